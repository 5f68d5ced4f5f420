// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # CPU-agnostic ARM LPAE I/O page-table allocation
//!
//! Builds and mutates the multi-level translation trees an IOMMU walks to
//! map I/O virtual addresses onto physical memory, for the stage-1 and
//! stage-2 LPAE formats in their 64-bit and 32-bit variants.
//!
//! ## Key types
//!
//! - `IoPageTable` is a translation tree bound to one domain. It owns the
//!   root and every interior table, installs and removes leaf descriptors,
//!   and reports the TCR/VTCR/MAIR/TTBR values the driver programs.
//! - `IoPgTableCfg` carries the driver-chosen format, address widths, page
//!   sizes, and quirks.
//! - `TlbOps` is the coherency seam: descriptor publishes and TLB
//!   invalidation are delegated to the driver through it.
//! - `IoPageAllocator` supplies zeroed, naturally aligned table memory and
//!   takes it back on teardown.
//!
//! ## Safety
//!
//! The table exclusively owns all table memory it allocates, and every
//! descriptor mutation is published through `TlbOps` before the operation
//! returns, so the device-side walker never observes an unpublished write.
//! The allocator is not internally synchronized: callers serialize
//! mutations per table and must not translate concurrently with one.
#![no_std]

mod config;
mod geometry;
mod page_table;
mod pte;

pub use config::{Format, IoPageAllocator, IoPgTableCfg, MapFlags, Prot, Quirks, TlbOps};
pub use page_table::{Error, IoPageTable, Result, SgChunk, SgMapError, TranslationRegs};

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod test_stubs;
