// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # IOMMU address and granule primitives
//!
//! - `Iova` is an I/O virtual address as issued by a DMA-capable device.
//! - `PhysAddr` is a physical address as seen by memory.
//! - `Granule` is the translation granule of an LPAE regime and knows the
//!   block sizes that regime can map.
#![no_std]

mod addr;
mod granule;

pub use addr::{Iova, PhysAddr};
pub use granule::Granule;

#[cfg(test)]
#[macro_use]
extern crate std;
