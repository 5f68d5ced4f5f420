// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;
use iommu_pages::{Iova, PhysAddr};

/// The translation regime and register width a page table is built for.
///
/// The tree algorithms are format-agnostic; the format only selects the
/// leaf attribute encoding and the shape of the register values reported
/// back to the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// Stage-1, 64-bit TCR/MAIR.
    Arm64LpaeS1,
    /// Stage-2, 64-bit VTCR.
    Arm64LpaeS2,
    /// Stage-1 behind a 32-bit TCR (EAE set, register truncated).
    Arm32LpaeS1,
    /// Stage-2 behind a 32-bit VTCR.
    Arm32LpaeS2,
}

impl Format {
    /// Returns `true` for the stage-1 formats.
    pub fn is_stage1(&self) -> bool {
        matches!(self, Format::Arm64LpaeS1 | Format::Arm32LpaeS1)
    }

    /// Returns `true` for the formats whose registers are truncated to 32
    /// bits.
    pub fn is_32bit(&self) -> bool {
        matches!(self, Format::Arm32LpaeS1 | Format::Arm32LpaeS2)
    }
}

bitflags! {
    /// Capabilities requested for a mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CACHE = 1 << 2;
        const NOEXEC = 1 << 3;
        const DEVICE = 1 << 4;
        const PRIV = 1 << 5;
        const EXEC = 1 << 6;
    }
}

bitflags! {
    /// Implementation quirks requested by the driver.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Quirks: u32 {
        /// Set the NS bit on leaf descriptors and NSTABLE on table
        /// descriptors so walks continue in the non-secure address space.
        const ARM_NS = 1 << 0;
    }
}

bitflags! {
    /// Per-operation modifiers for `map_with_flags`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Don't log a warning when the mapping collides with a live
        /// descriptor. The operation still fails. Intended for callers that
        /// probe for conflicts on purpose.
        const SUPPRESS_CONFLICT_WARN = 1 << 0;
    }
}

/// Configuration for a page-table allocation. Immutable once the table is
/// constructed.
#[derive(Copy, Clone, Debug)]
pub struct IoPgTableCfg {
    pub fmt: Format,
    /// Bitmask of page and block sizes the caller wants to map. Restricted
    /// at construction to the sizes the chosen granule can express.
    pub pgsize_bitmap: u64,
    /// Input (IOVA) address width in bits.
    pub ias: u32,
    /// Output (PA) address width in bits.
    pub oas: u32,
    pub quirks: Quirks,
}

/// TLB and page-table-walker coherency maintenance supplied by the IOMMU
/// driver. Implementations carry whatever per-domain state the hardware
/// needs; the table calls these at precisely defined points and never
/// blocks between a descriptor write and the publish that covers it.
pub trait TlbOps {
    /// Makes the descriptor bytes in `[ptr, ptr + len)` visible to the
    /// device's page-table walker.
    fn flush_pgtable(&self, ptr: *const u8, len: usize);

    /// Invalidates all device TLB entries for the domain.
    fn tlb_flush_all(&self);

    /// Queues invalidation of a single translation range.
    fn tlb_add_flush(&self, iova: Iova, size: u64, leaf: bool);

    /// Drains invalidations queued with `tlb_add_flush`.
    fn tlb_sync(&self);
}

/// Source of page-table memory.
///
/// `alloc_pages` must return zeroed, physically contiguous memory naturally
/// aligned to `len`, or `None` when no memory is available. The table walks
/// this memory through its physical address, so it must be addressable at
/// that address (identity or linear mapped) for the table's lifetime.
/// Interior tables are allocated while a map operation is in flight, so
/// implementations must not sleep.
pub trait IoPageAllocator {
    fn alloc_pages(&self, len: usize) -> Option<PhysAddr>;
    fn free_pages(&self, addr: PhysAddr, len: usize);
}
