// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_lpae_regs::{MAIR_IDX_CACHEABLE, MAIR_IDX_DEVICE};
use iommu_pages::PhysAddr;
use static_assertions::const_assert_eq;

use crate::config::{Format, Prot};
use crate::geometry::MAX_LEVELS;

// Descriptor type field, bits [1:0].
const PTE_TYPE_MASK: u64 = 0x3;
const PTE_TYPE_BLOCK: u64 = 1;
const PTE_TYPE_TABLE: u64 = 3;
const PTE_TYPE_PAGE: u64 = 3;
const PTE_VALID: u64 = 1;

const PTE_NSTABLE: u64 = 1 << 63;
const PTE_XN: u64 = 3 << 53;
const PTE_AF: u64 = 1 << 10;
const PTE_SH_IS: u64 = 3 << 8;
const PTE_NS: u64 = 1 << 5;

// Stage-1 leaf attributes.
const PTE_AP_PRIV_RW: u64 = 0 << 6;
const PTE_AP_RW: u64 = 1 << 6;
const PTE_AP_PRIV_RO: u64 = 2 << 6;
const PTE_AP_RO: u64 = 3 << 6;
const PTE_ATTRINDX_SHIFT: u64 = 2;
const PTE_NG: u64 = 1 << 11;

// Stage-2 leaf attributes.
const PTE_HAP_READ: u64 = 1 << 6;
const PTE_HAP_WRITE: u64 = 2 << 6;
const PTE_MEMATTR_OIWB: u64 = 0xf << 2;
const PTE_MEMATTR_NC: u64 = 0x5 << 2;
const PTE_MEMATTR_DEV: u64 = 0x1 << 2;

// Attribute bits preserved when a block is split into a table of smaller
// leaves. The contiguous hint (bit 52) is deliberately excluded.
const PTE_ATTR_LO_MASK: u64 = 0x3ff << 2;
const PTE_ATTR_HI_MASK: u64 = 6 << 52;
const PTE_ATTR_MASK: u64 = PTE_ATTR_LO_MASK | PTE_ATTR_HI_MASK;

// The output address field occupies bits [47:granule-shift].
const ADDR_MASK: u64 = (1 << 48) - 1;

// Table descriptors hide a use counter for the directly referenced table in
// bits the walker ignores: a 10-bit low half in [11:2] and a 7-bit high
// half in [58:52]. 17 bits count up to the 8192 entries a 64K-granule
// table can hold, with headroom.
const TBLCNT_LO_SHIFT: u64 = 2;
const TBLCNT_LO_MASK: u64 = 0x3ff;
const TBLCNT_LO_BITS: u64 = 10;
const TBLCNT_HI_SHIFT: u64 = 52;
const TBLCNT_HI_MASK: u64 = 0x7f;
const TBLCNT_RESERVED_MASK: u64 =
    (TBLCNT_LO_MASK << TBLCNT_LO_SHIFT) | (TBLCNT_HI_MASK << TBLCNT_HI_SHIFT);

// The counter bits must never alias the output address field, even at the
// smallest granule.
const_assert_eq!(TBLCNT_RESERVED_MASK & (ADDR_MASK & !0xfff), 0);

/// The leaf attribute bits derived from a `Prot` set, ready to be OR'd into
/// a descriptor. Format-specific; produced by `leaf_attrs`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Attrs(u64);

impl Attrs {
    pub(crate) fn bits(&self) -> u64 {
        self.0
    }
}

/// Maps a capability set onto the attribute encoding of the given format.
/// Stage-1 goes through AP + AttrIdx + nG; stage-2 through HAP + MemAttr.
pub(crate) fn leaf_attrs(fmt: Format, prot: Prot) -> Attrs {
    let mut bits;

    if fmt.is_stage1() {
        bits = PTE_NG;

        if prot.contains(Prot::WRITE) {
            bits |= if prot.contains(Prot::PRIV) {
                PTE_AP_PRIV_RW
            } else {
                PTE_AP_RW
            };
        } else {
            bits |= if prot.contains(Prot::PRIV) {
                PTE_AP_PRIV_RO
            } else {
                PTE_AP_RO
            };
        }

        if prot.contains(Prot::CACHE) {
            bits |= MAIR_IDX_CACHEABLE << PTE_ATTRINDX_SHIFT;
        }
        if prot.contains(Prot::DEVICE) {
            bits |= MAIR_IDX_DEVICE << PTE_ATTRINDX_SHIFT;
        }
    } else {
        bits = 0;
        if prot.contains(Prot::READ) {
            bits |= PTE_HAP_READ;
        }
        if prot.contains(Prot::WRITE) {
            bits |= PTE_HAP_WRITE;
        }
        bits |= if prot.contains(Prot::CACHE) {
            PTE_MEMATTR_OIWB
        } else {
            PTE_MEMATTR_NC
        };
        if prot.contains(Prot::DEVICE) {
            bits |= PTE_MEMATTR_DEV;
        }
    }

    if prot.contains(Prot::NOEXEC) {
        bits |= PTE_XN;
    }

    Attrs(bits)
}

/// A single 8-byte descriptor. Read from and written to table memory by
/// value; never a live reference into the tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Pte(u64);

impl Pte {
    /// Returns the all-zero (invalid) descriptor.
    pub(crate) const fn invalid() -> Self {
        Self(0)
    }

    /// Creates a leaf descriptor mapping `paddr` at `level` with the given
    /// attributes. Every leaf gets AF and inner-shareability; the NS bit is
    /// appended when `ns` is set.
    pub(crate) fn new_leaf(level: usize, paddr: PhysAddr, attrs: Attrs, ns: bool) -> Self {
        let mut pte = attrs.bits();
        if ns {
            pte |= PTE_NS;
        }
        pte |= if level == MAX_LEVELS - 1 {
            PTE_TYPE_PAGE
        } else {
            PTE_TYPE_BLOCK
        };
        pte |= PTE_AF | PTE_SH_IS;
        pte |= paddr.bits() & ADDR_MASK;
        Self(pte)
    }

    /// Creates a table descriptor referencing the table at `paddr`, with a
    /// zeroed use counter.
    pub(crate) fn new_table(paddr: PhysAddr, ns: bool) -> Self {
        let mut pte = (paddr.bits() & ADDR_MASK) | PTE_TYPE_TABLE;
        if ns {
            pte |= PTE_NSTABLE;
        }
        Self(pte)
    }

    /// Returns the raw bits of the descriptor.
    pub(crate) fn bits(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the descriptor is entirely clear.
    pub(crate) fn is_clear(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the valid bit is set.
    pub(crate) fn is_valid(&self) -> bool {
        self.0 & PTE_VALID != 0
    }

    /// Returns `true` if the descriptor is a leaf at `level`: a page
    /// descriptor at the terminal level, a block descriptor above it.
    pub(crate) fn is_leaf(&self, level: usize) -> bool {
        let pte_type = self.0 & PTE_TYPE_MASK;
        if level == MAX_LEVELS - 1 {
            pte_type == PTE_TYPE_PAGE
        } else {
            pte_type == PTE_TYPE_BLOCK
        }
    }

    /// Returns the output address, masking off attributes, the embedded
    /// counter, and everything below the granule.
    pub(crate) fn addr(&self, granule_shift: u64) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK & !((1 << granule_shift) - 1))
    }

    /// Returns the attribute bits a split must carry over to the smaller
    /// leaves.
    pub(crate) fn attrs(&self) -> Attrs {
        Attrs(self.0 & PTE_ATTR_MASK)
    }

    /// Returns the embedded use counter of a table descriptor.
    pub(crate) fn tblcnt(&self) -> usize {
        let lo = (self.0 >> TBLCNT_LO_SHIFT) & TBLCNT_LO_MASK;
        let hi = (self.0 >> TBLCNT_HI_SHIFT) & TBLCNT_HI_MASK;
        (lo | (hi << TBLCNT_LO_BITS)) as usize
    }

    /// Replaces the embedded use counter.
    pub(crate) fn set_tblcnt(&mut self, count: usize) {
        let count = count as u64;
        let mut pte = self.0 & !TBLCNT_RESERVED_MASK;
        pte |= (count & TBLCNT_LO_MASK) << TBLCNT_LO_SHIFT;
        pte |= ((count >> TBLCNT_LO_BITS) & TBLCNT_HI_MASK) << TBLCNT_HI_SHIFT;
        self.0 = pte;
    }

    /// Adds to the embedded use counter.
    pub(crate) fn tblcnt_add(&mut self, count: usize) {
        self.set_tblcnt(self.tblcnt() + count);
    }

    /// Subtracts from the embedded use counter.
    pub(crate) fn tblcnt_sub(&mut self, count: usize) {
        self.set_tblcnt(self.tblcnt() - count);
    }
}
