// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Memory attribute indirection for stage-1 leaf descriptors.
//!
//! Stage-1 leaves carry a 3-bit index into MAIR rather than attributes
//! themselves. The allocator fixes three indices and the driver programs
//! MAIR0 with the matching attribute bytes.

/// MAIR index used for non-cacheable mappings.
pub const MAIR_IDX_NON_CACHEABLE: u64 = 0;
/// MAIR index used for cacheable (write-back, read/write-allocate) mappings.
pub const MAIR_IDX_CACHEABLE: u64 = 1;
/// MAIR index used for device mappings.
pub const MAIR_IDX_DEVICE: u64 = 2;

/// Attribute byte for outer and inner non-cacheable normal memory.
pub const MAIR_ATTR_NON_CACHEABLE: u64 = 0x44;
/// Attribute byte for outer and inner write-back read/write-allocate.
pub const MAIR_ATTR_WRITE_BACK: u64 = 0xff;
/// Attribute byte for Device-nGnRE memory.
pub const MAIR_ATTR_DEVICE: u64 = 0x04;

/// Composes a MAIR word from the attribute byte assigned to each index.
/// Indices above the ones given encode as zero (strongly-ordered device
/// memory), which no leaf produced by the allocator references.
pub const fn mair_value(attrs: &[(u64, u64)]) -> u64 {
    let mut reg = 0;
    let mut i = 0;
    while i < attrs.len() {
        let (idx, attr) = attrs[i];
        reg |= attr << (idx << 3);
        i += 1;
    }
    reg
}
