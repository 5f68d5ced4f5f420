// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// The translation granule of an LPAE regime.
///
/// The granule fixes the size of every interior table and of the smallest
/// leaf mapping. Each granule also fixes the set of larger block sizes the
/// regime can map at the non-terminal levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Granule {
    Size4k,
    Size16k,
    Size64k,
}

impl Granule {
    /// Creates a `Granule` from a page size in bytes.
    pub fn from_size(size: u64) -> Option<Self> {
        match size {
            0x1000 => Some(Granule::Size4k),
            0x4000 => Some(Granule::Size16k),
            0x1_0000 => Some(Granule::Size64k),
            _ => None,
        }
    }

    /// Returns the granule size in bytes.
    pub const fn size(&self) -> u64 {
        1 << self.shift()
    }

    /// Returns log2 of the granule size.
    pub const fn shift(&self) -> u64 {
        match self {
            Granule::Size4k => 12,
            Granule::Size16k => 14,
            Granule::Size64k => 16,
        }
    }

    /// Returns the bitmask of page and block sizes mappable with this
    /// granule: the granule itself plus the block sizes of the non-terminal
    /// levels that the architecture defines for it.
    pub const fn supported_sizes(&self) -> u64 {
        match self {
            // 4K pages, 2M and 1G blocks.
            Granule::Size4k => 0x1000 | 0x20_0000 | 0x4000_0000,
            // 16K pages, 32M blocks.
            Granule::Size16k => 0x4000 | 0x200_0000,
            // 64K pages, 512M blocks.
            Granule::Size64k => 0x1_0000 | 0x2000_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_size() {
        assert_eq!(Granule::from_size(0x1000), Some(Granule::Size4k));
        assert_eq!(Granule::from_size(0x4000), Some(Granule::Size16k));
        assert_eq!(Granule::from_size(0x1_0000), Some(Granule::Size64k));
        assert_eq!(Granule::from_size(0x2000), None);
        assert_eq!(Granule::from_size(0x20_0000), None);
    }

    #[test]
    fn block_sets() {
        assert_eq!(Granule::Size4k.supported_sizes(), 0x4020_1000);
        assert!(Granule::Size16k.supported_sizes() & 0x200_0000 != 0);
        assert!(Granule::Size64k.supported_sizes() & 0x2000_0000 != 0);
        // A granule never claims another granule's block sizes.
        assert_eq!(Granule::Size16k.supported_sizes() & 0x20_0000, 0);
    }
}
