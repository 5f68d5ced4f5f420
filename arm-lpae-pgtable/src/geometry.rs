// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_lpae_regs::{
    mair_value, physical_address_size, tcr, vtcr, MAIR_ATTR_DEVICE, MAIR_ATTR_NON_CACHEABLE,
    MAIR_ATTR_WRITE_BACK, MAIR_IDX_CACHEABLE, MAIR_IDX_DEVICE, MAIR_IDX_NON_CACHEABLE,
};
use iommu_pages::Granule;
use tock_registers::LocalRegisterCopy;

use crate::config::IoPgTableCfg;
use crate::page_table::{Error, Result};

/// For consistency with the architecture we always consider four levels,
/// with the walk starting at level `4 - levels`. Level 3 is terminal.
pub(crate) const MAX_LEVELS: usize = 4;

const SZ_4K: u64 = 0x1000;
const SZ_2M: u64 = 0x20_0000;
const SZ_1G: u64 = 0x4000_0000;

// A stage-2 walk can fold its top level into the root by concatenating up
// to this many granules.
const S2_MAX_CONCAT_ENTRIES: usize = 16;

// Granule preference is anchored to the CPU page size; this library models
// a 4K-page host.
const CPU_PAGE_SIZE: u64 = SZ_4K;

/// The derived shape of a translation tree: granule, depth, root size, and
/// the per-level index and block-size arithmetic. Immutable once the table
/// is constructed (stage-2 concatenation happens before the root is
/// allocated).
#[derive(Clone, Debug)]
pub(crate) struct Geometry {
    granule: Granule,
    levels: usize,
    pgd_size: usize,
    pgsize_bitmap: u64,
}

/// Chooses the granule for a page-size bitmap and intersects the bitmap
/// with the sizes that granule can express. Preference order: the CPU page
/// size if listed, else the largest listed size below it, else the smallest
/// listed size above it.
fn restrict_pgsizes(bitmap: u64) -> Option<(Granule, u64)> {
    let granule_size = if bitmap & CPU_PAGE_SIZE != 0 {
        CPU_PAGE_SIZE
    } else if bitmap & (CPU_PAGE_SIZE - 1) != 0 {
        1 << (63 - (bitmap & (CPU_PAGE_SIZE - 1)).leading_zeros())
    } else if bitmap != 0 {
        1 << bitmap.trailing_zeros()
    } else {
        return None;
    };

    let granule = Granule::from_size(granule_size)?;
    let restricted = bitmap & granule.supported_sizes();
    if restricted == 0 {
        None
    } else {
        Some((granule, restricted))
    }
}

impl Geometry {
    /// Derives the tree shape from a configuration, restricting its
    /// page-size bitmap along the way.
    pub(crate) fn new(cfg: &IoPgTableCfg) -> Result<Self> {
        let (max_ias, max_oas) = if cfg.fmt.is_32bit() {
            if cfg.fmt.is_stage1() {
                (32, 40)
            } else {
                (40, 40)
            }
        } else {
            (48, 48)
        };
        if cfg.ias > max_ias {
            return Err(Error::InputSizeTooLarge(cfg.ias));
        }
        if cfg.oas > max_oas {
            return Err(Error::OutputSizeTooLarge(cfg.oas));
        }

        let mut bitmap = cfg.pgsize_bitmap;
        if cfg.fmt.is_32bit() {
            bitmap &= SZ_4K | SZ_2M | SZ_1G;
        }
        let (granule, pgsize_bitmap) =
            restrict_pgsizes(bitmap).ok_or(Error::UnsupportedPageSizes(cfg.pgsize_bitmap))?;

        let pg_shift = granule.shift();
        if (cfg.ias as u64) <= pg_shift {
            return Err(Error::InputSizeTooSmall(cfg.ias));
        }
        let va_bits = cfg.ias as u64 - pg_shift;
        let bits_per_level = pg_shift - 3;
        let levels = ((va_bits + bits_per_level - 1) / bits_per_level) as usize;
        let pgd_bits = va_bits - bits_per_level * (levels as u64 - 1);
        let pgd_size = 1usize << (pgd_bits + 3);

        Ok(Self {
            granule,
            levels,
            pgd_size,
            pgsize_bitmap,
        })
    }

    /// Folds the top level of a stage-2 walk into a concatenated root when
    /// the architecture allows it, shortening the walk by one level.
    pub(crate) fn concat_stage2_pgd(&mut self) {
        if self.levels == MAX_LEVELS && self.pgd_entries() <= S2_MAX_CONCAT_ENTRIES {
            self.pgd_size = self.pgd_entries() << self.granule.shift();
            self.levels -= 1;
        }
    }

    pub(crate) fn granule(&self) -> Granule {
        self.granule
    }

    pub(crate) fn granule_shift(&self) -> u64 {
        self.granule.shift()
    }

    pub(crate) fn granule_size(&self) -> usize {
        self.granule.size() as usize
    }

    pub(crate) fn bits_per_level(&self) -> u64 {
        self.granule.shift() - 3
    }

    pub(crate) fn levels(&self) -> usize {
        self.levels
    }

    pub(crate) fn start_level(&self) -> usize {
        MAX_LEVELS - self.levels
    }

    /// Byte size of the root table. A power of two; smaller than a granule
    /// for narrow address spaces, larger for a concatenated stage-2 root.
    pub(crate) fn pgd_size(&self) -> usize {
        self.pgd_size
    }

    pub(crate) fn pgd_entries(&self) -> usize {
        self.pgd_size / core::mem::size_of::<u64>()
    }

    /// Number of descriptors in a non-root table.
    pub(crate) fn table_entries(&self) -> usize {
        1 << self.bits_per_level()
    }

    pub(crate) fn pgsize_bitmap(&self) -> u64 {
        self.pgsize_bitmap
    }

    /// The shift that isolates the index bits of `level` in an IOVA.
    pub(crate) fn lvl_shift(&self, level: usize) -> u64 {
        (MAX_LEVELS - 1 - level) as u64 * self.bits_per_level() + self.granule.shift()
    }

    /// Bytes mapped by one descriptor at `level`.
    pub(crate) fn block_size(&self, level: usize) -> u64 {
        1 << self.lvl_shift(level)
    }

    /// The slot index of `iova` at `level`. The root level indexes with the
    /// root's actual entry count, which may be narrower or wider than
    /// `bits_per_level`.
    pub(crate) fn lvl_idx(&self, iova: u64, level: usize) -> usize {
        let bits = if level == self.start_level() {
            self.pgd_entries().trailing_zeros() as u64
        } else {
            self.bits_per_level()
        };
        ((iova >> self.lvl_shift(level)) & ((1 << bits) - 1)) as usize
    }

    /// Picks the largest supported page size that divides the combined
    /// alignment of `addr_merge` and does not exceed `size`. Returns `None`
    /// when no supported size fits.
    pub(crate) fn best_pgsize(&self, addr_merge: u64, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let mut pgsize_idx = 63 - size.leading_zeros();
        if addr_merge != 0 {
            pgsize_idx = pgsize_idx.min(addr_merge.trailing_zeros());
        }
        let below = if pgsize_idx >= 63 {
            u64::MAX
        } else {
            (1u64 << (pgsize_idx + 1)) - 1
        };
        let candidates = below & self.pgsize_bitmap;
        if candidates == 0 {
            return None;
        }
        Some(1 << (63 - candidates.leading_zeros()))
    }

    /// Composes the stage-1 TCR and MAIR pair for this geometry. The walk
    /// out of TTBR1 is disabled; MAIR1 is unused.
    pub(crate) fn s1_registers(&self, cfg: &IoPgTableCfg) -> Result<(u64, [u64; 2])> {
        let mut reg = LocalRegisterCopy::<u64, tcr::Register>::new(0);
        reg.modify(tcr::sh0::InnerShareable);
        reg.modify(tcr::irgn0::NonCacheable);
        reg.modify(tcr::orgn0::NonCacheable);
        reg.modify(match self.granule {
            Granule::Size4k => tcr::tg0::Granule4k,
            Granule::Size16k => tcr::tg0::Granule16k,
            Granule::Size64k => tcr::tg0::Granule64k,
        });
        let ps = physical_address_size(cfg.oas).ok_or(Error::UnsupportedOutputSize(cfg.oas))?;
        reg.modify(tcr::ips.val(ps));
        reg.modify(tcr::t0sz.val(64 - cfg.ias as u64));
        reg.modify(tcr::epd1::Fault);

        let mair = mair_value(&[
            (MAIR_IDX_NON_CACHEABLE, MAIR_ATTR_NON_CACHEABLE),
            (MAIR_IDX_CACHEABLE, MAIR_ATTR_WRITE_BACK),
            (MAIR_IDX_DEVICE, MAIR_ATTR_DEVICE),
        ]);

        Ok((reg.get(), [mair, 0]))
    }

    /// Composes the stage-2 VTCR for this geometry. Must run after
    /// `concat_stage2_pgd` so SL0 reflects the folded walk.
    pub(crate) fn s2_registers(&self, cfg: &IoPgTableCfg) -> Result<u64> {
        let mut reg = LocalRegisterCopy::<u64, vtcr::Register>::new(0);
        reg.modify(vtcr::res1.val(1));
        reg.modify(vtcr::sh0::InnerShareable);
        reg.modify(vtcr::irgn0::WriteBackWriteAlloc);
        reg.modify(vtcr::orgn0::WriteBackWriteAlloc);

        let mut sl = self.start_level() as u64;
        match self.granule {
            Granule::Size4k => {
                reg.modify(vtcr::tg0::Granule4k);
                // SL0 counts from one level further down for the 4K granule.
                sl += 1;
            }
            Granule::Size16k => reg.modify(vtcr::tg0::Granule16k),
            Granule::Size64k => reg.modify(vtcr::tg0::Granule64k),
        }

        let ps = physical_address_size(cfg.oas).ok_or(Error::UnsupportedOutputSize(cfg.oas))?;
        reg.modify(vtcr::ps.val(ps));
        reg.modify(vtcr::t0sz.val(64 - cfg.ias as u64));
        reg.modify(vtcr::sl0.val(!sl & 0x3));

        Ok(reg.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Format, Quirks};

    fn cfg(fmt: Format, pgsize_bitmap: u64, ias: u32, oas: u32) -> IoPgTableCfg {
        IoPgTableCfg {
            fmt,
            pgsize_bitmap,
            ias,
            oas,
            quirks: Quirks::empty(),
        }
    }

    #[test]
    fn shape_4k_granule() {
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 48, 48)).unwrap();
        assert_eq!(geo.granule(), Granule::Size4k);
        assert_eq!(geo.levels(), 4);
        assert_eq!(geo.start_level(), 0);
        assert_eq!(geo.pgd_size(), 4096);
        assert_eq!(geo.block_size(3), SZ_4K);
        assert_eq!(geo.block_size(2), SZ_2M);
        assert_eq!(geo.block_size(1), SZ_1G);

        // Narrow address spaces shrink the root below one granule.
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 32, 48)).unwrap();
        assert_eq!(geo.levels(), 3);
        assert_eq!(geo.start_level(), 1);
        assert_eq!(geo.pgd_size(), 32);
        assert_eq!(geo.pgd_entries(), 4);
    }

    #[test]
    fn shape_large_granules() {
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, 0x4000 | 0x200_0000, 48, 48)).unwrap();
        assert_eq!(geo.granule(), Granule::Size16k);
        assert_eq!(geo.levels(), 4);
        assert_eq!(geo.pgd_size(), 16);

        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, 0x1_0000 | 0x2000_0000, 48, 48)).unwrap();
        assert_eq!(geo.granule(), Granule::Size64k);
        assert_eq!(geo.levels(), 3);
        assert_eq!(geo.start_level(), 1);
        assert_eq!(geo.pgd_size(), 512);
        assert_eq!(geo.block_size(2), 0x2000_0000);
    }

    #[test]
    fn lvl_index_math() {
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 48, 48)).unwrap();
        let iova = (5u64 << 39) | (3 << 30) | (511 << 21) | (1 << 12);
        assert_eq!(geo.lvl_idx(iova, 0), 5);
        assert_eq!(geo.lvl_idx(iova, 1), 3);
        assert_eq!(geo.lvl_idx(iova, 2), 511);
        assert_eq!(geo.lvl_idx(iova, 3), 1);

        // With a sub-granule root the start-level index narrows to the
        // root's entry count.
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 32, 48)).unwrap();
        assert_eq!(geo.lvl_idx(3 << 30, 1), 3);
        assert_eq!(geo.lvl_idx(0xffff_ffff, 1), 3);
    }

    #[test]
    fn pgsize_restriction() {
        // The CPU page size wins when listed, dropping foreign block sizes.
        let geo =
            Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | 0x4000 | 0x200_0000, 48, 48)).unwrap();
        assert_eq!(geo.granule(), Granule::Size4k);
        assert_eq!(geo.pgsize_bitmap(), SZ_4K);

        // Without it, the smallest larger size is chosen as granule.
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, 0x1_0000 | 0x2000_0000, 48, 48)).unwrap();
        assert_eq!(geo.granule(), Granule::Size64k);

        // Block sizes alone can't form a regime.
        assert!(Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_2M | SZ_1G, 48, 48)).is_err());
        assert!(Geometry::new(&cfg(Format::Arm64LpaeS1, 0, 48, 48)).is_err());
    }

    #[test]
    fn address_size_limits() {
        assert_eq!(
            Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K, 52, 48)).unwrap_err(),
            Error::InputSizeTooLarge(52)
        );
        assert_eq!(
            Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K, 48, 52)).unwrap_err(),
            Error::OutputSizeTooLarge(52)
        );
        assert_eq!(
            Geometry::new(&cfg(Format::Arm32LpaeS1, SZ_4K, 36, 40)).unwrap_err(),
            Error::InputSizeTooLarge(36)
        );
        assert_eq!(
            Geometry::new(&cfg(Format::Arm32LpaeS2, SZ_4K, 44, 40)).unwrap_err(),
            Error::InputSizeTooLarge(44)
        );
        // The 32-bit formats silently drop sizes outside the 4K regime.
        let geo = Geometry::new(&cfg(Format::Arm32LpaeS1, SZ_4K | 0x4000, 32, 40)).unwrap();
        assert_eq!(geo.pgsize_bitmap(), SZ_4K);
    }

    #[test]
    fn stage2_concat() {
        // ias 40: a two-entry top level folds into a two-granule root.
        let mut geo = Geometry::new(&cfg(Format::Arm64LpaeS2, SZ_4K | SZ_2M | SZ_1G, 40, 40)).unwrap();
        assert_eq!(geo.levels(), 4);
        geo.concat_stage2_pgd();
        assert_eq!(geo.levels(), 3);
        assert_eq!(geo.pgd_size(), 2 * 4096);
        assert_eq!(geo.start_level(), 1);

        // ias 43 is the widest 4K space that still concatenates: 16 pages.
        let mut geo = Geometry::new(&cfg(Format::Arm64LpaeS2, SZ_4K | SZ_2M | SZ_1G, 43, 48)).unwrap();
        geo.concat_stage2_pgd();
        assert_eq!(geo.levels(), 3);
        assert_eq!(geo.pgd_size(), 16 * 4096);

        // ias 48 needs a 512-entry top level; no concatenation.
        let mut geo = Geometry::new(&cfg(Format::Arm64LpaeS2, SZ_4K | SZ_2M | SZ_1G, 48, 48)).unwrap();
        geo.concat_stage2_pgd();
        assert_eq!(geo.levels(), 4);
        assert_eq!(geo.pgd_size(), 4096);
    }

    #[test]
    fn best_pgsize_selection() {
        let geo = Geometry::new(&cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 48, 48)).unwrap();
        assert_eq!(geo.best_pgsize(0, 20 * 1024 * 1024), Some(SZ_2M));
        assert_eq!(geo.best_pgsize(0, SZ_1G), Some(SZ_1G));
        assert_eq!(geo.best_pgsize(SZ_4K, SZ_2M), Some(SZ_4K));
        assert_eq!(geo.best_pgsize(SZ_2M, 3 * 1024 * 1024), Some(SZ_2M));
        assert_eq!(geo.best_pgsize(0, SZ_4K), Some(SZ_4K));
        assert_eq!(geo.best_pgsize(0, 0x800), None);
        assert_eq!(geo.best_pgsize(0x800, SZ_2M), None);
    }

    #[test]
    fn stage1_register_values() {
        let c = cfg(Format::Arm64LpaeS1, SZ_4K | SZ_2M | SZ_1G, 48, 48);
        let geo = Geometry::new(&c).unwrap();
        let (tcr_val, mair) = geo.s1_registers(&c).unwrap();
        assert_eq!(tcr_val, (3 << 12) | (5u64 << 32) | 16 | (1 << 23));
        assert_eq!(mair[0], 0x44 | (0xff << 8) | (0x04 << 16));
        assert_eq!(mair[1], 0);

        // Unencodable output sizes are rejected at register time.
        let c = cfg(Format::Arm64LpaeS1, SZ_4K, 48, 34);
        let geo = Geometry::new(&c).unwrap();
        assert_eq!(geo.s1_registers(&c), Err(Error::UnsupportedOutputSize(34)));
    }

    #[test]
    fn stage2_register_values() {
        let c = cfg(Format::Arm64LpaeS2, SZ_4K | SZ_2M | SZ_1G, 40, 40);
        let mut geo = Geometry::new(&c).unwrap();
        geo.concat_stage2_pgd();
        let vtcr_val = geo.s2_registers(&c).unwrap();
        let expect = (1u64 << 31)
            | (3 << 12)
            | (1 << 8)
            | (1 << 10)
            | (2 << 16)
            | 24
            | (1 << 6);
        assert_eq!(vtcr_val, expect);
    }
}
