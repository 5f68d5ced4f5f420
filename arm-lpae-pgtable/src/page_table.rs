// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use core::mem;
use core::slice;

use arm_lpae_regs::tcr;
use iommu_pages::{Iova, PhysAddr};

use crate::config::{Format, IoPageAllocator, IoPgTableCfg, MapFlags, Prot, Quirks, TlbOps};
use crate::geometry::{Geometry, MAX_LEVELS};
use crate::pte::{leaf_attrs, Attrs, Pte};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No usable page size remains after restricting the bitmap to a
    /// granule's regime.
    UnsupportedPageSizes(u64),
    /// The input address width doesn't reach past a single granule.
    InputSizeTooSmall(u32),
    InputSizeTooLarge(u32),
    OutputSizeTooLarge(u32),
    /// The output width has no PS/IPS field encoding.
    UnsupportedOutputSize(u32),
    /// The mapping size is not one of the supported page or block sizes.
    UnsupportedPageSize(u64),
    MisalignedAddress,
    /// The range already holds a valid descriptor; unmap it first.
    AlreadyMapped,
    /// The page allocator could not produce an interior table.
    InsufficientPtePages,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedPageSizes(bitmap) => {
                write!(f, "no usable page sizes in bitmap {bitmap:#x}")
            }
            Error::InputSizeTooSmall(ias) => write!(f, "input address size {ias} too small"),
            Error::InputSizeTooLarge(ias) => write!(f, "input address size {ias} too large"),
            Error::OutputSizeTooLarge(oas) => write!(f, "output address size {oas} too large"),
            Error::UnsupportedOutputSize(oas) => {
                write!(f, "output address size {oas} has no register encoding")
            }
            Error::UnsupportedPageSize(size) => write!(f, "unsupported mapping size {size:#x}"),
            Error::MisalignedAddress => write!(f, "address not aligned to the mapping size"),
            Error::AlreadyMapped => write!(f, "range already mapped"),
            Error::InsufficientPtePages => write!(f, "out of page-table memory"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// A partially completed `map_sg`: `mapped` bytes were installed before
/// `cause` stopped the walk. The caller reverses exactly that prefix with
/// `unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgMapError {
    pub mapped: u64,
    pub cause: Error,
}

/// One element of a scatter-gather input: `length` bytes starting `offset`
/// bytes into the physical page at `page`.
#[derive(Copy, Clone, Debug)]
pub struct SgChunk {
    pub page: PhysAddr,
    pub offset: u64,
    pub length: u64,
}

/// The register values the driver programs to point hardware at the tree.
/// Produced at construction time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TranslationRegs {
    Stage1 {
        ttbr: [u64; 2],
        tcr: u64,
        mair: [u64; 2],
    },
    Stage2 {
        vttbr: u64,
        vtcr: u64,
    },
}

// Scatter-gather batching stops at the next 2M boundary regardless of
// granule, which keeps a batch inside one terminal table.
const SZ_2M: u64 = 0x20_0000;

/// A table in the tree, identified by its physical address and entry
/// count. Plain data; `table_mut`/`table_shared` materialize the
/// descriptor array it names.
#[derive(Copy, Clone)]
struct TableRef {
    pa: PhysAddr,
    entries: usize,
}

/// Returns the descriptor array of `table` for mutation.
fn table_mut<'a>(table: TableRef) -> &'a mut [Pte] {
    // Safe because every table a tree references is exclusively owned by
    // that tree and stays live until its descriptor is cleared, and the
    // single-writer contract keeps this the only mutable view in use.
    unsafe { slice::from_raw_parts_mut(table.pa.bits() as *mut Pte, table.entries) }
}

/// Returns the descriptor array of `table` for reading.
fn table_shared<'a>(table: TableRef) -> &'a [Pte] {
    // Safe as above; readers run under the same serialization contract.
    unsafe { slice::from_raw_parts(table.pa.bits() as *const Pte, table.entries) }
}

/// The constant part of a single leaf installation, threaded through the
/// walk.
struct MapOp {
    iova: u64,
    paddr: u64,
    size: u64,
    attrs: Attrs,
    warn_on_conflict: bool,
}

/// A run of page leaves written into one terminal table without
/// intervening publishes; a single range publish covers the run when it
/// closes.
struct Batch {
    iova_end: u64,
    table: TableRef,
    parent: Option<(TableRef, usize)>,
    start: usize,
    count: usize,
}

type MapState = Option<Batch>;

/// An LPAE I/O page table bound to one translation domain.
///
/// The table exclusively owns its root and every interior table beneath it
/// for its lifetime; `Drop` returns them all to the allocator. Mutations
/// are not internally synchronized: the caller serializes `map`, `map_sg`,
/// and `unmap` per table, and must not translate concurrently with a
/// mutation.
pub struct IoPageTable<T: TlbOps, A: IoPageAllocator> {
    fmt: Format,
    quirks: Quirks,
    geo: Geometry,
    regs: TranslationRegs,
    pgd: PhysAddr,
    tlb: T,
    alloc: A,
}

impl<T: TlbOps, A: IoPageAllocator> IoPageTable<T, A> {
    /// Builds an empty table for the configured format and derives the
    /// register values for it. The root is allocated, zeroed, and published
    /// before the registers reference it.
    pub fn new(cfg: &IoPgTableCfg, tlb: T, alloc: A) -> Result<Self> {
        let mut geo = Geometry::new(cfg)?;

        let mut regs = if cfg.fmt.is_stage1() {
            let (mut tcr_val, mair) = geo.s1_registers(cfg)?;
            if cfg.fmt.is_32bit() {
                tcr_val |= tcr::eae::SET.value;
                tcr_val &= 0xffff_ffff;
            }
            TranslationRegs::Stage1 {
                ttbr: [0; 2],
                tcr: tcr_val,
                mair,
            }
        } else {
            geo.concat_stage2_pgd();
            let mut vtcr_val = geo.s2_registers(cfg)?;
            if cfg.fmt.is_32bit() {
                vtcr_val &= 0xffff_ffff;
            }
            TranslationRegs::Stage2 {
                vttbr: 0,
                vtcr: vtcr_val,
            }
        };

        let pgd = alloc
            .alloc_pages(geo.pgd_size())
            .ok_or(Error::InsufficientPtePages)?;
        tlb.flush_pgtable(pgd.bits() as *const u8, geo.pgd_size());

        match &mut regs {
            TranslationRegs::Stage1 { ttbr, .. } => ttbr[0] = pgd.bits(),
            TranslationRegs::Stage2 { vttbr, .. } => *vttbr = pgd.bits(),
        }

        Ok(Self {
            fmt: cfg.fmt,
            quirks: cfg.quirks,
            geo,
            regs,
            pgd,
            tlb,
            alloc,
        })
    }

    /// Returns the register values for the driver to program.
    pub fn regs(&self) -> &TranslationRegs {
        &self.regs
    }

    /// Maps `size` bytes at `iova` onto `paddr`. `size` must be a supported
    /// page or block size and both addresses must be aligned to it. The
    /// range must not contain a valid descriptor.
    pub fn map(&mut self, iova: Iova, paddr: PhysAddr, size: u64, prot: Prot) -> Result<()> {
        self.map_with_flags(iova, paddr, size, prot, MapFlags::empty())
    }

    /// Like `map`, with per-operation modifiers.
    pub fn map_with_flags(
        &mut self,
        iova: Iova,
        paddr: PhysAddr,
        size: u64,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<()> {
        // If no access, then nothing to do.
        if !prot.intersects(Prot::READ | Prot::WRITE) {
            return Ok(());
        }
        if !size.is_power_of_two() || size & self.geo.pgsize_bitmap() == 0 {
            return Err(Error::UnsupportedPageSize(size));
        }
        if !iova.is_aligned(size) || !paddr.is_aligned(size) {
            return Err(Error::MisalignedAddress);
        }

        let op = MapOp {
            iova: iova.bits(),
            paddr: paddr.bits(),
            size,
            attrs: leaf_attrs(self.fmt, prot),
            warn_on_conflict: !flags.contains(MapFlags::SUPPRESS_CONFLICT_WARN),
        };
        let pgd = self.pgd_table();
        self.install(&op, self.geo.start_level(), pgd, None, None)
    }

    /// Maps a scatter-gather list starting at `iova`, splitting every chunk
    /// into the largest page sizes its alignment allows. Consecutive page
    /// leaves landing in the same terminal table are published in ranges
    /// rather than one slot at a time.
    pub fn map_sg(
        &mut self,
        iova: Iova,
        sg: &[SgChunk],
        prot: Prot,
    ) -> core::result::Result<u64, SgMapError> {
        // If no access, then nothing to do.
        if !prot.intersects(Prot::READ | Prot::WRITE) {
            return Ok(0);
        }

        let min_pagesz = 1u64 << self.geo.pgsize_bitmap().trailing_zeros();
        // Chunk offsets must sit on IOMMU page boundaries. Checked for the
        // whole input up front so a bad chunk has no side effects.
        if sg.iter().any(|c| c.offset & (min_pagesz - 1) != 0) {
            return Err(SgMapError {
                mapped: 0,
                cause: Error::MisalignedAddress,
            });
        }

        let attrs = leaf_attrs(self.fmt, prot);
        let start_lvl = self.geo.start_level();
        let mut state: MapState = None;
        let mut mapped = 0u64;
        let mut iova = iova.bits();

        for chunk in sg {
            let mut paddr = chunk.page.bits() + chunk.offset;
            let mut remaining = chunk.length;

            while remaining > 0 {
                let pgsize = match self.geo.best_pgsize(iova | paddr, remaining) {
                    Some(size) => size,
                    None => {
                        if let Some(batch) = state.take() {
                            self.flush_batch(&batch);
                        }
                        return Err(SgMapError {
                            mapped,
                            cause: Error::UnsupportedPageSize(remaining),
                        });
                    }
                };

                let op = MapOp {
                    iova,
                    paddr,
                    size: pgsize,
                    attrs,
                    warn_on_conflict: true,
                };

                // Stay on the fast path while the next leaf lands in the
                // batch's window.
                let window = state
                    .as_ref()
                    .and_then(|b| (iova < b.iova_end).then(|| (b.table, b.parent)));
                let res = match window {
                    Some((table, parent)) => {
                        let idx = self.geo.lvl_idx(iova, MAX_LEVELS - 1);
                        let res =
                            self.init_pte(&op, MAX_LEVELS - 1, &mut table_mut(table)[idx], parent, false);
                        if res.is_ok() {
                            if let Some(batch) = state.as_mut() {
                                batch.count += 1;
                            }
                        }
                        res
                    }
                    None => {
                        let pgd = self.pgd_table();
                        self.install(&op, start_lvl, pgd, None, Some(&mut state))
                    }
                };

                match res {
                    Ok(()) => {
                        iova += pgsize;
                        paddr += pgsize;
                        mapped += pgsize;
                        remaining -= pgsize;
                    }
                    Err(cause) => {
                        // Publish anything still batched; the caller undoes
                        // the installed prefix with unmap.
                        if let Some(batch) = state.take() {
                            self.flush_batch(&batch);
                        }
                        return Err(SgMapError { mapped, cause });
                    }
                }
            }
        }

        if let Some(batch) = state.take() {
            self.flush_batch(&batch);
        }
        Ok(mapped)
    }

    /// Unmaps up to `size` bytes at `iova` and returns the bytes actually
    /// unmapped. Blocks larger than the remaining request are split into
    /// tables of smaller leaves around the hole. Device TLBs are flushed
    /// once at the end if anything changed.
    pub fn unmap(&mut self, iova: Iova, size: u64) -> u64 {
        let mut unmapped = 0u64;
        let mut iova = iova.bits();

        while unmapped < size {
            let remaining = size - unmapped;
            let to_unmap = if remaining < SZ_2M {
                remaining
            } else {
                match self.geo.best_pgsize(iova, remaining) {
                    Some(size) => size,
                    None => break,
                }
            };
            let pgd = self.pgd_table();
            let ret = self.do_unmap(iova, to_unmap, self.geo.start_level(), pgd);
            if ret == 0 {
                break;
            }
            unmapped += ret;
            iova += ret;
        }

        if unmapped > 0 {
            self.tlb.tlb_flush_all();
        }
        unmapped
    }

    /// Walks the tree for `iova`. Returns `None` when no leaf covers it.
    pub fn iova_to_phys(&self, iova: Iova) -> Option<PhysAddr> {
        let mut lvl = self.geo.start_level();
        let mut table = self.pgd_table();

        while lvl < MAX_LEVELS {
            let pte = table_shared(table)[self.geo.lvl_idx(iova.bits(), lvl)];
            if pte.is_clear() {
                return None;
            }
            if pte.is_leaf(lvl) {
                let offset = iova.bits() & (self.geo.block_size(lvl) - 1);
                return Some(PhysAddr::new(
                    pte.addr(self.geo.granule_shift()).bits() | offset,
                ));
            }
            table = self.child_ref(pte);
            lvl += 1;
        }
        // Ran out of page table to walk.
        None
    }

    fn pgd_table(&self) -> TableRef {
        TableRef {
            pa: self.pgd,
            entries: self.geo.pgd_entries(),
        }
    }

    /// Returns the table referenced by a table descriptor.
    fn child_ref(&self, pte: Pte) -> TableRef {
        TableRef {
            pa: pte.addr(self.geo.granule_shift()),
            entries: self.geo.table_entries(),
        }
    }

    fn flush_slot(&self, slot: &Pte) {
        self.tlb
            .flush_pgtable(slot as *const Pte as *const u8, mem::size_of::<Pte>());
    }

    fn flush_slots(&self, start: &Pte, count: usize) {
        self.tlb
            .flush_pgtable(start as *const Pte as *const u8, count * mem::size_of::<Pte>());
    }

    fn flush_batch(&self, batch: &Batch) {
        let ptes = table_shared(batch.table);
        self.flush_slots(&ptes[batch.start], batch.count);
    }

    /// Writes a leaf descriptor into `slot`, publishing it unless the
    /// caller batches, and charges the parent descriptor's use counter.
    fn init_pte(
        &mut self,
        op: &MapOp,
        lvl: usize,
        slot: &mut Pte,
        parent: Option<(TableRef, usize)>,
        flush: bool,
    ) -> Result<()> {
        if slot.is_valid() {
            // We require an unmap first.
            if op.warn_on_conflict {
                log::warn!("map conflicts with live descriptor at iova {:#x}", op.iova);
            }
            return Err(Error::AlreadyMapped);
        }

        *slot = Pte::new_leaf(
            lvl,
            PhysAddr::new(op.paddr),
            op.attrs,
            self.quirks.contains(Quirks::ARM_NS),
        );
        if flush {
            self.flush_slot(slot);
        }

        if let Some((ptable, pidx)) = parent {
            // The counter sits in walker-ignored bits, so no publish is
            // needed for it.
            table_mut(ptable)[pidx].tblcnt_add(1);
        }
        Ok(())
    }

    /// Installs the leaf described by `op`, descending from `table` at
    /// `lvl` and creating interior tables on demand. `parent` names the
    /// slot referencing `table`, if any; `ms` carries scatter-gather
    /// batching state.
    fn install(
        &mut self,
        op: &MapOp,
        lvl: usize,
        table: TableRef,
        parent: Option<(TableRef, usize)>,
        ms: Option<&mut MapState>,
    ) -> Result<()> {
        let ptes = table_mut(table);
        let idx = self.geo.lvl_idx(op.iova, lvl);
        let block_size = self.geo.block_size(lvl);

        // If we can install a leaf entry at this level, then do so.
        if op.size == block_size && op.size & self.geo.pgsize_bitmap() != 0 {
            return match ms {
                None => self.init_pte(op, lvl, &mut ptes[idx], parent, true),
                Some(state) => {
                    // Whatever was batched belongs to another table or
                    // window; publish it first.
                    if let Some(batch) = state.take() {
                        self.flush_batch(&batch);
                    }
                    if lvl == MAX_LEVELS - 1 {
                        // Page leaf: open a batch bounded by the next 2M
                        // boundary and defer the publish to its flush.
                        let res = self.init_pte(op, lvl, &mut ptes[idx], parent, false);
                        if res.is_ok() {
                            *state = Some(Batch {
                                iova_end: (op.iova & !(SZ_2M - 1)) + SZ_2M,
                                table,
                                parent,
                                start: idx,
                                count: 1,
                            });
                        }
                        res
                    } else {
                        // A block leaf can't join a batch.
                        self.init_pte(op, lvl, &mut ptes[idx], parent, true)
                    }
                }
            };
        }

        // We can't allocate tables at the final level.
        if lvl >= MAX_LEVELS - 1 {
            log::warn!("cannot map size {:#x} below the terminal level", op.size);
            return Err(Error::UnsupportedPageSize(op.size));
        }

        // Grab a pointer to the next level, materializing it if needed.
        let pte = ptes[idx];
        let child = if pte.is_clear() {
            let len = self.geo.granule_size();
            let pa = self
                .alloc
                .alloc_pages(len)
                .ok_or(Error::InsufficientPtePages)?;
            // The zeroed table is published before the descriptor
            // referencing it.
            self.tlb.flush_pgtable(pa.bits() as *const u8, len);
            ptes[idx] = Pte::new_table(pa, self.quirks.contains(Quirks::ARM_NS));
            self.flush_slot(&ptes[idx]);
            TableRef {
                pa,
                entries: self.geo.table_entries(),
            }
        } else if pte.is_leaf(lvl) {
            // The range sits inside an existing block mapping.
            if op.warn_on_conflict {
                log::warn!("map conflicts with block mapping at iova {:#x}", op.iova);
            }
            return Err(Error::AlreadyMapped);
        } else {
            self.child_ref(pte)
        };

        self.install(op, lvl + 1, child, Some((table, idx)), ms)
    }

    fn do_unmap(&mut self, iova: u64, size: u64, lvl: usize, table: TableRef) -> u64 {
        // Something went horribly wrong and we ran out of page table.
        if lvl >= MAX_LEVELS {
            log::warn!("unmap walked past the terminal level at iova {iova:#x}");
            return 0;
        }

        let ptes = table_mut(table);
        let idx = self.geo.lvl_idx(iova, lvl);
        let pte = ptes[idx];
        if pte.is_clear() {
            // Nothing mapped here.
            return 0;
        }

        let block_size = self.geo.block_size(lvl);

        if size == block_size {
            // The request covers this descriptor exactly. The cleared
            // slot is published before the subtree is released.
            ptes[idx] = Pte::invalid();
            self.flush_slot(&ptes[idx]);
            if !pte.is_leaf(lvl) {
                self.free_table(self.child_ref(pte), lvl + 1);
            }
            size
        } else if lvl == MAX_LEVELS - 2 && !pte.is_leaf(lvl) {
            // A table at the penultimate level references page leaves
            // only; zero the covered run in one sweep.
            let child = self.child_ref(pte);
            let child_ptes = table_mut(child);
            let offset = self.geo.lvl_idx(iova, lvl + 1);
            let entry_size = self.geo.block_size(lvl + 1);
            let entries = ((size / entry_size) as usize).min(child.entries - offset);

            child_ptes[offset..offset + entries].fill(Pte::invalid());
            self.flush_slots(&child_ptes[offset], entries);

            ptes[idx].tblcnt_sub(entries);
            if ptes[idx].tblcnt() == 0 {
                // No mappings left beneath this table; release it.
                ptes[idx] = Pte::invalid();
                self.flush_slot(&ptes[idx]);
                self.alloc
                    .free_pages(child.pa, child.entries * mem::size_of::<Pte>());
            }
            entries as u64 * entry_size
        } else if pte.is_leaf(lvl) {
            // Unmapping a hole out of a larger block.
            self.split_block_unmap(iova, pte, lvl, &mut ptes[idx])
        } else {
            // Keep on walking.
            self.do_unmap(iova, size, lvl + 1, self.child_ref(pte))
        }
    }

    /// Replaces the block at `slot` with a one-level-deeper table whose
    /// leaves cover the block minus the sub-block at `iova`, carrying the
    /// block's attributes. Returns the bytes carved out, or 0 if the
    /// replacement table couldn't be built.
    fn split_block_unmap(&mut self, iova: u64, block: Pte, lvl: usize, slot: &mut Pte) -> u64 {
        let block_size = self.geo.block_size(lvl);
        let child_size = self.geo.block_size(lvl + 1);
        let blk_start = iova & !(block_size - 1);
        let attrs = block.attrs();

        let table_len = self.geo.granule_size();
        let table_pa = match self.alloc.alloc_pages(table_len) {
            Some(pa) => pa,
            None => return 0,
        };
        self.tlb.flush_pgtable(table_pa.bits() as *const u8, table_len);

        let table = TableRef {
            pa: table_pa,
            entries: self.geo.table_entries(),
        };
        // The replacement's use counter accumulates in this local
        // descriptor and reaches the parent slot only once the table is
        // complete. Every surviving sub-block is a direct leaf of the new
        // table, so the count is exactly the installs that succeed.
        let mut table_pte = Pte::new_table(table_pa, self.quirks.contains(Quirks::ARM_NS));

        let mut sub = blk_start;
        let mut paddr = block.addr(self.geo.granule_shift()).bits();
        while sub < blk_start + block_size {
            // Skip the hole being unmapped.
            if sub != iova {
                let op = MapOp {
                    iova: sub,
                    paddr,
                    size: child_size,
                    attrs,
                    warn_on_conflict: true,
                };
                if self.install(&op, lvl + 1, table, None, None).is_err() {
                    // Free the table we allocated.
                    self.free_table(table, lvl + 1);
                    return 0;
                }
                table_pte.tblcnt_add(1);
            }
            sub += child_size;
            paddr += child_size;
        }

        // The fully built replacement is published before the walker can
        // follow it.
        *slot = table_pte;
        self.flush_slot(slot);
        child_size
    }

    /// Returns a subtree's tables to the allocator, post-order. `lvl` is
    /// the level of the table itself.
    fn free_table(&mut self, table: TableRef, lvl: usize) {
        // Only leaf entries at the terminal level.
        if lvl < MAX_LEVELS - 1 {
            let ptes = table_shared(table);
            for &pte in ptes.iter() {
                if pte.is_clear() || pte.is_leaf(lvl) {
                    continue;
                }
                self.free_table(self.child_ref(pte), lvl + 1);
            }
        }

        self.alloc
            .free_pages(table.pa, table.entries * mem::size_of::<Pte>());
    }
}

impl<T: TlbOps, A: IoPageAllocator> Drop for IoPageTable<T, A> {
    fn drop(&mut self) {
        let pgd = self.pgd_table();
        self.free_table(pgd, self.geo.start_level());
    }
}

impl<T: TlbOps, A: IoPageAllocator> fmt::Debug for IoPageTable<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPageTable")
            .field("fmt", &self.fmt)
            .field("granule", &self.geo.granule())
            .field("levels", &self.geo.levels())
            .field("pgd_size", &self.geo.pgd_size())
            .field("bits_per_level", &self.geo.bits_per_level())
            .field("pgsize_bitmap", &self.geo.pgsize_bitmap())
            .finish()
    }
}

#[cfg(test)]
impl<T: TlbOps, A: IoPageAllocator> IoPageTable<T, A> {
    pub(crate) fn levels(&self) -> usize {
        self.geo.levels()
    }

    pub(crate) fn pgd_len(&self) -> usize {
        self.geo.pgd_size()
    }

    pub(crate) fn supported_pgsizes(&self) -> u64 {
        self.geo.pgsize_bitmap()
    }

    /// Raw bits of a root descriptor, for asserting on the wire format.
    pub(crate) fn root_slot_bits(&self, idx: usize) -> u64 {
        table_shared(self.pgd_table())[idx].bits()
    }

    /// Returns `true` if the root contains no descriptors, i.e. the whole
    /// tree has been torn back down to an empty root.
    pub(crate) fn root_is_empty(&self) -> bool {
        table_shared(self.pgd_table()).iter().all(Pte::is_clear)
    }
}
