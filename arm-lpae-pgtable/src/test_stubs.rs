// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::vec::Vec;

use iommu_pages::{Iova, PhysAddr};

use crate::config::{IoPageAllocator, TlbOps};

#[derive(Default)]
struct AllocState {
    live: HashMap<u64, usize>,
    total: usize,
    fail_after: Option<usize>,
}

/// Page-table memory backed by the host heap. Allocations are naturally
/// aligned and zeroed; the table walks them through their host address,
/// standing in for identity-mapped physical memory. Frees are checked
/// against the live set so double frees and size mismatches fail the test.
#[derive(Clone, Default)]
pub struct StubAllocator {
    state: Rc<RefCell<AllocState>>,
}

impl StubAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes allocation fail after `count` further successes.
    pub fn fail_after(&self, count: usize) {
        self.state.borrow_mut().fail_after = Some(count);
    }

    /// Number of allocations not yet freed.
    pub fn live_allocs(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn total_allocs(&self) -> usize {
        self.state.borrow().total
    }
}

impl IoPageAllocator for StubAllocator {
    fn alloc_pages(&self, len: usize) -> Option<PhysAddr> {
        let mut state = self.state.borrow_mut();
        if let Some(remaining) = state.fail_after.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let layout = Layout::from_size_align(len, len).ok()?;
        // Safety: every table the tree asks for has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        state.live.insert(ptr as u64, len);
        state.total += 1;
        Some(PhysAddr::new(ptr as u64))
    }

    fn free_pages(&self, addr: PhysAddr, len: usize) {
        let removed = self.state.borrow_mut().live.remove(&addr.bits());
        assert_eq!(removed, Some(len), "bad free of {:#x}", addr.bits());
        // Safety: addr and len were returned by alloc_pages above.
        unsafe {
            dealloc(
                addr.bits() as *mut u8,
                Layout::from_size_align(len, len).unwrap(),
            )
        };
    }
}

#[derive(Default)]
struct TlbState {
    flushes: Vec<(u64, usize)>,
    flush_all: usize,
    add_flush: usize,
    syncs: usize,
}

/// Records every coherency hook invocation so tests can assert on publish
/// coverage and TLB invalidation counts.
#[derive(Clone, Default)]
pub struct StubTlb {
    state: Rc<RefCell<TlbState>>,
}

impl StubTlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_count(&self) -> usize {
        self.state.borrow().flushes.len()
    }

    pub fn flushed_bytes(&self) -> usize {
        self.state.borrow().flushes.iter().map(|(_, len)| len).sum()
    }

    pub fn flush_all_count(&self) -> usize {
        self.state.borrow().flush_all
    }

    pub fn reset(&self) {
        *self.state.borrow_mut() = TlbState::default();
    }
}

impl TlbOps for StubTlb {
    fn flush_pgtable(&self, ptr: *const u8, len: usize) {
        self.state.borrow_mut().flushes.push((ptr as u64, len));
    }

    fn tlb_flush_all(&self) {
        self.state.borrow_mut().flush_all += 1;
    }

    fn tlb_add_flush(&self, _iova: Iova, _size: u64, _leaf: bool) {
        self.state.borrow_mut().add_flush += 1;
    }

    fn tlb_sync(&self) {
        self.state.borrow_mut().syncs += 1;
    }
}
