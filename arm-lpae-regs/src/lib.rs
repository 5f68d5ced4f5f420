// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]
#![allow(missing_docs)]

//! Bit layouts of the ARM LPAE translation-control registers an IOMMU
//! driver programs from values produced by the page-table allocator.
//! defs - TCR/VTCR/MAIR register field definitions
//! mair - memory attribute encodings for the three MAIR indices

mod defs;
mod mair;

pub use defs::*;
pub use mair::*;
