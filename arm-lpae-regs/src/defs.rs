// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::register_bitfields;

// Stage-1 translation control.
register_bitfields![u64,
    pub tcr [
        // Size offset of the region addressed by TTBR0: 64 - IAS.
        t0sz OFFSET(0) NUMBITS(6) [],
        // Inner cacheability for walks out of TTBR0.
        irgn0 OFFSET(8) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackWriteAlloc = 1,
            WriteThrough = 2,
            WriteBack = 3,
        ],
        // Outer cacheability for walks out of TTBR0.
        orgn0 OFFSET(10) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackWriteAlloc = 1,
            WriteThrough = 2,
            WriteBack = 3,
        ],
        // Shareability for walks out of TTBR0.
        sh0 OFFSET(12) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3,
        ],
        // Granule size for TTBR0.
        tg0 OFFSET(14) NUMBITS(2) [
            Granule4k = 0,
            Granule64k = 1,
            Granule16k = 2,
        ],
        // Disable walks out of TTBR1; accesses through it fault.
        epd1 OFFSET(23) NUMBITS(1) [
            Fault = 1,
        ],
        // Extended address enable. Only meaningful in the 32-bit register;
        // selects the LPAE (long-descriptor) format.
        eae OFFSET(31) NUMBITS(1) [],
        // Intermediate physical address size.
        ips OFFSET(32) NUMBITS(3) [
            Bits32 = 0,
            Bits36 = 1,
            Bits40 = 2,
            Bits42 = 3,
            Bits44 = 4,
            Bits48 = 5,
        ],
    ]
];

// Stage-2 translation control.
register_bitfields![u64,
    pub vtcr [
        // Size offset of the region addressed by VTTBR: 64 - IAS.
        t0sz OFFSET(0) NUMBITS(6) [],
        // Starting level of the stage-2 walk. The field encoding is the
        // complement of the architectural level, shifted by one for the
        // 4K granule.
        sl0 OFFSET(6) NUMBITS(2) [],
        irgn0 OFFSET(8) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackWriteAlloc = 1,
            WriteThrough = 2,
            WriteBack = 3,
        ],
        orgn0 OFFSET(10) NUMBITS(2) [
            NonCacheable = 0,
            WriteBackWriteAlloc = 1,
            WriteThrough = 2,
            WriteBack = 3,
        ],
        sh0 OFFSET(12) NUMBITS(2) [
            NonShareable = 0,
            OuterShareable = 2,
            InnerShareable = 3,
        ],
        tg0 OFFSET(14) NUMBITS(2) [
            Granule4k = 0,
            Granule64k = 1,
            Granule16k = 2,
        ],
        // Physical address size.
        ps OFFSET(16) NUMBITS(3) [
            Bits32 = 0,
            Bits36 = 1,
            Bits40 = 2,
            Bits42 = 3,
            Bits44 = 4,
            Bits48 = 5,
        ],
        // Architecturally RES1.
        res1 OFFSET(31) NUMBITS(1) [],
    ]
];

/// Returns the PS/IPS field encoding for an output address size in bits, or
/// `None` if the architecture defines no encoding for that size.
pub const fn physical_address_size(oas: u32) -> Option<u64> {
    match oas {
        32 => Some(0),
        36 => Some(1),
        40 => Some(2),
        42 => Some(3),
        44 => Some(4),
        48 => Some(5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tock_registers::LocalRegisterCopy;

    #[test]
    fn tcr_field_positions() {
        let mut reg = LocalRegisterCopy::<u64, tcr::Register>::new(0);
        reg.modify(tcr::sh0::InnerShareable);
        reg.modify(tcr::irgn0::WriteBackWriteAlloc);
        reg.modify(tcr::orgn0::WriteBackWriteAlloc);
        reg.modify(tcr::tg0::Granule16k);
        reg.modify(tcr::epd1::Fault);
        reg.modify(tcr::ips::Bits48);
        assert_eq!(
            reg.get(),
            (3 << 12) | (1 << 8) | (1 << 10) | (2 << 14) | (1 << 23) | (5 << 32)
        );
    }

    #[test]
    fn vtcr_field_positions() {
        let mut reg = LocalRegisterCopy::<u64, vtcr::Register>::new(0);
        reg.modify(vtcr::res1.val(1));
        reg.modify(vtcr::sl0.val(1));
        reg.modify(vtcr::ps::Bits40);
        reg.modify(vtcr::t0sz.val(24));
        assert_eq!(reg.get(), (1 << 31) | (1 << 6) | (2 << 16) | 24);
    }

    #[test]
    fn ps_encodings() {
        assert_eq!(physical_address_size(32), Some(0));
        assert_eq!(physical_address_size(48), Some(5));
        assert_eq!(physical_address_size(34), None);
        assert_eq!(physical_address_size(52), None);
    }
}
