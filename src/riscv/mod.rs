pub mod asm;
pub mod memlayout;
pub mod plic;

pub use asm::*;

use bitflags::bitflags;

/// A single Sv39 page-table entry.
pub type Pte = u64;
/// A page-table page: 512 PTEs.
pub type Pagetable = *mut [Pte; 512];

/// Previous mode
pub const MSTATUS_MPP_MASK: u64 = 3 << 11;
pub const MSTATUS_MPP_S: u64 = 1 << 11;
/// Machine-mode interrupt enable.
pub const MSTATUS_MIE: u64 = 1 << 3;

/// Previous mode: 1 = Supervisor, 0 = User
pub const SSTATUS_SPP: u64 = 1 << 8;
/// Supervisor Previous Interrupt Enable
pub const SSTATUS_SPIE: u64 = 1 << 5;
/// Supervisor Interrupt Enable
pub const SSTATUS_SIE: u64 = 1 << 1;

/// Supervisor External Interrupt Enable
pub const SIE_SEIE: u64 = 1 << 9;
/// Supervisor Timer Interrupt Enable
pub const SIE_STIE: u64 = 1 << 5;
/// Supervisor Software Interrupt Enable
pub const SIE_SSIE: u64 = 1 << 1;

/// Machine-mode Timer Interrupt Enable
pub const MIE_MTIE: u64 = 1 << 7;

pub const SATP_SV39: u64 = 8 << 60;

/// Bytes per page
pub const PGSIZE: u64 = 4096;
/// Bits of offset within a page
pub const PGSHIFT: u64 = 12;

bitflags! {
    /// Permission and status bits of a page-table entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User-accessible
        const U = 1 << 4;
        /// Global
        const G = 1 << 5;
        /// Accessed
        const A = 1 << 6;
        /// Dirty
        const D = 1 << 7;
    }
}

/// One beyond the highest possible virtual address.
///
/// MAXVA is actually one bit less than the max allowed by Sv39
/// to avoid having to sign-extend virtual addresses that have
/// the high bit set.
pub const MAXVA: u64 = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pg_round_up(addr: u64) -> u64 {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Extract the three 9-bit page-table indices from a virtual address.
pub const fn px(level: usize, va: u64) -> usize {
    ((va >> (PGSHIFT + 9 * level as u64)) & 0x1ff) as usize
}

pub const fn pa2pte(pa: u64) -> Pte {
    (pa >> 12) << 10
}

pub const fn pte2pa(pte: Pte) -> u64 {
    (pte >> 10) << 12
}

pub fn pte_flags(pte: Pte) -> PteFlags {
    PteFlags::from_bits_truncate(pte & 0x3ff)
}

pub fn make_satp(pagetable: Pagetable) -> u64 {
    SATP_SV39 | (pagetable as u64 >> 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_round_trip() {
        let pa = 0x8020_3000u64;
        let pte = pa2pte(pa) | (PteFlags::V | PteFlags::R | PteFlags::U).bits();
        assert_eq!(pte2pa(pte), pa);
        assert_eq!(pte_flags(pte), PteFlags::V | PteFlags::R | PteFlags::U);
    }

    #[test]
    fn pte_flags_ignore_ppn() {
        let pte = pa2pte(0x8000_0000) | PteFlags::V.bits();
        assert!(!pte_flags(pte).contains(PteFlags::W));
        assert!(pte_flags(pte).contains(PteFlags::V));
    }

    #[test]
    fn page_rounding() {
        assert_eq!(pg_round_up(0), 0);
        assert_eq!(pg_round_up(1), PGSIZE);
        assert_eq!(pg_round_up(PGSIZE), PGSIZE);
        assert_eq!(pg_round_down(PGSIZE + 1), PGSIZE);
        assert_eq!(pg_round_down(PGSIZE - 1), 0);
    }

    #[test]
    fn va_indices() {
        // VA = L2 index 1, L1 index 2, L0 index 3, offset 4.
        let va = (1u64 << 30) | (2u64 << 21) | (3u64 << 12) | 4;
        assert_eq!(px(2, va), 1);
        assert_eq!(px(1, va), 2);
        assert_eq!(px(0, va), 3);
        assert!(va < MAXVA);
    }
}
