use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;
use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::EPT_LEVELS;
use crate::HostPhysAddr;

register_bitfields! [
    u64,
    /// The EPT pointer loaded into the VMCS. (SDM Vol. 3C, Section 25.6.11)
    pub EPT_POINTER [
        MEMORY_TYPE OFFSET(0) NUMBITS(3) [
            Uncached = 0,
            WriteBack = 6
        ],
        PAGE_WALK_LENGTH OFFSET(3) NUMBITS(3) [],
        ENABLE_ACCESSED_DIRTY OFFSET(6) NUMBITS(1) [],
        PML4_PFN OFFSET(12) NUMBITS(40) []
    ]
];

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// EPT memory types. (SDM Vol. 3C, Section 29.3.7)
    pub enum EptMemType {
        Uncached = 0,
        WriteCombining = 1,
        WriteThrough = 4,
        WriteProtected = 5,
        WriteBack = 6,
    }
}

bitflags! {
    /// Attribute bits of an EPT paging-structure entry. (SDM Vol. 3C, Section 29.3.2)
    pub struct EptFlags: u64 {
        const READ =                1 << 0;
        const WRITE =               1 << 1;
        const EXECUTE =             1 << 2;
        const MEM_TYPE_MASK =       0b111 << 3;
        const IGNORE_PAT =          1 << 6;
        const HUGE_PAGE =           1 << 7;
        const ACCESSED =            1 << 8;
        const DIRTY =               1 << 9;
        const EXECUTE_FOR_USER =    1 << 10;
    }
}

impl EptFlags {
    /// Read, write and execute: nothing is trapped.
    pub fn pass_through() -> Self {
        Self::READ | Self::WRITE | Self::EXECUTE
    }
}

const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000; // bits 12..52

/// The EPT pointer, i.e. the root of the guest-physical to host-physical translation.
#[derive(Clone, Copy)]
pub struct EptPointer(LocalRegisterCopy<u64, EPT_POINTER::Register>);

impl EptPointer {
    /// Creates an EPT pointer for a `EPT_LEVELS`-level walk over write-back tables rooted at the
    /// PML4 at `pml4`.
    pub fn new(pml4: HostPhysAddr) -> Self {
        let mut eptp = LocalRegisterCopy::new(0);
        eptp.write(
            EPT_POINTER::MEMORY_TYPE::WriteBack
                + EPT_POINTER::PAGE_WALK_LENGTH.val(EPT_LEVELS as u64 - 1)
                + EPT_POINTER::PML4_PFN.val((pml4 as u64) >> 12),
        );
        Self(eptp)
    }

    /// The raw value to write into the VMCS.
    pub fn bits(&self) -> u64 {
        self.0.get()
    }

    pub fn memory_type(&self) -> u64 {
        self.0.read(EPT_POINTER::MEMORY_TYPE)
    }

    /// Number of levels of the walk.
    pub fn levels(&self) -> usize {
        self.0.read(EPT_POINTER::PAGE_WALK_LENGTH) as usize + 1
    }

    /// Physical address of the PML4.
    pub fn pml4(&self) -> HostPhysAddr {
        (self.0.read(EPT_POINTER::PML4_PFN) << 12) as HostPhysAddr
    }
}

impl fmt::Debug for EptPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptPointer")
            .field("raw", &format_args!("{:#x}", self.bits()))
            .field("memory_type", &self.memory_type())
            .field("levels", &self.levels())
            .field("pml4", &format_args!("{:#x}", self.pml4()))
            .finish()
    }
}

/// An EPT paging-structure entry, at any level.
///
/// An all-zero entry is not present. Non-leaf entries point at the next table, leaf (PT) entries
/// map a 4K guest page.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// A pass-through entry for `level` pointing at `pa`: read, write and execute are granted
    /// and, at the PT level, the page is write-back.
    pub fn pass_through(level: usize, pa: HostPhysAddr) -> Self {
        let mut entry = Self::empty();
        entry.set_flags(EptFlags::pass_through());
        entry.set_phys_addr(pa);
        if level == 1 {
            entry.set_memory_type(EptMemType::WriteBack);
        }
        entry
    }

    pub const fn is_present(&self) -> bool {
        self.0 != 0
    }

    pub fn flags(&self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// Replaces the attribute bits, leaving the frame number alone.
    pub fn set_flags(&mut self, flags: EptFlags) {
        self.0 = (self.0 & PHYS_ADDR_MASK) | flags.bits();
    }

    /// The memory type of a leaf entry, or the raw value if it is not a valid type.
    pub fn memory_type(&self) -> Result<EptMemType, u8> {
        EptMemType::try_from(self.0.get_bits(3..6) as u8)
    }

    pub fn set_memory_type(&mut self, mem_type: EptMemType) {
        self.0.set_bits(3..6, u8::from(mem_type) as u64);
    }

    /// Physical address of the next table or the mapped page.
    pub fn phys_addr(&self) -> HostPhysAddr {
        (self.0 & PHYS_ADDR_MASK) as HostPhysAddr
    }

    /// Sets the frame number from `pa`; the offset within the page is dropped.
    pub fn set_phys_addr(&mut self, pa: HostPhysAddr) {
        self.0 = (self.0 & !PHYS_ADDR_MASK) | (pa as u64 & PHYS_ADDR_MASK);
    }
}

impl fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptEntry")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("paddr", &format_args!("{:#x}", self.phys_addr()))
            .field("flags", &self.flags())
            .field("mem_type", &self.memory_type())
            .finish()
    }
}

/// The memory cell holding an `EptEntry`.
///
/// Cells are shared by every processor handling EPT violations, so they are accessed atomically.
#[repr(transparent)]
pub struct EptSlot(AtomicU64);

impl EptSlot {
    pub fn load(&self) -> EptEntry {
        EptEntry(self.0.load(Ordering::Acquire))
    }

    /// Overwrites the entry. Used by interceptors to change the permissions of a mapped page;
    /// the caller is responsible for invalidating cached translations afterwards.
    pub fn store(&self, entry: EptEntry) {
        self.0.store(entry.0, Ordering::Release)
    }

    /// Installs `entry` if the slot is still empty, otherwise returns the entry found.
    pub(super) fn install(&self, entry: EptEntry) -> Result<(), EptEntry> {
        self.0
            .compare_exchange(0, entry.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EptEntry)
    }
}

impl fmt::Debug for EptSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ept_pointer_layout() {
        let eptp = EptPointer::new(0x1234_5000);
        // write-back, walk length 3
        assert_eq!(eptp.bits(), 0x1234_5000 | (3 << 3) | 6);
        assert_eq!(eptp.memory_type(), 6);
        assert_eq!(eptp.levels(), 4);
        assert_eq!(eptp.pml4(), 0x1234_5000);
    }

    #[test]
    fn leaf_pass_through() {
        let entry = EptEntry::pass_through(1, 0x10_3abc);
        assert!(entry.is_present());
        assert_eq!(entry.phys_addr(), 0x10_3000);
        assert_eq!(entry.memory_type(), Ok(EptMemType::WriteBack));
        assert_eq!(
            entry.flags() & EptFlags::pass_through(),
            EptFlags::pass_through()
        );
        assert_eq!(entry.bits(), 0x10_3000 | (6 << 3) | 0b111);
    }

    #[test]
    fn table_pass_through_has_no_memory_type() {
        let entry = EptEntry::pass_through(3, 0x7f_f000);
        assert_eq!(entry.bits(), 0x7f_f000 | 0b111);
        assert_eq!(entry.memory_type(), Ok(EptMemType::Uncached));
    }

    #[test]
    fn set_flags_keeps_frame() {
        let mut entry = EptEntry::pass_through(1, 0xfee0_0000);
        entry.set_flags(EptFlags::READ);
        assert_eq!(entry.phys_addr(), 0xfee0_0000);
        assert_eq!(entry.flags(), EptFlags::READ);
        assert_eq!(entry.memory_type(), Ok(EptMemType::Uncached));
        assert!(EptEntry::empty().memory_type().is_ok());
        assert_eq!(EptEntry::from_bits(0b111 << 3).memory_type(), Err(7));
    }

    #[test]
    fn slot_install_only_once() {
        let slot = EptSlot(AtomicU64::new(0));
        let first = EptEntry::pass_through(1, 0x1000);
        assert_eq!(slot.install(first), Ok(()));
        assert_eq!(slot.install(EptEntry::pass_through(1, 0x2000)), Err(first));
        assert_eq!(slot.load(), first);
    }
}
