#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms, non_upper_case_globals)]

#[macro_use]
extern crate log;

#[cfg(target_arch = "x86_64")]
#[path = "arch/x86_64/mod.rs"]
mod arch;
mod hal;
mod memory;
#[cfg(test)]
mod test_hal;

pub type HyperResult<T = ()> = Result<T, HyperError>;

#[cfg(target_arch = "x86_64")]
pub use arch::{
    apic_base_from_msr, is_ept_available, EptData, EptEntry, EptFlags, EptMemType, EptPointer,
    EptSlot, EptViolationInfo, EptViolationInterceptor, EptViolationOutcome,
    EptViolationQualification, EptVpidCap, VmcsField, EPT_LEVELS, MSR_IA32_APIC_BASE,
    MSR_IA32_VMX_EPT_VPID_CAP, PREALLOCATED_ENTRIES,
};
pub use hal::HyperCraftHal;
pub use memory::{
    GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr, PhysMemoryRanges, PhysMemoryRun,
    MAX_PHYS_MEMORY_RUNS, PAGE_SIZE_4K,
};

#[derive(Debug, PartialEq)]
pub enum HyperError {
    NoMemory,
    OutOfRange,
}
