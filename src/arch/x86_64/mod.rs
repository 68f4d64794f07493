mod ept;
mod vmx;

pub use ept::{
    EptData, EptEntry, EptFlags, EptMemType, EptPointer, EptSlot, EptViolationInfo,
    EptViolationInterceptor, EptViolationOutcome, EptViolationQualification, EPT_LEVELS,
    PREALLOCATED_ENTRIES,
};
pub use vmx::{
    apic_base_from_msr, is_ept_available, EptVpidCap, VmcsField, MSR_IA32_APIC_BASE,
    MSR_IA32_VMX_EPT_VPID_CAP,
};
