use bit_field::BitField;
use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::HostPhysAddr;

/// IA32_APIC_BASE, holds the physical base address of the local APIC.
pub const MSR_IA32_APIC_BASE: u32 = 0x1b;
/// IA32_VMX_EPT_VPID_CAP, reports the EPT and VPID capabilities. (SDM Vol. 3D, Appendix A.10)
pub const MSR_IA32_VMX_EPT_VPID_CAP: u32 = 0x48c;

/// Physical-address widths beyond this are not supported by a 4-level EPT.
const MAX_SUPPORTED_PHYS_ADDR_BITS: u8 = 48;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Encodings of the VMCS fields read while handling an EPT violation. (SDM Vol. 3D, Appendix B)
    pub enum VmcsField {
        GuestPhysicalAddress = 0x2400,
        ExitQualification = 0x6400,
        GuestLinearAddress = 0x640a,
    }
}

bitflags! {
    /// Bits of IA32_VMX_EPT_VPID_CAP.
    pub struct EptVpidCap: u64 {
        const EXECUTE_ONLY = 1 << 0;
        const PAGE_WALK_LENGTH_4 = 1 << 6;
        const PAGE_WALK_LENGTH_5 = 1 << 7;
        const MEMORY_TYPE_UC = 1 << 8;
        const MEMORY_TYPE_WB = 1 << 14;
        const PDE_2MB = 1 << 16;
        const PDPTE_1GB = 1 << 17;
        const INVEPT = 1 << 20;
        const ACCESSED_DIRTY = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXT = 1 << 26;
        const INVVPID = 1 << 32;
    }
}

/// Checks if the processor supports EPT well enough for us: a 4-level walk over write-back
/// tables, execute-only pages and every flavour of INVEPT.
///
/// `ept_vpid_cap` is the value of `MSR_IA32_VMX_EPT_VPID_CAP` and `phys_addr_bits` comes from
/// CPUID.80000008H:EAX[7:0].
pub fn is_ept_available(ept_vpid_cap: u64, phys_addr_bits: u8) -> bool {
    debug!("Physical Address Range = {} bits", phys_addr_bits);
    if phys_addr_bits > MAX_SUPPORTED_PHYS_ADDR_BITS {
        return false;
    }
    let required = EptVpidCap::PAGE_WALK_LENGTH_4
        | EptVpidCap::EXECUTE_ONLY
        | EptVpidCap::MEMORY_TYPE_WB
        | EptVpidCap::INVEPT
        | EptVpidCap::INVEPT_SINGLE_CONTEXT
        | EptVpidCap::INVEPT_ALL_CONTEXT;
    EptVpidCap::from_bits_truncate(ept_vpid_cap).contains(required)
}

/// Extracts the local APIC base address from the value of `MSR_IA32_APIC_BASE`.
pub fn apic_base_from_msr(msr: u64) -> HostPhysAddr {
    (msr.get_bits(12..52) << 12) as HostPhysAddr
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_CAPS: u64 = 0x0000_0f01_0674_4141;

    #[test]
    fn ept_available() {
        assert!(is_ept_available(GOOD_CAPS, 39));
        assert!(is_ept_available(GOOD_CAPS, 48));
    }

    #[test]
    fn ept_unavailable_with_wide_phys_addr() {
        assert!(!is_ept_available(GOOD_CAPS, 52));
    }

    #[test]
    fn ept_unavailable_without_required_caps() {
        for missing in [
            EptVpidCap::PAGE_WALK_LENGTH_4,
            EptVpidCap::EXECUTE_ONLY,
            EptVpidCap::MEMORY_TYPE_WB,
            EptVpidCap::INVEPT,
            EptVpidCap::INVEPT_SINGLE_CONTEXT,
            EptVpidCap::INVEPT_ALL_CONTEXT,
        ] {
            assert!(
                !is_ept_available(GOOD_CAPS & !missing.bits(), 39),
                "{:?}",
                missing
            );
        }
        // Optional features do not matter.
        assert!(is_ept_available(
            GOOD_CAPS & !(EptVpidCap::PDPTE_1GB | EptVpidCap::ACCESSED_DIRTY).bits(),
            39
        ));
    }

    #[test]
    fn apic_base() {
        // BSP, xAPIC enabled, base 0xfee00000.
        assert_eq!(apic_base_from_msr(0xfee0_0900), 0xfee0_0000);
        assert_eq!(apic_base_from_msr(0x0000_0001_2345_6d00), 0x1_2345_6000);
    }

    #[test]
    fn vmcs_field_encodings() {
        assert_eq!(u32::from(VmcsField::ExitQualification), 0x6400);
        assert_eq!(
            VmcsField::try_from(0x2400u32),
            Ok(VmcsField::GuestPhysicalAddress)
        );
        assert_eq!(VmcsField::try_from(0x4400u32), Err(0x4400));
    }
}
