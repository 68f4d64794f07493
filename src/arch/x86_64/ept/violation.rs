use core::fmt;

use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::EptData;
use crate::arch::vmx::VmcsField;
use crate::{GuestPhysAddr, GuestVirtAddr, HyperCraftHal};

register_bitfields! [
    u64,
    /// Exit qualification for EPT violations. (SDM Vol. 3C, Table 28-7)
    pub QUALIFICATION [
        READ_ACCESS OFFSET(0) NUMBITS(1) [],
        WRITE_ACCESS OFFSET(1) NUMBITS(1) [],
        EXECUTE_ACCESS OFFSET(2) NUMBITS(1) [],
        EPT_READABLE OFFSET(3) NUMBITS(1) [],
        EPT_WRITEABLE OFFSET(4) NUMBITS(1) [],
        EPT_EXECUTABLE OFFSET(5) NUMBITS(1) [],
        EPT_EXECUTABLE_FOR_USER_MODE OFFSET(6) NUMBITS(1) [],
        VALID_GUEST_LINEAR_ADDRESS OFFSET(7) NUMBITS(1) [],
        CAUSED_BY_TRANSLATION OFFSET(8) NUMBITS(1) [],
        USER_MODE_LINEAR_ADDRESS OFFSET(9) NUMBITS(1) [],
        READABLE_WRITABLE_PAGE OFFSET(10) NUMBITS(1) [],
        EXECUTE_DISABLE_PAGE OFFSET(11) NUMBITS(1) [],
        NMI_UNBLOCKING OFFSET(12) NUMBITS(1) []
    ]
];

/// The decoded exit qualification of an EPT violation.
#[derive(Clone, Copy)]
pub struct EptViolationQualification(LocalRegisterCopy<u64, QUALIFICATION::Register>);

impl EptViolationQualification {
    pub fn new(raw: u64) -> Self {
        Self(LocalRegisterCopy::new(raw))
    }

    pub fn bits(&self) -> u64 {
        self.0.get()
    }

    pub fn read_access(&self) -> bool {
        self.0.is_set(QUALIFICATION::READ_ACCESS)
    }

    pub fn write_access(&self) -> bool {
        self.0.is_set(QUALIFICATION::WRITE_ACCESS)
    }

    pub fn execute_access(&self) -> bool {
        self.0.is_set(QUALIFICATION::EXECUTE_ACCESS)
    }

    pub fn ept_readable(&self) -> bool {
        self.0.is_set(QUALIFICATION::EPT_READABLE)
    }

    pub fn ept_writeable(&self) -> bool {
        self.0.is_set(QUALIFICATION::EPT_WRITEABLE)
    }

    pub fn ept_executable(&self) -> bool {
        self.0.is_set(QUALIFICATION::EPT_EXECUTABLE)
    }

    pub fn ept_executable_for_user_mode(&self) -> bool {
        self.0.is_set(QUALIFICATION::EPT_EXECUTABLE_FOR_USER_MODE)
    }

    pub fn valid_guest_linear_address(&self) -> bool {
        self.0.is_set(QUALIFICATION::VALID_GUEST_LINEAR_ADDRESS)
    }

    pub fn caused_by_translation(&self) -> bool {
        self.0.is_set(QUALIFICATION::CAUSED_BY_TRANSLATION)
    }

    pub fn user_mode_linear_address(&self) -> bool {
        self.0.is_set(QUALIFICATION::USER_MODE_LINEAR_ADDRESS)
    }

    pub fn nmi_unblocking(&self) -> bool {
        self.0.is_set(QUALIFICATION::NMI_UNBLOCKING)
    }

    /// The EPT entry did not exist at all: none of the access rights is granted.
    pub fn is_entry_missing(&self) -> bool {
        !self.ept_readable() && !self.ept_writeable() && !self.ept_executable()
    }

    /// The access asked for a right the EPT entry does not grant.
    pub fn is_permission_mismatch(&self) -> bool {
        let read_failure = self.read_access() && !self.ept_readable();
        let write_failure = self.write_access() && !self.ept_writeable();
        let execute_failure = self.execute_access() && !self.ept_executable();
        read_failure || write_failure || execute_failure
    }
}

impl fmt::Debug for EptViolationQualification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EptViolationQualification")
            .field("raw", &format_args!("{:#x}", self.bits()))
            .field("read", &self.read_access())
            .field("write", &self.write_access())
            .field("execute", &self.execute_access())
            .field("ept_readable", &self.ept_readable())
            .field("ept_writeable", &self.ept_writeable())
            .field("ept_executable", &self.ept_executable())
            .field("linear_valid", &self.valid_guest_linear_address())
            .field("caused_by_translation", &self.caused_by_translation())
            .finish()
    }
}

/// Everything the VMCS tells about an EPT violation.
#[derive(Debug, Clone, Copy)]
pub struct EptViolationInfo {
    pub qualification: EptViolationQualification,
    /// The guest-physical address that was accessed.
    pub guest_phys_addr: GuestPhysAddr,
    /// The guest-linear address that was accessed, when the processor reports one.
    pub guest_linear_addr: Option<GuestVirtAddr>,
}

impl EptViolationInfo {
    /// Builds the information from raw VMCS values. `guest_linear_addr` is dropped unless the
    /// qualification marks it valid.
    pub fn new(qualification: u64, guest_phys_addr: u64, guest_linear_addr: u64) -> Self {
        let qualification = EptViolationQualification::new(qualification);
        Self {
            qualification,
            guest_phys_addr: guest_phys_addr as GuestPhysAddr,
            guest_linear_addr: qualification
                .valid_guest_linear_address()
                .then_some(guest_linear_addr as GuestVirtAddr),
        }
    }

    /// Reads the information of the current VM exit from the VMCS. The guest-linear address is
    /// only read when it is valid.
    pub fn from_vmcs<H: HyperCraftHal>() -> Self {
        let qualification =
            EptViolationQualification::new(H::vmcs_read(VmcsField::ExitQualification));
        let guest_phys_addr = H::vmcs_read(VmcsField::GuestPhysicalAddress) as GuestPhysAddr;
        let guest_linear_addr = if qualification.valid_guest_linear_address() {
            Some(H::vmcs_read(VmcsField::GuestLinearAddress) as GuestVirtAddr)
        } else {
            None
        };
        Self {
            qualification,
            guest_phys_addr,
            guest_linear_addr,
        }
    }
}

/// What `EptData::handle_ept_violation` did with a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptViolationOutcome {
    /// The entry was missing and a pass-through mapping was built.
    Mapped,
    /// The entry was missing when the processor walked the EPT but exists now.
    AlreadyMapped,
    /// Access-rights violation, handed to the interceptor.
    Forwarded,
    /// Nothing to do.
    Ignored,
}

/// Decides what to do about accesses to mapped pages the EPT does not allow, typically by
/// changing the entry found with `EptData::lookup_entry` or by emulating the access.
pub trait EptViolationInterceptor<H: HyperCraftHal> {
    fn handle_ept_violation(
        &mut self,
        ept: &EptData<H>,
        fault_pa: GuestPhysAddr,
        fault_va: Option<GuestVirtAddr>,
    );
}

impl<H: HyperCraftHal> EptData<H> {
    /// Deals with an EPT violation VM exit.
    ///
    /// A missing entry is device memory that was not mapped up front: it is built now from the
    /// pre-allocated tables. Access-rights violations go to `interceptor`. Anything else is
    /// logged and ignored.
    pub fn handle_ept_violation<I: EptViolationInterceptor<H>>(
        &self,
        interceptor: &mut I,
        info: &EptViolationInfo,
    ) -> EptViolationOutcome {
        let qualification = &info.qualification;
        let fault_pa = info.guest_phys_addr;
        let fault_va = info.guest_linear_addr;

        if qualification.is_entry_missing() {
            if self
                .lookup_entry(fault_pa)
                .is_some_and(|slot| slot.load().is_present())
            {
                // Completed by an earlier violation, possibly on another processor. This one
                // only saw a stale translation.
                H::invept_all();
                return EptViolationOutcome::AlreadyMapped;
            }
            debug_assert!(
                self.is_device_memory(fault_pa),
                "EPT entry for RAM at {:#x} is missing",
                fault_pa
            );
            if let Err(err) = self.construct_tables(fault_pa, Some(&self.pool)) {
                // Tables come from the pool, which panics rather than fail.
                unreachable!("building EPT entry for {:#x} failed: {:?}", fault_pa, err);
            }
            H::invept_all();
            EptViolationOutcome::Mapped
        } else if qualification.caused_by_translation() && qualification.is_permission_mismatch() {
            interceptor.handle_ept_violation(self, fault_pa, fault_va);
            EptViolationOutcome::Forwarded
        } else {
            debug!(
                "ignoring EPT violation: va={:?} pa={:#x} {:?}",
                fault_va, fault_pa, qualification
            );
            EptViolationOutcome::Ignored
        }
    }
}
