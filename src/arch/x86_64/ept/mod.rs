//! The VMX extended page table. (SDM Vol. 3C, Chapter 29.3)
//!
//! The EPT identity-maps all RAM when it is built. Device memory is mapped lazily, when the guest
//! touches it and the processor reports an EPT violation.

mod entry;
mod pool;
mod table;
mod violation;

use core::marker::PhantomData;

pub use entry::{EptEntry, EptFlags, EptMemType, EptPointer, EptSlot};
pub use violation::{
    EptViolationInfo, EptViolationInterceptor, EptViolationOutcome, EptViolationQualification,
};

use pool::{alloc_table, PreallocatedPool};
use table::EptTable;

use crate::{
    GuestPhysAddr, HostPhysAddr, HyperCraftHal, HyperError, HyperResult, PhysMemoryRanges,
};

/// Number of levels of the EPT walk.
pub const EPT_LEVELS: usize = 4;

/// How many tables are pre-allocated for EPT violations. When the number is exceeded the
/// hypervisor panics.
pub const PREALLOCATED_ENTRIES: usize = 50;

type EptPool = PreallocatedPool<PREALLOCATED_ENTRIES>;

/// EPT related data shared by all processors.
pub struct EptData<H: HyperCraftHal> {
    ept_pointer: EptPointer,
    pml4: HostPhysAddr,
    pool: EptPool,
    ranges: PhysMemoryRanges,
    marker: PhantomData<fn() -> H>,
}

impl<H: HyperCraftHal> EptData<H> {
    /// Builds the EPT and allocates the pre-allocated tables.
    ///
    /// Every page in `ranges` is identity-mapped, and so is the page of the local APIC at
    /// `apic_base`: it has to be mapped up front or the system hangs. Must be called from a
    /// context where `H::alloc_page` may block.
    ///
    /// Fails with `HyperError::NoMemory` if any allocation fails, after freeing everything
    /// allocated so far.
    pub fn new(ranges: PhysMemoryRanges, apic_base: HostPhysAddr) -> HyperResult<Self> {
        let Some(pml4) = alloc_table::<H, PREALLOCATED_ENTRIES>(None) else {
            return Err(HyperError::NoMemory);
        };
        let mut ept = Self {
            ept_pointer: EptPointer::new(pml4),
            pml4,
            pool: EptPool::new(),
            ranges,
            marker: PhantomData,
        };
        debug!("EPT pointer: {:?}", ept.ept_pointer);

        // From here on, dropping `ept` releases whatever has been built.
        for run in ept.ranges.iter() {
            debug!(
                "identity-mapping {:#x} pages at {:#x}",
                run.page_count,
                run.start()
            );
            for pa in run.pages() {
                ept.construct_tables(pa, None).map_err(|err| {
                    error!("failed to build EPT entry for {:#x}: {:?}", pa, err);
                    err
                })?;
            }
        }

        if ept.ranges.contains(apic_base) {
            warn!(
                "APIC base {:#x} is inside RAM, already mapped",
                apic_base
            );
        } else {
            ept.construct_tables(apic_base, None).map_err(|err| {
                error!(
                    "failed to build EPT entry for APIC base {:#x}: {:?}",
                    apic_base, err
                );
                err
            })?;
        }

        ept.pool.fill::<H>().map_err(|err| {
            error!(
                "failed to pre-allocate {} EPT tables: {:?}",
                PREALLOCATED_ENTRIES, err
            );
            err
        })?;

        info!(
            "EPT built: {:#x} RAM pages in {} runs, {} tables pre-allocated",
            ept.ranges.total_pages(),
            ept.ranges.len(),
            ept.pool.capacity()
        );
        Ok(ept)
    }

    /// Frees the EPT and all pre-allocated tables. Every processor must have stopped using it.
    pub fn terminate(self) {
        drop(self)
    }

    /// The value of the EPT pointer VMCS field.
    pub fn eptp(&self) -> u64 {
        self.ept_pointer.bits()
    }

    pub fn ept_pointer(&self) -> EptPointer {
        self.ept_pointer
    }

    /// Returns the PT entry mapping `pa`, or `None` if the tables leading to it do not exist.
    pub fn lookup_entry(&self, pa: GuestPhysAddr) -> Option<&EptSlot> {
        // Safety: the tree lives as long as `self`, and non-leaf entries only point at tables.
        unsafe { table::lookup::<H>(self.pml4_table(), pa) }
    }

    /// Returns true if `pa` is not RAM, i.e. it could not have been mapped when the EPT was built.
    pub fn is_device_memory(&self, pa: GuestPhysAddr) -> bool {
        !self.ranges.contains(pa)
    }

    /// Number of pre-allocated tables used by EPT violations so far.
    pub fn preallocated_used(&self) -> usize {
        self.pool.used()
    }

    pub fn preallocated_capacity(&self) -> usize {
        self.pool.capacity()
    }

    fn pml4_table(&self) -> &EptTable {
        // Safety: `pml4` was allocated in `new` and is only freed on drop.
        unsafe { EptTable::from_pa::<H>(self.pml4) }
    }

    fn construct_tables(
        &self,
        pa: GuestPhysAddr,
        pool: Option<&EptPool>,
    ) -> HyperResult<&EptSlot> {
        // Safety: see `lookup_entry`.
        unsafe { table::construct::<H, PREALLOCATED_ENTRIES>(self.pml4_table(), pa, pool) }
    }
}

impl<H: HyperCraftHal> Drop for EptData<H> {
    fn drop(&mut self) {
        info!(
            "Used pre-allocated entries = {:2} / {:2}",
            self.pool.used(),
            self.pool.capacity()
        );
        // Taken tables are part of the tree, the pool only frees the others.
        self.pool.release::<H>();
        // Safety: `&mut self` guarantees nobody else walks the tree any more.
        unsafe { table::destruct::<H>(self.pml4, EPT_LEVELS) };
    }
}

impl<H: HyperCraftHal> core::fmt::Debug for EptData<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EptData")
            .field("ept_pointer", &self.ept_pointer)
            .field("preallocated_used", &self.pool.used())
            .field("ranges", &self.ranges)
            .finish()
    }
}
