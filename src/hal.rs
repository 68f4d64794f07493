use crate::{HostPhysAddr, HostVirtAddr};

#[cfg(target_arch = "x86_64")]
use crate::VmcsField;

/// The interfaces which the underlying software(kernel or hypervisor) must implement.
pub trait HyperCraftHal: Sized {
    /// Allocates a 4K-sized contiguous physical page, returns its physical address.
    fn alloc_page() -> Option<HostPhysAddr> {
        Self::alloc_pages(1)
    }
    /// Deallocates the given physical page.
    fn dealloc_page(pa: HostPhysAddr) {
        Self::dealloc_pages(pa, 1)
    }
    /// Allocates contiguous pages, returns its physical address.
    ///
    /// May block, so it is only called while building the EPT, never from a VM-exit handler.
    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr>;
    /// Gives back the allocated pages starts from `pa` to the page allocator.
    fn dealloc_pages(pa: HostPhysAddr, num_pages: usize);
    /// Returns a virtual address through which the physical address `pa` can be accessed.
    fn phys_to_virt(pa: HostPhysAddr) -> HostVirtAddr;
    /// Invalidates all EPT-derived translations (INVEPT, all-context).
    #[cfg(target_arch = "x86_64")]
    fn invept_all();
    /// Reads a field of the current VMCS.
    #[cfg(target_arch = "x86_64")]
    fn vmcs_read(field: VmcsField) -> u64;
}
