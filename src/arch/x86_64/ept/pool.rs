use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use crate::{HostPhysAddr, HyperCraftHal, HyperError, HyperResult, PAGE_SIZE_4K};

/// Returns a zeroed page for a new EPT table.
///
/// Without a pool (while building the EPT) the page comes from the HAL allocator, which may block.
/// With a pool (inside a VM-exit handler) it is taken from the pre-allocated pages.
pub(super) fn alloc_table<H: HyperCraftHal, const N: usize>(
    pool: Option<&PreallocatedPool<N>>,
) -> Option<HostPhysAddr> {
    match pool {
        Some(pool) => Some(pool.take()),
        None => {
            let pa = H::alloc_page()?;
            // Safety: the page was just allocated for us and nothing else references it.
            unsafe { core::ptr::write_bytes(H::phys_to_virt(pa) as *mut u8, 0, PAGE_SIZE_4K) };
            Some(pa)
        }
    }
}

/// A fixed number of zeroed table pages, allocated up front so that new tables can be created
/// where blocking allocation is not allowed.
///
/// Pages are handed out in order by bumping an atomic counter. Running out is fatal: the pool
/// must be sized above what EPT violations can ever consume.
#[derive(Debug)]
pub struct PreallocatedPool<const N: usize> {
    pages: ArrayVec<HostPhysAddr, N>,
    used: AtomicUsize,
    /// Pages taken by a processor that then lost the race to install its table.
    retired: [AtomicUsize; N],
    retired_count: AtomicUsize,
}

impl<const N: usize> PreallocatedPool<N> {
    pub fn new() -> Self {
        Self {
            pages: ArrayVec::new(),
            used: AtomicUsize::new(0),
            retired: core::array::from_fn(|_| AtomicUsize::new(0)),
            retired_count: AtomicUsize::new(0),
        }
    }

    /// Allocates all `N` pages. On failure the pages allocated so far stay in the pool and are
    /// given back by `release`.
    pub fn fill<H: HyperCraftHal>(&mut self) -> HyperResult {
        while !self.pages.is_full() {
            let pa = alloc_table::<H, N>(None).ok_or(HyperError::NoMemory)?;
            self.pages.push(pa);
        }
        Ok(())
    }

    /// Takes the next page. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics when all `N` pages are gone, there is no way to continue without a table.
    pub fn take(&self) -> HostPhysAddr {
        let count = self.used.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.pages.len() {
            panic!(
                "exhausted pre-allocated EPT entries: {} requested, {} available",
                count,
                self.pages.len()
            );
        }
        self.pages[count - 1]
    }

    /// Records a page returned by `take` that did not end up in the tree.
    pub fn retire(&self, pa: HostPhysAddr) {
        let index = self.retired_count.fetch_add(1, Ordering::AcqRel);
        // Each retired page was taken first, so there can never be more than N of them.
        self.retired[index].store(pa, Ordering::Release);
    }

    /// Number of pages handed out so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire).min(self.pages.len())
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Frees every page still owned by the pool: the ones never handed out and the retired ones.
    /// Pages handed out and linked into the tree belong to the tree.
    pub fn release<H: HyperCraftHal>(&mut self) {
        let used = self.used();
        for &pa in &self.pages[used..] {
            H::dealloc_page(pa);
        }
        let retired = *self.retired_count.get_mut();
        for slot in &mut self.retired[..retired] {
            H::dealloc_page(*slot.get_mut());
        }
        self.pages.clear();
        *self.used.get_mut() = 0;
        *self.retired_count.get_mut() = 0;
    }
}

impl<const N: usize> Default for PreallocatedPool<N> {
    fn default() -> Self {
        Self::new()
    }
}
