//! A `HyperCraftHal` backed by the host allocator, for unit tests.
//!
//! Physical addresses are host pointers (`phys_to_virt` is the identity). Every page handed out
//! is tracked, so double frees and frees of unknown pages panic and leaks show up in
//! `live_pages`. State is per thread; every test starts with `TestHal::reset`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::{HostPhysAddr, HostVirtAddr, HyperCraftHal, PAGE_SIZE_4K};

#[cfg(target_arch = "x86_64")]
use crate::VmcsField;

#[derive(Default)]
struct State {
    live: BTreeMap<HostPhysAddr, usize>,
    allocation_budget: Option<usize>,
    invept_count: usize,
    vmcs: BTreeMap<u32, u64>,
    vmcs_reads: BTreeSet<u32>,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

fn layout(num_pages: usize) -> Layout {
    Layout::from_size_align(num_pages * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap()
}

#[derive(Debug)]
pub struct TestHal;

impl TestHal {
    /// Forgets everything about previous tests run on this thread.
    pub fn reset() {
        STATE.with(|s| *s.borrow_mut() = State::default());
    }

    /// Lets the next `count` allocations succeed and fails all later ones.
    pub fn fail_allocations_after(count: usize) {
        STATE.with(|s| s.borrow_mut().allocation_budget = Some(count));
    }

    /// Number of pages allocated and not freed yet.
    pub fn live_pages() -> usize {
        STATE.with(|s| s.borrow().live.values().sum())
    }

    pub fn is_live(pa: HostPhysAddr) -> bool {
        STATE.with(|s| s.borrow().live.contains_key(&pa))
    }

    pub fn invept_count() -> usize {
        STATE.with(|s| s.borrow().invept_count)
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_vmcs(field: VmcsField, value: u64) {
        STATE.with(|s| s.borrow_mut().vmcs.insert(field.into(), value));
    }

    #[cfg(target_arch = "x86_64")]
    pub fn vmcs_was_read(field: VmcsField) -> bool {
        STATE.with(|s| s.borrow().vmcs_reads.contains(&u32::from(field)))
    }
}

impl HyperCraftHal for TestHal {
    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr> {
        STATE.with(|s| {
            let mut state = s.borrow_mut();
            if let Some(budget) = state.allocation_budget.as_mut() {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
            }
            let ptr = unsafe { alloc_zeroed(layout(num_pages)) };
            assert!(!ptr.is_null());
            state.live.insert(ptr as HostPhysAddr, num_pages);
            Some(ptr as HostPhysAddr)
        })
    }

    fn dealloc_pages(pa: HostPhysAddr, num_pages: usize) {
        STATE.with(|s| {
            let pages = s.borrow_mut().live.remove(&pa);
            assert_eq!(
                pages,
                Some(num_pages),
                "freeing {:#x} ({} pages) which is not allocated",
                pa,
                num_pages
            );
        });
        unsafe { dealloc(pa as *mut u8, layout(num_pages)) };
    }

    fn phys_to_virt(pa: HostPhysAddr) -> HostVirtAddr {
        pa
    }

    #[cfg(target_arch = "x86_64")]
    fn invept_all() {
        STATE.with(|s| s.borrow_mut().invept_count += 1);
    }

    #[cfg(target_arch = "x86_64")]
    fn vmcs_read(field: VmcsField) -> u64 {
        STATE.with(|s| {
            let mut state = s.borrow_mut();
            state.vmcs_reads.insert(field.into());
            state.vmcs.get(&u32::from(field)).copied().unwrap_or(0)
        })
    }
}
