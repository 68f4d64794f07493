use arrayvec::ArrayVec;

use crate::{HyperError, HyperResult};

pub type GuestPhysAddr = usize;
pub type GuestVirtAddr = usize;
pub type HostPhysAddr = usize;
pub type HostVirtAddr = usize;

pub const PAGE_SIZE_4K: usize = 0x1000;

/// The maximum number of distinct RAM runs we support in `PhysMemoryRanges`.
pub const MAX_PHYS_MEMORY_RUNS: usize = 64;

/// A contiguous run of installed RAM, in units of 4K pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysMemoryRun {
    /// Page number of the first page of the run.
    pub base_page: usize,
    /// Number of pages in the run.
    pub page_count: usize,
}

impl PhysMemoryRun {
    pub const fn new(base_page: usize, page_count: usize) -> Self {
        Self {
            base_page,
            page_count,
        }
    }

    /// Physical address of the first byte of the run.
    pub const fn start(&self) -> HostPhysAddr {
        self.base_page * PAGE_SIZE_4K
    }

    /// Returns true if `pa` falls inside `[start, start + size - 1]`.
    pub fn contains(&self, pa: HostPhysAddr) -> bool {
        if self.page_count == 0 {
            return false;
        }
        let end = self.start() + (self.page_count * PAGE_SIZE_4K - 1);
        (self.start()..=end).contains(&pa)
    }

    /// Iterates over the physical address of every page in the run.
    pub fn pages(&self) -> impl Iterator<Item = HostPhysAddr> {
        let start = self.start();
        (0..self.page_count).map(move |i| start + i * PAGE_SIZE_4K)
    }
}

/// The physical memory layout of the machine, as reported by the firmware or the host kernel.
/// Every page in it is identity-mapped when the EPT is built; addresses outside of it are
/// treated as device memory.
#[derive(Clone, Debug, Default)]
pub struct PhysMemoryRanges {
    runs: ArrayVec<PhysMemoryRun, MAX_PHYS_MEMORY_RUNS>,
}

impl PhysMemoryRanges {
    pub fn new() -> Self {
        Self {
            runs: ArrayVec::new(),
        }
    }

    /// Builds the range list from `runs`, failing if there are more than `MAX_PHYS_MEMORY_RUNS`.
    pub fn from_runs(runs: &[PhysMemoryRun]) -> HyperResult<Self> {
        let mut ranges = Self::new();
        for run in runs {
            ranges.push(*run)?;
        }
        Ok(ranges)
    }

    /// Appends a run. Fails if the list is full or the run does not fit in the address space.
    pub fn push(&mut self, run: PhysMemoryRun) -> HyperResult {
        run.base_page
            .checked_add(run.page_count)
            .and_then(|end_page| end_page.checked_mul(PAGE_SIZE_4K))
            .ok_or(HyperError::OutOfRange)?;
        self.runs.try_push(run).map_err(|_| HyperError::OutOfRange)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysMemoryRun> {
        self.runs.iter()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of pages over all runs.
    pub fn total_pages(&self) -> usize {
        self.runs.iter().map(|run| run.page_count).sum()
    }

    /// Returns true if `pa` is backed by RAM.
    pub fn contains(&self, pa: HostPhysAddr) -> bool {
        self.runs.iter().any(|run| run.contains(pa))
    }
}
