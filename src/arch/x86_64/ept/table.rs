//! Walking, building and freeing the 4-level EPT.
//!
//! The bits of a physical address select EPT entries as follows:
//!
//! | bits  | selects                               |
//! |-------|---------------------------------------|
//! | 47:39 | PML4 entry (512 GB)                   |
//! | 38:30 | page-directory-pointer entry (1 GB)   |
//! | 29:21 | page-directory entry (2 MB)           |
//! | 20:12 | page-table entry (4 KB)               |
//! | 11:0  | byte within the page                  |

use bit_field::BitField;

use super::entry::{EptEntry, EptSlot};
use super::pool::{alloc_table, PreallocatedPool};
use super::EPT_LEVELS;
use crate::{GuestPhysAddr, HostPhysAddr, HyperCraftHal, HyperError, HyperResult};

/// Number of entries in each table.
pub const ENTRY_COUNT: usize = 512;

/// One page worth of EPT entries.
#[repr(C, align(4096))]
pub struct EptTable {
    entries: [EptSlot; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<EptTable>() == crate::PAGE_SIZE_4K);

/// Returns the index of the entry selecting `pa` in a table of `level` (4 = PML4, 1 = PT).
pub fn table_index(level: usize, pa: GuestPhysAddr) -> usize {
    debug_assert!((1..=EPT_LEVELS).contains(&level));
    let shift = 12 + (level - 1) * 9;
    (pa as u64).get_bits(shift..shift + 9) as usize
}

impl EptTable {
    /// Returns the table stored in the page at `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be a page allocated for an EPT table that stays alive for `'a`.
    pub unsafe fn from_pa<'a, H: HyperCraftHal>(pa: HostPhysAddr) -> &'a EptTable {
        unsafe { &*(H::phys_to_virt(pa) as *const EptTable) }
    }

    pub fn entry(&self, index: usize) -> &EptSlot {
        &self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EptSlot> {
        self.entries.iter()
    }

    /// Returns the table the non-leaf entry at `index` points at, if any.
    ///
    /// # Safety
    ///
    /// `self` must be a non-leaf table of a live EPT.
    unsafe fn next_table<'a, H: HyperCraftHal>(&'a self, index: usize) -> Option<&'a EptTable> {
        let entry = self.entries[index].load();
        if entry.is_present() {
            Some(unsafe { Self::from_pa::<H>(entry.phys_addr()) })
        } else {
            None
        }
    }
}

/// Builds every missing table on the way to the PT entry for `pa` and fills it with a
/// pass-through mapping of `pa`.
///
/// `pool` selects where new tables come from (see `alloc_table`). On failure nothing is rolled
/// back: tables linked so far stay in the tree and are freed with it.
///
/// # Safety
///
/// `pml4` must be the root of a live EPT whose non-leaf entries only point at tables.
pub unsafe fn construct<'a, H: HyperCraftHal, const N: usize>(
    pml4: &'a EptTable,
    pa: GuestPhysAddr,
    pool: Option<&PreallocatedPool<N>>,
) -> HyperResult<&'a EptSlot> {
    let mut table = pml4;
    for level in (2..=EPT_LEVELS).rev() {
        let slot = table.entry(table_index(level, pa));
        if !slot.load().is_present() {
            let new_table = alloc_table::<H, N>(pool).ok_or(HyperError::NoMemory)?;
            if let Err(existing) = slot.install(EptEntry::pass_through(level, new_table)) {
                // Another processor linked a table here first, use theirs.
                warn!(
                    "lost the race to link a level {} table for {:#x} (winner {:#x})",
                    level - 1,
                    pa,
                    existing.phys_addr()
                );
                match pool {
                    Some(pool) => pool.retire(new_table),
                    None => H::dealloc_page(new_table),
                }
            }
        }
        table = unsafe { EptTable::from_pa::<H>(slot.load().phys_addr()) };
    }

    let slot = table.entry(table_index(1, pa));
    let entry = EptEntry::pass_through(1, pa);
    // Processors faulting on the same page at once may all get here; they install the same entry.
    debug_assert!(
        !slot.load().is_present() || slot.load() == entry,
        "EPT entry for {:#x} is already present: {:?}",
        pa,
        slot
    );
    if let Err(existing) = slot.install(entry) {
        debug!(
            "EPT entry for {:#x} was installed concurrently: {:?}",
            pa, existing
        );
    }
    Ok(slot)
}

/// Returns the PT entry for `pa`, or `None` if a table on the way is missing.
///
/// # Safety
///
/// Same as `construct`.
pub unsafe fn lookup<'a, H: HyperCraftHal>(
    pml4: &'a EptTable,
    pa: GuestPhysAddr,
) -> Option<&'a EptSlot> {
    let mut table = pml4;
    for level in (2..=EPT_LEVELS).rev() {
        table = unsafe { table.next_table::<H>(table_index(level, pa))? };
    }
    Some(table.entry(table_index(1, pa)))
}

/// Frees `table` at `level` and every table below it.
///
/// PTs hold guest page mappings rather than tables, so they are freed as-is when their PD is
/// walked.
///
/// # Safety
///
/// `table` must be a table of `level` in a tree nobody else is using any more, and must not be
/// used after this call.
pub unsafe fn destruct<H: HyperCraftHal>(table: HostPhysAddr, level: usize) {
    let entries = unsafe { EptTable::from_pa::<H>(table) };
    for slot in entries.iter() {
        let entry = slot.load();
        if !entry.is_present() {
            continue;
        }
        match level {
            // PML4 -> PDPT, PDPT -> PD
            4 | 3 => unsafe { destruct::<H>(entry.phys_addr(), level - 1) },
            // PD -> PT
            2 => H::dealloc_page(entry.phys_addr()),
            _ => unreachable!("EPT tables of level {} have no sub tables", level),
        }
    }
    H::dealloc_page(table);
}
