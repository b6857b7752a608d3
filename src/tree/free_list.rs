use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::pagestore::{PageFlag, PageId, PageMemory};
use crate::types::DefragResult;
use crate::utils::HandyRwLock;

use super::row::{DataRow, RowLink};
use super::slotted::SlottedPage;

const NO_ACTIVE_PAGE: u32 = 0;

/// External free list for data-row allocation (§3: "use an external
/// free list for data row allocation"). This crate's free list is a
/// bump allocator over the data region's page store: rows are appended
/// to the current "active" page until it is full, then a fresh page is
/// allocated and becomes active. Page index `0` of every data-region
/// store is reserved for this free list's own metadata (the active
/// page pointer), so it is never itself a candidate for data rows.
pub struct FreeList {
    memory: Arc<PageMemory>,
    partition: u16,
    active_page: AtomicU32,
}

impl FreeList {
    /// Fresh free list over a newly-created, empty store: consumes
    /// page index 0 for its own bookkeeping.
    pub fn create(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let (meta_pid, _meta_page) = memory.allocate(partition, PageFlag::Data)?;
        debug_assert_eq!(meta_pid.index(), 0);
        Ok(Self {
            memory,
            partition,
            active_page: AtomicU32::new(NO_ACTIVE_PAGE),
        })
    }

    /// Reopen a free list whose meta page already records an active
    /// page index (resume path).
    pub fn open(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let meta = memory.pin(PageId::new(partition, PageFlag::Data, 0))?;
        let active_page = u32::from_be_bytes(meta.rl()[0..4].try_into().unwrap());
        Ok(Self {
            memory,
            partition,
            active_page: AtomicU32::new(active_page),
        })
    }

    /// Append-insert a row, allocating a fresh page if the current one
    /// is full. Returns the link the row was written at; the caller
    /// (§4.4 step 5) is responsible for assigning it to `row.link`
    /// before any downstream use.
    pub fn insert_data_row(&self, row: &mut DataRow) -> DefragResult<RowLink> {
        let encoded = row.encode();

        let mut page_index = self.active_page.load(Ordering::SeqCst);
        if page_index == NO_ACTIVE_PAGE {
            page_index = self.allocate_new_active_page()?;
        }

        let pid = PageId::new(self.partition, PageFlag::Data, page_index);
        let page = self.memory.pin(pid)?;
        let fits = {
            let mut guard = page.wl();
            SlottedPage::open(&mut guard).can_fit(encoded.len())
        };

        let (page_index, page) = if fits {
            (page_index, page)
        } else {
            let fresh_index = self.allocate_new_active_page()?;
            let fresh_pid = PageId::new(self.partition, PageFlag::Data, fresh_index);
            let fresh_page = self.memory.pin(fresh_pid)?;
            {
                let mut guard = fresh_page.wl();
                SlottedPage::format(&mut guard);
            }
            (fresh_index, fresh_page)
        };

        let slot = {
            let mut guard = page.wl();
            SlottedPage::open(&mut guard).insert(&encoded)?
        };
        let link = RowLink::new(page_index, slot as u16);
        row.link = link;
        Ok(link)
    }

    fn allocate_new_active_page(&self) -> DefragResult<u32> {
        let (pid, page) = self.memory.allocate(self.partition, PageFlag::Data)?;
        {
            let mut guard = page.wl();
            SlottedPage::format(&mut guard);
        }
        self.active_page.store(pid.index(), Ordering::SeqCst);
        Ok(pid.index())
    }

    pub fn get_row(&self, link: RowLink) -> DefragResult<DataRow> {
        let pid = PageId::new(self.partition, PageFlag::Data, link.page_index());
        let page = self.memory.pin(pid)?;
        // `SlottedPage::open` only reads through `&mut [u8]` to reuse
        // the same accessor code for reads and writes; a write latch
        // keeps this sound without a raw-pointer cast.
        let mut guard = page.wl();
        let bytes = SlottedPage::open(&mut guard)
            .get(link.slot() as u32)
            .map(|b| b.to_vec())
            .ok_or_else(|| {
                crate::error::DefragError::page_io(format!("dangling row link {}", link))
            })?;
        DataRow::decode(&bytes)
    }

    /// Persist the active-page pointer into the reserved meta page.
    /// Called once after a partition's row copy completes (§4.4 step 5:
    /// "After iteration, `freeList.saveMetadata()`").
    pub fn save_metadata(&self) -> DefragResult<()> {
        let meta = self.memory.pin(PageId::new(self.partition, PageFlag::Data, 0))?;
        let active = self.active_page.load(Ordering::SeqCst);
        meta.wl()[0..4].copy_from_slice(&active.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagestore::FilePageStore;

    fn memory_with_store(dir: &std::path::Path, partition: u16, page_size: usize) -> Arc<PageMemory> {
        let store = FilePageStore::create(dir.join(format!("part-{}.bin", partition)), page_size).unwrap();
        let memory = Arc::new(PageMemory::new());
        memory.register_store(partition, Arc::new(store));
        memory
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with_store(dir.path(), 0, 256);
        let free_list = FreeList::create(memory, 0).unwrap();

        let mut row = DataRow::new(Some(1), b"key".to_vec(), b"value".to_vec(), 1, 0);
        let link = free_list.insert_data_row(&mut row).unwrap();
        assert!(!link.is_none());

        let back = free_list.get_row(link).unwrap();
        assert_eq!(back.key, b"key");
        assert_eq!(back.value, b"value");
    }

    #[test]
    fn overflowing_a_page_allocates_a_new_one() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with_store(dir.path(), 0, 80);
        let free_list = FreeList::create(memory, 0).unwrap();

        let mut links = Vec::new();
        for i in 0..10u32 {
            let mut row = DataRow::new(Some(i), format!("k{}", i).into_bytes(), b"v".to_vec(), 0, 0);
            links.push(free_list.insert_data_row(&mut row).unwrap());
        }
        let distinct_pages: std::collections::HashSet<u32> =
            links.iter().map(|l| l.page_index()).collect();
        assert!(distinct_pages.len() > 1);
    }

    #[test]
    fn save_and_reopen_preserves_active_page() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with_store(dir.path(), 0, 256);
        let free_list = FreeList::create(memory.clone(), 0).unwrap();
        let mut row = DataRow::new(Some(1), b"k".to_vec(), b"v".to_vec(), 0, 0);
        free_list.insert_data_row(&mut row).unwrap();
        free_list.save_metadata().unwrap();

        let reopened = FreeList::open(memory, 0).unwrap();
        let back = reopened.get_row(row.link).unwrap();
        assert_eq!(back.key, b"k");
    }
}
