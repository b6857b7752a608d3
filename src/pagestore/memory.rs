use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::types::DefragResult;
use crate::utils::HandyRwLock;

use super::page_id::PageId;
use super::store::PageStore;

/// Buffer pool (C2) over one or more page stores; provides pin/unpin and
/// read/write latches. Generalizes the teacher's `BufferPool`
/// (`HashMap<BTreePageID, Rc<RefCell<_>>>`) from a single Rc/RefCell
/// single-threaded cache to `Arc<RwLock<Vec<u8>>>` pages, since the
/// checkpointer thread and the coordinator both touch the cache.
///
/// Like C1, this is an external interface in the source system; this
/// implementation is this crate's standalone stand-in.
pub struct PageMemory {
    stores: RwLock<HashMap<u16, Arc<dyn PageStore>>>,
    pages: RwLock<HashMap<PageId, Arc<RwLock<Vec<u8>>>>>,
}

pub type PageReadGuard<'a> = RwLockReadGuard<'a, Vec<u8>>;
pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, Vec<u8>>;

impl PageMemory {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            pages: RwLock::new(HashMap::new()),
        }
    }

    /// Register a page store under the given partition id. A region
    /// (`partDataRegion`, `mappingDataRegion`) typically registers one
    /// store per partition it is responsible for.
    pub fn register_store(&self, partition: u16, store: Arc<dyn PageStore>) {
        self.stores.wl().insert(partition, store);
    }

    pub fn deregister_store(&self, partition: u16) {
        self.stores.wl().remove(&partition);
        self.pages
            .wl()
            .retain(|pid, _| pid.partition() != partition);
    }

    /// Page count of the store registered for `partition`, for the
    /// sizes a pipeline reports once a partition's closing checkpoint
    /// resolves (§4.4 step 6: "log sizes (oldPages, newPages,
    /// mappingPages)").
    pub fn page_count(&self, partition: u16) -> DefragResult<u32> {
        Ok(self.store_for(partition)?.page_count())
    }

    fn store_for(&self, partition: u16) -> DefragResult<Arc<dyn PageStore>> {
        self.stores
            .rl()
            .get(&partition)
            .cloned()
            .ok_or_else(|| {
                crate::error::DefragError::page_io(format!(
                    "no page store registered for partition {}",
                    partition
                ))
            })
    }

    /// Pin a page, loading it from its backing store on first access.
    /// Returned as a shared `Arc<RwLock<Vec<u8>>>` so callers can take a
    /// read or a write latch independently; dropping all clones unpins
    /// the page (there is no separate `unpin` call to forget).
    pub fn pin(&self, pid: PageId) -> DefragResult<Arc<RwLock<Vec<u8>>>> {
        if let Some(page) = self.pages.rl().get(&pid) {
            return Ok(Arc::clone(page));
        }

        debug!("page miss, loading from store: {}", pid);
        let store = self.store_for(pid.partition())?;
        let bytes = store.read_page(pid.index())?;
        let page = Arc::new(RwLock::new(bytes));

        let mut pages = self.pages.wl();
        // another thread may have raced us to load the same page
        let page = pages.entry(pid).or_insert(page).clone();
        Ok(page)
    }

    /// Allocate a fresh page in `partition`'s store under `flag` and pin
    /// it, inserting it into the cache the same way [`pin`](Self::pin)
    /// would on a later lookup.
    pub fn allocate(
        &self,
        partition: u16,
        flag: super::page_id::PageFlag,
    ) -> DefragResult<(PageId, Arc<RwLock<Vec<u8>>>)> {
        let store = self.store_for(partition)?;
        let index = store.allocate()?;
        let page_size = store.page_size();
        let page = Arc::new(RwLock::new(vec![0u8; page_size]));
        let pid = PageId::new(partition, flag, index);
        self.pages.wl().insert(pid, Arc::clone(&page));
        Ok((pid, page))
    }

    /// Write a pinned page's current bytes through to its backing store.
    pub fn flush_page(&self, pid: PageId) -> DefragResult<()> {
        let page = match self.pages.rl().get(&pid) {
            Some(p) => Arc::clone(p),
            None => return Ok(()),
        };
        let store = self.store_for(pid.partition())?;
        let bytes = page.rl().clone();
        store.write_page(pid.index(), &bytes)
    }

    /// Flush every dirty page belonging to `partition` and fsync its
    /// store. Called by the checkpoint controller's flush cycle.
    pub fn flush_partition(&self, partition: u16) -> DefragResult<()> {
        let pids: Vec<PageId> = self
            .pages
            .rl()
            .keys()
            .filter(|pid| pid.partition() == partition)
            .copied()
            .collect();
        for pid in pids {
            self.flush_page(pid)?;
        }
        if let Some(store) = self.stores.rl().get(&partition) {
            store.sync()?;
        }
        Ok(())
    }

    /// Drop every cached page belonging to `(partition)` without writing
    /// it back — used after a rename has made the old partition's pages
    /// meaningless (§4.4 step 6: "invalidate pages of (G,P) in both old
    /// and new page memories").
    pub fn invalidate_partition(&self, partition: u16) {
        self.pages.wl().retain(|pid, _| pid.partition() != partition);
    }

    pub fn clear(&self) {
        self.pages.wl().clear();
    }
}

impl Default for PageMemory {
    fn default() -> Self {
        Self::new()
    }
}
