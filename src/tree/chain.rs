use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::DefragError;
use crate::pagestore::{PageFlag, PageId, PageMemory};
use crate::types::DefragResult;
use crate::utils::HandyRwLock;

use super::slotted::SlottedPage;

/// Shared on-disk shape for the Cache Data Tree, the Pending Entries
/// Tree and the Link Map: a singly-linked chain of slotted pages, grown
/// by appending records to the tail page and allocating a fresh tail
/// once it is full. A dedicated meta page (consumed once at
/// [`create`](PageChain::create) time, or located at a caller-supplied
/// index when [resuming](PageChain::open)) records `head`/`tail`/`len`.
///
/// This is the B+-tree simplification this crate makes: §3 describes
/// genuine B+-trees with internal/leaf separation, but every write this
/// engine performs against a *new* tree is an append in source key
/// order (§4.4 step 5: "rows inserted into the new tree in source key
/// order") — an append-only leaf chain preserves exactly that ordering
/// without needing internal routing pages. See DESIGN.md.
pub struct PageChain {
    memory: Arc<PageMemory>,
    partition: u16,
    meta_idx: u32,
    head: AtomicU32,
    tail: AtomicU32,
    len: AtomicU32,
}

const NONE: u32 = super::slotted::NO_NEXT_PAGE;

impl PageChain {
    /// Allocate a fresh meta page and start an empty chain.
    pub fn create(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let (meta_pid, _meta_page) = memory.allocate(partition, PageFlag::Data)?;
        let chain = Self {
            memory,
            partition,
            meta_idx: meta_pid.index(),
            head: AtomicU32::new(NONE),
            tail: AtomicU32::new(NONE),
            len: AtomicU32::new(0),
        };
        chain.save_metadata()?;
        Ok(chain)
    }

    /// Reopen a chain whose meta page already exists at `meta_idx`
    /// (resume path, or a well-known index such as
    /// [`crate::config::META_PAGE_IDX`]).
    pub fn open(memory: Arc<PageMemory>, partition: u16, meta_idx: u32) -> DefragResult<Self> {
        let meta = memory.pin(PageId::new(partition, PageFlag::Data, meta_idx))?;
        let (head, tail, len) = {
            let guard = meta.rl();
            (
                u32::from_be_bytes(guard[0..4].try_into().unwrap()),
                u32::from_be_bytes(guard[4..8].try_into().unwrap()),
                u32::from_be_bytes(guard[8..12].try_into().unwrap()),
            )
        };
        Ok(Self {
            memory,
            partition,
            meta_idx,
            head: AtomicU32::new(head),
            tail: AtomicU32::new(tail),
            len: AtomicU32::new(len),
        })
    }

    pub fn meta_idx(&self) -> u32 {
        self.meta_idx
    }

    pub fn len(&self) -> u32 {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pid(&self, index: u32) -> PageId {
        PageId::new(self.partition, PageFlag::Data, index)
    }

    /// Append `record` to the tail leaf, allocating a new one if the
    /// current tail is full or the chain is empty.
    pub fn append(&self, record: &[u8]) -> DefragResult<()> {
        let tail = self.tail.load(Ordering::SeqCst);

        let tail = if tail == NONE {
            self.allocate_leaf(None)?
        } else {
            let page = self.memory.pin(self.pid(tail))?;
            let fits = SlottedPage::open(&mut page.wl()).can_fit(record.len());
            if fits {
                tail
            } else {
                self.allocate_leaf(Some(tail))?
            }
        };

        let page = self.memory.pin(self.pid(tail))?;
        SlottedPage::open(&mut page.wl()).insert(record)?;
        self.len.fetch_add(1, Ordering::SeqCst);
        self.save_metadata()
    }

    fn allocate_leaf(&self, prev: Option<u32>) -> DefragResult<u32> {
        let (pid, page) = self.memory.allocate(self.partition, PageFlag::Data)?;
        SlottedPage::format(&mut page.wl());

        if let Some(prev) = prev {
            let prev_page = self.memory.pin(self.pid(prev))?;
            SlottedPage::open(&mut prev_page.wl()).set_next_page(pid.index());
        } else {
            self.head.store(pid.index(), Ordering::SeqCst);
        }
        self.tail.store(pid.index(), Ordering::SeqCst);
        Ok(pid.index())
    }

    /// Persist `head`/`tail`/`len` into the meta page. Called after
    /// every append so a crash never leaves the meta page pointing past
    /// the last durably-linked leaf.
    fn save_metadata(&self) -> DefragResult<()> {
        let meta = self.memory.pin(self.pid(self.meta_idx))?;
        let mut guard = meta.wl();
        guard[0..4].copy_from_slice(&self.head.load(Ordering::SeqCst).to_be_bytes());
        guard[4..8].copy_from_slice(&self.tail.load(Ordering::SeqCst).to_be_bytes());
        guard[8..12].copy_from_slice(&self.len.load(Ordering::SeqCst).to_be_bytes());
        Ok(())
    }

    /// Walk every record from head to tail, in append order, without
    /// any checkpoint-lock yielding. Used by [`LinkMap`](super::LinkMap)
    /// to replay its chain into an in-memory index on open, and by
    /// tests; the yielding walk callers iterate a tree through is
    /// [`TreeIterator`](super::TreeIterator).
    pub fn for_each<F>(&self, mut f: F) -> DefragResult<()>
    where
        F: FnMut(&[u8]) -> DefragResult<bool>,
    {
        let mut current = self.head.load(Ordering::SeqCst);
        while current != NONE {
            let page = self.memory.pin(self.pid(current))?;
            // `SlottedPage::open` wants `&mut [u8]` only to share
            // accessor code between reads and writes; a write latch
            // avoids casting a read guard through a raw pointer.
            let mut guard = page.wl();
            let slotted = SlottedPage::open(&mut guard);
            let next = slotted.next_page();
            for (_, record) in slotted.iter() {
                if !f(record)? {
                    return Ok(());
                }
            }
            current = next;
        }
        Ok(())
    }

    pub(super) fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    pub(super) fn partition(&self) -> u16 {
        self.partition
    }

    pub(super) fn head(&self) -> u32 {
        self.head.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagestore::FilePageStore;

    fn memory(dir: &std::path::Path, partition: u16, page_size: usize) -> Arc<PageMemory> {
        let store = FilePageStore::create(dir.join(format!("chain-{}.bin", partition)), page_size).unwrap();
        let memory = Arc::new(PageMemory::new());
        memory.register_store(partition, Arc::new(store));
        memory
    }

    #[test]
    fn append_then_for_each_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path(), 0, 128);
        let chain = PageChain::create(mem, 0).unwrap();

        for i in 0u8..20 {
            chain.append(&[i]).unwrap();
        }
        assert_eq!(chain.len(), 20);

        let mut seen = Vec::new();
        chain
            .for_each(|record| {
                seen.push(record[0]);
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, (0u8..20).collect::<Vec<_>>());
    }

    #[test]
    fn for_each_can_stop_early() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path(), 0, 128);
        let chain = PageChain::create(mem, 0).unwrap();
        for i in 0u8..20 {
            chain.append(&[i]).unwrap();
        }

        let mut seen = Vec::new();
        chain
            .for_each(|record| {
                seen.push(record[0]);
                Ok(seen.len() < 3)
            })
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path(), 0, 128);
        let meta_idx = {
            let chain = PageChain::create(mem.clone(), 0).unwrap();
            chain.append(&[1]).unwrap();
            chain.append(&[2]).unwrap();
            chain.meta_idx()
        };

        let reopened = PageChain::open(mem, 0, meta_idx).unwrap();
        assert_eq!(reopened.len(), 2);
        let mut seen = Vec::new();
        reopened
            .for_each(|r| {
                seen.push(r[0]);
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
