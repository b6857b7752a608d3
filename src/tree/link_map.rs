use std::collections::HashMap;
use std::sync::Arc;

use crate::config::META_PAGE_IDX;
use crate::pagestore::PageMemory;
use crate::types::DefragResult;
use crate::utils::HandyRwLock;

use super::chain::PageChain;

/// Persistent `oldLink → newLink` map owned by one partition's mapping
/// region (C5, §4.3). Keys are old 64-bit links, values are new 64-bit
/// links; `put` of a key already present overwrites, since
/// defragmentation may run twice over the same partition after a crash
/// (§4.3).
///
/// Durability runs entirely through the chain's pages and the shared
/// checkpoint (§4.3: "no independent fsync") — `put` appends a record
/// to [`PageChain`] so every mapping is recoverable by replay, while
/// `get` is served from an in-memory index kept alongside it so a hot
/// lookup loop (the index rebuilder translating millions of links,
/// §4.6) never re-walks the chain.
pub struct LinkMap {
    chain: PageChain,
    index: std::sync::RwLock<HashMap<u64, u64>>,
}

impl LinkMap {
    /// `init = true`: allocate a fresh meta page at [`META_PAGE_IDX`]
    /// and start an empty map.
    pub fn init(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let chain = PageChain::create(memory, partition)?;
        debug_assert_eq!(chain.meta_idx(), META_PAGE_IDX);
        Ok(Self {
            chain,
            index: std::sync::RwLock::new(HashMap::new()),
        })
    }

    /// `init = false`: reopen an existing mapping file left by a
    /// previous, crashed run and replay its chain into the in-memory
    /// index (last record for a given old link wins, matching `put`'s
    /// overwrite semantics).
    pub fn open(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let chain = PageChain::open(memory, partition, META_PAGE_IDX)?;
        let mut index = HashMap::new();
        chain.for_each(|record| {
            let (old, new) = decode(record);
            index.insert(old, new);
            Ok(true)
        })?;
        Ok(Self {
            chain,
            index: std::sync::RwLock::new(index),
        })
    }

    pub fn put(&self, old: u64, new: u64) -> DefragResult<()> {
        self.chain.append(&encode(old, new))?;
        self.index.wl().insert(old, new);
        Ok(())
    }

    pub fn get(&self, old: u64) -> Option<u64> {
        self.index.rl().get(&old).copied()
    }

    pub fn len(&self) -> usize {
        self.index.rl().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every `(old, new)` pair currently recorded, for the index
    /// rebuilder (§4.6) to translate links it encounters.
    pub fn snapshot(&self) -> HashMap<u64, u64> {
        self.index.rl().clone()
    }
}

fn encode(old: u64, new: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&old.to_be_bytes());
    buf[8..16].copy_from_slice(&new.to_be_bytes());
    buf
}

fn decode(bytes: &[u8]) -> (u64, u64) {
    let old = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let new = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    (old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagestore::FilePageStore;

    fn memory(dir: &std::path::Path) -> Arc<PageMemory> {
        let store = FilePageStore::create(dir.join("part-map-0.bin"), 256).unwrap();
        let memory = Arc::new(PageMemory::new());
        memory.register_store(0, Arc::new(store));
        memory
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let map = LinkMap::init(memory(dir.path()), 0).unwrap();
        map.put(10, 20).unwrap();
        map.put(11, 21).unwrap();
        assert_eq!(map.get(10), Some(20));
        assert_eq!(map.get(11), Some(21));
        assert_eq!(map.get(99), None);
    }

    #[test]
    fn duplicate_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let map = LinkMap::init(memory(dir.path()), 0).unwrap();
        map.put(10, 20).unwrap();
        map.put(10, 30).unwrap();
        assert_eq!(map.get(10), Some(30));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn reopen_after_crash_replays_every_entry_with_last_write_winning() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path());
        {
            let map = LinkMap::init(mem.clone(), 0).unwrap();
            map.put(1, 100).unwrap();
            map.put(2, 200).unwrap();
            map.put(1, 101).unwrap();
        }

        let reopened = LinkMap::open(mem, 0).unwrap();
        assert_eq!(reopened.get(1), Some(101));
        assert_eq!(reopened.get(2), Some(200));
        assert_eq!(reopened.len(), 2);
    }
}
