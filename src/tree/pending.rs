use std::sync::Arc;

use crate::checkpoint::YieldClock;
use crate::error::DefragError;
use crate::pagestore::PageMemory;
use crate::types::DefragResult;

use super::chain::PageChain;
use super::iterator::TreeIterator;
use super::row::RowLink;

/// One entry of the Pending Entries Tree: `(cacheId, expireTime, link)`
/// (§3), used downstream for TTL processing. A row only ever appears
/// here when its `expireTime != 0` (§8 invariant 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub cache_id: u32,
    pub expire_time: u64,
    pub link: RowLink,
}

impl PendingEntry {
    fn encode(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.cache_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.expire_time.to_be_bytes());
        buf[12..20].copy_from_slice(&self.link.as_u64().to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> DefragResult<Self> {
        if bytes.len() < 20 {
            return Err(DefragError::page_io("pending entry record truncated"));
        }
        Ok(PendingEntry {
            cache_id: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            expire_time: u64::from_be_bytes(bytes[4..12].try_into().unwrap()),
            link: RowLink::from_u64(u64::from_be_bytes(bytes[12..20].try_into().unwrap())),
        })
    }
}

/// Per-partition TTL index, keyed by `(cacheId, expireTime, link)`
/// (§3). Same append-only leaf-chain shape as [`CacheDataTree`](super::CacheDataTree).
pub struct PendingEntriesTree {
    chain: PageChain,
}

impl PendingEntriesTree {
    pub fn create(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        Ok(Self {
            chain: PageChain::create(memory, partition)?,
        })
    }

    pub fn open(memory: Arc<PageMemory>, partition: u16, meta_idx: u32) -> DefragResult<Self> {
        Ok(Self {
            chain: PageChain::open(memory, partition, meta_idx)?,
        })
    }

    pub fn meta_idx(&self) -> u32 {
        self.chain.meta_idx()
    }

    pub fn len(&self) -> u32 {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn put(&self, entry: &PendingEntry) -> DefragResult<()> {
        self.chain.append(&entry.encode())
    }

    pub fn iterate<F>(
        &self,
        yield_clock: &mut YieldClock,
        mut f: F,
        on_yield: impl FnMut(),
    ) -> DefragResult<()>
    where
        F: FnMut(PendingEntry) -> DefragResult<bool>,
    {
        TreeIterator::new(&self.chain).walk(
            yield_clock,
            |raw| PendingEntry::decode(raw),
            |entry| f(entry),
            on_yield,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagestore::FilePageStore;
    use std::time::Duration;

    #[test]
    fn only_expiring_rows_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePageStore::create(dir.path().join("part-0.bin"), 256).unwrap();
        let memory = Arc::new(PageMemory::new());
        memory.register_store(0, Arc::new(store));
        let tree = PendingEntriesTree::create(memory, 0).unwrap();

        for i in 0u32..7 {
            tree.put(&PendingEntry {
                cache_id: 1,
                expire_time: 1_700_000_000_000 + i as u64,
                link: RowLink::new(i + 1, 0),
            })
            .unwrap();
        }
        assert_eq!(tree.len(), 7);

        let mut clock = YieldClock::new(Duration::from_millis(150));
        let mut seen = Vec::new();
        tree.iterate(
            &mut clock,
            |e| {
                seen.push(e.expire_time);
                Ok(true)
            },
            || {},
        )
        .unwrap();
        assert_eq!(seen.len(), 7);
    }
}
