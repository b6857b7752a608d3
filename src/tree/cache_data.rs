use std::sync::Arc;

use crate::checkpoint::YieldClock;
use crate::error::DefragError;
use crate::pagestore::PageMemory;
use crate::types::DefragResult;

use super::chain::PageChain;
use super::iterator::TreeIterator;
use super::row::RowLink;

const UNDEFINED_CACHE_ID: u32 = u32::MAX;

/// One entry of the Cache Data Tree: `(cacheId, hash, key) → link`
/// (§3). `hash` is carried alongside `key` the way the source system's
/// key shape does, even though this crate never needs to recompute it
/// — defragmentation only ever re-inserts entries in the order they
/// were read from the old tree, so the hash travels with the entry
/// rather than being derived again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDataEntry {
    pub cache_id: Option<u32>,
    pub hash: u64,
    pub key: Vec<u8>,
    pub link: RowLink,
}

impl CacheDataEntry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.key.len());
        buf.extend_from_slice(&self.cache_id.unwrap_or(UNDEFINED_CACHE_ID).to_be_bytes());
        buf.extend_from_slice(&self.hash.to_be_bytes());
        buf.extend_from_slice(&self.link.as_u64().to_be_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    fn decode(bytes: &[u8]) -> DefragResult<Self> {
        if bytes.len() < 24 {
            return Err(DefragError::page_io("cache data tree entry truncated"));
        }
        let cache_id_raw = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let hash = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
        let link = RowLink::from_u64(u64::from_be_bytes(bytes[12..20].try_into().unwrap()));
        let key_len = u32::from_be_bytes(bytes[20..24].try_into().unwrap()) as usize;
        if bytes.len() < 24 + key_len {
            return Err(DefragError::page_io("cache data tree entry truncated (key)"));
        }
        Ok(CacheDataEntry {
            cache_id: if cache_id_raw == UNDEFINED_CACHE_ID {
                None
            } else {
                Some(cache_id_raw)
            },
            hash,
            link,
            key: bytes[24..24 + key_len].to_vec(),
        })
    }
}

/// Per-partition tree keyed by `(cacheId, hash, key)` carrying the row's
/// link (§3). Backed by [`PageChain`]; see that module for why an
/// append-only leaf chain stands in for a full B+-tree here.
pub struct CacheDataTree {
    chain: PageChain,
}

impl CacheDataTree {
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

    /// Append one entry. Entries must be inserted in source key order
    /// (§4.4 step 5) — this tree does not reorder or re-sort them.
    pub fn put(&self, entry: &CacheDataEntry) -> DefragResult<()> {
        self.chain.append(&entry.encode())
    }

    /// Walk every entry in key order, releasing and reacquiring the
    /// checkpoint read-lock at leaf boundaries once the yield cadence
    /// has elapsed (C4, §4.2). `f` may return `Ok(false)` to stop.
    pub fn iterate<F>(
        &self,
        yield_clock: &mut YieldClock,
        mut f: F,
        on_yield: impl FnMut(),
    ) -> DefragResult<()>
    where
        F: FnMut(CacheDataEntry) -> DefragResult<bool>,
    {
        TreeIterator::new(&self.chain).walk(
            yield_clock,
            |raw| CacheDataEntry::decode(raw),
            |entry| f(entry),
            on_yield,
        )
    }
}
