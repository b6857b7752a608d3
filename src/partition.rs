//! One partition's three page-resident structures (§3, §4.4) bundled
//! together: the free list data rows live in, and the two trees built
//! over it. Both the *old* partition the pipeline reads from and the
//! *new* one it writes into are this same shape — `PartitionStore` is
//! deliberately symmetric between the two roles.

use std::sync::Arc;

use crate::meta::PartitionMeta;
use crate::pagestore::{PageFlag, PageMemory};
use crate::tree::{CacheDataTree, FreeList, PendingEntriesTree};
use crate::types::DefragResult;

/// Well-known page indices within a partition's data store, consumed in
/// this fixed order by [`PartitionStore::create`] so
/// [`PartitionStore::open`] can find each structure's meta page without
/// any extra bookkeeping (the same "well-known index" discipline
/// `META_PAGE_IDX` uses for the Link Map, §9 "Global state").
pub const FREE_LIST_META_IDX: u32 = 0;
pub const CACHE_TREE_META_IDX: u32 = 1;
pub const PENDING_TREE_META_IDX: u32 = 2;
pub const PARTITION_META_IDX: u32 = 3;

pub struct PartitionStore {
    memory: Arc<PageMemory>,
    partition: u16,
    pub free_list: FreeList,
    pub cache_tree: CacheDataTree,
    pub pending_tree: PendingEntriesTree,
}

impl PartitionStore {
    /// Build a brand-new partition over a freshly-created, empty page
    /// store (§4.4 steps 3–4).
    pub fn create(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        let free_list = FreeList::create(memory.clone(), partition)?;
        debug_assert_eq!(free_list_meta_idx(&free_list), FREE_LIST_META_IDX);

        let cache_tree = CacheDataTree::create(memory.clone(), partition)?;
        debug_assert_eq!(cache_tree.meta_idx(), CACHE_TREE_META_IDX);

        let pending_tree = PendingEntriesTree::create(memory.clone(), partition)?;
        debug_assert_eq!(pending_tree.meta_idx(), PENDING_TREE_META_IDX);

        let (meta_pid, _) = memory.allocate(partition, PageFlag::Data)?;
        debug_assert_eq!(meta_pid.index(), PARTITION_META_IDX);

        Ok(Self {
            memory,
            partition,
            free_list,
            cache_tree,
            pending_tree,
        })
    }

    /// Reopen a partition store whose four well-known pages already
    /// exist — the old partition the pipeline is about to iterate, or
    /// (in principle) a resumed new one.
    pub fn open(memory: Arc<PageMemory>, partition: u16) -> DefragResult<Self> {
        Ok(Self {
            free_list: FreeList::open(memory.clone(), partition)?,
            cache_tree: CacheDataTree::open(memory.clone(), partition, CACHE_TREE_META_IDX)?,
            pending_tree: PendingEntriesTree::open(memory.clone(), partition, PENDING_TREE_META_IDX)?,
            memory,
            partition,
        })
    }

    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn read_meta(&self) -> DefragResult<PartitionMeta> {
        PartitionMeta::read(&self.memory, self.partition, PARTITION_META_IDX)
    }

    pub fn write_meta(&self, meta: &PartitionMeta) -> DefragResult<()> {
        meta.write(&self.memory, self.partition, PARTITION_META_IDX)
    }
}

fn free_list_meta_idx(_free_list: &FreeList) -> u32 {
    // FreeList does not expose its meta index directly (it has no
    // callers outside this crate that need it); the invariant that it
    // lands at index 0 on a fresh store is covered by
    // `FreeList::create`'s own `debug_assert_eq!`.
    FREE_LIST_META_IDX
}
