//! Partition Pipeline (C6, §4.4): copies one partition's rows into a
//! freshly-built replacement, leaving a Link Map behind for C8 to
//! translate against afterwards.

use std::sync::Arc;

use crate::checkpoint::{CheckpointController, CheckpointFuture, YieldClock};
use crate::config::{CacheGroupId, DefragConfig};
use crate::error::DefragError;
use crate::layout::GroupLayout;
use crate::meta::copy_partition_meta;
use crate::metrics::{DefragEvent, DefragMetricsSink};
use crate::pagestore::{FilePageStore, PageMemory};
use crate::partition::{PartitionStore, PARTITION_META_IDX};
use crate::tree::{CacheDataEntry, LinkMap, PendingEntry, RowLink};
use crate::types::{DefragResult, VoidResult};

/// One partition's rewrite. Constructed per `(group, partition)` pair;
/// [`run`](Self::run) does everything up through requesting the closing
/// checkpoint, and returns a [`PipelineHandle`] the caller finishes once
/// that checkpoint resolves (§4.4 step 6 happens strictly after the
/// checkpoint the step requests, so it cannot live inside `run` itself).
pub struct PartitionPipeline<'a> {
    pub group: CacheGroupId,
    pub partition: u32,
    pub layout: &'a GroupLayout,
    pub config: &'a DefragConfig,
    pub cp: Arc<CheckpointController>,
    /// Whether the owning cache group is encrypted (§9 open question).
    pub encrypted: bool,
    /// Per-group flag: whether `cacheId` is inlined into every data row,
    /// or carried only in the tree entry (§3).
    pub inline_cache_id: bool,
    pub metrics: Arc<dyn DefragMetricsSink>,
}

/// What remains to do once the checkpoint [`PartitionPipeline::run`]
/// requested has resolved: drop cached pages for both sides and commit
/// the new store's filename (§4.4 step 6). The Link Map itself outlives
/// this: C8's index rebuild (§4.6) needs every partition's map together,
/// so its store is only dropped once [`deregister_link_map`](Self::deregister_link_map)
/// is called after that rebuild finishes.
pub struct PipelineHandle {
    group: CacheGroupId,
    partition: u32,
    old_memory: Arc<PageMemory>,
    new_memory: Arc<PageMemory>,
    map_memory: Arc<PageMemory>,
    pub link_map: Arc<LinkMap>,
    layout: GroupLayout,
    metrics: Arc<dyn DefragMetricsSink>,
}

impl PipelineHandle {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn finish(&self) -> VoidResult {
        let partition_id = self.partition as u16;
        let old_pages = self.old_memory.page_count(partition_id).unwrap_or(0);
        let new_pages = self.new_memory.page_count(partition_id).unwrap_or(0);
        let mapping_pages = self.map_memory.page_count(partition_id).unwrap_or(0);
        self.metrics.on_event(&DefragEvent::PartitionCommitted {
            group: self.group,
            partition: self.partition,
            old_pages,
            new_pages,
            mapping_pages,
        });

        self.old_memory.invalidate_partition(partition_id);
        self.new_memory.invalidate_partition(partition_id);
        self.old_memory.deregister_store(partition_id);
        self.new_memory.deregister_store(partition_id);
        self.layout.commit_partition_rename(self.partition)
    }

    pub fn deregister_link_map(&self) {
        self.map_memory.deregister_store(self.partition as u16);
    }
}

/// §4.4 step 2: a partition whose `part-dfrg-P.bin` already exists is not
/// touched again, but its Link Map is still reopened (in `init = false`
/// mode) so C8 can translate against it. This carries just enough state
/// to join that reopened map into the group's index rebuild alongside
/// the handles of partitions this run actually rewrote.
pub struct SkippedPartition {
    partition: u32,
    map_memory: Arc<PageMemory>,
    pub link_map: Arc<LinkMap>,
}

impl SkippedPartition {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn deregister_link_map(&self) {
        self.map_memory.deregister_store(self.partition as u16);
    }
}

/// Reopen the Link Map of an already-defragmented partition (§4.4 step 2)
/// so the index rebuilder (§4.6) can still translate through it.
pub fn reopen_skipped_link_map(
    layout: &GroupLayout,
    config: &DefragConfig,
    partition: u32,
) -> DefragResult<SkippedPartition> {
    let partition_id = partition as u16;
    let map_store = FilePageStore::open(layout.link_map(partition), config.page_size)?;
    let map_memory = Arc::new(PageMemory::new());
    map_memory.register_store(partition_id, Arc::new(map_store));
    let link_map = Arc::new(LinkMap::open(map_memory.clone(), partition_id)?);
    Ok(SkippedPartition {
        partition,
        map_memory,
        link_map,
    })
}

impl<'a> PartitionPipeline<'a> {
    pub fn run(&self) -> DefragResult<(CheckpointFuture, PipelineHandle)> {
        if self.layout.partition_already_defragmented(self.partition) {
            return Err(DefragError::already_defragmented(format!(
                "group {} partition {} already defragmented",
                self.group, self.partition
            )));
        }

        let partition_id = self.partition as u16;
        self.metrics.on_event(&DefragEvent::PartitionStarted {
            group: self.group,
            partition: self.partition,
        });

        // Step 1: old partition (read side) and this partition's Link Map
        // store, each given their own page store / page memory.
        let old_store = FilePageStore::open(
            self.layout.live_partition(self.partition),
            self.config.page_size,
        )?;
        let old_memory = Arc::new(PageMemory::new());
        old_memory.register_store(partition_id, Arc::new(old_store));
        let old_partition = PartitionStore::open(old_memory.clone(), partition_id)?;

        let map_store = FilePageStore::create(
            self.layout.link_map(self.partition),
            self.config.page_size,
        )?;
        let map_memory = Arc::new(PageMemory::new());
        map_memory.register_store(partition_id, Arc::new(map_store));
        let link_map = Arc::new(LinkMap::init(map_memory.clone(), partition_id)?);

        // Step 3: brand-new store for the rewritten partition.
        let new_store = FilePageStore::create(
            self.layout.dfrg_tmp(self.partition),
            self.config.page_size,
        )?;
        let new_memory = Arc::new(PageMemory::new());
        new_memory.register_store(partition_id, Arc::new(new_store));

        // Step 4: build the new free list and trees under the checkpoint
        // read-lock, the same as any other page allocation (§4.1).
        let new_partition = {
            let _guard = self.cp.cp_read_lock();
            PartitionStore::create(new_memory.clone(), partition_id)?
        };

        // Step 5: row copy loop, yielding the read-lock at leaf
        // boundaries so the checkpointer is never starved.
        let mut yield_clock = YieldClock::new(self.cp.yield_cadence());
        let mut guard = Some(self.cp.cp_read_lock());
        let cp = &self.cp;
        old_partition.cache_tree.iterate(
            &mut yield_clock,
            |entry: CacheDataEntry| {
                let mut row = old_partition.free_list.get_row(entry.link)?;
                let old_link = entry.link;
                row.link = RowLink::NONE;
                if !self.inline_cache_id {
                    row.cache_id = None;
                }
                let new_link = new_partition.free_list.insert_data_row(&mut row)?;

                new_partition.cache_tree.put(&CacheDataEntry {
                    cache_id: entry.cache_id,
                    hash: entry.hash,
                    key: entry.key,
                    link: new_link,
                })?;
                link_map.put(old_link.as_u64(), new_link.as_u64())?;

                if row.expire_time != 0 {
                    new_partition.pending_tree.put(&PendingEntry {
                        cache_id: entry.cache_id.unwrap_or(u32::MAX),
                        expire_time: row.expire_time,
                        link: new_link,
                    })?;
                }
                Ok(true)
            },
            || {
                guard.take();
                guard = Some(cp.cp_read_lock());
            },
        )?;
        drop(guard.take());

        new_partition.free_list.save_metadata()?;
        let new_meta = copy_partition_meta(
            &old_memory,
            partition_id,
            PARTITION_META_IDX,
            &old_partition.free_list,
            &new_memory,
            partition_id,
            PARTITION_META_IDX,
            &new_partition.free_list,
            self.encrypted,
        )?;
        new_partition.write_meta(&new_meta)?;

        old_memory.flush_partition(partition_id)?;
        new_memory.flush_partition(partition_id)?;
        map_memory.flush_partition(partition_id)?;

        let future = self.cp.force_checkpoint(format!(
            "group {} partition {} defragmented",
            self.group, self.partition
        ))?;

        Ok((
            future,
            PipelineHandle {
                group: self.group,
                partition: self.partition,
                old_memory,
                new_memory,
                map_memory,
                link_map,
                layout: self.layout.clone(),
                metrics: self.metrics.clone(),
            },
        ))
    }
}
