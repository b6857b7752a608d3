//! Defragmenter Coordinator (C9, §4.7): orchestrates one run across
//! every configured cache group, driving the Partition Pipeline per
//! partition and the Index Rebuilder hook once a group's partitions are
//! done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};

use crate::checkpoint::{CheckpointController, CompoundCheckpointFuture};
use crate::config::{CacheGroupId, DefragConfig, INDEX_PARTITION, MAINTENANCE_TASK_NAME};
use crate::external::{DbMgr, Indexing, MaintenanceRegistry};
use crate::layout::GroupLayout;
use crate::metrics::{DefragEvent, DefragMetricsSink, LoggingMetricsSink};
use crate::pagestore::{FilePageStore, PageMemory};
use crate::pipeline::{reopen_skipped_link_map, PartitionPipeline, PipelineHandle, SkippedPartition};
use crate::tree::LinkMap;
use crate::types::{DefragResult, VoidResult};

/// What the coordinator needs to know about one cache group beyond its
/// id: these would ordinarily be read off the group's own descriptor in
/// the surrounding cache runtime (§6); this crate's standalone
/// embedding has the caller state them directly.
#[derive(Debug, Clone)]
pub struct CacheGroupSpec {
    pub group: CacheGroupId,
    pub partition_count: u32,
    pub encrypted: bool,
    pub inline_cache_id: bool,
}

/// Top-level entry point (§4.7). Owns the checkpoint controller for the
/// duration of one run; a fresh `Defragmenter` is expected per run.
pub struct Defragmenter {
    config: DefragConfig,
    cp: Arc<CheckpointController>,
    metrics: Arc<dyn DefragMetricsSink>,
}

impl Defragmenter {
    pub fn new(config: DefragConfig) -> Self {
        let cp = CheckpointController::start(config.checkpoint_yield_cadence);
        Self {
            config,
            cp,
            metrics: Arc::new(LoggingMetricsSink),
        }
    }

    /// Swap in a different progress observer (§9 "Delegating metrics");
    /// defaults to [`LoggingMetricsSink`].
    pub fn with_metrics(mut self, metrics: Arc<dyn DefragMetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run defragmentation over `groups`, skipping any not selected by
    /// [`DefragConfig::skips_group`] and any already marked complete
    /// (§4.7 step 3, §7). On any fatal error the checkpoint controller is
    /// stopped and the error's backtrace logged before propagating, so a
    /// caller retrying the whole run starts from a clean controller.
    pub fn run(
        &self,
        db_mgr: &dyn DbMgr,
        registry: &dyn MaintenanceRegistry,
        indexing: &dyn Indexing,
        groups: &[CacheGroupSpec],
    ) -> VoidResult {
        match self.run_inner(db_mgr, indexing, groups) {
            Ok(()) => {
                registry.unregister_maintenance_task(MAINTENANCE_TASK_NAME);
                self.cp.stop(true);
                Ok(())
            }
            Err(e) => {
                e.show_backtrace();
                self.cp.stop(true);
                Err(e)
            }
        }
    }

    fn run_inner(
        &self,
        db_mgr: &dyn DbMgr,
        indexing: &dyn Indexing,
        groups: &[CacheGroupSpec],
    ) -> VoidResult {
        // §4.7 step 1-2: resume WAL logging / restore state before
        // touching anything, then disable WAL for every group this run
        // will rewrite.
        db_mgr.resume_wal_logging()?;
        db_mgr.on_state_restored()?;

        // §4.7 step 1: force a "beforeDefragmentation" checkpoint and
        // wait for it before any group is touched.
        self.cp
            .force_checkpoint("beforeDefragmentation")?
            .wait()?;

        for spec in groups {
            if self.config.skips_group(spec.group) {
                info!("skipping group {} (not selected)", spec.group);
                continue;
            }

            let layout = GroupLayout::new(&self.config.work_dir, spec.group);
            layout.ensure_dir()?;

            if layout.group_already_complete() {
                info!("group {} already defragmented, skipping", spec.group);
                self.metrics
                    .on_event(&DefragEvent::GroupSkipped { group: spec.group });
                continue;
            }

            db_mgr.disable_group_wal(spec.group)?;
            layout.remove_stale_index_tmp()?;

            if let Err(e) = self.defragment_group(&layout, indexing, spec) {
                if e.is_already_defragmented() {
                    warn!("group {} reported already defragmented mid-run", spec.group);
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn defragment_group(
        &self,
        layout: &GroupLayout,
        indexing: &dyn Indexing,
        spec: &CacheGroupSpec,
    ) -> VoidResult {
        let started = Instant::now();

        // §4.8: bootstrap the temp index store before this group's
        // pipelines begin, but only for a group this run will actually
        // rebuild an index for (this crate folds `hasIndexStore` into
        // `Indexing::module_enabled`, per external.rs).
        let index_memory = if indexing.module_enabled() {
            Some(self.bootstrap_index_store(layout)?)
        } else {
            None
        };

        let mut futures = Vec::with_capacity(spec.partition_count as usize);
        let mut handles = Vec::with_capacity(spec.partition_count as usize);
        let mut skipped = Vec::new();

        for partition in 0..spec.partition_count {
            if layout.partition_already_defragmented(partition) {
                // §4.4 step 2: don't touch the partition again, but the
                // Link Map must still be reopened for C8 below.
                skipped.push(reopen_skipped_link_map(layout, &self.config, partition)?);
                continue;
            }

            let pipeline = PartitionPipeline {
                group: spec.group,
                partition,
                layout,
                config: &self.config,
                cp: self.cp.clone(),
                encrypted: spec.encrypted,
                inline_cache_id: spec.inline_cache_id,
                metrics: self.metrics.clone(),
            };
            let (future, handle) = pipeline.run()?;
            futures.push(future);
            handles.push(handle);
        }

        // §4.4 step 6 happens only once every partition's own closing
        // checkpoint has resolved.
        CompoundCheckpointFuture::new(futures).wait()?;
        for handle in &handles {
            handle.finish()?;
        }

        self.rebuild_index_and_finish(layout, indexing, spec, &handles, &skipped, index_memory)?;

        for handle in &handles {
            handle.deregister_link_map();
        }
        for skip in &skipped {
            skip.deregister_link_map();
        }
        self.metrics.on_event(&DefragEvent::GroupCompleted {
            group: spec.group,
            duration: started.elapsed(),
        });
        Ok(())
    }

    /// §4.8: delete any stale tmp left by a crashed previous run
    /// (already done by the caller, §7), create a fresh store, `sync()`
    /// it, and register it at [`INDEX_PARTITION`] — all under the
    /// checkpoint read-lock, since creating a store is itself a page
    /// allocation (§4.1).
    fn bootstrap_index_store(&self, layout: &GroupLayout) -> DefragResult<Arc<PageMemory>> {
        let memory = Arc::new(PageMemory::new());
        let store = {
            let _guard = self.cp.cp_read_lock();
            FilePageStore::create(layout.index_tmp(), self.config.page_size)?
        };
        memory.register_store(INDEX_PARTITION as u16, Arc::new(store));
        memory.flush_partition(INDEX_PARTITION as u16)?;
        Ok(memory)
    }

    /// §4.6: rebuild the index partition (if the group has one and the
    /// indexing module is enabled), then commit the index rename, write
    /// the group's completion marker, and swap every finished partition
    /// into its live name.
    fn rebuild_index_and_finish(
        &self,
        layout: &GroupLayout,
        indexing: &dyn Indexing,
        spec: &CacheGroupSpec,
        handles: &[PipelineHandle],
        skipped: &[SkippedPartition],
        index_memory: Option<Arc<PageMemory>>,
    ) -> VoidResult {
        if let Some(index_memory) = index_memory {
            let link_maps: HashMap<u32, Arc<LinkMap>> = handles
                .iter()
                .map(|h| (h.partition(), h.link_map.clone()))
                .chain(skipped.iter().map(|s| (s.partition(), s.link_map.clone())))
                .collect();
            let future = indexing.defragment(
                spec.group,
                spec.group,
                index_memory.clone(),
                link_maps,
                self.cp.clone(),
            )?;
            future.wait().map_err(|e| {
                error!("index rebuild failed for group {}: {}", spec.group, e);
                crate::error::DefragError::index_defragmentation_failed(e.to_string())
            })?;

            // §4.6: "invalidate index-partition pages in both the old
            // and new page memories" — this crate models no separate
            // old index page memory (the indexing subsystem's internal
            // tree code, including its live-index read path, is out of
            // scope, §1), so only the new side is invalidated here.
            index_memory.flush_partition(INDEX_PARTITION as u16)?;
            index_memory.invalidate_partition(INDEX_PARTITION as u16);
            index_memory.deregister_store(INDEX_PARTITION as u16);
            layout.commit_index_rename()?;
        }

        layout.write_completion_marker()?;
        layout.batch_rename_partitions(spec.partition_count)?;
        Ok(())
    }
}
