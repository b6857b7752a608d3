use std::time::Duration;

use crate::config::CacheGroupId;

/// Events the coordinator and pipeline report through a metrics sink.
/// The source system exposes a metrics adapter that can chain to another
/// adapter (§9 "Delegating metrics"); here that's modeled as a single
/// optional observer with explicit lifetime instead of shared mutable
/// ownership, since chaining adapters is the part of the source design
/// flagged for a redesign.
#[derive(Debug, Clone)]
pub enum DefragEvent {
    PartitionStarted {
        group: CacheGroupId,
        partition: u32,
    },
    PartitionCommitted {
        group: CacheGroupId,
        partition: u32,
        old_pages: u32,
        new_pages: u32,
        mapping_pages: u32,
    },
    GroupCompleted {
        group: CacheGroupId,
        duration: Duration,
    },
    GroupSkipped {
        group: CacheGroupId,
    },
}

/// Observer for defragmentation progress. Implementors must not block the
/// coordinator for long — this is called from the single-threaded
/// pipeline, never from the checkpointer thread.
pub trait DefragMetricsSink: Send + Sync {
    fn on_event(&self, event: &DefragEvent);
}

/// Default sink: forwards every event to the `log` facade. Logging itself
/// is out of scope as a feature (§1), but the ambient plumbing that
/// carries events to it is not.
pub struct LoggingMetricsSink;

impl DefragMetricsSink for LoggingMetricsSink {
    fn on_event(&self, event: &DefragEvent) {
        match event {
            DefragEvent::PartitionStarted { group, partition } => {
                log::info!(
                    "defrag: partition started, group: {}, partition: {}",
                    group,
                    partition
                );
            }
            DefragEvent::PartitionCommitted {
                group,
                partition,
                old_pages,
                new_pages,
                mapping_pages,
            } => {
                log::info!(
                    "defrag: partition committed, group: {}, partition: {}, old_pages: {}, new_pages: {}, mapping_pages: {}",
                    group, partition, old_pages, new_pages, mapping_pages
                );
            }
            DefragEvent::GroupCompleted { group, duration } => {
                log::info!(
                    "defrag: group completed, group: {}, duration: {:?}",
                    group,
                    duration
                );
            }
            DefragEvent::GroupSkipped { group } => {
                log::info!("defrag: group skipped, group: {}", group);
            }
        }
    }
}

/// Sink that swallows every event; useful for tests that only care about
/// the on-disk outcome.
pub struct NoopMetricsSink;

impl DefragMetricsSink for NoopMetricsSink {
    fn on_event(&self, _event: &DefragEvent) {}
}
