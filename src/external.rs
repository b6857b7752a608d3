//! External interfaces this engine consumes (§6). The surrounding node
//! owns the real implementations (WAL-aware `DbMgr`, the node-wide
//! `FilePageStoreMgr`, the cluster's `MaintenanceRegistry`, the
//! indexing subsystem); this module only states the trait boundary
//! plus minimal in-memory stand-ins so the crate is runnable and
//! testable standalone (mirrors how [`crate::pagestore`] stands in for
//! C1/C2).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::checkpoint::{CheckpointController, CheckpointFuture};
use crate::config::{CacheGroupId, INDEX_PARTITION};
use crate::pagestore::{PageFlag, PageMemory};
use crate::tree::LinkMap;
use crate::types::{DefragResult, VoidResult};
use crate::utils::HandyRwLock;

/// `DbMgr`: WAL resume/restore lifecycle and named data regions (§6).
/// Out of scope here beyond the calls the coordinator makes around
/// them (§4.7 step 1–2); a real embedder's WAL/region bookkeeping is
/// untouched by this crate.
pub trait DbMgr: Send + Sync {
    fn resume_wal_logging(&self) -> VoidResult;
    fn on_state_restored(&self) -> VoidResult;
    /// Locally disable WAL production for `group`, so rewrite traffic
    /// generates no redo (§4.7 step 2).
    fn disable_group_wal(&self, group: CacheGroupId) -> VoidResult;
}

/// No-op `DbMgr` for standalone use and tests: there is no WAL in this
/// crate's embedding, so every call trivially succeeds.
pub struct NoopDbMgr;

impl DbMgr for NoopDbMgr {
    fn resume_wal_logging(&self) -> VoidResult {
        Ok(())
    }
    fn on_state_restored(&self) -> VoidResult {
        Ok(())
    }
    fn disable_group_wal(&self, _group: CacheGroupId) -> VoidResult {
        Ok(())
    }
}

/// `MaintenanceRegistry`: the coordinator unregisters
/// [`crate::config::MAINTENANCE_TASK_NAME`] once a run finishes
/// successfully (§6, §4.7 step 4).
pub trait MaintenanceRegistry: Send + Sync {
    fn unregister_maintenance_task(&self, name: &str);
}

/// In-memory stand-in: a process-wide set of currently-registered task
/// names, the way a real registry tracks them across a node's
/// lifetime. `once_cell::sync::Lazy` holds it, since the registry is a
/// process-wide collaborator in the source system, not per-engine
/// state (§9 "Global state").
static REGISTERED_TASKS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub struct InMemoryMaintenanceRegistry;

impl InMemoryMaintenanceRegistry {
    pub fn register(name: &str) {
        REGISTERED_TASKS.lock().unwrap().insert(name.to_string());
    }

    pub fn is_registered(name: &str) -> bool {
        REGISTERED_TASKS.lock().unwrap().contains(name)
    }
}

impl MaintenanceRegistry for InMemoryMaintenanceRegistry {
    fn unregister_maintenance_task(&self, name: &str) {
        REGISTERED_TASKS.lock().unwrap().remove(name);
    }
}

/// `Indexing`: the indexing subsystem's `defragment` hook (C8, §4.6,
/// §6). Only this one entry point is specified; everything about how
/// the index itself is organized is an internal detail of that
/// subsystem.
pub trait Indexing: Send + Sync {
    fn module_enabled(&self) -> bool;

    /// Rebuild the index partition registered at
    /// [`crate::config::INDEX_PARTITION`] in `page_mem`, translating
    /// every link the implementer encounters through `link_maps[partition]`.
    /// Returns a [`CheckpointFuture`] the caller awaits before renaming
    /// the index temp file into place.
    fn defragment(
        &self,
        old_group: CacheGroupId,
        new_group: CacheGroupId,
        page_mem: Arc<PageMemory>,
        link_maps: std::collections::HashMap<u32, Arc<LinkMap>>,
        cp: Arc<CheckpointController>,
    ) -> DefragResult<CheckpointFuture>;
}

/// Stand-in used when a cache group has no index store
/// (`hasIndexStore(grpId) == false`, §6) or when the indexing module
/// is disabled: `module_enabled` reports `false`, and the coordinator
/// (§4.6) must not call `defragment` in that case.
pub struct NoIndexing;

impl Indexing for NoIndexing {
    fn module_enabled(&self) -> bool {
        false
    }

    fn defragment(
        &self,
        _old_group: CacheGroupId,
        _new_group: CacheGroupId,
        _page_mem: Arc<PageMemory>,
        _link_maps: std::collections::HashMap<u32, Arc<LinkMap>>,
        cp: Arc<CheckpointController>,
    ) -> DefragResult<CheckpointFuture> {
        cp.force_checkpoint("no-op index defragmentation")
    }
}

/// Exercising `Indexing` implementation used by this crate's own
/// integration tests: rather than leaving link translation unverified,
/// it writes one index page per partition recording that partition's
/// `(oldLink, newLink)` pairs, translated exactly as a real indexing
/// subsystem's `defragment` hook is required to (§4.6: "translate every
/// link it encounters through this map"). Record layout per page:
/// `partition: u32, count: u32, (old: u64, new: u64){count}`, truncated
/// to whatever fits in one page — real index records would span
/// multiple pages via the same free-list/chain mechanism C5 uses, but
/// that structure is the indexing subsystem's own internal tree code,
/// out of scope here (§1).
pub struct InMemoryIndexDefragmenter;

impl Indexing for InMemoryIndexDefragmenter {
    fn module_enabled(&self) -> bool {
        true
    }

    fn defragment(
        &self,
        _old_group: CacheGroupId,
        _new_group: CacheGroupId,
        page_mem: Arc<PageMemory>,
        link_maps: std::collections::HashMap<u32, Arc<LinkMap>>,
        cp: Arc<CheckpointController>,
    ) -> DefragResult<CheckpointFuture> {
        let _guard = cp.cp_read_lock();
        let mut partitions: Vec<u32> = link_maps.keys().copied().collect();
        partitions.sort_unstable();

        for partition in partitions {
            let snapshot = link_maps[&partition].snapshot();
            let (_pid, page) = page_mem.allocate(INDEX_PARTITION as u16, PageFlag::Idx)?;
            let mut guard = page.wl();
            let cap = guard.len();

            let mut off = 0;
            guard[off..off + 4].copy_from_slice(&partition.to_be_bytes());
            off += 4;
            let count_off = off;
            off += 4;

            let mut written = 0u32;
            for (old, new) in snapshot {
                if off + 16 > cap {
                    break;
                }
                guard[off..off + 8].copy_from_slice(&old.to_be_bytes());
                off += 8;
                guard[off..off + 8].copy_from_slice(&new.to_be_bytes());
                off += 8;
                written += 1;
            }
            guard[count_off..count_off + 4].copy_from_slice(&written.to_be_bytes());
        }

        cp.force_checkpoint("in-memory index defragmented")
    }
}
