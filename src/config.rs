use std::path::PathBuf;
use std::time::Duration;

/// Process-wide constants. The maintenance-registry task name and the
/// well-known mapping meta-page index are compile-time configuration, not
/// mutable state (see "Global state" in the design notes).
pub const MAINTENANCE_TASK_NAME: &str = "defragmentationMaintenanceTask";

/// Well-known page index at which a partition's Link Map stores its meta
/// page, under `PageFlag::Data` in the mapping partition.
pub const META_PAGE_IDX: u32 = 0;

/// Page index reserved for a cache group's index partition inside the
/// part-region page memory.
pub const INDEX_PARTITION: u32 = u32::MAX;

/// Default fixed page size, matching the teacher's `BufferPool::PAGE_SIZE`
/// constant in spirit: typical on-disk page stores use 4 KiB pages.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default checkpoint read-lock yield cadence: workers must release and
/// re-acquire the lock at least this often so the checkpointer is never
/// starved (§4.1).
pub const DEFAULT_YIELD_CADENCE: Duration = Duration::from_millis(150);

/// Opaque identifier for a cache group, as handed to the engine by the
/// surrounding cache runtime (out of scope here: how the runtime assigns
/// these ids).
pub type CacheGroupId = u32;

/// Runtime configuration for one `Defragmenter` run. Parsing this from a
/// file or CLI flags is explicitly out of scope (§1 Non-goals); this
/// struct is constructed programmatically by the embedding node, the way
/// `DbMgr`/`FilePageStoreMgr` are handed to the engine in §6.
#[derive(Clone, Debug)]
pub struct DefragConfig {
    /// Fixed page size used by every page store this engine creates.
    pub page_size: usize,

    /// Cadence at which the checkpoint read-lock must be yielded during a
    /// long iteration (§4.1, §4.4 step 5).
    pub checkpoint_yield_cadence: Duration,

    /// Root directory under which per-group work directories live.
    pub work_dir: PathBuf,

    /// Cache groups to defragment. Empty means "all user groups found
    /// under `work_dir`".
    pub cache_groups_for_defragmentation: Vec<CacheGroupId>,
}

impl DefragConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            checkpoint_yield_cadence: DEFAULT_YIELD_CADENCE,
            work_dir: work_dir.into(),
            cache_groups_for_defragmentation: Vec::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_yield_cadence(mut self, cadence: Duration) -> Self {
        self.checkpoint_yield_cadence = cadence;
        self
    }

    pub fn with_groups(mut self, groups: Vec<CacheGroupId>) -> Self {
        self.cache_groups_for_defragmentation = groups;
        self
    }

    /// `true` if the filter set is non-empty and `group` is not in it.
    pub fn skips_group(&self, group: CacheGroupId) -> bool {
        !self.cache_groups_for_defragmentation.is_empty()
            && !self.cache_groups_for_defragmentation.contains(&group)
    }
}
