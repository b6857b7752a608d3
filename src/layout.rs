//! File Layout Manager (C7, §3 "File naming", §7 crash protocol):
//! names, temp files, crash-safe rename, completion markers, resume
//! detection. Every path this engine touches is derived here so the
//! naming scheme lives in exactly one place.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CacheGroupId;
use crate::error::DefragError;
use crate::types::VoidResult;

/// Paths for one cache group's work directory, and the crash-safe
/// operations the pipeline and coordinator perform on it.
#[derive(Debug, Clone)]
pub struct GroupLayout {
    dir: PathBuf,
}

impl GroupLayout {
    /// `FilePageStoreMgr::cacheWorkDir(group)` (§6) resolved under
    /// `root`.
    pub fn new(root: impl AsRef<Path>, group: CacheGroupId) -> Self {
        Self {
            dir: root.as_ref().join(format!("group-{}", group)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> VoidResult {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn live_partition(&self, n: u32) -> PathBuf {
        self.dir.join(format!("part-{}.bin", n))
    }

    pub fn dfrg_tmp(&self, n: u32) -> PathBuf {
        self.dir.join(format!("part-dfrg-{}.bin.tmp", n))
    }

    pub fn dfrg_final(&self, n: u32) -> PathBuf {
        self.dir.join(format!("part-dfrg-{}.bin", n))
    }

    pub fn link_map(&self, n: u32) -> PathBuf {
        self.dir.join(format!("part-map-{}.bin", n))
    }

    pub fn index_tmp(&self) -> PathBuf {
        self.dir.join("index-dfrg.bin.tmp")
    }

    pub fn index_final(&self) -> PathBuf {
        self.dir.join("index-dfrg.bin")
    }

    pub fn completion_marker(&self) -> PathBuf {
        self.dir.join("defrg-completion.marker")
    }

    fn completion_marker_tmp(&self) -> PathBuf {
        self.dir.join("defrg-completion.marker.tmp")
    }

    /// §7 `AlreadyDefragmented`, group granularity: "detected by presence
    /// of the completion marker".
    pub fn group_already_complete(&self) -> bool {
        self.completion_marker().exists()
    }

    /// §4.4 step 2 skip check: "completion semantics: the defragmented
    /// final `part-dfrg-P.bin` already exists".
    pub fn partition_already_defragmented(&self, n: u32) -> bool {
        self.dfrg_final(n).exists()
    }

    /// §4.8: "delete any stale `index-dfrg.bin.tmp` left by a crashed
    /// previous run" before a group's pipelines begin.
    pub fn remove_stale_index_tmp(&self) -> VoidResult {
        let path = self.index_tmp();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Per-partition commit point (§4.4 step 6): rename the finished
    /// `.tmp` data store into its final defragmented name.
    pub fn commit_partition_rename(&self, n: u32) -> VoidResult {
        fs::rename(self.dfrg_tmp(n), self.dfrg_final(n)).map_err(|e| {
            DefragError::page_io(format!(
                "failed to rename partition {} tmp store into place: {}",
                n, e
            ))
        })
    }

    pub fn commit_index_rename(&self) -> VoidResult {
        fs::rename(self.index_tmp(), self.index_final()).map_err(|e| {
            DefragError::page_io(format!("failed to rename index tmp store into place: {}", e))
        })
    }

    /// Atomic creation of the completion marker is the commit point of
    /// the whole group (§3, §7). Written via a temp file plus rename
    /// rather than a bare `File::create`, so a crash mid-write of the
    /// marker itself can never leave a half-written marker that later
    /// reads as "present".
    pub fn write_completion_marker(&self) -> VoidResult {
        let tmp = self.completion_marker_tmp();
        fs::write(&tmp, [])?;
        fs::rename(&tmp, self.completion_marker())?;
        Ok(())
    }

    /// §4.6 `batchRenameDefragmentedCacheGroupPartitions(G)`: the final
    /// group-level swap of every `part-dfrg-N.bin` into its live name.
    /// Called only after the completion marker is durable, so a crash
    /// partway through this loop still leaves the group recoverable —
    /// on the next run `group_already_complete` is true and whichever
    /// live names are still stale get swapped again (renaming an
    /// already-correct file in place is a no-op in effect).
    pub fn batch_rename_partitions(&self, partition_count: u32) -> VoidResult {
        for n in 0..partition_count {
            let from = self.dfrg_final(n);
            if from.exists() {
                fs::rename(&from, self.live_partition(n))?;
            }
        }
        Ok(())
    }
}
