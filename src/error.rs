use std::fmt;
use std::io;

use backtrace::Backtrace;

/// The kinds of failure the defragmentation engine can surface, per the
/// error-handling design: most are fatal for the current group, one
/// (`AlreadyDefragmented`) is a skip signal rather than a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefragErrorKind {
    /// Any page read/write/sync/rename failure.
    PageIo,

    /// Old partition meta version outside {1,2,3}.
    UnsupportedMetaVersion,

    /// The index rebuild hook (C8) failed; the group's completion marker
    /// must not be written so the group is retried on the next run.
    IndexDefragmentationFailed,

    /// A checkpoint future resolved with an error.
    CheckpointFailed,

    /// Not a failure: the group or partition is already defragmented.
    AlreadyDefragmented,

    /// §9 open question resolution: an encrypted group's partition meta
    /// carries non-zero `encryptedPageCount`/`Index` that this engine
    /// cannot preserve across defragmentation. Raised instead of
    /// silently resetting them to 0.
    EncryptedMetaLoss,
}

impl fmt::Display for DefragErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DefragErrorKind::PageIo => "page io error",
            DefragErrorKind::UnsupportedMetaVersion => {
                "unsupported partition meta version"
            }
            DefragErrorKind::IndexDefragmentationFailed => {
                "index defragmentation failed"
            }
            DefragErrorKind::CheckpointFailed => "checkpoint failed",
            DefragErrorKind::AlreadyDefragmented => "already defragmented",
            DefragErrorKind::EncryptedMetaLoss => "encrypted partition meta would be truncated",
        };
        write!(f, "{}", s)
    }
}

/// Crate-wide error type. Carries a captured backtrace the way
/// `transaction::concurrent_status`'s error path does, so a fatal failure
/// mid-run can be diagnosed after the fact without re-running under a
/// debugger.
pub struct DefragError {
    kind: DefragErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl DefragError {
    pub fn new(kind: DefragErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            details: msg.into(),
            backtrace: Backtrace::new(),
        }
    }

    pub fn page_io(msg: impl Into<String>) -> Self {
        Self::new(DefragErrorKind::PageIo, msg)
    }

    pub fn unsupported_meta_version(version: u8) -> Self {
        Self::new(
            DefragErrorKind::UnsupportedMetaVersion,
            format!("unsupported partition meta version: {}", version),
        )
    }

    pub fn already_defragmented(msg: impl Into<String>) -> Self {
        Self::new(DefragErrorKind::AlreadyDefragmented, msg)
    }

    pub fn index_defragmentation_failed(msg: impl Into<String>) -> Self {
        Self::new(DefragErrorKind::IndexDefragmentationFailed, msg)
    }

    pub fn checkpoint_failed(msg: impl Into<String>) -> Self {
        Self::new(DefragErrorKind::CheckpointFailed, msg)
    }

    pub fn encrypted_meta_loss(msg: impl Into<String>) -> Self {
        Self::new(DefragErrorKind::EncryptedMetaLoss, msg)
    }

    pub fn kind(&self) -> &DefragErrorKind {
        &self.kind
    }

    pub fn is_already_defragmented(&self) -> bool {
        self.kind == DefragErrorKind::AlreadyDefragmented
    }

    /// Print the captured backtrace to the log at `error!` level. Callers
    /// in the coordinator's cleanup path call this before giving up on a
    /// run, mirroring `err.show_backtrace()` in the teacher's transaction
    /// module.
    pub fn show_backtrace(&self) {
        log::error!("{}\n{:?}", self, self.backtrace);
    }
}

impl fmt::Display for DefragError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.details)
    }
}

impl fmt::Debug for DefragError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DefragError({}: {})", self.kind, self.details)
    }
}

impl std::error::Error for DefragError {}

impl From<io::Error> for DefragError {
    fn from(e: io::Error) -> Self {
        DefragError::page_io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_defragmented_is_not_treated_as_a_generic_failure() {
        let e = DefragError::already_defragmented("group 3 has a marker");
        assert!(e.is_already_defragmented());
        assert_eq!(e.kind(), &DefragErrorKind::AlreadyDefragmented);
    }

    #[test]
    fn io_error_converts_to_page_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let e: DefragError = io_err.into();
        assert_eq!(e.kind(), &DefragErrorKind::PageIo);
    }
}
