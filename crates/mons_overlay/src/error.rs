//! Error types for overlay operations.
//!
//! Every fallible function in this crate returns [`Result<T>`], which uses
//! [`Error`] as the error type. Unlike most crates there is no blanket
//! `From<std::io::Error>` conversion: filesystem failures are always wrapped
//! together with the path they happened on, so a caller can tell the user
//! exactly which file needs attention.

use crate::classify::EntryKind;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while applying, inspecting or reverting an overlay.
#[derive(Error, Debug)]
pub enum Error {
    /// A relative path is a file on one side and a directory on the other.
    ///
    /// The user has to rename or remove one side before the overlay can be applied.
    #[error(
        "Overlay conflict at '{path}': {base} in target, {overlay} in overlay source{}",
        more_paths(.others)
    )]
    OverlayConflict {
        path: Utf8PathBuf,
        base: EntryKind,
        overlay: EntryKind,
        /// Further conflicting paths, in sorted order.
        others: Vec<Utf8PathBuf>,
    },

    /// The platform failed to mount the overlay. The target was left untouched.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// The platform failed to unmount the overlay.
    #[error(transparent)]
    Unmount(#[from] UnmountError),

    /// A manifest already exists for the target; it must be reverted first.
    #[error("An overlay is already active on {target} (manifest: {manifest})")]
    OverlayAlreadyActive {
        target: Utf8PathBuf,
        manifest: Utf8PathBuf,
    },

    /// Placing the overlay failed; the engine attempted to roll back.
    ///
    /// `rollback` is `None` when the rollback restored the target completely.
    #[error("Failed to apply overlay at '{path}': {source}{}", rollback_outcome(.rollback))]
    OverlayApply {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
        rollback: Option<Box<PartialRevertError>>,
    },

    /// Revert stopped partway. Re-invoking revert resumes where it stopped.
    #[error(transparent)]
    PartialRevert(#[from] PartialRevertError),

    /// The manifest was written by an unknown schema version. Nothing was touched.
    #[error("Unsupported manifest version {version} in {path}")]
    UnsupportedManifestVersion { path: Utf8PathBuf, version: String },

    /// The target root is missing, not a directory, or not writable.
    #[error("Invalid target directory {path}: {reason}")]
    InvalidTarget { path: Utf8PathBuf, reason: String },

    /// The overlay source is missing or not a directory.
    #[error("Invalid overlay source {path}: {reason}")]
    InvalidSource { path: Utf8PathBuf, reason: String },

    /// Reading or writing the manifest file failed.
    #[error("Manifest I/O error at {path}: {source}")]
    ManifestIo {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest file exists but is not a valid manifest document.
    #[error("Malformed manifest {path}: {source}")]
    ManifestFormat {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Walking the target or overlay tree failed.
    #[error("Failed to read {path}: {source}")]
    Classify {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether re-invoking the failed operation can reasonably succeed.
    ///
    /// True for a busy mount point and for partial reverts (which resume from
    /// the remaining manifest entries).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unmount(UnmountError::Busy { .. }) | Error::PartialRevert(_)
        )
    }

    pub(crate) fn manifest_io(path: &Utf8Path, source: std::io::Error) -> Self {
        Error::ManifestIo {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn classify(path: &Utf8Path, source: std::io::Error) -> Self {
        Error::Classify {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Failure of the platform mount mechanism.
#[derive(Error, Debug)]
pub enum MountError {
    /// The platform has no native overlay mechanism.
    #[error("Native overlay mounts are not supported on this platform")]
    Unsupported,

    /// The path cannot be expressed as an overlay mount option (contains `:` or `,`).
    #[error("Path cannot be used in overlay mount options: {path}")]
    InvalidPath { path: Utf8PathBuf },

    /// Creating the upper or work directory failed.
    #[error("Failed to prepare overlay directory {path}: {source}")]
    Prepare {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The `mount` program could not be started.
    #[error("Failed to run mount for {target}: {source}")]
    Spawn {
        target: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `mount` ran and reported failure.
    #[error("mount failed for {target} ({status}): {stderr}")]
    Failed {
        target: Utf8PathBuf,
        status: String,
        stderr: String,
    },
}

/// Failure of the platform unmount mechanism.
#[derive(Error, Debug)]
pub enum UnmountError {
    /// The mount point is in use. Close whatever holds it open and retry.
    #[error("Overlay at {mount_point} is busy: {stderr}")]
    Busy {
        mount_point: Utf8PathBuf,
        stderr: String,
    },

    /// Nothing is mounted there any more.
    #[error("No overlay is mounted at {mount_point}")]
    NotMounted { mount_point: Utf8PathBuf },

    /// The mount table could not be read to determine the mount state.
    #[error("Unable to determine mount state from {path}: {source}")]
    MountTable {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The `umount` program could not be started.
    #[error("Failed to run umount for {mount_point}: {source}")]
    Spawn {
        mount_point: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The platform has no native overlay mechanism.
    #[error("Native overlay mounts are not supported on this platform")]
    Unsupported,
}

/// A revert that stopped before every manifest entry was processed.
///
/// The manifest on disk has been rewritten to hold exactly the unprocessed
/// entries (`failed` followed by `remaining`), so calling revert again picks
/// up from here.
#[derive(Error, Debug)]
#[error(
    "Revert of {target} stopped at '{failed}': {source}; {} more path(s) still need attention{}",
    .remaining.len(),
    path_list(.remaining)
)]
pub struct PartialRevertError {
    pub target: Utf8PathBuf,
    /// Relative path whose revert failed.
    pub failed: Utf8PathBuf,
    #[source]
    pub source: std::io::Error,
    /// Relative paths that were not processed yet, in revert order.
    pub remaining: Vec<Utf8PathBuf>,
}

impl PartialRevertError {
    /// Every relative path that still needs manual attention, failed one first.
    pub fn unresolved_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        std::iter::once(self.failed.as_path()).chain(self.remaining.iter().map(|p| p.as_path()))
    }
}

fn more_paths(others: &[Utf8PathBuf]) -> String {
    if others.is_empty() {
        return String::new();
    }
    format!(" (and {} more: {})", others.len(), join_paths(others))
}

fn path_list(paths: &[Utf8PathBuf]) -> String {
    if paths.is_empty() {
        return String::new();
    }
    format!(": {}", join_paths(paths))
}

fn rollback_outcome(rollback: &Option<Box<PartialRevertError>>) -> String {
    match rollback {
        None => "; target rolled back".to_string(),
        Some(partial) => format!(
            "; rollback incomplete, paths needing manual attention: {}",
            partial
                .unresolved_paths()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial() -> PartialRevertError {
        PartialRevertError {
            target: Utf8PathBuf::from("/game"),
            failed: Utf8PathBuf::from("Content/a.bin"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            remaining: vec![Utf8PathBuf::from("Content"), Utf8PathBuf::from("b.txt")],
        }
    }

    #[test]
    fn test_partial_revert_lists_paths() {
        let message = partial().to_string();
        assert!(message.contains("Content/a.bin"));
        assert!(message.contains("2 more path(s)"));
        assert!(message.contains("Content, b.txt"));
    }

    #[test]
    fn test_apply_error_mentions_residue() {
        let err = Error::OverlayApply {
            path: Utf8PathBuf::from("x.txt"),
            source: std::io::Error::other("disk full"),
            rollback: Some(Box::new(partial())),
        };
        let message = err.to_string();
        assert!(message.contains("rollback incomplete"));
        assert!(message.contains("Content/a.bin, Content, b.txt"));

        let clean = Error::OverlayApply {
            path: Utf8PathBuf::from("x.txt"),
            source: std::io::Error::other("disk full"),
            rollback: None,
        };
        assert!(clean.to_string().ends_with("target rolled back"));
    }

    #[test]
    fn test_conflict_message() {
        let err = Error::OverlayConflict {
            path: Utf8PathBuf::from("a/b"),
            base: EntryKind::File,
            overlay: EntryKind::Dir,
            others: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Overlay conflict at 'a/b': file in target, directory in overlay source"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::PartialRevert(partial()).is_retryable());
        assert!(Error::Unmount(UnmountError::Busy {
            mount_point: Utf8PathBuf::from("/game"),
            stderr: String::new(),
        })
        .is_retryable());
        assert!(!Error::UnsupportedManifestVersion {
            path: Utf8PathBuf::from("/game/.mons-overlay.json"),
            version: "7".to_string(),
        }
        .is_retryable());
    }
}
