use camino::{Utf8Path, Utf8PathBuf};
use miette::Diagnostic;
use mons_overlay::{Error as OverlayError, UnmountError};
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("{error}")]
    #[diagnostic(
        code(overlay::conflict),
        help("Rename or remove '{path}' in either the target or the overlay source, then apply again")
    )]
    Conflict {
        path: Utf8PathBuf,
        error: OverlayError,
    },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::already_active),
        help("Run `mons revert {target}` first")
    )]
    AlreadyActive {
        target: Utf8PathBuf,
        error: OverlayError,
    },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::mount_failed),
        help("Run `mons config set-mechanism copy` to apply overlays without mounting")
    )]
    MountFailed { error: OverlayError },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::busy),
        help("Close programs using files under {target} and run `mons revert {target}` again")
    )]
    Busy {
        target: Utf8PathBuf,
        error: OverlayError,
    },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::apply_failed),
        help("The target was restored. Check file permissions and available disk space")
    )]
    ApplyFailed { error: OverlayError },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::rollback_incomplete),
        help("Run `mons revert {target}` to retry restoring the listed paths")
    )]
    RollbackIncomplete {
        target: Utf8PathBuf,
        error: OverlayError,
    },

    #[error("{error}")]
    #[diagnostic(
        code(overlay::partial_revert),
        help("Fix the problem with the listed path and run `mons revert {target}` again")
    )]
    PartialRevert {
        target: Utf8PathBuf,
        error: OverlayError,
    },

    #[error("{error}")]
    #[diagnostic(
        code(manifest::unsupported_version),
        help("The overlay was applied by a different version of mons; revert it with that version")
    )]
    UnsupportedManifest { error: OverlayError },

    #[error("{error}")]
    #[diagnostic(code(overlay::error))]
    Overlay { error: OverlayError },

    #[error("Path must be absolute: {path}")]
    #[diagnostic(
        code(path::not_absolute),
        help("Pass the full path, e.g. /home/me/games/Celeste")
    )]
    NotAbsolute { path: Utf8PathBuf },

    #[error("Failed to read {path}")]
    #[diagnostic(code(io::read_failed))]
    ReadFailed {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save configuration")]
    #[diagnostic(
        code(config::save_failed),
        help("Check that the configuration directory is writable")
    )]
    ConfigSave {
        #[source]
        source: std::io::Error,
    },
}

impl CliError {
    /// Wrap a library error, attaching the target the user was working on.
    pub fn overlay(error: OverlayError, target: &Utf8Path) -> Self {
        let target = target.to_path_buf();
        match &error {
            OverlayError::OverlayConflict { path, .. } => Self::Conflict {
                path: path.clone(),
                error,
            },
            OverlayError::OverlayAlreadyActive { .. } => Self::AlreadyActive { target, error },
            OverlayError::Mount(_) => Self::MountFailed { error },
            OverlayError::Unmount(UnmountError::Busy { .. }) => Self::Busy { target, error },
            OverlayError::OverlayApply { rollback: None, .. } => Self::ApplyFailed { error },
            OverlayError::OverlayApply { .. } => Self::RollbackIncomplete { target, error },
            OverlayError::PartialRevert(_) => Self::PartialRevert { target, error },
            OverlayError::UnsupportedManifestVersion { .. } => Self::UnsupportedManifest { error },
            _ => Self::Overlay { error },
        }
    }

    pub fn not_absolute(path: &Utf8Path) -> Self {
        Self::NotAbsolute {
            path: path.to_path_buf(),
        }
    }

    pub fn read_failed(path: &Utf8Path, source: std::io::Error) -> Self {
        Self::ReadFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config_save(source: std::io::Error) -> Self {
        Self::ConfigSave { source }
    }
}
