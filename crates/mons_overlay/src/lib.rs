//! Revertible overlays of mod content on top of a base installation.
//!
//! This crate layers an overlay source tree over a target directory (a game
//! install, say) so that the target shows the overlay's files, then restores
//! the target exactly as it was. It supports:
//!
//! - **Native mounts**: overlayfs on Linux when the process may mount
//! - **Copy fallback**: works everywhere; base files are moved aside, never deleted
//! - **Crash safety**: every change is recorded before it is made
//! - **Resumable revert**: a failed revert picks up where it stopped
//! - **Conflict detection**: file/directory clashes are reported before anything changes
//!
//! # Example
//!
//! ```no_run
//! use camino::Utf8Path;
//! use mons_overlay::{OverlayEngine, PlatformOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = OverlayEngine::from_options(&PlatformOptions::default())
//!     .with_progress(|progress| {
//!         println!("Stage: {:?}, Progress: {}/{}",
//!             progress.stage, progress.current, progress.total);
//!     });
//!
//! let target = Utf8Path::new("/games/Celeste");
//! let manifest = engine.apply(target, Utf8Path::new("/mods/Celeste"))?;
//! println!("Overlaid {} files via {}", manifest.files_overlaid(), manifest.mechanism);
//!
//! engine.revert(target)?;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod engine;
pub mod error;
pub mod fs_ops;
pub mod manifest;
pub mod platform;
mod session;

// Re-export main types
pub use classify::{classify, EntryKind, MergePlan, Origin, PlanEntry};
pub use engine::{OverlayEngine, OverlayProgress, OverlayStage, RevertReport};
pub use error::{Error, MountError, PartialRevertError, Result, UnmountError};
pub use fs_ops::{FileOps, StdFileOps};
pub use manifest::{EntryAction, Manifest, ManifestEntry, ManifestState, Mechanism};
pub use platform::{
    MechanismPreference, MountHandle, Platform, PlatformOptions, ProbeReport,
};
