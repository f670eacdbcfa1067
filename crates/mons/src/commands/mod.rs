pub mod apply;
pub mod config;
pub mod fstab;
pub mod probe;
pub mod revert;
pub mod status;

pub use apply::{apply_overlay, ApplyOverlayArgs};
pub use config::MechanismArg;
pub use fstab::{check_fstab, FstabArgs};
pub use probe::probe_platform;
pub use revert::revert_overlay;
pub use status::show_status;

use crate::utils::config::AppConfig;
use mons_overlay::OverlayEngine;

/// Engine configured from the user's `[overlay]` settings.
fn engine(cfg: &AppConfig) -> OverlayEngine {
    OverlayEngine::from_options(&cfg.overlay)
}
