//! Overlay engine: apply and revert.
//!
//! # Apply
//!
//! 1. Validate both roots and refuse if a manifest already exists.
//! 2. Ask the [`Platform`] which mechanism to use.
//! 3. **Native mount**: persist a manifest holding the mount handle, then
//!    mount. The manifest is written first because the mount covers the
//!    target root and may make it read-only. If mounting fails the manifest is
//!    deleted again and the target is untouched.
//! 4. **Copy fallback**: take the manifest as an exclusive lock, classify the
//!    trees, then walk the plan in order. Overlay-only directories are
//!    created, overlay-only files placed, and shadowed base files moved to
//!    the backup directory before the overlay file takes their place. Each
//!    step is recorded in the manifest before it happens. Any failure rolls
//!    the target back from the partial manifest and returns
//!    [`Error::OverlayApply`] carrying the rollback outcome.
//! 5. Mark the manifest `active` and return it.
//!
//! # Revert
//!
//! Loads the manifest. Native mounts are unmounted ("not mounted" counts as
//! done). Copy fallbacks undo their entries newest first. The manifest is
//! deleted only once everything is undone; a failure leaves the remaining
//! entries on disk for the next attempt.

use crate::classify::{classify, EntryKind};
use crate::error::{Error, Result, UnmountError};
use crate::fs_ops::{FileOps, StdFileOps};
use crate::manifest::{Manifest, ManifestState, Mechanism, MANIFEST_FILE_NAME};
use crate::platform::{self, MountHandle, Platform, PlatformOptions};
use crate::session::OverlaySession;
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;

/// Progress update emitted during apply and revert.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayProgress {
    pub stage: OverlayStage,
    /// Relative path being placed or reverted.
    pub current_path: Option<Utf8PathBuf>,
    /// 1-based index of the current path.
    pub current: u32,
    pub total: u32,
}

/// Stages of apply and revert.
///
/// Apply emits `Classifying` -> `Placing` (repeated) -> `Complete`, or
/// `Mounting` -> `Complete` for native mounts. Revert emits `Reverting`
/// (repeated for copy fallbacks) -> `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OverlayStage {
    Classifying,
    Placing,
    Mounting,
    Reverting,
    Complete,
}

/// Outcome of [`OverlayEngine::revert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertReport {
    /// Mechanism of the reverted overlay, or `None` if nothing was active.
    pub mechanism: Option<Mechanism>,
    /// Number of manifest entries undone (copy fallback only).
    pub paths_reverted: usize,
}

type ProgressCallback = Arc<dyn Fn(OverlayProgress) + Send + Sync>;

/// Applies overlays to target roots and reverts them.
///
/// The engine itself is stateless; everything it needs to revert lives in the
/// manifest on disk, so revert works from a different process than apply.
pub struct OverlayEngine {
    platform: Box<dyn Platform>,
    fs: Box<dyn FileOps>,
    progress_callback: Option<ProgressCallback>,
}

impl OverlayEngine {
    pub fn new(platform: Box<dyn Platform>) -> Self {
        Self {
            platform,
            fs: Box::new(StdFileOps),
            progress_callback: None,
        }
    }

    /// Engine using the platform adapter [`platform::detect`] picks for `options`.
    pub fn from_options(options: &PlatformOptions) -> Self {
        Self::new(platform::detect(options))
    }

    /// Replace the filesystem primitives used by the copy fallback.
    pub fn with_file_ops(mut self, fs: Box<dyn FileOps>) -> Self {
        self.fs = fs;
        self
    }

    /// Register a progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(OverlayProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Mechanism the next apply would use on a target without a native
    /// mount route of its own (see [`Platform::capability_for`]).
    pub fn capability(&self) -> Mechanism {
        self.platform.capability()
    }

    /// The active manifest of `target`, if any.
    pub fn status(&self, target: &Utf8Path) -> Result<Option<Manifest>> {
        let target = resolve_target(target)?;
        Manifest::load(&target)
    }

    /// Apply the overlay at `source` on top of `target`.
    pub fn apply(&self, target: &Utf8Path, source: &Utf8Path) -> Result<Manifest> {
        let target = validate_target(target)?;
        let source = validate_source(&target, source)?;

        if Manifest::load(&target)?.is_some() {
            return Err(Error::OverlayAlreadyActive {
                manifest: Manifest::path_for(&target),
                target,
            });
        }

        let mechanism = self.platform.capability_for(&target, &source);
        tracing::info!("Applying overlay {} onto {} ({})", source, target, mechanism);

        let manifest = match mechanism {
            Mechanism::NativeMount => self.apply_native(&target, &source)?,
            Mechanism::CopyFallback => self.apply_copy(&target, &source)?,
        };

        self.emit_progress(OverlayStage::Complete, None, 0, 0);
        tracing::info!(
            "Overlay active on {} ({}, {} files overlaid)",
            target,
            manifest.mechanism,
            manifest.files_overlaid()
        );
        Ok(manifest)
    }

    fn apply_native(&self, target: &Utf8Path, source: &Utf8Path) -> Result<Manifest> {
        let handle = self.platform.describe_mount(target, source)?;

        // Written in its final form: the target may be read-only once mounted.
        let mut manifest = Manifest::new(target, source, Mechanism::NativeMount);
        manifest.state = ManifestState::Active;
        manifest.mount = Some(handle.clone());
        manifest.create_exclusive()?;

        self.emit_progress(OverlayStage::Mounting, None, 0, 0);
        match self.platform.mount(target, source) {
            Ok(mounted) => {
                if mounted != handle {
                    tracing::warn!("Mounted overlay differs from the recorded handle: {:?}", mounted);
                }
                Ok(manifest)
            }
            Err(e) => {
                tracing::error!("Mount failed: {}", e);
                if let Err(cleanup) = Manifest::remove(target) {
                    tracing::error!("Could not remove manifest after failed mount: {}", cleanup);
                }
                Err(e.into())
            }
        }
    }

    fn apply_copy(&self, target: &Utf8Path, source: &Utf8Path) -> Result<Manifest> {
        let manifest = Manifest::new(target, source, Mechanism::CopyFallback);
        manifest.create_exclusive()?;

        self.emit_progress(OverlayStage::Classifying, None, 0, 0);
        let plan = match classify(target, source) {
            Ok(plan) => plan,
            Err(e) => {
                Manifest::remove(target)?;
                return Err(e);
            }
        };

        let total = plan.overlay_entries().count() as u32;
        let mut session = OverlaySession::new(manifest, self.fs.as_ref());

        for (index, (rel, entry)) in plan.overlay_entries().enumerate() {
            self.emit_progress(
                OverlayStage::Placing,
                Some(rel),
                index as u32 + 1,
                total,
            );

            let src = source.join(rel);
            let step = match (entry.kind, entry.shadows_base) {
                (EntryKind::Dir, _) => session.add_dir(rel, &src),
                (EntryKind::File, false) => session.add_file(rel, &src),
                (EntryKind::File, true) => session.replace_file(rel, &src),
            };
            if let Err(err) = step {
                tracing::error!("Failed to place {}: {}", rel, err);
                return Err(self.rollback(session, rel.to_path_buf(), err));
            }
            tracing::debug!("Placed {} ({})", rel, entry.kind);
        }

        if let Err(err) = session.finish() {
            let path = Utf8PathBuf::from(MANIFEST_FILE_NAME);
            return Err(self.rollback(session, path, err));
        }
        Ok(session.into_manifest())
    }

    fn rollback(
        &self,
        session: OverlaySession<'_>,
        path: Utf8PathBuf,
        source: std::io::Error,
    ) -> Error {
        tracing::info!("Rolling back {} recorded changes", session.manifest().entries.len());
        let rollback = match session.revert_all(|_| {}) {
            Ok(_) => None,
            Err(partial) => {
                tracing::error!("Rollback incomplete: {}", partial);
                Some(Box::new(partial))
            }
        };
        Error::OverlayApply {
            path,
            source,
            rollback,
        }
    }

    /// Revert whatever overlay is active on `target`.
    ///
    /// A target without a manifest is left alone and reported with
    /// `mechanism: None`.
    pub fn revert(&self, target: &Utf8Path) -> Result<RevertReport> {
        let target = resolve_target(target)?;
        match Manifest::load(&target)? {
            Some(manifest) => self.revert_manifest(manifest),
            None => {
                tracing::info!("No active overlay on {}", target);
                Ok(RevertReport {
                    mechanism: None,
                    paths_reverted: 0,
                })
            }
        }
    }

    /// Revert the session described by `manifest`.
    pub fn revert_manifest(&self, manifest: Manifest) -> Result<RevertReport> {
        let mechanism = manifest.mechanism;
        tracing::info!("Reverting overlay on {} ({})", manifest.target, mechanism);

        let paths_reverted = match mechanism {
            Mechanism::NativeMount => {
                self.revert_native(&manifest)?;
                0
            }
            Mechanism::CopyFallback => self.revert_copy(manifest)?,
        };

        self.emit_progress(OverlayStage::Complete, None, 0, 0);
        Ok(RevertReport {
            mechanism: Some(mechanism),
            paths_reverted,
        })
    }

    fn revert_native(&self, manifest: &Manifest) -> Result<()> {
        let handle = match &manifest.mount {
            Some(handle) => handle.clone(),
            None => {
                tracing::warn!("Manifest has no mount handle; unmounting {}", manifest.target);
                MountHandle {
                    mount_point: manifest.target.clone(),
                    lower_dirs: Vec::new(),
                    upper_dir: None,
                    work_dir: None,
                }
            }
        };

        self.emit_progress(OverlayStage::Reverting, Some(&handle.mount_point), 1, 1);
        match self.platform.unmount(&handle) {
            Ok(()) => {}
            Err(UnmountError::NotMounted { mount_point }) => {
                tracing::info!("{} is no longer mounted; treating as reverted", mount_point);
            }
            Err(e) => return Err(e.into()),
        }
        Manifest::remove(&manifest.target)
    }

    fn revert_copy(&self, manifest: Manifest) -> Result<usize> {
        let total = manifest.entries.len() as u32;
        let mut current = 0;
        let session = OverlaySession::new(manifest, self.fs.as_ref());
        let reverted = session.revert_all(|path| {
            current += 1;
            self.emit_progress(OverlayStage::Reverting, Some(path), current, total);
        })?;
        Ok(reverted)
    }

    fn emit_progress(
        &self,
        stage: OverlayStage,
        current_path: Option<&Utf8Path>,
        current: u32,
        total: u32,
    ) {
        if let Some(callback) = &self.progress_callback {
            callback(OverlayProgress {
                stage,
                current_path: current_path.map(Utf8Path::to_path_buf),
                current,
                total,
            });
        }
    }
}

fn canonical(path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
    let canonical = path.as_std_path().canonicalize()?;
    Utf8PathBuf::from_path_buf(canonical).map_err(|p| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not valid UTF-8", p.display()),
        )
    })
}

fn invalid_target(target: &Utf8Path, reason: impl ToString) -> Error {
    Error::InvalidTarget {
        path: target.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Canonical form of an existing target directory.
fn resolve_target(target: &Utf8Path) -> Result<Utf8PathBuf> {
    let resolved = canonical(target).map_err(|e| invalid_target(target, e))?;
    if !resolved.is_dir() {
        return Err(invalid_target(target, "not a directory"));
    }
    Ok(resolved)
}

/// Like [`resolve_target`], additionally requiring the directory to be writable.
fn validate_target(target: &Utf8Path) -> Result<Utf8PathBuf> {
    let resolved = resolve_target(target)?;
    let metadata = std::fs::metadata(&resolved).map_err(|e| invalid_target(target, e))?;
    if metadata.permissions().readonly() {
        return Err(invalid_target(target, "directory is read-only"));
    }
    Ok(resolved)
}

fn validate_source(target: &Utf8Path, source: &Utf8Path) -> Result<Utf8PathBuf> {
    let invalid = |reason: &str| Error::InvalidSource {
        path: source.to_path_buf(),
        reason: reason.to_string(),
    };

    let resolved = canonical(source).map_err(|e| invalid(&e.to_string()))?;
    if !resolved.is_dir() {
        return Err(invalid("not a directory"));
    }
    if resolved.starts_with(target) || target.starts_with(&resolved) {
        return Err(invalid("overlay source and target must not contain each other"));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CopyFallbackPlatform;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn dir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_progress_stages() {
        let (_t, target) = dir();
        let (_s, source) = dir();
        fs::write(source.join("a.txt"), b"a").unwrap();
        fs::create_dir(source.join("sub")).unwrap();
        fs::write(source.join("sub/b.txt"), b"b").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let engine = OverlayEngine::new(Box::new(CopyFallbackPlatform))
            .with_progress(move |p| sink.lock().unwrap().push((p.stage, p.current, p.total)));

        engine.apply(&target, &source).unwrap();
        let stages = seen.lock().unwrap().clone();
        assert_eq!(
            stages,
            vec![
                (OverlayStage::Classifying, 0, 0),
                (OverlayStage::Placing, 1, 3),
                (OverlayStage::Placing, 2, 3),
                (OverlayStage::Placing, 3, 3),
                (OverlayStage::Complete, 0, 0),
            ]
        );
    }

    #[test]
    fn test_missing_target_is_invalid() {
        let (_s, source) = dir();
        let engine = OverlayEngine::new(Box::new(CopyFallbackPlatform));
        let result = engine.apply(Utf8Path::new("/definitely/not/here"), &source);
        assert!(matches!(result, Err(Error::InvalidTarget { .. })));
    }

    #[test]
    fn test_nested_source_is_invalid() {
        let (_t, target) = dir();
        fs::create_dir(target.join("mods")).unwrap();
        let engine = OverlayEngine::new(Box::new(CopyFallbackPlatform));

        let result = engine.apply(&target, &target.join("mods"));
        assert!(matches!(result, Err(Error::InvalidSource { .. })));
        assert!(!Manifest::path_for(&target).exists());
    }

    #[test]
    fn test_status() {
        let (_t, target) = dir();
        let (_s, source) = dir();
        fs::write(source.join("a.txt"), b"a").unwrap();
        let engine = OverlayEngine::new(Box::new(CopyFallbackPlatform));

        assert!(engine.status(&target).unwrap().is_none());
        engine.apply(&target, &source).unwrap();

        let manifest = engine.status(&target).unwrap().unwrap();
        assert_eq!(manifest.state, ManifestState::Active);
        assert_eq!(manifest.source, source);
        assert_eq!(manifest.files_overlaid(), 1);
    }
}
