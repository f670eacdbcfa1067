//! Platform adapter: how an overlay is realized on the current OS.
//!
//! The engine only talks to the [`Platform`] trait. Two implementations ship
//! with the crate:
//!
//! - [`CopyFallbackPlatform`] always reports [`Mechanism::CopyFallback`]. It is
//!   the portable baseline and fully functional on its own.
//! - `LinuxOverlay` (Linux only) reports [`Mechanism::NativeMount`] when a cheap
//!   probe finds kernel overlayfs support and either sufficient privilege or
//!   a matching `users` entry in `/etc/fstab` (as printed by `mons fstab`), and
//!   shells out to `mount` / `umount`.
//!
//! [`detect`] picks the implementation according to [`PlatformOptions`].

pub mod mount_table;

#[cfg(target_os = "linux")]
mod linux;

use crate::error::{MountError, UnmountError};
use crate::manifest::Mechanism;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
pub use linux::LinuxOverlay;

/// Mechanism used to realize an overlay on a target root.
pub trait Platform {
    /// Mechanism this platform will use. Never fails: a failed probe degrades
    /// to [`Mechanism::CopyFallback`].
    fn capability(&self) -> Mechanism;

    /// Mechanism an apply of `source` onto `target` will use.
    ///
    /// Defaults to [`capability`](Self::capability). Platforms that can mount
    /// some targets but not others refine it; like `capability` it must not
    /// have side effects.
    fn capability_for(&self, target: &Utf8Path, source: &Utf8Path) -> Mechanism {
        let _ = (target, source);
        self.capability()
    }

    /// Compute the handle [`mount`](Self::mount) would produce, without side effects.
    ///
    /// Lets the engine persist the manifest before the target root is covered
    /// by the mount.
    fn describe_mount(&self, target: &Utf8Path, source: &Utf8Path)
        -> Result<MountHandle, MountError>;

    /// Mount `source` over `target`.
    ///
    /// Must be side-effect free on failure: no mount may remain attached to
    /// `target` when this returns `Err`.
    fn mount(&self, target: &Utf8Path, source: &Utf8Path) -> Result<MountHandle, MountError>;

    /// Undo a mount made by [`mount`](Self::mount).
    ///
    /// Returns [`UnmountError::NotMounted`] when nothing is mounted any more.
    fn unmount(&self, handle: &MountHandle) -> Result<(), UnmountError>;
}

/// Everything needed to identify and undo a native overlay mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountHandle {
    pub mount_point: Utf8PathBuf,
    /// Lower layers, topmost first (`<source>`, `<target>`).
    pub lower_dirs: Vec<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_dir: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<Utf8PathBuf>,
}

impl MountHandle {
    /// Build the handle for mounting `source` over `target`.
    ///
    /// When both `upper_dir` and `work_dir` are configured, each target gets
    /// its own subdirectory in them (named after the target path) and the
    /// mount is writable; otherwise the mount is read-only.
    pub fn for_target(
        target: &Utf8Path,
        source: &Utf8Path,
        options: &PlatformOptions,
    ) -> Result<Self, MountError> {
        let key = slug::slugify(target.as_str());
        let (upper_dir, work_dir) = match (&options.upper_dir, &options.work_dir) {
            (Some(upper), Some(work)) => (Some(upper.join(&key)), Some(work.join(&key))),
            _ => (None, None),
        };

        let handle = Self {
            mount_point: target.to_path_buf(),
            lower_dirs: vec![source.to_path_buf(), target.to_path_buf()],
            upper_dir,
            work_dir,
        };

        for path in handle.paths() {
            if path.as_str().contains([':', ',']) {
                return Err(MountError::InvalidPath {
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(handle)
    }

    /// Overlay mount options (`index=off,lowerdir=...[,upperdir=...,workdir=...]`).
    ///
    /// `index=off` avoids failures when the same dirs are mounted again later.
    pub fn options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(":");

        let mut opts = vec!["index=off".to_string(), format!("lowerdir={lower}")];
        if let (Some(upper), Some(work)) = (&self.upper_dir, &self.work_dir) {
            opts.push(format!("upperdir={upper}"));
            opts.push(format!("workdir={work}"));
        }
        opts.join(",")
    }

    fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.lower_dirs
            .iter()
            .chain(self.upper_dir.iter())
            .chain(self.work_dir.iter())
            .map(|p| p.as_path())
    }
}

/// Which mechanism the user prefers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MechanismPreference {
    /// Native mount when the probe allows it, otherwise copy.
    #[default]
    Auto,
    /// Native mount; still degrades to copy (with a warning) if the probe fails.
    Native,
    /// Always copy.
    Copy,
}

/// Platform adapter configuration (the `[overlay]` table of the user config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOptions {
    #[serde(default)]
    pub mechanism: MechanismPreference,
    /// Parent directory for per-target upper dirs of writable native mounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_dir: Option<Utf8PathBuf>,
    /// Parent directory for per-target overlayfs work dirs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<Utf8PathBuf>,
}

/// Result of the capability probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// The kernel lists `overlay` in `/proc/filesystems`.
    pub overlay_supported: bool,
    /// Effective uid is root (possibly inside a user namespace).
    pub privileged: bool,
    /// The process runs inside a non-initial user namespace.
    pub user_namespace: bool,
}

impl ProbeReport {
    pub fn native_available(&self) -> bool {
        self.overlay_supported && self.privileged
    }
}

/// Probe the current environment without mounting anything.
pub fn probe() -> ProbeReport {
    #[cfg(target_os = "linux")]
    {
        linux::probe()
    }
    #[cfg(not(target_os = "linux"))]
    {
        ProbeReport::default()
    }
}

/// Whether this process runs inside a non-initial user namespace.
pub fn in_user_namespace() -> bool {
    probe().user_namespace
}

/// Pick the platform adapter for the given options.
///
/// On Linux this is always [`LinuxOverlay`], even when copying is forced, so
/// that overlays mounted earlier can still be unmounted.
pub fn detect(options: &PlatformOptions) -> Box<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxOverlay::new(options.clone()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        if options.mechanism == MechanismPreference::Native {
            tracing::warn!("Native overlay mounts are not available on this platform; using copy fallback");
        }
        Box::new(CopyFallbackPlatform)
    }
}

/// Platform without native overlay support.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFallbackPlatform;

impl Platform for CopyFallbackPlatform {
    fn capability(&self) -> Mechanism {
        Mechanism::CopyFallback
    }

    fn describe_mount(
        &self,
        _target: &Utf8Path,
        _source: &Utf8Path,
    ) -> Result<MountHandle, MountError> {
        Err(MountError::Unsupported)
    }

    fn mount(&self, _target: &Utf8Path, _source: &Utf8Path) -> Result<MountHandle, MountError> {
        Err(MountError::Unsupported)
    }

    fn unmount(&self, _handle: &MountHandle) -> Result<(), UnmountError> {
        Err(UnmountError::Unsupported)
    }
}
