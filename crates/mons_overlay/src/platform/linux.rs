//! Linux overlayfs adapter.
//!
//! Mounts with the system `mount`/`umount` programs rather than the raw
//! syscall. Root (including root inside a user namespace) mounts directly
//! with `mount -t overlay`. Anyone else can still get a native mount when
//! `/etc/fstab` carries a matching `users` entry (the one `mons fstab`
//! prints): `mount <target>` then picks the options up from fstab, and the
//! setuid `mount`/`umount` helpers do the privileged part.

use super::mount_table::{
    fstab_user_mountable, is_initial_uid_map, overlay_mounted_at, parse_mount_table,
};
use super::{MechanismPreference, MountHandle, Platform, PlatformOptions, ProbeReport};
use crate::error::{MountError, UnmountError};
use crate::manifest::Mechanism;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Command;

const PROC_FILESYSTEMS: &str = "/proc/filesystems";
const PROC_MOUNTS: &str = "/proc/mounts";
const ETC_MTAB: &str = "/etc/mtab";
const ETC_FSTAB: &str = "/etc/fstab";
const PROC_UID_MAP: &str = "/proc/self/uid_map";

/// Native overlayfs through `mount`.
#[derive(Debug, Clone)]
pub struct LinuxOverlay {
    options: PlatformOptions,
}

/// How `mount` is invoked for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountRoute {
    /// `mount -t overlay overlay -o <options> <target>`
    Direct,
    /// `mount <target>`, relying on a `users` entry in fstab.
    Fstab,
}

/// Pick the mount route, or `None` if this process cannot mount `target`.
fn route(report: &ProbeReport, user_mountable: bool) -> Option<MountRoute> {
    if !report.overlay_supported {
        None
    } else if report.privileged {
        Some(MountRoute::Direct)
    } else if user_mountable {
        Some(MountRoute::Fstab)
    } else {
        None
    }
}

impl LinuxOverlay {
    pub fn new(options: PlatformOptions) -> Self {
        Self { options }
    }

    fn degrade(&self, report: &ProbeReport) -> Mechanism {
        if self.options.mechanism == MechanismPreference::Native {
            tracing::warn!(
                "Native overlay requested but unavailable (overlay supported: {}, privileged: {}); using copy fallback",
                report.overlay_supported,
                report.privileged
            );
        } else {
            tracing::debug!("Native overlay unavailable ({:?}); using copy fallback", report);
        }
        Mechanism::CopyFallback
    }
}

impl Platform for LinuxOverlay {
    fn capability(&self) -> Mechanism {
        if self.options.mechanism == MechanismPreference::Copy {
            tracing::debug!("Copy fallback forced by configuration");
            return Mechanism::CopyFallback;
        }

        let report = probe();
        if report.native_available() {
            tracing::debug!("Native overlay available ({:?})", report);
            return Mechanism::NativeMount;
        }
        self.degrade(&report)
    }

    fn capability_for(&self, target: &Utf8Path, source: &Utf8Path) -> Mechanism {
        if self.options.mechanism == MechanismPreference::Copy {
            tracing::debug!("Copy fallback forced by configuration");
            return Mechanism::CopyFallback;
        }

        let report = probe();
        let user_mountable = match self.describe_mount(target, source) {
            Ok(handle) => listed_in_fstab(&handle),
            Err(e) => {
                tracing::debug!("No native mount for {}: {}", target, e);
                return self.degrade(&report);
            }
        };

        match route(&report, user_mountable) {
            Some(route) => {
                tracing::debug!("Native overlay available via {:?} ({:?})", route, report);
                Mechanism::NativeMount
            }
            None => self.degrade(&report),
        }
    }

    fn describe_mount(
        &self,
        target: &Utf8Path,
        source: &Utf8Path,
    ) -> Result<MountHandle, MountError> {
        MountHandle::for_target(target, source, &self.options)
    }

    fn mount(&self, target: &Utf8Path, source: &Utf8Path) -> Result<MountHandle, MountError> {
        let handle = self.describe_mount(target, source)?;

        for dir in handle.upper_dir.iter().chain(handle.work_dir.iter()) {
            std::fs::create_dir_all(dir.as_std_path()).map_err(|source| MountError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }

        let options = handle.options();
        let mut command = Command::new("mount");
        match route(&probe(), listed_in_fstab(&handle)) {
            Some(MountRoute::Fstab) => {
                tracing::info!("Mounting overlay on {} from its fstab entry", target);
            }
            _ => {
                tracing::info!("Mounting overlay on {} with options {}", target, options);
                command.args(["-t", "overlay", "overlay", "-o", &options]);
            }
        }

        let output = command
            .arg(target.as_std_path())
            .output()
            .map_err(|source| MountError::Spawn {
                target: target.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // Never leave a half-attached mount behind.
            if let Ok(true) = is_mounted(target) {
                tracing::warn!("mount reported failure but {} is mounted; detaching", target);
                if let Err(detach) = detach(target) {
                    tracing::error!("Could not detach partial mount at {}: {}", target, detach);
                    stderr = with_detach_failure(&stderr, &detach);
                }
            }
            return Err(MountError::Failed {
                target: target.to_path_buf(),
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(handle)
    }

    fn unmount(&self, handle: &MountHandle) -> Result<(), UnmountError> {
        let mount_point = &handle.mount_point;
        if !is_mounted(mount_point)? {
            return Err(UnmountError::NotMounted {
                mount_point: mount_point.clone(),
            });
        }

        tracing::info!("Unmounting overlay at {}", mount_point);
        let output = Command::new("umount")
            .arg(mount_point.as_std_path())
            .output()
            .map_err(|source| UnmountError::Spawn {
                mount_point: mount_point.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        if is_mounted(mount_point)? {
            Err(UnmountError::Busy {
                mount_point: mount_point.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        } else {
            Err(UnmountError::NotMounted {
                mount_point: mount_point.clone(),
            })
        }
    }
}

/// Cheap capability probe; reads a few `/proc` files and nothing else.
pub(super) fn probe() -> ProbeReport {
    let overlay_supported = match std::fs::read_to_string(PROC_FILESYSTEMS) {
        Ok(text) => text
            .lines()
            .any(|line| line.split_whitespace().last() == Some("overlay")),
        Err(e) => {
            tracing::debug!("Could not read {}: {}", PROC_FILESYSTEMS, e);
            false
        }
    };

    let user_namespace = match std::fs::read_to_string(PROC_UID_MAP) {
        Ok(text) => !is_initial_uid_map(&text),
        Err(e) => {
            tracing::debug!("Could not read {}: {}", PROC_UID_MAP, e);
            false
        }
    };

    ProbeReport {
        overlay_supported,
        privileged: nix::unistd::geteuid().is_root(),
        user_namespace,
    }
}

/// Whether `/etc/fstab` lets ordinary users mount exactly this overlay.
fn listed_in_fstab(handle: &MountHandle) -> bool {
    let text = match std::fs::read_to_string(ETC_FSTAB) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("Could not read {}: {}", ETC_FSTAB, e);
            return false;
        }
    };
    match fstab_user_mountable(&text, handle) {
        Ok(listed) => listed,
        Err(e) => {
            tracing::debug!("Could not parse {}: {}", ETC_FSTAB, e);
            false
        }
    }
}

/// Unmount whatever a failed `mount` left at `target`.
fn detach(target: &Utf8Path) -> Result<(), String> {
    match Command::new("umount").arg(target.as_std_path()).output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(format!(
            "umount {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => Err(format!("could not run umount: {e}")),
    }
}

fn with_detach_failure(stderr: &str, detach: &str) -> String {
    let note = format!("the partial mount is still attached ({detach})");
    if stderr.is_empty() {
        note
    } else {
        format!("{stderr}; {note}")
    }
}

/// Whether an overlay is mounted at `mount_point`.
///
/// Reads `/proc/mounts`, falling back to `/etc/mtab` (usually the same data,
/// but `/proc/mounts` is more likely to be current).
fn is_mounted(mount_point: &Utf8Path) -> Result<bool, UnmountError> {
    let table_path = if Utf8Path::new(PROC_MOUNTS).is_file() {
        PROC_MOUNTS
    } else {
        ETC_MTAB
    };
    let table_error = |source| UnmountError::MountTable {
        path: Utf8PathBuf::from(table_path),
        source,
    };

    let text = std::fs::read_to_string(table_path).map_err(table_error)?;
    let entries = parse_mount_table(&text).map_err(table_error)?;
    Ok(overlay_mounted_at(&entries, mount_point))
}
