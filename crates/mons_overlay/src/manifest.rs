//! Manifest persistence.
//!
//! A [`Manifest`] records everything an apply changed inside a target root so
//! that a later revert (possibly from a different process) can undo it. It is
//! stored as `.mons-overlay.json` directly inside the target root; its mere
//! presence means "an overlay session is active on this target".
//!
//! # JSON format
//!
//! ```json
//! {
//!   "version": 1,
//!   "mechanism": "copyFallback",
//!   "target": "/games/Celeste",
//!   "source": "/home/me/.local/share/mons/overlay/Celeste",
//!   "state": "active",
//!   "createdAt": "2026-10-17T12:00:00Z",
//!   "entries": [
//!     { "path": "Mods", "kind": "dir", "action": "added" },
//!     { "path": "Celeste.exe", "kind": "file", "action": "replaced",
//!       "backup": ".mons-overlay-backup/000002", "overlayXxh3": 1311768467294899695 }
//!   ]
//! }
//! ```
//!
//! The `version` field is checked before anything else is interpreted. A
//! document with any other version fails closed with
//! [`Error::UnsupportedManifestVersion`].
//!
//! # Journal
//!
//! While an apply is running, entries are not written into the document
//! itself. [`Manifest::append_entry`] appends one JSON line per entry to
//! `.mons-overlay.json.journal` next to it, so recording an entry costs the
//! size of that entry rather than the whole document. [`Manifest::load`]
//! replays the journal on top of the document; [`Manifest::save`] folds it
//! back in and deletes it. Each line carries the index of its entry, so a line
//! that was already folded in is skipped and a torn last line (from a crash
//! mid-write) is ignored: its mutation never started.

use crate::classify::EntryKind;
use crate::error::{Error, Result};
use crate::platform::MountHandle;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::Write;

/// File name of the manifest inside the target root.
pub const MANIFEST_FILE_NAME: &str = ".mons-overlay.json";

/// Directory inside the target root holding moved-aside base files.
pub const BACKUP_DIR_NAME: &str = ".mons-overlay-backup";

/// Suffix appended to the manifest path to name its entry journal.
pub const JOURNAL_SUFFIX: &str = ".journal";

/// Current manifest schema version.
pub const MANIFEST_VERSION: u64 = 1;

/// Whether a top-level name inside a target root belongs to the engine.
pub fn is_reserved_name(name: &str) -> bool {
    name == MANIFEST_FILE_NAME
        || name == BACKUP_DIR_NAME
        || name.starts_with(&format!("{MANIFEST_FILE_NAME}."))
}

/// How an overlay was realized on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mechanism {
    /// An OS-level overlay mount over the target root.
    NativeMount,
    /// Files copied into the target root and tracked for revert.
    CopyFallback,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::NativeMount => f.write_str("native mount"),
            Mechanism::CopyFallback => f.write_str("copy fallback"),
        }
    }
}

/// Lifecycle of a session as recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ManifestState {
    /// Apply started but did not finish. Revert still works.
    Applying,
    /// Apply completed.
    Active,
}

/// What apply did to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryAction {
    /// The path did not exist before apply.
    Added,
    /// A base file was moved to `backup` and the overlay file put in its place.
    Replaced,
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Path relative to the target root.
    pub path: Utf8PathBuf,
    pub kind: EntryKind,
    pub action: EntryAction,
    /// Backup location relative to the target root (`Replaced` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<Utf8PathBuf>,
    /// xxh3 digest of the overlay file placed at `path` (regular files only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_xxh3: Option<u64>,
}

/// One line of the entry journal.
#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    index: usize,
    entry: ManifestEntry,
}

/// Persisted record of an overlay session on one target root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u64,
    pub mechanism: Mechanism,
    pub target: Utf8PathBuf,
    pub source: Utf8PathBuf,
    pub state: ManifestState,
    pub created_at: DateTime<Utc>,
    /// Handle needed to unmount (`NativeMount` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountHandle>,
    /// Mutations in the order they were applied (`CopyFallback` only).
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Create a fresh manifest in the `Applying` state.
    pub fn new(target: &Utf8Path, source: &Utf8Path, mechanism: Mechanism) -> Self {
        Self {
            version: MANIFEST_VERSION,
            mechanism,
            target: target.to_path_buf(),
            source: source.to_path_buf(),
            state: ManifestState::Applying,
            created_at: Utc::now(),
            mount: None,
            entries: Vec::new(),
        }
    }

    /// Location of the manifest for a target root.
    pub fn path_for(target: &Utf8Path) -> Utf8PathBuf {
        target.join(MANIFEST_FILE_NAME)
    }

    /// Location of the backup directory for a target root.
    pub fn backup_dir_for(target: &Utf8Path) -> Utf8PathBuf {
        target.join(BACKUP_DIR_NAME)
    }

    /// Location of the entry journal for a target root.
    pub fn journal_path_for(target: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}{JOURNAL_SUFFIX}", Self::path_for(target)))
    }

    pub fn path(&self) -> Utf8PathBuf {
        Self::path_for(&self.target)
    }

    /// Number of files the overlay placed into the target.
    pub fn files_overlaid(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }

    /// Load the manifest of a target root.
    ///
    /// Returns `Ok(None)` if no manifest exists (no active session).
    /// Returns `Err` if the file cannot be read, is not valid JSON, or carries
    /// a schema version this build does not understand.
    pub fn load(target: &Utf8Path) -> Result<Option<Self>> {
        let path = Self::path_for(target);
        let contents = match std::fs::read_to_string(path.as_std_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::manifest_io(&path, e)),
        };

        let document: serde_json::Value =
            serde_json::from_str(&contents).map_err(|source| Error::ManifestFormat {
                path: path.clone(),
                source,
            })?;

        match document.get("version").and_then(|v| v.as_u64()) {
            Some(MANIFEST_VERSION) => {}
            other => {
                return Err(Error::UnsupportedManifestVersion {
                    path,
                    version: other
                        .map(|v| v.to_string())
                        .or_else(|| document.get("version").map(|v| v.to_string()))
                        .unwrap_or_else(|| "(missing)".to_string()),
                });
            }
        }

        let mut manifest: Manifest =
            serde_json::from_value(document).map_err(|source| Error::ManifestFormat {
                path: path.clone(),
                source,
            })?;
        manifest.replay_journal(target)?;
        Ok(Some(manifest))
    }

    fn replay_journal(&mut self, target: &Utf8Path) -> Result<()> {
        let path = Self::journal_path_for(target);
        let contents = match std::fs::read_to_string(path.as_std_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::manifest_io(&path, e)),
        };

        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(record) = serde_json::from_str::<JournalRecord>(line) else {
                tracing::warn!("Ignoring torn record at the end of {}", path);
                break;
            };
            match record.index.cmp(&self.entries.len()) {
                Ordering::Less => continue,
                Ordering::Equal => self.entries.push(record.entry),
                Ordering::Greater => {
                    return Err(Error::manifest_io(
                        &path,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "journal jumps from entry {} to entry {}",
                                self.entries.len(),
                                record.index
                            ),
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Durably record `entry` in the journal, then add it to `entries`.
    pub fn append_entry(&mut self, entry: ManifestEntry) -> Result<()> {
        let path = Self::journal_path_for(&self.target);
        let record = JournalRecord {
            index: self.entries.len(),
            entry,
        };
        let mut line = serde_json::to_vec(&record).map_err(|source| Error::ManifestFormat {
            path: path.clone(),
            source,
        })?;
        line.push(b'\n');

        let append = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_std_path())?;
            file.write_all(&line)?;
            file.sync_data()
        };
        append().map_err(|e| Error::manifest_io(&path, e))?;

        self.entries.push(record.entry);
        Ok(())
    }

    /// Create the manifest file, failing if one already exists.
    ///
    /// This is the cross-process lock for a target root: exactly one caller
    /// wins, everyone else gets [`Error::OverlayAlreadyActive`].
    pub fn create_exclusive(&self) -> Result<()> {
        let path = self.path();
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::OverlayAlreadyActive {
                    target: self.target.clone(),
                    manifest: path,
                });
            }
            Err(e) => return Err(Error::manifest_io(&path, e)),
        };
        // A journal without a manifest belongs to no session.
        remove_if_present(&Self::journal_path_for(&self.target))?;

        let written = self
            .to_bytes()
            .and_then(|bytes| {
                file.write_all(&bytes)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| Error::manifest_io(&path, e))
            });
        if let Err(e) = written {
            drop(file);
            let _ = std::fs::remove_file(path.as_std_path());
            return Err(e);
        }
        Ok(())
    }

    /// Persist the manifest, replacing the previous version atomically, and
    /// drop the journal it now contains.
    pub fn save(&self) -> Result<()> {
        let path = self.path();
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        let bytes = self.to_bytes()?;

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(tmp_path.as_std_path())?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(tmp_path.as_std_path(), path.as_std_path())
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(tmp_path.as_std_path());
            Error::manifest_io(&path, e)
        })?;
        remove_if_present(&Self::journal_path_for(&self.target))
    }

    /// Delete the manifest of a target root and its journal. A missing
    /// manifest is not an error.
    pub fn remove(target: &Utf8Path) -> Result<()> {
        remove_if_present(&Self::journal_path_for(target))?;
        remove_if_present(&Self::path_for(target))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|source| Error::ManifestFormat {
            path: self.path(),
            source,
        })
    }
}

fn remove_if_present(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::manifest_io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn sample(target: &Utf8Path) -> Manifest {
        let mut manifest = Manifest::new(target, Utf8Path::new("/mods/x"), Mechanism::CopyFallback);
        manifest.entries.push(ManifestEntry {
            path: Utf8PathBuf::from("Mods"),
            kind: EntryKind::Dir,
            action: EntryAction::Added,
            backup: None,
            overlay_xxh3: None,
        });
        manifest.entries.push(ManifestEntry {
            path: Utf8PathBuf::from("Celeste.exe"),
            kind: EntryKind::File,
            action: EntryAction::Replaced,
            backup: Some(Utf8PathBuf::from(".mons-overlay-backup/000002")),
            overlay_xxh3: Some(42),
        });
        manifest
    }

    #[test]
    fn test_load_missing() {
        let (_dir, t) = target();
        assert!(Manifest::load(&t).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, t) = target();
        let mut manifest = sample(&t);
        manifest.state = ManifestState::Active;
        manifest.save().unwrap();

        let loaded = Manifest::load(&t).unwrap().unwrap();
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.mechanism, Mechanism::CopyFallback);
        assert_eq!(loaded.state, ManifestState::Active);
        assert_eq!(loaded.entries, manifest.entries);
        assert_eq!(loaded.files_overlaid(), 1);
        assert!(!t.join(format!("{MANIFEST_FILE_NAME}.tmp")).exists());
    }

    #[test]
    fn test_create_exclusive_twice() {
        let (_dir, t) = target();
        let manifest = sample(&t);
        manifest.create_exclusive().unwrap();

        match manifest.create_exclusive() {
            Err(Error::OverlayAlreadyActive { target, manifest }) => {
                assert_eq!(target, t);
                assert_eq!(manifest, t.join(MANIFEST_FILE_NAME));
            }
            other => panic!("expected OverlayAlreadyActive, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let (_dir, t) = target();
        std::fs::write(
            t.join(MANIFEST_FILE_NAME),
            r#"{ "version": 7, "mechanism": "teleport" }"#,
        )
        .unwrap();

        match Manifest::load(&t) {
            Err(Error::UnsupportedManifestVersion { version, .. }) => assert_eq!(version, "7"),
            other => panic!("expected UnsupportedManifestVersion, got {other:?}"),
        }
        assert!(t.join(MANIFEST_FILE_NAME).exists());
    }

    #[test]
    fn test_missing_version_fails_closed() {
        let (_dir, t) = target();
        std::fs::write(t.join(MANIFEST_FILE_NAME), r#"{ "entries": [] }"#).unwrap();

        match Manifest::load(&t) {
            Err(Error::UnsupportedManifestVersion { version, .. }) => {
                assert_eq!(version, "(missing)")
            }
            other => panic!("expected UnsupportedManifestVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json() {
        let (_dir, t) = target();
        std::fs::write(t.join(MANIFEST_FILE_NAME), "{ not json").unwrap();
        assert!(matches!(
            Manifest::load(&t),
            Err(Error::ManifestFormat { .. })
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, t) = target();
        sample(&t).save().unwrap();
        Manifest::remove(&t).unwrap();
        Manifest::remove(&t).unwrap();
        assert!(!Manifest::path_for(&t).exists());
    }

    #[test]
    fn test_serialization_format() {
        let (_dir, t) = target();
        let json = String::from_utf8(sample(&t).to_bytes().unwrap()).unwrap();

        assert!(json.contains("\"version\": 1"));
        assert!(json.contains("\"mechanism\": \"copyFallback\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"action\": \"replaced\""));
        assert!(json.contains("\"kind\": \"dir\""));
        assert!(!json.contains("\"mount\""));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name(MANIFEST_FILE_NAME));
        assert!(is_reserved_name(BACKUP_DIR_NAME));
        assert!(is_reserved_name(".mons-overlay.json.tmp"));
        assert!(is_reserved_name(".mons-overlay.json.journal"));
        assert!(!is_reserved_name("Celeste.exe"));
    }

    fn journaled(t: &Utf8Path) -> Manifest {
        let full = sample(t);
        let mut manifest = Manifest::new(t, Utf8Path::new("/mods/x"), Mechanism::CopyFallback);
        manifest.create_exclusive().unwrap();
        for entry in full.entries {
            manifest.append_entry(entry).unwrap();
        }
        manifest
    }

    #[test]
    fn test_appended_entries_survive_load() {
        let (_dir, t) = target();
        let manifest = journaled(&t);

        assert!(Manifest::journal_path_for(&t).exists());
        let loaded = Manifest::load(&t).unwrap().unwrap();
        assert_eq!(loaded.entries, manifest.entries);
        assert_eq!(loaded.entries[1].overlay_xxh3, Some(42));
    }

    #[test]
    fn test_append_writes_one_line_per_entry() {
        let (_dir, t) = target();
        journaled(&t);
        let document = std::fs::read_to_string(Manifest::path_for(&t)).unwrap();
        let journal = std::fs::read_to_string(Manifest::journal_path_for(&t)).unwrap();
        assert!(!document.contains("Celeste.exe"));
        assert_eq!(journal.lines().count(), 2);
    }

    #[test]
    fn test_save_folds_journal() {
        let (_dir, t) = target();
        let mut manifest = journaled(&t);
        manifest.state = ManifestState::Active;
        manifest.save().unwrap();

        assert!(!Manifest::journal_path_for(&t).exists());
        let loaded = Manifest::load(&t).unwrap().unwrap();
        assert_eq!(loaded.entries, manifest.entries);
    }

    #[test]
    fn test_journal_lines_already_folded_are_skipped() {
        let (_dir, t) = target();
        let manifest = journaled(&t);
        let journal = std::fs::read(Manifest::journal_path_for(&t)).unwrap();

        // Crash after the document was rewritten but before the journal went away.
        manifest.save().unwrap();
        std::fs::write(Manifest::journal_path_for(&t), journal).unwrap();

        let loaded = Manifest::load(&t).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 2);
    }

    #[test]
    fn test_torn_journal_line_is_ignored() {
        let (_dir, t) = target();
        journaled(&t);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(Manifest::journal_path_for(&t))
            .unwrap();
        file.write_all(br#"{"index":2,"entry":{"path":"Con"#).unwrap();

        let loaded = Manifest::load(&t).unwrap().unwrap();
        assert_eq!(loaded.entries.len(), 2);
    }

    #[test]
    fn test_journal_gap_is_an_error() {
        let (_dir, t) = target();
        let manifest = Manifest::new(&t, Utf8Path::new("/mods/x"), Mechanism::CopyFallback);
        manifest.create_exclusive().unwrap();
        std::fs::write(
            Manifest::journal_path_for(&t),
            r#"{"index":3,"entry":{"path":"a","kind":"file","action":"added"}}"#,
        )
        .unwrap();

        assert!(matches!(Manifest::load(&t), Err(Error::ManifestIo { .. })));
    }

    #[test]
    fn test_remove_deletes_journal() {
        let (_dir, t) = target();
        journaled(&t);
        Manifest::remove(&t).unwrap();
        assert!(!Manifest::journal_path_for(&t).exists());
        assert!(!Manifest::path_for(&t).exists());
    }
}
