//! Bookkeeping for one copy-fallback apply or revert.
//!
//! An [`OverlaySession`] owns the manifest of the target it works on. During
//! apply every mutation is appended to the manifest and persisted *before* it
//! is performed, so after a crash the manifest never misses a change that
//! happened on disk. It may list a change that never happened; the undo
//! actions are written to cope with that:
//!
//! | entry              | undo                                                  |
//! |--------------------|-------------------------------------------------------|
//! | added file         | remove the path if it exists                          |
//! | added directory    | remove the (empty) directory if it exists             |
//! | replaced file      | if the backup exists, remove the path and move it back |
//!
//! Because each undo only acts on what is actually present, running it twice
//! is harmless. That is what makes revert resumable.
//!
//! Entry number `n` owns two names inside the backup directory: `n` (zero
//! padded to six digits) for the base file it moved aside and `n.part` for
//! staging the overlay file. Nothing outside the backup directory is ever
//! created or removed except the recorded paths themselves.
//!
//! A replaced file whose backup is gone is only a no-op when the path does
//! not hold the recorded overlay file: either the move never happened or an
//! earlier revert already put the base file back. Otherwise the base file is
//! lost and the undo fails, naming the path.

use crate::classify::EntryKind;
use crate::error::PartialRevertError;
use crate::fs_ops::{exists_no_follow, file_digest, FileOps};
use crate::manifest::{
    EntryAction, Manifest, ManifestEntry, ManifestState, BACKUP_DIR_NAME,
    MANIFEST_FILE_NAME,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::io;

pub(crate) struct OverlaySession<'a> {
    manifest: Manifest,
    fs: &'a dyn FileOps,
}

impl<'a> OverlaySession<'a> {
    /// Wrap a manifest that is already on disk.
    pub fn new(manifest: Manifest, fs: &'a dyn FileOps) -> Self {
        Self { manifest, fs }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    /// Create directory `rel` in the target, with the permissions of the
    /// overlay directory `src`.
    pub fn add_dir(&mut self, rel: &Utf8Path, src: &Utf8Path) -> io::Result<()> {
        self.record(ManifestEntry {
            path: rel.to_path_buf(),
            kind: EntryKind::Dir,
            action: EntryAction::Added,
            backup: None,
            overlay_xxh3: None,
        })?;
        self.fs.create_dir(&self.abs(rel), src)
    }

    /// Place overlay file `src` at `rel`, where the target has nothing.
    pub fn add_file(&mut self, rel: &Utf8Path, src: &Utf8Path) -> io::Result<()> {
        let slot = self.next_slot();
        let overlay_xxh3 = file_digest(src)?;
        std::fs::create_dir_all(Manifest::backup_dir_for(&self.manifest.target))?;

        self.record(ManifestEntry {
            path: rel.to_path_buf(),
            kind: EntryKind::File,
            action: EntryAction::Added,
            backup: None,
            overlay_xxh3,
        })?;
        let staging = staging_path(&self.manifest.target, slot);
        self.fs.place_file(src, &self.abs(rel), &staging)
    }

    /// Move the base file at `rel` aside and place overlay file `src` there.
    pub fn replace_file(&mut self, rel: &Utf8Path, src: &Utf8Path) -> io::Result<()> {
        let slot = self.next_slot();
        let backup = backup_name(slot);
        let backup_abs = self.abs(&backup);
        let dst = self.abs(rel);

        // Checked before recording: an entry pointing at a foreign file would
        // make the undo move that file over the base.
        if exists_no_follow(&backup_abs)? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("backup location {backup_abs} is already occupied"),
            ));
        }

        // Losing the backup of a byte-identical base file loses nothing.
        let overlay_xxh3 = match file_digest(src)? {
            Some(digest) if file_digest(&dst)? == Some(digest) => None,
            digest => digest,
        };
        std::fs::create_dir_all(Manifest::backup_dir_for(&self.manifest.target))?;

        self.record(ManifestEntry {
            path: rel.to_path_buf(),
            kind: EntryKind::File,
            action: EntryAction::Replaced,
            backup: Some(backup),
            overlay_xxh3,
        })?;

        self.fs.move_file(&dst, &backup_abs)?;
        let staging = staging_path(&self.manifest.target, slot);
        self.fs.place_file(src, &dst, &staging)
    }

    /// Mark the apply as complete.
    pub fn finish(&mut self) -> io::Result<()> {
        self.manifest.state = ManifestState::Active;
        self.manifest.save().map_err(io::Error::other)
    }

    /// Undo every recorded entry, newest first, then delete the backup
    /// directory (if empty) and the manifest.
    ///
    /// `on_entry` is called with each relative path before it is undone.
    /// Returns the number of entries undone. On failure the manifest is
    /// rewritten to hold only the entries that still need undoing.
    pub fn revert_all(
        mut self,
        mut on_entry: impl FnMut(&Utf8Path),
    ) -> Result<usize, PartialRevertError> {
        let target = self.manifest.target.clone();
        let mut reverted = 0;

        while let Some(entry) = self.manifest.entries.last() {
            let slot = self.manifest.entries.len();
            on_entry(&entry.path);
            if let Err(source) = undo(self.fs, &target, slot, entry) {
                let failed = entry.path.clone();
                let remaining: Vec<Utf8PathBuf> = self.manifest.entries
                    [..self.manifest.entries.len() - 1]
                    .iter()
                    .rev()
                    .map(|e| e.path.clone())
                    .collect();

                tracing::error!("Failed to revert {}: {}", failed, source);
                if let Err(e) = self.manifest.save() {
                    tracing::error!("Could not persist remaining revert work: {}", e);
                }
                return Err(PartialRevertError {
                    target,
                    failed,
                    source,
                    remaining,
                });
            }

            tracing::debug!("Reverted {}", entry.path);
            self.manifest.entries.pop();
            reverted += 1;
        }

        remove_backup_dir(&target);
        if let Err(e) = Manifest::remove(&target) {
            tracing::error!("Could not remove manifest: {}", e);
            return Err(PartialRevertError {
                target,
                failed: Utf8PathBuf::from(MANIFEST_FILE_NAME),
                source: io::Error::other(e),
                remaining: Vec::new(),
            });
        }
        Ok(reverted)
    }

    fn record(&mut self, entry: ManifestEntry) -> io::Result<()> {
        self.manifest
            .append_entry(entry)
            .map_err(io::Error::other)
    }

    /// Number of the entry recorded next (1-based).
    fn next_slot(&self) -> usize {
        self.manifest.entries.len() + 1
    }

    fn abs(&self, rel: &Utf8Path) -> Utf8PathBuf {
        self.manifest.target.join(rel)
    }
}

fn backup_name(slot: usize) -> Utf8PathBuf {
    Utf8Path::new(BACKUP_DIR_NAME).join(format!("{slot:06}"))
}

fn staging_path(target: &Utf8Path, slot: usize) -> Utf8PathBuf {
    Manifest::backup_dir_for(target).join(format!("{slot:06}.part"))
}

fn undo(
    fs: &dyn FileOps,
    target: &Utf8Path,
    slot: usize,
    entry: &ManifestEntry,
) -> io::Result<()> {
    let path = target.join(&entry.path);

    match (entry.action, entry.kind) {
        (EntryAction::Added, EntryKind::Dir) => {
            if exists_no_follow(&path)? {
                fs.remove_dir(&path)?;
            }
        }
        (EntryAction::Added, EntryKind::File) => {
            remove_file_if_present(fs, &staging_path(target, slot))?;
            remove_file_if_present(fs, &path)?;
        }
        (EntryAction::Replaced, _) => {
            remove_file_if_present(fs, &staging_path(target, slot))?;
            let Some(backup) = &entry.backup else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("replaced entry '{}' has no backup location", entry.path),
                ));
            };
            let backup = target.join(backup);
            if exists_no_follow(&backup)? {
                remove_file_if_present(fs, &path)?;
                fs.move_file(&backup, &path)?;
            } else if base_lost(&path, entry)? {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("backup {backup} of '{}' is missing", entry.path),
                ));
            }
        }
    }
    Ok(())
}

/// Whether a replaced path whose backup is gone no longer holds its base file.
fn base_lost(path: &Utf8Path, entry: &ManifestEntry) -> io::Result<bool> {
    if !exists_no_follow(path)? {
        return Ok(true);
    }
    match entry.overlay_xxh3 {
        Some(overlay) => Ok(file_digest(path)? == Some(overlay)),
        None => Ok(false),
    }
}

fn remove_file_if_present(fs: &dyn FileOps, path: &Utf8Path) -> io::Result<()> {
    if exists_no_follow(path)? {
        fs.remove_file(path)?;
    }
    Ok(())
}

fn remove_backup_dir(target: &Utf8Path) {
    let dir = Manifest::backup_dir_for(target);
    match std::fs::remove_dir(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Leaving backup directory {} in place: {}", dir, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::StdFileOps;
    use crate::manifest::Mechanism;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dirs: (TempDir, TempDir),
        target: Utf8PathBuf,
        source: Utf8PathBuf,
    }

    fn fixture() -> Fixture {
        let t = TempDir::new().unwrap();
        let s = TempDir::new().unwrap();
        let target = Utf8PathBuf::from_path_buf(t.path().to_path_buf()).unwrap();
        let source = Utf8PathBuf::from_path_buf(s.path().to_path_buf()).unwrap();
        Fixture {
            _dirs: (t, s),
            target,
            source,
        }
    }

    fn begin(f: &Fixture) -> Manifest {
        let manifest = Manifest::new(&f.target, &f.source, Mechanism::CopyFallback);
        manifest.create_exclusive().unwrap();
        manifest
    }

    #[test]
    fn test_entries_are_persisted_before_mutation() {
        let f = fixture();
        fs::write(f.source.join("new.txt"), b"n").unwrap();
        let mut session = OverlaySession::new(begin(&f), &StdFileOps);

        session
            .add_file(Utf8Path::new("new.txt"), &f.source.join("new.txt"))
            .unwrap();

        let on_disk = Manifest::load(&f.target).unwrap().unwrap();
        assert_eq!(on_disk.entries.len(), 1);
        assert_eq!(on_disk.state, ManifestState::Applying);
    }

    #[test]
    fn test_replace_and_revert() {
        let f = fixture();
        fs::write(f.target.join("game.exe"), b"base").unwrap();
        fs::write(f.source.join("game.exe"), b"modded").unwrap();
        let mut session = OverlaySession::new(begin(&f), &StdFileOps);

        session
            .replace_file(Utf8Path::new("game.exe"), &f.source.join("game.exe"))
            .unwrap();
        assert_eq!(fs::read(f.target.join("game.exe")).unwrap(), b"modded");
        assert_eq!(
            fs::read(f.target.join(BACKUP_DIR_NAME).join("000001")).unwrap(),
            b"base"
        );

        assert_eq!(session.revert_all(|_| {}).unwrap(), 1);
        assert_eq!(fs::read(f.target.join("game.exe")).unwrap(), b"base");
        assert!(!f.target.join(BACKUP_DIR_NAME).exists());
        assert!(!Manifest::path_for(&f.target).exists());
    }

    #[test]
    fn test_undo_of_unperformed_entries_is_noop() {
        let f = fixture();
        fs::write(f.target.join("keep.txt"), b"base").unwrap();

        // Entries recorded but never carried out, as after a crash.
        let mut manifest = begin(&f);
        manifest.entries = vec![
            ManifestEntry {
                path: Utf8PathBuf::from("Mods"),
                kind: EntryKind::Dir,
                action: EntryAction::Added,
                backup: None,
                overlay_xxh3: None,
            },
            ManifestEntry {
                path: Utf8PathBuf::from("keep.txt"),
                kind: EntryKind::File,
                action: EntryAction::Replaced,
                backup: Some(Utf8PathBuf::from(".mons-overlay-backup/000002")),
                overlay_xxh3: Some(7),
            },
        ];
        manifest.save().unwrap();

        let session = OverlaySession::new(manifest, &StdFileOps);
        assert_eq!(session.revert_all(|_| {}).unwrap(), 2);
        assert_eq!(fs::read(f.target.join("keep.txt")).unwrap(), b"base");
    }

    #[test]
    fn test_occupied_backup_slot_is_not_recorded() {
        let f = fixture();
        fs::write(f.target.join("game.exe"), b"base").unwrap();
        fs::write(f.source.join("game.exe"), b"modded").unwrap();
        fs::create_dir(f.target.join(BACKUP_DIR_NAME)).unwrap();
        fs::write(f.target.join(BACKUP_DIR_NAME).join("000001"), b"foreign").unwrap();

        let mut session = OverlaySession::new(begin(&f), &StdFileOps);
        let err = session
            .replace_file(Utf8Path::new("game.exe"), &f.source.join("game.exe"))
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(session.manifest().entries.is_empty());
        assert_eq!(fs::read(f.target.join("game.exe")).unwrap(), b"base");
    }

    fn applied_replacement(f: &Fixture, base: &[u8], overlay: &[u8]) {
        fs::write(f.target.join("game.exe"), base).unwrap();
        fs::write(f.source.join("game.exe"), overlay).unwrap();
        let mut session = OverlaySession::new(begin(f), &StdFileOps);
        session
            .replace_file(Utf8Path::new("game.exe"), &f.source.join("game.exe"))
            .unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_missing_backup_under_overlay_file_is_reported() {
        let f = fixture();
        applied_replacement(&f, b"base", b"modded");
        fs::remove_file(f.target.join(BACKUP_DIR_NAME).join("000001")).unwrap();

        let manifest = Manifest::load(&f.target).unwrap().unwrap();
        let err = OverlaySession::new(manifest, &StdFileOps)
            .revert_all(|_| {})
            .unwrap_err();

        assert_eq!(err.failed, "game.exe");
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
        assert_eq!(fs::read(f.target.join("game.exe")).unwrap(), b"modded");
        assert!(Manifest::path_for(&f.target).exists());
    }

    #[test]
    fn test_missing_backup_after_restore_is_noop() {
        let f = fixture();
        applied_replacement(&f, b"base", b"modded");

        // An earlier revert put the base file back, then stopped.
        fs::remove_file(f.target.join("game.exe")).unwrap();
        fs::rename(
            f.target.join(BACKUP_DIR_NAME).join("000001"),
            f.target.join("game.exe"),
        )
        .unwrap();

        let manifest = Manifest::load(&f.target).unwrap().unwrap();
        assert_eq!(OverlaySession::new(manifest, &StdFileOps).revert_all(|_| {}).unwrap(), 1);
        assert_eq!(fs::read(f.target.join("game.exe")).unwrap(), b"base");
    }

    #[test]
    fn test_identical_replacement_records_no_digest() {
        let f = fixture();
        applied_replacement(&f, b"same", b"same");

        let manifest = Manifest::load(&f.target).unwrap().unwrap();
        assert_eq!(manifest.entries[0].overlay_xxh3, None);
    }

    #[test]
    fn test_staging_stays_inside_backup_dir() {
        let f = fixture();
        fs::write(f.source.join("data.bin"), b"overlay").unwrap();
        fs::write(f.target.join("data.bin.part"), b"user file").unwrap();
        let mut session = OverlaySession::new(begin(&f), &StdFileOps);

        session
            .add_file(Utf8Path::new("data.bin"), &f.source.join("data.bin"))
            .unwrap();
        // Left behind by a crash between staging and rename.
        fs::write(staging_path(&f.target, 1), b"partial").unwrap();

        session.revert_all(|_| {}).unwrap();
        assert_eq!(fs::read(f.target.join("data.bin.part")).unwrap(), b"user file");
        assert!(!f.target.join(BACKUP_DIR_NAME).exists());
    }
}
