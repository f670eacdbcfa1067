//! Merged-view computation for a target root and an overlay source.
//!
//! [`classify`] walks both trees in lockstep and decides, for every relative
//! path in their union, which tree the merged view draws it from:
//!
//! | target        | overlay       | result                         |
//! |---------------|---------------|--------------------------------|
//! | file          | file          | [`Origin::Overlay`] (shadows)  |
//! | directory     | directory     | [`Origin::MergedDir`], recurse |
//! | file          | directory     | conflict                       |
//! | directory     | file          | conflict                       |
//! | present       | absent        | [`Origin::Base`]               |
//! | absent        | present       | [`Origin::Overlay`]            |
//!
//! Directory entries are read in sorted order, so the plan and the reported
//! conflicts are identical for identical trees. Symlinks are never followed;
//! they are classified as files.
//!
//! Names that are not valid UTF-8 are skipped (with a warning) in the target
//! root, where leaving them alone is harmless. In the overlay source they fail
//! the classification with [`Error::Classify`]: skipping them would apply a
//! partial overlay.

use crate::error::{Error, Result};
use crate::manifest::is_reserved_name;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use walkdir::WalkDir;

/// Which tree the merged view draws an entry from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Only the target root has it.
    Base,
    /// The overlay source provides it, possibly shadowing a base file.
    Overlay,
    /// A directory present in both trees; its contents are unioned.
    MergedDir,
}

/// Kind of a filesystem entry as seen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    /// Regular file or symlink.
    File,
    Dir,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => f.write_str("file"),
            EntryKind::Dir => f.write_str("directory"),
        }
    }
}

/// Per-path decision in a [`MergePlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub origin: Origin,
    pub kind: EntryKind,
    /// The overlay file replaces an existing base file at the same path.
    pub shadows_base: bool,
}

/// Ordered mapping from relative path to the tree that provides it.
///
/// Parents always sort before their children, so iterating the plan yields
/// directories before anything placed inside them.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    entries: BTreeMap<Utf8PathBuf, PlanEntry>,
}

impl MergePlan {
    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&PlanEntry> {
        self.entries.get(path.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Utf8Path, &PlanEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_path(), e))
    }

    /// Entries that have to be materialized from the overlay source.
    pub fn overlay_entries(&self) -> impl Iterator<Item = (&Utf8Path, &PlanEntry)> {
        self.iter().filter(|(_, e)| e.origin == Origin::Overlay)
    }

    /// Number of overlay files (not directories) in the plan.
    pub fn overlay_file_count(&self) -> usize {
        self.overlay_entries()
            .filter(|(_, e)| e.kind == EntryKind::File)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, path: Utf8PathBuf, origin: Origin, kind: EntryKind, shadows_base: bool) {
        self.entries.insert(
            path,
            PlanEntry {
                origin,
                kind,
                shadows_base,
            },
        );
    }
}

struct Conflict {
    path: Utf8PathBuf,
    base: EntryKind,
    overlay: EntryKind,
}

/// Compute the merged view of `overlay_source` layered over `target_root`.
///
/// Fails with [`Error::OverlayConflict`] naming the first conflicting path (in
/// sorted order) if any path is a file on one side and a directory on the
/// other. No partial plan is returned in that case.
pub fn classify(target_root: &Utf8Path, overlay_source: &Utf8Path) -> Result<MergePlan> {
    let mut classifier = Classifier {
        target_root,
        overlay_source,
        plan: MergePlan::default(),
        conflicts: Vec::new(),
    };
    classifier.merge_dir(Utf8Path::new(""))?;

    let Classifier {
        plan,
        mut conflicts,
        ..
    } = classifier;

    if conflicts.is_empty() {
        tracing::debug!(
            "Classified {} paths ({} overlay files)",
            plan.len(),
            plan.overlay_file_count()
        );
        return Ok(plan);
    }

    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    let first = conflicts.remove(0);
    Err(Error::OverlayConflict {
        path: first.path,
        base: first.base,
        overlay: first.overlay,
        others: conflicts.into_iter().map(|c| c.path).collect(),
    })
}

struct Classifier<'a> {
    target_root: &'a Utf8Path,
    overlay_source: &'a Utf8Path,
    plan: MergePlan,
    conflicts: Vec<Conflict>,
}

impl Classifier<'_> {
    /// Union the contents of a directory that exists in both trees.
    fn merge_dir(&mut self, rel: &Utf8Path) -> Result<()> {
        let base = list_dir(&self.target_root.join(rel), Origin::Base)?;
        let overlay = list_dir(&self.overlay_source.join(rel), Origin::Overlay)?;

        let names: BTreeSet<&String> = base.keys().chain(overlay.keys()).collect();
        for name in names {
            if rel.as_str().is_empty() && is_reserved_name(name) {
                continue;
            }
            let child = rel.join(name);

            match (base.get(name).copied(), overlay.get(name).copied()) {
                (Some(EntryKind::Dir), Some(EntryKind::Dir)) => {
                    self.plan
                        .insert(child.clone(), Origin::MergedDir, EntryKind::Dir, false);
                    self.merge_dir(&child)?;
                }
                (Some(EntryKind::File), Some(EntryKind::File)) => {
                    self.plan
                        .insert(child, Origin::Overlay, EntryKind::File, true);
                }
                (Some(base), Some(overlay)) => {
                    self.conflicts.push(Conflict {
                        path: child,
                        base,
                        overlay,
                    });
                }
                (Some(kind), None) => {
                    self.plan.insert(child.clone(), Origin::Base, kind, false);
                    if kind == EntryKind::Dir {
                        self.single_side(self.target_root, &child, Origin::Base)?;
                    }
                }
                (None, Some(kind)) => {
                    self.plan.insert(child.clone(), Origin::Overlay, kind, false);
                    if kind == EntryKind::Dir {
                        self.single_side(self.overlay_source, &child, Origin::Overlay)?;
                    }
                }
                (None, None) => unreachable!("name comes from one of the listings"),
            }
        }
        Ok(())
    }

    /// Record a subtree that only one of the trees has.
    fn single_side(&mut self, root: &Utf8Path, rel: &Utf8Path, origin: Origin) -> Result<()> {
        let dir = root.join(rel);
        for entry in WalkDir::new(dir.as_std_path())
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .and_then(Utf8Path::from_path)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|| dir.clone());
                Error::classify(&path, e.into())
            })?;

            let Some(path) = Utf8Path::from_path(entry.path()) else {
                unrepresentable(entry.path(), origin)?;
                continue;
            };
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let kind = if entry.file_type().is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            self.plan
                .insert(relative.to_path_buf(), origin, kind, false);
        }
        Ok(())
    }
}

/// Handle a name that is not valid UTF-8, found in the tree `origin` names.
fn unrepresentable(path: &std::path::Path, origin: Origin) -> Result<()> {
    if origin != Origin::Overlay {
        tracing::warn!("Skipping non-UTF-8 path: {}", path.display());
        return Ok(());
    }
    Err(Error::classify(
        &Utf8PathBuf::from(path.to_string_lossy().into_owned()),
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "overlay file name is not valid UTF-8",
        ),
    ))
}

/// List a directory's entries by name. A missing directory lists as empty.
fn list_dir(dir: &Utf8Path, origin: Origin) -> Result<BTreeMap<String, EntryKind>> {
    let mut entries = BTreeMap::new();
    let read_dir = match std::fs::read_dir(dir.as_std_path()) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(Error::classify(dir, e)),
    };

    for entry in read_dir {
        let entry = entry.map_err(|e| Error::classify(dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            unrepresentable(&entry.path(), origin)?;
            continue;
        };
        let file_type = entry
            .file_type()
            .map_err(|e| Error::classify(&dir.join(&name), e))?;
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.insert(name, kind);
    }
    Ok(entries)
}
