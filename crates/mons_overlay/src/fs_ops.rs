//! Filesystem primitives used by the copy fallback.
//!
//! The engine never calls `std::fs` directly for the mutations it records in
//! a manifest; it goes through [`FileOps`]. [`StdFileOps`] is the real
//! implementation. Tests substitute their own to inject failures at a chosen
//! step.

use camino::Utf8Path;
use std::fs;
use std::io::{self, Read};
use xxhash_rust::xxh3::Xxh3;

/// Mutations the copy fallback performs on a target root.
///
/// Every method takes absolute paths. Implementations must be [`Send`] and
/// [`Sync`] so the engine can be shared between threads.
pub trait FileOps: Send + Sync {
    /// Put a copy of `src` at `dst`.
    ///
    /// `dst` must not exist. The copy is written to `staging`, a path the
    /// engine owns, and renamed into place, so `dst` never holds partial
    /// contents. Whatever is at `staging` beforehand is discarded. Symlinks are
    /// recreated rather than followed where the platform allows it.
    fn place_file(&self, src: &Utf8Path, dst: &Utf8Path, staging: &Utf8Path) -> io::Result<()>;

    /// Move `from` to `to`, which must not exist.
    ///
    /// Across volumes this degrades to copy, verify, delete. The original is
    /// only removed once the copy has been checked.
    fn move_file(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;

    /// Create directory `path` with the permissions of directory `like`.
    fn create_dir(&self, path: &Utf8Path, like: &Utf8Path) -> io::Result<()>;

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()>;
}

/// [`FileOps`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn place_file(&self, src: &Utf8Path, dst: &Utf8Path, staging: &Utf8Path) -> io::Result<()> {
        remove_if_present(staging)?;
        if let Err(e) = stage_copy(src, staging) {
            let _ = fs::remove_file(staging);
            return Err(e);
        }

        match fs::rename(staging, dst) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(staging);
                if e.kind() != io::ErrorKind::CrossesDevices {
                    return Err(e);
                }
                // `dst` sits on a volume mounted inside the target.
                tracing::debug!("{} is on another volume; copying in place", dst);
                stage_copy(src, dst)
            }
        }
    }

    fn move_file(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                tracing::debug!("{} and {} are on different volumes; copying", from, to);
                copy_verify_delete(from, to)
            }
            Err(e) => Err(e),
        }
    }

    fn create_dir(&self, path: &Utf8Path, like: &Utf8Path) -> io::Result<()> {
        let permissions = fs::metadata(like)?.permissions();
        fs::create_dir(path)?;
        fs::set_permissions(path, permissions)
    }

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        fs::remove_dir(path)
    }
}

/// Whether anything (including a dangling symlink) exists at `path`.
pub fn exists_no_follow(path: &Utf8Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_if_present(path: &Utf8Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn stage_copy(src: &Utf8Path, part: &Utf8Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    if metadata.file_type().is_symlink() {
        #[cfg(unix)]
        {
            let link = fs::read_link(src)?;
            return std::os::unix::fs::symlink(link, part);
        }
    }
    // Copies permission bits along with the contents.
    fs::copy(src, part).map(|_| ())
}

fn copy_verify_delete(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    fs::copy(from, to)?;

    match same_contents(from, to) {
        Ok(true) => {}
        Ok(false) => {
            let _ = fs::remove_file(to);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("copy of {from} to {to} does not match the original"),
            ));
        }
        Err(e) => {
            let _ = fs::remove_file(to);
            return Err(e);
        }
    }

    if let Err(e) = fs::remove_file(from) {
        // Leave exactly one copy behind.
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}

/// Compare two files by length and xxh3 digest.
pub fn same_contents(a: &Utf8Path, b: &Utf8Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(digest(a)? == digest(b)?)
}

/// xxh3 digest of a regular file, or `None` for anything else (including
/// symlinks, which are not followed).
pub fn file_digest(path: &Utf8Path) -> io::Result<Option<u64>> {
    if !fs::symlink_metadata(path)?.file_type().is_file() {
        return Ok(None);
    }
    digest(path).map(Some)
}

fn digest(path: &Utf8Path) -> io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.digest())
}
