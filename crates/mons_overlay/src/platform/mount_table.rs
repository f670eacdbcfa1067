//! Mount table and fstab parsing.
//!
//! `/proc/mounts`, `/etc/mtab` and `/etc/fstab` share the same
//! whitespace-separated record layout:
//!
//! ```text
//! overlay /games/Celeste overlay rw,lowerdir=/mods/Celeste:/games/Celeste 0 0
//! ```
//!
//! Only the first four fields are interpreted; the dump/pass fields are
//! optional. Spaces and other special characters in paths are written as octal
//! escapes (`\040`).

use super::MountHandle;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;

/// One record of a mount table or fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub spec: String,
    pub mount_point: Utf8PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    fn is_overlay_at(&self, mount_point: &Utf8Path) -> bool {
        self.fs_type == "overlay" && self.mount_point == mount_point
    }
}

/// Parse mount table text, skipping blank and `#` comment lines.
///
/// A record with fewer than four fields is an `InvalidData` error.
pub fn parse_mount_table(text: &str) -> std::io::Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[spec, mount_point, fs_type, options, ..] = fields.as_slice() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed mount table line {}: '{}'", index + 1, line),
            ));
        };

        entries.push(MountEntry {
            spec: unescape(spec),
            mount_point: Utf8PathBuf::from(unescape(mount_point)),
            fs_type: fs_type.to_string(),
            options: options.split(',').map(unescape).collect(),
        });
    }
    Ok(entries)
}

/// Whether any overlay is mounted at `mount_point` according to `entries`.
pub fn overlay_mounted_at(entries: &[MountEntry], mount_point: &Utf8Path) -> bool {
    entries.iter().any(|e| e.is_overlay_at(mount_point))
}

/// Whether fstab text already contains an overlay entry equivalent to `handle`.
///
/// The entry must be `overlay <mount point> overlay` and carry the same
/// `lowerdir`, `upperdir` and `workdir` options; other options may differ.
pub fn fstab_contains(text: &str, handle: &MountHandle) -> std::io::Result<bool> {
    Ok(fstab_entries_for(text, handle)?.next().is_some())
}

/// Like [`fstab_contains`], additionally requiring the entry to let ordinary
/// users mount it (`user` or `users`).
pub fn fstab_user_mountable(text: &str, handle: &MountHandle) -> std::io::Result<bool> {
    Ok(fstab_entries_for(text, handle)?
        .any(|entry| entry.options.iter().any(|o| o == "user" || o == "users")))
}

fn fstab_entries_for<'h>(
    text: &str,
    handle: &'h MountHandle,
) -> std::io::Result<impl Iterator<Item = MountEntry> + 'h> {
    let required: Vec<String> = handle
        .options()
        .split(',')
        .filter(|o| !o.starts_with("index="))
        .map(str::to_string)
        .collect();

    Ok(parse_mount_table(text)?.into_iter().filter(move |entry| {
        entry.spec == "overlay"
            && entry.is_overlay_at(&handle.mount_point)
            && required.iter().all(|o| entry.options.contains(o))
    }))
}

/// Render an `/etc/fstab` record (preceded by a dated comment line) for `handle`.
///
/// The record is `noauto` with `x-systemd.automount`, so systemd mounts the
/// overlay on first access, and `users`/`exec` so it can be mounted without
/// root.
pub fn fstab_entry(handle: &MountHandle, date: NaiveDate) -> String {
    format!(
        "# Added by mons {}\noverlay {} overlay noauto,x-systemd.automount,users,exec,{} 0 0\n",
        date.format("%Y-%m-%d"),
        escape(handle.mount_point.as_str()),
        handle.options()
    )
}

/// Whether a `/proc/self/uid_map` describes the initial user namespace.
pub fn is_initial_uid_map(uid_map: &str) -> bool {
    let fields: Vec<&str> = uid_map.split_whitespace().collect();
    fields == ["0", "0", "4294967295"]
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            c => out.push(c),
        }
    }
    out
}
