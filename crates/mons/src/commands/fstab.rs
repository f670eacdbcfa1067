use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{config::load_config, require_absolute};
use camino::Utf8Path;
use colored::Colorize;
use miette::Result;
use mons_overlay::platform::mount_table::{fstab_contains, fstab_entry, fstab_user_mountable};
use mons_overlay::{Error as OverlayError, MountHandle};

const FSTAB_PATH: &str = "/etc/fstab";

pub struct FstabArgs {
    pub target: String,
    pub source: String,
    pub check: bool,
}

/// Print (or look up) the fstab entry for an on-demand overlay mount.
///
/// Never edits /etc/fstab.
pub fn check_fstab(args: FstabArgs) -> Result<()> {
    let target = require_absolute(&args.target)?;
    let source = require_absolute(&args.source)?;
    let cfg = load_config();

    let handle = MountHandle::for_target(target, source, &cfg.overlay)
        .map_err(|e| CliError::overlay(OverlayError::Mount(e), target))?;

    let fstab_path = Utf8Path::new(FSTAB_PATH);
    let existing = match std::fs::read_to_string(fstab_path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(CliError::read_failed(fstab_path, e).into()),
    };
    let (present, user_mountable) = match &existing {
        Some(text) => (
            fstab_contains(text, &handle).map_err(|e| CliError::read_failed(fstab_path, e))?,
            fstab_user_mountable(text, &handle)
                .map_err(|e| CliError::read_failed(fstab_path, e))?,
        ),
        None => (false, false),
    };

    if args.check {
        if present {
            println_pad!(
                "{} {}",
                "✓ /etc/fstab already mounts the overlay on".bright_green(),
                target.as_str().bright_cyan()
            );
            if user_mountable {
                println_pad!(
                    "{}",
                    "  The entry allows user mounts; `mons apply` will mount it without root."
                        .bright_white()
                );
            }
        } else {
            println_pad!(
                "{} {}",
                "✗ /etc/fstab has no overlay entry for".bright_red(),
                target.as_str().bright_cyan()
            );
        }
        return Ok(());
    }

    if present {
        println_pad!(
            "{}",
            "/etc/fstab already contains this entry; nothing to add.".bright_yellow()
        );
        return Ok(());
    }

    let entry = fstab_entry(&handle, chrono::Local::now().date_naive());
    println_pad!(
        "{}",
        "Add these lines to /etc/fstab to mount the overlay on first access:".bright_cyan()
    );
    println!();
    print!("{entry}");
    Ok(())
}
