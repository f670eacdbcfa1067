use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{config::load_config, require_absolute};
use colored::Colorize;
use miette::Result;
use mons_overlay::{EntryAction, ManifestState};

pub fn show_status(target: &str) -> Result<()> {
    let target = require_absolute(target)?;
    let cfg = load_config();

    let manifest = super::engine(&cfg)
        .status(target)
        .map_err(|e| CliError::overlay(e, target))?;

    let Some(manifest) = manifest else {
        println_pad!(
            "{} {}",
            "No overlay active on".bright_yellow(),
            target.as_str().bright_cyan()
        );
        return Ok(());
    };

    let state = match manifest.state {
        ManifestState::Active => "active".bright_green(),
        ManifestState::Applying => "interrupted (run 'mons revert' to clean up)".bright_red(),
    };
    let replaced = manifest
        .entries
        .iter()
        .filter(|e| e.action == EntryAction::Replaced)
        .count();

    println_pad!(
        "{} {}",
        "🧩 Overlay on".bright_blue().bold(),
        manifest.target.as_str().bright_cyan().bold()
    );
    println_pad!("  {} {}", "State:".bright_white().bold(), state);
    println_pad!(
        "  {} {}",
        "Mechanism:".bright_white().bold(),
        manifest.mechanism.to_string().bright_white()
    );
    println_pad!(
        "  {} {}",
        "Source:".bright_white().bold(),
        manifest.source.as_str().bright_white()
    );
    println_pad!(
        "  {} {}",
        "Applied:".bright_white().bold(),
        manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().bright_white()
    );
    if let Some(mount) = &manifest.mount {
        println_pad!(
            "  {} {}",
            "Mount options:".bright_white().bold(),
            mount.options().dimmed()
        );
    } else {
        println_pad!(
            "  {} {} ({} replaced, {} entries recorded)",
            "Files overlaid:".bright_white().bold(),
            manifest.files_overlaid().to_string().bright_green(),
            replaced,
            manifest.entries.len()
        );
    }
    Ok(())
}
