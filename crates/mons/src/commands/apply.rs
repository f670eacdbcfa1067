use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{config::load_config, require_absolute};
use colored::Colorize;
use miette::Result;
use mons_overlay::{Manifest, OverlayStage};

pub struct ApplyOverlayArgs {
    pub target: String,
    pub source: String,
}

pub fn apply_overlay(args: ApplyOverlayArgs) -> Result<()> {
    let target = require_absolute(&args.target)?;
    let source = require_absolute(&args.source)?;
    let cfg = load_config();

    println_pad!(
        "{} {} {} {}",
        "🧩 Applying overlay:".bright_blue().bold(),
        source.as_str().bright_cyan(),
        "→".dimmed(),
        target.as_str().bright_cyan().bold()
    );

    let engine = super::engine(&cfg).with_progress(|progress| {
        if progress.stage == OverlayStage::Placing {
            if let Some(path) = &progress.current_path {
                tracing::debug!("[{}/{}] {}", progress.current, progress.total, path);
            }
        }
    });

    let manifest = engine
        .apply(target, source)
        .map_err(|e| CliError::overlay(e, target))?;

    print_summary(&manifest);
    Ok(())
}

fn print_summary(manifest: &Manifest) {
    println!();
    println_pad!("{}", "✓ Overlay applied".bright_green().bold());
    println_pad!(
        "  {} {}",
        "Mechanism:".bright_white().bold(),
        manifest.mechanism.to_string().bright_green()
    );
    println_pad!(
        "  {} {}",
        "Files overlaid:".bright_white().bold(),
        manifest.files_overlaid().to_string().bright_green()
    );
    println_pad!(
        "  {} {}",
        "Manifest:".bright_white().bold(),
        manifest.path().as_str().dimmed()
    );
    println!();
    println_pad!(
        "{}",
        format!("Run 'mons revert {}' to restore the original files", manifest.target)
            .bright_cyan()
    );
}
