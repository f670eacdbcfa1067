use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{config::load_config, require_absolute};
use colored::Colorize;
use miette::Result;

pub fn revert_overlay(target: &str) -> Result<()> {
    let target = require_absolute(target)?;
    let cfg = load_config();

    let report = super::engine(&cfg)
        .revert(target)
        .map_err(|e| CliError::overlay(e, target))?;

    match report.mechanism {
        None => {
            println_pad!(
                "{} {}",
                "Nothing to revert on".bright_yellow(),
                target.as_str().bright_cyan()
            );
        }
        Some(mechanism) => {
            println_pad!("{}", "✓ Overlay reverted".bright_green().bold());
            println_pad!(
                "  {} {}",
                "Mechanism:".bright_white().bold(),
                mechanism.to_string().bright_green()
            );
            if report.paths_reverted > 0 {
                println_pad!(
                    "  {} {}",
                    "Paths restored:".bright_white().bold(),
                    report.paths_reverted.to_string().bright_green()
                );
            }
        }
    }
    Ok(())
}
