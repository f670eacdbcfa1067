use crate::errors::CliError;
use crate::utils::config::{self, AppConfig};
use camino::Utf8PathBuf;
use clap::ValueEnum;
use colored::Colorize;
use miette::Result;
use mons_overlay::MechanismPreference;

/// Command-line spelling of [`MechanismPreference`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MechanismArg {
    /// Native mount when possible, otherwise copy
    Auto,
    /// Prefer a native mount
    Native,
    /// Always copy files into the target
    Copy,
}

impl From<MechanismArg> for MechanismPreference {
    fn from(arg: MechanismArg) -> Self {
        match arg {
            MechanismArg::Auto => MechanismPreference::Auto,
            MechanismArg::Native => MechanismPreference::Native,
            MechanismArg::Copy => MechanismPreference::Copy,
        }
    }
}

fn update_config(update: impl FnOnce(&mut AppConfig)) -> Result<()> {
    let mut cfg = config::load_config();
    update(&mut cfg);
    config::save_config(&cfg).map_err(|e| CliError::config_save(e).into())
}

/// Print a config path entry with status indicator
fn print_path_config(name: &str, path: Option<&Utf8PathBuf>) {
    match path {
        Some(p) => {
            let status = if p.is_dir() {
                "✓".bright_green()
            } else {
                "✗".bright_red()
            };
            println!("  {} {} {}", format!("{}:", name).bright_white(), p, status);
        }
        None => {
            println!(
                "  {} {}",
                format!("{}:", name).bright_white(),
                "(not set)".bright_yellow()
            );
        }
    }
}

pub fn show_config() -> Result<()> {
    let (cfg, config_path) = config::load_or_create_config()
        .map_err(|e| miette::miette!("Failed to initialize config: {}", e))?;

    println!();
    println!("  {} {}", "config_file:".bright_white(), config_path);
    println!(
        "  {} {:?}",
        "mechanism:".bright_white(),
        cfg.overlay.mechanism
    );
    print_path_config("upper_dir", cfg.overlay.upper_dir.as_ref());
    print_path_config("work_dir", cfg.overlay.work_dir.as_ref());
    println!();
    Ok(())
}

pub fn set_mechanism(mechanism: MechanismPreference) -> Result<()> {
    update_config(|cfg| cfg.overlay.mechanism = mechanism)?;
    println!(
        "{} {:?}",
        "✓ Overlay mechanism set to".bright_green().bold(),
        mechanism
    );
    Ok(())
}

pub fn set_layer_dirs(upper_dir: Option<String>, work_dir: Option<String>) -> Result<()> {
    let upper_dir = upper_dir.map(Utf8PathBuf::from);
    let work_dir = work_dir.map(Utf8PathBuf::from);
    for dir in upper_dir.iter().chain(work_dir.iter()) {
        crate::utils::require_absolute(dir.as_str())?;
    }

    let writable = upper_dir.is_some();
    update_config(|cfg| {
        cfg.overlay.upper_dir = upper_dir;
        cfg.overlay.work_dir = work_dir;
    })?;

    if writable {
        println!(
            "{}",
            "✓ Native mounts will be writable".bright_green().bold()
        );
    } else {
        println!(
            "{}",
            "✓ Native mounts will be read-only".bright_green().bold()
        );
    }
    Ok(())
}

pub fn reset_config() -> Result<()> {
    let config_path = config::default_config_path()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    config::save_config(&AppConfig::default()).map_err(CliError::config_save)?;

    println!(
        "{}",
        "✓ Configuration reset to defaults".bright_green().bold()
    );
    println!();
    println!("  {} {}", "Config file:".bright_white().bold(), config_path);
    println!();
    Ok(())
}
