use clap::builder::{styling::AnsiColor, Styles};
use clap::ColorChoice;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    apply_overlay, check_fstab, probe_platform, revert_overlay, show_status, ApplyOverlayArgs,
    FstabArgs, MechanismArg,
};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod errors;
mod utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Print debug logs (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Overlay a mod directory on top of a target directory
    Apply {
        /// The directory to overlay (e.g. the game installation)
        target: String,

        /// The directory holding the overlay content
        source: String,
    },
    /// Undo the overlay active on a target directory
    Revert {
        /// The directory the overlay was applied to
        target: String,
    },
    /// Show the overlay active on a target directory
    Status {
        /// The directory to inspect
        target: String,
    },
    /// Report which overlay mechanism this machine supports
    Probe,
    /// Print an /etc/fstab entry that mounts the overlay on first access
    Fstab {
        /// The directory to overlay
        target: String,

        /// The directory holding the overlay content
        source: String,

        /// Only check whether /etc/fstab already contains the entry
        #[arg(long)]
        check: bool,
    },
    /// Show or change the configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the current configuration
    Show,
    /// Reset the configuration to defaults
    Reset,
    /// Choose how overlays are applied
    SetMechanism {
        #[arg(value_enum)]
        mechanism: MechanismArg,
    },
    /// Make native mounts writable by giving them upper and work directories
    SetLayerDirs {
        /// Parent directory for per-target upper layers
        upper_dir: String,

        /// Parent directory for per-target overlayfs work directories
        work_dir: String,
    },
    /// Make native mounts read-only again
    ClearLayerDirs,
}

fn parse_args() -> Args {
    // Configure colored/styled help output
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "mons=debug,mons_overlay=debug"
    } else {
        "mons=info,mons_overlay=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
}

fn main() -> Result<()> {
    let args = parse_args();
    init_logging(args.verbose);

    match args.command {
        Commands::Apply { target, source } => apply_overlay(ApplyOverlayArgs { target, source }),
        Commands::Revert { target } => revert_overlay(&target),
        Commands::Status { target } => show_status(&target),
        Commands::Probe => probe_platform(),
        Commands::Fstab {
            target,
            source,
            check,
        } => check_fstab(FstabArgs {
            target,
            source,
            check,
        }),
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config::show_config(),
            ConfigAction::Reset => commands::config::reset_config(),
            ConfigAction::SetMechanism { mechanism } => {
                commands::config::set_mechanism(mechanism.into())
            }
            ConfigAction::SetLayerDirs {
                upper_dir,
                work_dir,
            } => commands::config::set_layer_dirs(Some(upper_dir), Some(work_dir)),
            ConfigAction::ClearLayerDirs => commands::config::set_layer_dirs(None, None),
        },
    }
}
