use crate::println_pad;
use crate::utils::config::load_config;
use colored::Colorize;
use miette::Result;
use mons_overlay::platform;
use mons_overlay::Mechanism;

fn yes_no(value: bool) -> colored::ColoredString {
    if value {
        "yes".bright_green()
    } else {
        "no".bright_red()
    }
}

pub fn probe_platform() -> Result<()> {
    let cfg = load_config();
    let report = platform::probe();
    let mechanism = super::engine(&cfg).capability();

    println_pad!("{}", "🔍 Overlay support".bright_blue().bold());
    println_pad!(
        "  {} {}",
        "Kernel overlayfs:".bright_white().bold(),
        yes_no(report.overlay_supported)
    );
    println_pad!(
        "  {} {}",
        "Privileged:".bright_white().bold(),
        yes_no(report.privileged)
    );
    println_pad!(
        "  {} {}",
        "User namespace:".bright_white().bold(),
        yes_no(report.user_namespace)
    );
    println_pad!(
        "  {} {:?}",
        "Configured preference:".bright_white().bold(),
        cfg.overlay.mechanism
    );
    if report.overlay_supported && !report.privileged {
        println_pad!(
            "  {}",
            "Targets with a `users` entry in /etc/fstab (see `mons fstab`) still mount natively."
                .bright_white()
        );
    }
    println!();

    match mechanism {
        Mechanism::NativeMount => println_pad!(
            "{} {}",
            "✓ Overlays will use a".bright_green(),
            mechanism.to_string().bright_green().bold()
        ),
        Mechanism::CopyFallback => println_pad!(
            "{} {}",
            "• Overlays will use the".bright_yellow(),
            mechanism.to_string().bright_yellow().bold()
        ),
    }
    Ok(())
}
