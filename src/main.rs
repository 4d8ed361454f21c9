//! Command-line entry point and composition root.
//!
//! One-shot flags perform a single controller call against the main device
//! and exit; with no flags the engine runs until `--stop` (or the process is
//! killed). The controller is constructed here and handed to collaborators
//! explicitly; there is no global instance.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "bettermute",
    version,
    about = "Mute control for the Windows default capture devices"
)]
struct Cli {
    /// Mute the main capture device and exit.
    #[arg(long, conflicts_with_all = ["unmute", "toggle", "stop"])]
    mute: bool,

    /// Unmute the main capture device and exit.
    #[arg(long, conflicts_with_all = ["toggle", "stop"])]
    unmute: bool,

    /// Toggle the main capture device and exit.
    #[arg(long, conflicts_with = "stop")]
    toggle: bool,

    /// Stop a running bettermute instance and exit.
    #[arg(long)]
    stop: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.stop {
        if !bettermute::instance::stop_running_instance()? {
            eprintln!("no running instance found");
        }
        return Ok(());
    }
    run(cli)
}

#[cfg(windows)]
fn run(cli: Cli) -> anyhow::Result<()> {
    use std::sync::{Arc, Mutex, PoisonError};

    use bettermute::settings::SETTINGS_FILE;
    use bettermute::{ComGuard, ListenerId, MicController, SettingsStore, WasapiSystem};
    use tracing::{info, trace};

    let _com = ComGuard::new()?;
    let controller = MicController::new(WasapiSystem::new()?);

    if cli.mute {
        controller.mute(Some(controller.main_role()));
        return Ok(());
    }
    if cli.unmute {
        controller.unmute(Some(controller.main_role()));
        return Ok(());
    }
    if cli.toggle {
        controller.toggle(Some(controller.main_role()));
        return Ok(());
    }

    bettermute::instance::write_pid_file()?;
    controller.start();

    // The engine consumes only show_level; hotkeys, tray and the status
    // overlay subscribe through the same listener API from their own glue.
    let settings = SettingsStore::load(SETTINGS_FILE)?;
    let level_slot: Mutex<Option<ListenerId>> = Mutex::new(None);
    let ctrl = Arc::clone(&controller);
    settings.add_listener(Arc::new(move |config| {
        let mut slot = level_slot.lock().unwrap_or_else(PoisonError::into_inner);
        match (config.show_level, slot.is_some()) {
            (true, false) => {
                *slot = Some(
                    ctrl.add_level_listener(Arc::new(|level| trace!(level, "input level"))),
                );
            }
            (false, true) => {
                if let Some(id) = slot.take() {
                    ctrl.remove_level_listener(id);
                }
            }
            _ => {}
        }
    }));

    info!("bettermute running; use --stop to exit");
    loop {
        std::thread::park();
    }
}

#[cfg(not(windows))]
fn run(_cli: Cli) -> anyhow::Result<()> {
    anyhow::bail!("microphone control requires the Windows audio subsystem")
}
