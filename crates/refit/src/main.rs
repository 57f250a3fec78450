mod cli;
mod commands;
mod error;
mod logging;
mod settings;

use clap::Parser;
use refit_platform::{AppPaths, default_install_root};

use crate::cli::{Cli, Command};
use crate::commands::Context;
use crate::error::CliError;
use crate::settings::UpdaterSettings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(error) => {
            log::error!("{error}");
            eprintln!("error: {error}");
            error.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let paths = AppPaths::new()?;
    let (settings, settings_error) = match UpdaterSettings::load(&paths) {
        Ok(settings) => (settings, None),
        Err(error) => (UpdaterSettings::default(), Some(error)),
    };
    logging::init_logging(
        &paths,
        cli.debug || settings.debug_logging,
        settings.max_log_size_bytes,
    );
    if let Some(error) = settings_error {
        log::warn!("Ignoring settings, using defaults: {error}");
        eprintln!("warning: {error}");
    }

    let install_root = match cli.install_root.or_else(|| settings.install_root.clone()) {
        Some(root) => root,
        None => default_install_root()?,
    };
    let context = Context {
        paths,
        settings,
        install_root,
    };

    // Deferred replacements must land before anything else touches the tree.
    let startup = commands::run_startup(&context);

    match cli.command {
        Command::Pending => {
            commands::print_startup_report(&startup?);
            Ok(())
        }
        command => {
            if let Err(error) = startup {
                log::warn!("Startup tasks failed: {error}");
                eprintln!("warning: {error}");
            }
            match command {
                Command::Check => commands::run_check(&context).await,
                Command::Apply(args) => commands::run_apply(&context, &args).await,
                Command::Backups(backups) => commands::run_backups(&context, &backups),
                Command::Pending => Ok(()),
            }
        }
    }
}
