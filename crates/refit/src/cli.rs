use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "refit",
    version,
    about = "Download and apply application updates in place"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Installation to update (defaults to the configured root, then the
    /// directory of this executable).
    #[arg(long = "install-root", value_name = "DIR", global = true)]
    pub install_root: Option<PathBuf>,

    /// Write debug output to the log.
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Report whether a newer release is published.
    Check,

    /// Download and install a release.
    Apply(ApplyArgs),

    /// Finish file replacements deferred by the last update and exit.
    Pending,

    /// Inspect and manage snapshots of the installation.
    #[command(subcommand)]
    Backups(BackupsCommand),
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Version to install instead of the latest published one.
    #[arg(long, value_name = "VERSION")]
    pub version: Option<String>,

    /// Archive URL to install from, bypassing the configured template.
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Do not relaunch after installing.
    #[arg(long = "no-restart")]
    pub no_restart: bool,
}

#[derive(Debug, Subcommand)]
pub enum BackupsCommand {
    /// List snapshots, newest first.
    List,

    /// Delete all but the newest snapshots.
    Prune {
        #[arg(long, value_name = "N")]
        keep: usize,
    },

    /// Copy a snapshot back over the installation.
    Restore {
        /// Snapshot directory name as shown by `backups list`.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{BackupsCommand, Cli, Command};

    #[test]
    fn apply_accepts_version_url_and_no_restart() {
        let cli = Cli::try_parse_from([
            "refit",
            "apply",
            "--version",
            "2.1.0",
            "--url",
            "https://downloads.example/app.zip",
            "--no-restart",
            "--install-root",
            "/opt/app",
        ])
        .expect("arguments should parse");

        assert_eq!(cli.install_root, Some(PathBuf::from("/opt/app")));
        let Command::Apply(args) = cli.command else {
            panic!("expected apply command");
        };
        assert_eq!(args.version.as_deref(), Some("2.1.0"));
        assert!(args.no_restart);
    }

    #[test]
    fn backups_prune_requires_keep() {
        assert!(Cli::try_parse_from(["refit", "backups", "prune"]).is_err());

        let cli = Cli::try_parse_from(["refit", "--debug", "backups", "prune", "--keep", "2"])
            .expect("arguments should parse");
        assert!(cli.debug);
        assert!(matches!(
            cli.command,
            Command::Backups(BackupsCommand::Prune { keep: 2 })
        ));
    }
}
