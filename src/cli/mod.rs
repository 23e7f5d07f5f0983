mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{error::Result, settings::SettingsOverrides};

pub use output::stderr_line;

const EXPOSE_ARG_HELP: &str =
    "Ad-hoc exposure `env|file|mount:<secret>:<destination>`. Repeat or comma-separate.";
const CLI_AFTER_HELP: &str = r#"Examples:
  credible -k ~/.config/credible/key.txt run-command -- ./deploy.sh
  credible -c base.toml,app.toml -e env:db:DATABASE_URL run-command -- psql
  credible -e file:tls:./cert.pem run-command -- nginx -g 'daemon off;'
  credible --mount-point /run/credible.d mount
  credible unmount
  credible upload db ./db-password.txt

Environment:
  CREDIBLE_CONFIG_FILES, CREDIBLE_EXPOSURES, CREDIBLE_MOUNT_POINT,
  CREDIBLE_SECRET_DIR, CREDIBLE_OWNER_USER, CREDIBLE_OWNER_GROUP,
  CREDIBLE_PRIVATE_KEY_PATHS and CREDIBLE_LOG. Flags take precedence.
"#;
const RUN_COMMAND_AFTER_HELP: &str = r#"Examples:
  credible -e env:sample:SAMPLE_SECRET run-command -- sh -c 'echo "$SAMPLE_SECRET"'

Notes:
  - Exposures exist only while the command runs and are removed afterwards.
  - The exit code mirrors the command; a command killed by signal N exits 128+N.
"#;
const MOUNT_COMMAND_AFTER_HELP: &str = r#"Examples:
  credible --mount-point /run/credible.d --secret-dir /run/credible mount

Notes:
  - Replaces an existing mount so it always holds the latest secrets.
  - Without mount exposures every secret is mounted at its own name.
"#;
const UNMOUNT_COMMAND_AFTER_HELP: &str = r#"Notes:
  - Unmounting when nothing is mounted succeeds without changes.
"#;
const UPLOAD_COMMAND_AFTER_HELP: &str = r#"Examples:
  credible upload db ./db-password.txt

Notes:
  - Encrypts for the secret's `encryption_keys` and stores it at the secret's `path`.
"#;

/// Top-level command line parser.
#[derive(Debug, Parser)]
#[command(
    name = "credible",
    version,
    about = "Exposes encrypted secrets to a command, a file or a memory-backed mount.",
    after_help = CLI_AFTER_HELP,
    arg_required_else_help = true,
    next_line_help = true
)]
pub struct Cli {
    /// Config fragment files in merge order.
    /// Default when unset: nearest `credible.toml`.
    #[arg(short, long, global = true, value_delimiter = ',')]
    pub config: Vec<PathBuf>,
    /// Ad-hoc exposures merged after all config fragments.
    #[arg(short, long, global = true, value_delimiter = ',', help = EXPOSE_ARG_HELP)]
    pub expose: Vec<String>,
    /// Age or unencrypted SSH identity files tried in order.
    /// Default when unset: `~/.ssh/id_rsa` and `~/.ssh/id_ed25519` if present.
    #[arg(short = 'k', long, global = true, value_delimiter = ',')]
    pub private_key: Vec<PathBuf>,
    /// Memory-backed mount point. Default: `/run/credible.d`.
    #[arg(long, global = true)]
    pub mount_point: Option<PathBuf>,
    /// Symlink pointing at the mount point. Default: `/run/credible`.
    #[arg(long, global = true)]
    pub secret_dir: Option<PathBuf>,
    /// Default owner of file and mount exposures.
    #[arg(long, global = true)]
    pub user: Option<String>,
    /// Default group of file and mount exposures.
    #[arg(long, global = true)]
    pub group: Option<String>,
    /// Increase log verbosity (`-v` info, `-vv` debug, `-vvv` trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Command-line values layered over the environment contract.
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            config_files: self.config.clone(),
            exposures: self.expose.clone(),
            mount_point: self.mount_point.clone(),
            secret_dir: self.secret_dir.clone(),
            owner_user: self.user.clone(),
            owner_group: self.group.clone(),
            private_key_paths: self.private_key.clone(),
        }
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a command with its exposures in place, then removes them.
    #[command(after_help = RUN_COMMAND_AFTER_HELP)]
    RunCommand {
        /// Program and arguments.
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "COMMAND"
        )]
        command: Vec<String>,
    },
    /// Mounts secrets on the memory-backed mount point until `unmount`.
    #[command(after_help = MOUNT_COMMAND_AFTER_HELP)]
    Mount,
    /// Removes the mount and its secret directory symlink.
    #[command(after_help = UNMOUNT_COMMAND_AFTER_HELP)]
    Unmount,
    /// Encrypts a plaintext file and stores it as a declared secret.
    #[command(after_help = UPLOAD_COMMAND_AFTER_HELP)]
    Upload {
        /// Declared secret name.
        secret: String,
        /// Plaintext file to encrypt.
        file: PathBuf,
    },
}

/// Runs one CLI invocation and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    commands::run(cli)
}

#[cfg(test)]
mod unit_tests {
    use std::path::PathBuf;

    use super::{Cli, Command};
    use clap::{error::ErrorKind, CommandFactory, Parser};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_command_keeps_trailing_arguments() {
        let cli = Cli::parse_from([
            "credible",
            "-e",
            "env:sample:SAMPLE_SECRET,file:sample:./secret.txt",
            "run-command",
            "sh",
            "-c",
            "echo -n hi",
        ]);
        assert_eq!(cli.expose.len(), 2);
        let Command::RunCommand { command } = cli.command else {
            panic!("expected run-command");
        };
        assert_eq!(command, vec!["sh", "-c", "echo -n hi"]);
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli = Cli::parse_from([
            "credible",
            "mount",
            "--mount-point",
            "/tmp/mnt",
            "-c",
            "a.toml,b.toml",
        ]);
        assert!(matches!(cli.command, Command::Mount));
        assert_eq!(cli.mount_point, Some(PathBuf::from("/tmp/mnt")));
        assert_eq!(
            cli.overrides().config_files,
            vec![PathBuf::from("a.toml"), PathBuf::from("b.toml")]
        );
    }

    #[test]
    fn run_command_requires_a_program() {
        let error = Cli::try_parse_from(["credible", "run-command"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn verbosity_counts_flags() {
        let cli = Cli::parse_from(["credible", "-vv", "unmount"]);
        assert_eq!(cli.verbose, 2);
    }
}
