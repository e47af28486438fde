//! CLI arguments and runtime configuration
//!
//! The command line is a thin layer: flags are folded into [`RunConfig`]
//! plus a [`TaskSpec`], and everything else happens in the engine.

use crate::auth::{AuthOptions, BastionOptions};
use crate::error::{Result, RunnerError};
use crate::hosts::split_host_port;
use crate::ssh::HostKeyPolicy;
use crate::task::{TaskKind, TaskSpec};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// parssh - parallel SSH task runner for large Linux host fleets
#[derive(Parser, Debug, Clone)]
#[command(name = "parssh")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run commands, scripts and file transfers on thousands of hosts over SSH")]
#[command(long_about = r#"
parssh authenticates once per host and fans work out to a bounded pool of
workers, optionally through an SSH bastion. Host patterns like
web[01-20].idc[1-3] expand into concrete host lists; results stream back
per host with a final success/failure summary.

Examples:
  parssh command -e 'uptime' web[01-20].prod
  parssh command -e 'systemctl restart nginx' -s -c 50 -H hosts.txt
  parssh script -e ./rollout.sh --remove-after db[1-8]
  parssh push -f ./conf -d /etc/app web[01-20].prod
  parssh fetch -f /var/log/app.log -d ./logs -s web[01-20].prod
"#)]
pub struct CliArgs {
    /// The task to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Task subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Execute a command on every host
    #[command(name = "command")]
    Command {
        /// Command to execute
        #[arg(short = 'e', long, value_name = "CMD")]
        execute: String,

        /// Disable the destructive-command safety check
        #[arg(long)]
        no_safe_check: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Upload a local shell script and execute it
    #[command(name = "script")]
    Script {
        /// Local script to upload and run
        #[arg(short = 'e', long, value_name = "PATH")]
        execute: PathBuf,

        /// Remote directory the script is uploaded to
        #[arg(short = 'd', long, default_value = "/tmp", value_name = "DIR")]
        dest_dir: PathBuf,

        /// Delete the uploaded script after execution
        #[arg(short = 'r', long)]
        remove_after: bool,

        /// Overwrite an existing remote file
        #[arg(short = 'F', long)]
        force: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Push local files and directories to every host
    #[command(name = "push")]
    Push {
        /// Local files, directories, or zip bundles to push
        #[arg(short = 'f', long = "files", required = true, value_name = "PATH")]
        files: Vec<PathBuf>,

        /// Remote destination directory
        #[arg(short = 'd', long, default_value = "/tmp", value_name = "DIR")]
        dest_dir: PathBuf,

        /// Overwrite existing remote files
        #[arg(short = 'F', long)]
        force: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Fetch remote files and directories from every host
    #[command(name = "fetch")]
    Fetch {
        /// Remote paths to fetch
        #[arg(short = 'f', long = "files", required = true, value_name = "PATH")]
        files: Vec<String>,

        /// Local destination directory; files land under <dir>/<host>/
        #[arg(short = 'd', long, value_name = "DIR")]
        dest_dir: PathBuf,

        /// Remote staging directory for sudo fetches
        #[arg(short = 't', long, default_value = "/tmp/parssh", value_name = "DIR")]
        tmp_dir: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Flags shared by all task subcommands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Target host patterns, e.g. web[01-20].idc[1-3]
    #[arg(value_name = "HOST_PATTERN")]
    pub hosts: Vec<String>,

    /// File with one host pattern per line
    #[arg(short = 'H', long, value_name = "PATH")]
    pub host_file: Option<PathBuf>,

    /// Login user (defaults to $USER)
    #[arg(short = 'u', long, value_name = "USER")]
    pub user: Option<String>,

    /// Login password; vault ciphertext is decrypted transparently
    #[arg(short = 'p', long, value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Prompt for the login password
    #[arg(short = 'k', long)]
    pub ask_pass: bool,

    /// File holding the login password
    #[arg(short = 'a', long, value_name = "PATH")]
    pub password_file: Option<PathBuf>,

    /// Identity file for public key auth (repeatable)
    #[arg(short = 'i', long = "identity-file", value_name = "PATH")]
    pub identity_files: Vec<PathBuf>,

    /// Passphrase for protected identity files
    #[arg(short = 'P', long, value_name = "PASSPHRASE")]
    pub passphrase: Option<String>,

    /// File holding the vault passphrase
    #[arg(long, value_name = "PATH")]
    pub vault_pass_file: Option<PathBuf>,

    /// Maximum hosts executing at once
    #[arg(short = 'c', long, default_value = "1", value_name = "NUM")]
    pub concurrency: usize,

    /// TCP connect and handshake timeout in seconds
    #[arg(long, default_value = "10", value_name = "SECS")]
    pub connect_timeout: u64,

    /// Per-operation timeout in seconds, 0 for unlimited
    #[arg(long, default_value = "0", value_name = "SECS")]
    pub command_timeout: u64,

    /// Whole-task timeout in seconds, 0 for unlimited
    #[arg(long, default_value = "0", value_name = "SECS")]
    pub task_timeout: u64,

    /// Run the task via sudo
    #[arg(short = 's', long)]
    pub sudo: bool,

    /// User sudo switches to
    #[arg(short = 'U', long, default_value = "root", value_name = "USER")]
    pub run_as: String,

    /// Remote LANG/LC_ALL/LANGUAGE value
    #[arg(long, value_name = "LANG")]
    pub lang: Option<String>,

    /// Only expand and print the target host list
    #[arg(short = 'l', long)]
    pub list_hosts: bool,

    /// Bastion host to tunnel through (host[:port])
    #[arg(short = 'X', long, value_name = "HOST[:PORT]")]
    pub bastion: Option<String>,

    /// Bastion login user (defaults to the target user)
    #[arg(long, value_name = "USER")]
    pub bastion_user: Option<String>,

    /// Bastion login password (defaults to the target password)
    #[arg(long, value_name = "PASSWORD")]
    pub bastion_password: Option<String>,

    /// Bastion identity file (repeatable, defaults to the target files)
    #[arg(long = "bastion-identity-file", value_name = "PATH")]
    pub bastion_identity_files: Vec<PathBuf>,

    /// Host key verification mode
    #[arg(long, value_enum, default_value = "accept-any")]
    pub host_key: HostKeyMode,

    /// Fingerprint store for strict/tofu host key checking
    #[arg(long, value_name = "PATH")]
    pub fingerprint_store: Option<PathBuf>,

    /// Emit per-host results and the summary as JSON
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Also append per-host detail lines to this file
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output_file: Option<PathBuf>,
}

/// Host key verification modes exposed on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyMode {
    /// Trust any presented key (the historical fleet-runner default)
    AcceptAny,
    /// Learn keys on first contact, reject changes
    Tofu,
    /// Only already-known fingerprints pass
    Strict,
}

/// Everything the orchestrator needs besides the task itself
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Host patterns from the command line
    pub host_patterns: Vec<String>,
    /// Optional file with further host patterns
    pub host_file: Option<PathBuf>,
    /// Parallelism cap K (>= 1)
    pub concurrency: usize,
    /// Bound on TCP connect plus SSH handshake
    pub connect_timeout: Duration,
    /// Bound on each session operation; None means unlimited
    pub command_timeout: Option<Duration>,
    /// Bound on the whole task; None means unlimited
    pub task_timeout: Option<Duration>,
    /// Print the expanded host list instead of running
    pub list_only: bool,
    /// Target-side credential inputs
    pub auth: AuthOptions,
    /// Optional bastion to tunnel through
    pub bastion: Option<BastionOptions>,
    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,
    /// Skip the destructive-command screen
    pub no_safe_check: bool,
    /// Emit results as JSON
    pub json: bool,
    /// Also append detail lines to this file
    pub output_file: Option<PathBuf>,
}

impl RunConfig {
    /// Fold the parsed command line into the runtime config and task spec.
    pub fn from_cli(args: &CliArgs) -> Result<(RunConfig, TaskSpec)> {
        let (common, kind, no_safe_check) = match &args.command {
            Commands::Command {
                execute,
                no_safe_check,
                common,
            } => (
                common,
                TaskKind::Command {
                    command: execute.clone(),
                },
                *no_safe_check,
            ),
            Commands::Script {
                execute,
                dest_dir,
                remove_after,
                force,
                common,
            } => (
                common,
                TaskKind::Script {
                    local_path: execute.clone(),
                    dest_dir: dest_dir.clone(),
                    remove_after: *remove_after,
                    overwrite: *force,
                },
                false,
            ),
            Commands::Push {
                files,
                dest_dir,
                force,
                common,
            } => (
                common,
                TaskKind::Push {
                    files: files.clone(),
                    dest_dir: dest_dir.clone(),
                    overwrite: *force,
                },
                false,
            ),
            Commands::Fetch {
                files,
                dest_dir,
                tmp_dir,
                common,
            } => (
                common,
                TaskKind::Fetch {
                    files: files.clone(),
                    dest_dir: dest_dir.clone(),
                    tmp_dir: tmp_dir.clone(),
                },
                false,
            ),
        };

        let auth = AuthOptions {
            user: common.user.clone(),
            password: common.password.clone(),
            ask_pass: common.ask_pass,
            password_file: common.password_file.clone(),
            identity_files: if common.identity_files.is_empty() {
                default_identity_files()
            } else {
                common.identity_files.clone()
            },
            passphrase: common.passphrase.clone(),
            agent_socket: std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from),
            vault_pass_file: common.vault_pass_file.clone(),
        };

        let bastion = common.bastion.as_ref().map(|endpoint| {
            let (host, port) = split_host_port(endpoint);
            BastionOptions {
                host,
                port,
                auth: AuthOptions {
                    user: common.bastion_user.clone(),
                    password: common.bastion_password.clone(),
                    identity_files: common.bastion_identity_files.clone(),
                    ..Default::default()
                },
            }
        });

        let host_key_policy = match common.host_key {
            HostKeyMode::AcceptAny => HostKeyPolicy::AcceptAny,
            HostKeyMode::Tofu => HostKeyPolicy::Tofu {
                store: fingerprint_store_path(common)?,
            },
            HostKeyMode::Strict => HostKeyPolicy::Strict {
                store: fingerprint_store_path(common)?,
            },
        };

        let config = RunConfig {
            host_patterns: common.hosts.clone(),
            host_file: common.host_file.clone(),
            concurrency: common.concurrency.max(1),
            connect_timeout: Duration::from_secs(common.connect_timeout),
            command_timeout: nonzero_secs(common.command_timeout),
            task_timeout: nonzero_secs(common.task_timeout),
            list_only: common.list_hosts,
            auth,
            bastion,
            host_key_policy,
            no_safe_check,
            json: common.json,
            output_file: common.output_file.clone(),
        };

        let mut spec = TaskSpec::new(kind);
        spec.sudo = common.sudo;
        spec.sudo_as_user = common.run_as.clone();
        spec.lang = common.lang.clone();

        Ok((config, spec))
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn default_identity_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("~/.ssh/id_rsa"),
        PathBuf::from("~/.ssh/id_ed25519"),
    ]
}

fn fingerprint_store_path(common: &CommonArgs) -> Result<PathBuf> {
    if let Some(path) = &common.fingerprint_store {
        return Ok(path.clone());
    }
    let home = std::env::var("HOME")
        .map_err(|_| RunnerError::config("--fingerprint-store not given and HOME is unset"))?;
    Ok(PathBuf::from(home).join(".parssh").join("fingerprints.json"))
}
