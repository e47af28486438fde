//! # parssh - Parallel SSH Task Runner
//!
//! parssh runs one task against tens of thousands of Linux hosts over SSH:
//! execute a remote command, upload-and-execute a local script, push files
//! and directories out, or fetch files back. It authenticates once per
//! host, fans work out to a bounded pool of worker threads (optionally
//! through an SSH bastion), and streams per-host results plus an aggregated
//! summary under three nested deadlines (connect, per-operation, whole
//! task).
//!
//! ## Features
//!
//! - **Host patterns**: `web[01-20].idc[1-3]` expands into concrete,
//!   deduplicated host lists
//! - **Layered auth**: password, identity files, ssh-agent; first accepted
//!   method wins per host
//! - **Vault secrets**: passwords and passphrases stored at rest in an
//!   Ansible-Vault-compatible AES-256 envelope are decrypted transparently
//! - **Bastion tunneling**: target connections relayed through a
//!   `direct-tcpip` channel on a jump host
//! - **Sudo support**: prompt feeding and localized prompt stripping
//!
//! ## Quick Start
//!
//! ```no_run
//! use parssh::config::RunConfig;
//! use parssh::runner::TaskEngine;
//! use parssh::task::{TaskKind, TaskSpec};
//! use parssh::auth::AuthOptions;
//! use parssh::ssh::HostKeyPolicy;
//! use std::time::Duration;
//!
//! let config = RunConfig {
//!     host_patterns: vec!["web[01-04].prod".to_string()],
//!     host_file: None,
//!     concurrency: 16,
//!     connect_timeout: Duration::from_secs(10),
//!     command_timeout: Some(Duration::from_secs(60)),
//!     task_timeout: None,
//!     list_only: false,
//!     auth: AuthOptions::default(),
//!     bastion: None,
//!     host_key_policy: HostKeyPolicy::AcceptAny,
//!     no_safe_check: false,
//!     json: false,
//!     output_file: None,
//! };
//! let spec = TaskSpec::new(TaskKind::Command { command: "uptime".to_string() });
//!
//! let report = TaskEngine::new(config, spec)
//!     .with_observer(|result| println!("{} -> {}", result.host, result.message))
//!     .execute()
//!     .unwrap();
//! println!("{} ok, {} failed", report.success_count(), report.failure_count());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod hosts;
pub mod runner;
pub mod ssh;
pub mod task;
pub mod vault;

// Re-export commonly used types
pub use config::{CliArgs, RunConfig};
pub use error::{ErrorKind, Result, RunnerError};
pub use runner::{TaskEngine, TaskReport};
pub use task::{HostResult, HostStatus, TaskKind, TaskSpec, TaskSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use parssh::prelude::*;
    //! ```

    pub use crate::auth::{AuthBundle, AuthMethod, AuthOptions, AuthResolver, BastionOptions};
    pub use crate::config::{CliArgs, RunConfig};
    pub use crate::error::{ErrorKind, Result, RunnerError};
    pub use crate::hosts::{collect_hosts, expand, expand_all};
    pub use crate::runner::{TaskEngine, TaskPool, TaskReport};
    pub use crate::ssh::{Bastion, HostKeyPolicy, HostSession, SshClient};
    pub use crate::task::{HostResult, HostStatus, TaskKind, TaskSpec, TaskSummary};
    pub use crate::vault;
}
