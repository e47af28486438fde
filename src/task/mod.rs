//! Task descriptors and per-host results
//!
//! The four task kinds share the connect/auth/session lifecycle and diverge
//! only in the body, so the task is a tagged variant dispatched by the
//! session executor rather than a trait hierarchy.

use crate::error::{Result, RunnerError};
use serde::Serialize;
use std::path::PathBuf;

/// What to run on every host
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Execute a remote shell command
    Command { command: String },
    /// Upload a local script and execute it
    Script {
        local_path: PathBuf,
        dest_dir: PathBuf,
        remove_after: bool,
        overwrite: bool,
    },
    /// Push local files/directories to the hosts
    Push {
        files: Vec<PathBuf>,
        dest_dir: PathBuf,
        overwrite: bool,
    },
    /// Fetch remote files/directories from the hosts
    Fetch {
        files: Vec<String>,
        dest_dir: PathBuf,
        tmp_dir: PathBuf,
    },
}

/// A full task: the kind plus the fields shared by all kinds
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// The operation to perform
    pub kind: TaskKind,
    /// Value exported as LANG/LC_ALL/LANGUAGE before command execution
    pub lang: Option<String>,
    /// Wrap execution in sudo
    pub sudo: bool,
    /// User sudo switches to
    pub sudo_as_user: String,
}

impl TaskSpec {
    /// Wrap a task kind with the shared-field defaults (no sudo, as root)
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            lang: None,
            sudo: false,
            sudo_as_user: "root".to_string(),
        }
    }

    /// Validate kind-specific preconditions before any fan-out happens.
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            TaskKind::Command { command } => {
                if command.trim().is_empty() {
                    return Err(RunnerError::config("empty command"));
                }
            }
            TaskKind::Script { local_path, .. } => {
                if !local_path.is_file() {
                    return Err(RunnerError::config(format!(
                        "script not found: {}",
                        local_path.display()
                    )));
                }
            }
            TaskKind::Push { files, dest_dir, .. } => {
                if files.is_empty() {
                    return Err(RunnerError::config("no files to push"));
                }
                for file in files {
                    if !file.exists() {
                        return Err(RunnerError::config(format!(
                            "push source not found: {}",
                            file.display()
                        )));
                    }
                }
                if dest_dir.as_os_str().is_empty() {
                    return Err(RunnerError::config("empty push destination"));
                }
            }
            TaskKind::Fetch { files, dest_dir, .. } => {
                if files.is_empty() {
                    return Err(RunnerError::config("no files to fetch"));
                }
                if dest_dir.as_os_str().is_empty() {
                    return Err(RunnerError::config("empty fetch destination"));
                }
            }
        }
        Ok(())
    }
}

/// Commands refused by the safety check unless it is disabled. Matching is
/// on the trimmed command start or a contained token, the way fat-finger
/// accidents actually arrive.
const UNSAFE_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "dd of=/dev/",
    ":(){ :|:& };:",
    "halt",
    "poweroff",
    "shutdown",
    "init 0",
];

/// Screen a command against the destructive-command list.
pub fn safe_check(command: &str) -> Result<()> {
    let normalized = command.trim().to_lowercase();
    for pattern in UNSAFE_COMMAND_PATTERNS {
        if normalized.contains(pattern) {
            return Err(RunnerError::config(format!(
                "command refused by safety check (matched '{pattern}'); \
                 pass --no-safe-check to override"
            )));
        }
    }
    Ok(())
}

/// Terminal status of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub enum HostStatus {
    Success,
    Failure,
}

/// Result of one host's execution
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    /// Target host as given in the working list
    pub host: String,
    /// Terminal status
    pub status: HostStatus,
    /// Captured output on success, classified cause on failure
    pub message: String,
}

impl HostResult {
    /// Successful completion with captured output
    pub fn success(host: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Success,
            message: output.into(),
        }
    }

    /// Failed completion; the message carries the classified cause
    pub fn failure(host: impl Into<String>, error: &RunnerError) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Failure,
            message: format!("{}: {}", error.kind().label(), error),
        }
    }

    /// True when the host completed successfully
    pub fn is_success(&self) -> bool {
        self.status == HostStatus::Success
    }
}

/// Aggregated counts for a finished (or abandoned) task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    /// Random identifier printed with every task
    pub task_id: String,
    /// Hosts that completed successfully
    pub success_count: usize,
    /// Hosts that completed with a failure
    pub failure_count: usize,
    /// Wall time from fan-out to drain
    pub elapsed_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        let spec = TaskSpec::new(TaskKind::Command {
            command: "   ".to_string(),
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_missing_script_rejected() {
        let spec = TaskSpec::new(TaskKind::Script {
            local_path: PathBuf::from("/no/such/script.sh"),
            dest_dir: PathBuf::from("/tmp"),
            remove_after: false,
            overwrite: false,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_push_requires_existing_sources() {
        let spec = TaskSpec::new(TaskKind::Push {
            files: vec![PathBuf::from("/no/such/file")],
            dest_dir: PathBuf::from("/tmp"),
            overwrite: false,
        });
        assert!(spec.validate().is_err());

        let spec = TaskSpec::new(TaskKind::Push {
            files: vec![],
            dest_dir: PathBuf::from("/tmp"),
            overwrite: false,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_safe_check_blocks_destructive_commands() {
        assert!(safe_check("rm -rf / --no-preserve-root").is_err());
        assert!(safe_check("  MKFS.ext4 /dev/sda1").is_err());
        assert!(safe_check("shutdown -h now").is_err());
        assert!(safe_check("uptime").is_ok());
        assert!(safe_check("rm -rf ./build").is_ok());
    }

    #[test]
    fn test_failure_message_carries_kind_label() {
        let err = RunnerError::unreachable("db01", "connection refused");
        let result = HostResult::failure("db01", &err);
        assert!(result.message.starts_with("Unreachable:"));
        assert!(!result.is_success());
    }
}
