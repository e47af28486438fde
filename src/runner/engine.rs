//! Task orchestration
//!
//! Composes the pipeline: validate -> expand hosts -> resolve auth ->
//! build the SSH client -> fan out -> drain results against the
//! whole-task deadline -> summarize.

use crate::auth::AuthResolver;
use crate::config::RunConfig;
use crate::error::Result;
use crate::hosts::{collect_hosts, split_host_port};
use crate::runner::pool::TaskPool;
use crate::ssh::{Bastion, SshClient};
use crate::task::{safe_check, HostResult, TaskKind, TaskSpec, TaskSummary};
use crossbeam::channel::after;
use crossbeam::select;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one task run
#[derive(Debug)]
pub struct TaskReport {
    /// Random identifier printed with every task
    pub task_id: String,
    /// The expanded, deduplicated working host list
    pub hosts: Vec<String>,
    /// One entry per completed host; short of `hosts` when the task
    /// deadline fired
    pub results: Vec<HostResult>,
    /// The whole-task deadline closed the sinks early
    pub timed_out: bool,
    /// The run stopped after host expansion (list-only mode)
    pub listed_only: bool,
    /// Wall time from fan-out to drain
    pub elapsed: Duration,
}

impl TaskReport {
    /// Hosts that completed successfully
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Hosts that completed with a failure
    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// Aggregate counts plus wall time
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            success_count: self.success_count(),
            failure_count: self.failure_count(),
            elapsed_seconds: self.elapsed.as_secs_f64(),
        }
    }

    /// Exit contract with the CLI: 0 all succeeded, 1 any host failed,
    /// 3 whole-task timeout. (2 is reserved for errors before fan-out and
    /// mapped by the caller.)
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            3
        } else if self.failure_count() > 0 {
            1
        } else {
            0
        }
    }
}

/// Per-host result observer, fed while results stream in
type Observer = Box<dyn Fn(&HostResult) + Send>;

/// One-shot task orchestrator
pub struct TaskEngine {
    config: RunConfig,
    spec: TaskSpec,
    resolver: AuthResolver,
    observer: Option<Observer>,
}

impl TaskEngine {
    /// Create an engine for one task run
    pub fn new(config: RunConfig, spec: TaskSpec) -> Self {
        let resolver = AuthResolver::new(spec.sudo);
        Self {
            config,
            spec,
            resolver,
            observer: None,
        }
    }

    /// Replace the credential resolver (used by tests to inject prompts)
    pub fn with_resolver(mut self, resolver: AuthResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Stream each per-host result to this callback as it arrives
    pub fn with_observer(mut self, observer: impl Fn(&HostResult) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Run the task to completion or to the whole-task deadline.
    pub fn execute(&self) -> Result<TaskReport> {
        self.spec.validate()?;
        if let TaskKind::Command { command } = &self.spec.kind {
            if !self.config.no_safe_check {
                safe_check(command)?;
            }
        }

        let hosts = collect_hosts(&self.config.host_patterns, self.config.host_file.as_deref())?;
        let task_id = format!("{:08x}", rand::random::<u32>());

        if self.config.list_only {
            return Ok(TaskReport {
                task_id,
                hosts,
                results: Vec::new(),
                timed_out: false,
                listed_only: true,
                elapsed: Duration::ZERO,
            });
        }

        let client = Arc::new(self.build_client()?);
        let spec = Arc::new(self.spec.clone());
        info!(
            %task_id,
            hosts = hosts.len(),
            concurrency = self.config.concurrency,
            "starting task"
        );

        let start = Instant::now();
        let pool = TaskPool::new(self.config.concurrency);
        let job = {
            let client = Arc::clone(&client);
            let spec = Arc::clone(&spec);
            move |target: &str| -> Result<String> {
                let (host, port) = split_host_port(target);
                let session = client.dial(&host, port)?;
                session.run(&spec)
            }
        };
        let (result_rx, handles, _stats) = pool.run(hosts.clone(), job);

        let mut results = Vec::with_capacity(hosts.len());
        let mut timed_out = false;
        let deadline = self.config.task_timeout.map(after);

        while results.len() < hosts.len() {
            let received = match &deadline {
                Some(timer) => {
                    select! {
                        recv(result_rx) -> msg => msg.ok(),
                        recv(timer) -> _ => {
                            warn!(
                                %task_id,
                                completed = results.len(),
                                total = hosts.len(),
                                "task timeout fired, abandoning remaining hosts"
                            );
                            timed_out = true;
                            None
                        }
                    }
                }
                None => result_rx.recv().ok(),
            };

            match received {
                Some(result) => {
                    if let Some(observer) = &self.observer {
                        observer(&result);
                    }
                    results.push(result);
                }
                None => break,
            }
        }

        if timed_out {
            // Close the sink; in-flight workers are abandoned, not joined.
            // Acceptable for a short-lived CLI, the process exits shortly.
            drop(result_rx);
        } else {
            for handle in handles {
                let _ = handle.join();
            }
        }

        let elapsed = start.elapsed();
        debug!(%task_id, ?elapsed, "task drained");

        Ok(TaskReport {
            task_id,
            hosts,
            results,
            timed_out,
            listed_only: false,
            elapsed,
        })
    }

    fn build_client(&self) -> Result<SshClient> {
        let auth = self.resolver.resolve(&self.config.auth)?;
        let mut client = SshClient::new(auth, self.config.connect_timeout)
            .with_op_timeout(self.config.command_timeout)
            .with_host_key_policy(self.config.host_key_policy.clone());

        if let Some(bastion) = &self.config.bastion {
            let bastion_auth = self.resolver.resolve_bastion(bastion, &self.config.auth)?;
            client = client.with_bastion(Bastion {
                host: bastion.host.clone(),
                port: bastion.port,
                auth: bastion_auth,
            });
        }

        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthOptions;
    use crate::error::ErrorKind;
    use crate::ssh::HostKeyPolicy;
    use std::net::TcpListener;

    fn base_config(hosts: Vec<String>) -> RunConfig {
        RunConfig {
            host_patterns: hosts,
            host_file: None,
            concurrency: 4,
            connect_timeout: Duration::from_secs(2),
            command_timeout: None,
            task_timeout: None,
            list_only: false,
            auth: AuthOptions {
                user: Some("tester".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            },
            bastion: None,
            host_key_policy: HostKeyPolicy::AcceptAny,
            no_safe_check: false,
            json: false,
            output_file: None,
        }
    }

    fn command_spec(command: &str) -> TaskSpec {
        TaskSpec::new(TaskKind::Command {
            command: command.to_string(),
        })
    }

    #[test]
    fn test_validation_failure_aborts_before_fanout() {
        let engine = TaskEngine::new(base_config(vec!["db01".to_string()]), command_spec(" "));
        let err = engine.execute().unwrap_err();
        assert!(err.is_config_stage());
    }

    #[test]
    fn test_safe_check_blocks_unless_disabled() {
        let config = base_config(vec!["db01".to_string()]);
        let engine = TaskEngine::new(config.clone(), command_spec("rm -rf /"));
        assert!(engine.execute().is_err());

        let mut unchecked = config;
        unchecked.no_safe_check = true;
        unchecked.list_only = true;
        let engine = TaskEngine::new(unchecked, command_spec("rm -rf /"));
        assert!(engine.execute().is_ok());
    }

    #[test]
    fn test_list_only_expands_without_connecting() {
        let mut config = base_config(vec!["web[01-03]".to_string(), "web01".to_string()]);
        config.list_only = true;
        // An unresolvable auth setup must not matter in list-only mode.
        config.auth = AuthOptions::default();

        let engine = TaskEngine::new(config, command_spec("uptime"));
        let report = engine.execute().unwrap();

        assert!(report.listed_only);
        assert_eq!(report.hosts, vec!["web01", "web02", "web03"]);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_closed_port_yields_unreachable_failure() {
        // Reserve a port, then free it so connects are refused.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = base_config(vec![format!("127.0.0.1:{port}")]);
        let engine = TaskEngine::new(config, command_spec("uptime"));
        let report = engine.execute().unwrap();

        assert_eq!(report.results.len(), 1);
        assert!(!report.results[0].is_success());
        assert!(report.results[0]
            .message
            .starts_with(ErrorKind::Unreachable.label()));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.summary().failure_count, 1);
    }

    #[test]
    fn test_task_timeout_abandons_stuck_hosts() {
        // A listener that accepts but never speaks SSH keeps the handshake
        // blocked; the whole-task deadline must fire.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let _held: Vec<_> = listener.incoming().take(1).collect();
            std::thread::sleep(Duration::from_secs(60));
        });

        let mut config = base_config(vec![format!("127.0.0.1:{port}")]);
        config.task_timeout = Some(Duration::from_millis(500));

        let engine = TaskEngine::new(config, command_spec("uptime"));
        let report = engine.execute().unwrap();

        assert!(report.timed_out);
        assert_eq!(report.exit_code(), 3);
        assert!(report.results.len() < report.hosts.len());
    }

    #[test]
    fn test_observer_sees_streamed_results() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let config = base_config(vec![format!("127.0.0.1:{port}")]);
        let engine = TaskEngine::new(config, command_spec("uptime"))
            .with_observer(move |result| sink.lock().unwrap().push(result.host.clone()));
        let report = engine.execute().unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
