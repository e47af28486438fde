//! Bounded concurrent fan-out
//!
//! Dispatches the host list FIFO to K worker threads over a bounded
//! channel and streams results back on a channel sized to the host count,
//! so result sends never block a worker. A panic inside one host's
//! execution is converted into a classified failure and cannot stop the
//! pool.

use crate::error::{Result, RunnerError};
use crate::task::HostResult;
use crossbeam::channel::{bounded, Receiver};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Counters observed by the orchestrator and by tests
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Hosts handed to a worker
    pub dispatched: AtomicU64,
    /// Results produced (success or failure)
    pub completed: AtomicU64,
    /// Hosts currently executing
    pub in_flight: AtomicUsize,
    /// High-water mark of concurrent executions
    pub max_in_flight: AtomicUsize,
}

impl PoolStats {
    fn enter(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Worker pool with a fixed parallelism cap
pub struct TaskPool {
    concurrency: usize,
}

impl TaskPool {
    /// The cap is clamped to at least one worker
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Effective parallelism cap
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fan `job` out over `hosts`. Exactly one result per host is emitted
    /// unless the receiver is dropped early (whole-task deadline), in which
    /// case remaining workers stop at their next send.
    pub fn run<F>(
        &self,
        hosts: Vec<String>,
        job: F,
    ) -> (Receiver<HostResult>, Vec<thread::JoinHandle<()>>, Arc<PoolStats>)
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        let n = hosts.len();
        let (host_tx, host_rx) = bounded::<String>(n.max(1));
        let (result_tx, result_rx) = bounded::<HostResult>(n.max(1));
        let job = Arc::new(job);
        let stats = Arc::new(PoolStats::default());

        // The dispatch channel holds the whole list, so feeding it here
        // keeps FIFO order without a dedicated dispatch thread.
        for host in hosts {
            let _ = host_tx.send(host);
        }
        drop(host_tx);

        let mut handles = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let host_rx = host_rx.clone();
            let result_tx = result_tx.clone();
            let job = Arc::clone(&job);
            let stats = Arc::clone(&stats);

            let handle = thread::Builder::new()
                .name(format!("parssh-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(host) = host_rx.recv() {
                        stats.enter();
                        let outcome =
                            std::panic::catch_unwind(AssertUnwindSafe(|| job(&host)));
                        stats.leave();

                        let result = match outcome {
                            Ok(Ok(output)) => HostResult::success(&host, output),
                            Ok(Err(error)) => HostResult::failure(&host, &error),
                            Err(panic) => HostResult::failure(
                                &host,
                                &RunnerError::Unknown(panic_message(panic)),
                            ),
                        };

                        // A closed sink means the task deadline fired.
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                    debug!("worker {worker_id} drained");
                })
                .expect("spawning worker thread");

            handles.push(handle);
        }

        (result_rx, handles, stats)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn hostnames(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("host{i:02}")).collect()
    }

    #[test]
    fn test_one_result_per_host() {
        let pool = TaskPool::new(4);
        let (rx, handles, _stats) =
            pool.run(hostnames(25), |host| Ok(format!("ran on {host}")));

        let results: Vec<_> = rx.iter().collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(results.len(), 25);
        let unique: HashSet<_> = results.iter().map(|r| r.host.clone()).collect();
        assert_eq!(unique.len(), 25);
        assert!(results.iter().all(|r| r.is_success()));
    }

    #[test]
    fn test_parallelism_cap_is_honored() {
        let pool = TaskPool::new(3);
        let (rx, handles, stats) = pool.run(hostnames(20), |_| {
            thread::sleep(Duration::from_millis(10));
            Ok(String::new())
        });

        let results: Vec<_> = rx.iter().collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(results.len(), 20);
        assert!(stats.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_minimum_one_worker() {
        assert_eq!(TaskPool::new(0).concurrency(), 1);
    }

    #[test]
    fn test_panic_is_isolated_to_its_host() {
        let pool = TaskPool::new(2);
        let (rx, handles, _stats) = pool.run(hostnames(6), |host| {
            if host == "host03" {
                panic!("boom on {host}");
            }
            Ok("ok".to_string())
        });

        let results: Vec<_> = rx.iter().collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(results.len(), 6);
        let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].host, "host03");
        assert!(failed[0].message.contains("panicked"));
    }

    #[test]
    fn test_dropped_receiver_stops_workers() {
        let pool = TaskPool::new(2);
        let (rx, handles, _stats) = pool.run(hostnames(50), |_| {
            thread::sleep(Duration::from_millis(5));
            Ok(String::new())
        });

        // Simulate the whole-task deadline closing the sink early.
        let first = rx.recv().unwrap();
        assert!(first.is_success());
        drop(rx);

        // Workers notice the closed sink and exit instead of hanging.
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
