//! Batched remote existence checks for requests no rule could resolve.
//!
//! One probe invocation answers a whole batch of candidates. Transient
//! failures are retried with a fixed backoff; a permanent authentication
//! failure opens the run-wide [`CircuitBreaker`] and every later batch
//! becomes a no-op.

mod breaker;
pub mod command;

pub use breaker::CircuitBreaker;

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdnarchive_config::ProbeConfig;
use cdnarchive_core::UnresolvedCandidate;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::side_channel::SideChannel;
use command::{
    build_script, classify_failure, confined_to_root, parse_reply, server_path, FailureKind,
};

/// Base probe timeout before the per-candidate allowance is added.
const BASE_TIMEOUT: Duration = Duration::from_secs(1);
const PER_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Checked { existing: usize, missing: usize },
    Disabled,
    CircuitOpen,
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub batches: u64,
    pub candidates: u64,
    pub invocations: u64,
    pub existing: u64,
    pub missing: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    candidates: AtomicU64,
    invocations: AtomicU64,
    existing: AtomicU64,
    missing: AtomicU64,
    skipped: AtomicU64,
}

enum ProbeFailure {
    Permanent(String),
    Transient(String),
}

pub struct ExistenceBatcher {
    config: ProbeConfig,
    breaker: Arc<CircuitBreaker>,
    side_channel: Arc<SideChannel>,
    in_flight: Mutex<()>,
    counters: Counters,
}

impl ExistenceBatcher {
    pub fn new(
        config: ProbeConfig,
        breaker: Arc<CircuitBreaker>,
        side_channel: Arc<SideChannel>,
    ) -> Self {
        Self {
            config,
            breaker,
            side_channel,
            in_flight: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Candidate for a request, with the server path derived from the probe root.
    pub fn candidate(&self, host: &str, path: &str) -> UnresolvedCandidate {
        UnresolvedCandidate {
            host: host.to_string(),
            path: path.to_string(),
            server_path: server_path(&self.config.server_root, host, path),
        }
    }

    /// `min(max_timeout, 1s + 1s * batch_len)`
    pub fn timeout_for(&self, batch_len: usize) -> Duration {
        let scaled = BASE_TIMEOUT + PER_CANDIDATE_TIMEOUT * batch_len as u32;
        scaled.min(self.config.max_timeout())
    }

    pub fn stats(&self) -> ProbeStats {
        let c = &self.counters;
        ProbeStats {
            batches: c.batches.load(Ordering::Relaxed),
            candidates: c.candidates.load(Ordering::Relaxed),
            invocations: c.invocations.load(Ordering::Relaxed),
            existing: c.existing.load(Ordering::Relaxed),
            missing: c.missing.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
        }
    }

    /// Check one batch. Never fails: every degraded path is reported in the
    /// outcome and the counters.
    pub async fn check(&self, candidates: Vec<UnresolvedCandidate>) -> BatchOutcome {
        if candidates.is_empty() {
            return BatchOutcome::Checked {
                existing: 0,
                missing: 0,
            };
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .candidates
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);

        if !self.config.enabled {
            self.skip(candidates.len());
            return BatchOutcome::Disabled;
        }
        if self.breaker.is_open() {
            self.skip(candidates.len());
            return BatchOutcome::CircuitOpen;
        }

        let (candidates, rejected): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| {
            !c.server_path.contains(['\n', '\r']) && confined_to_root(&c.host, &c.path)
        });
        if !rejected.is_empty() {
            warn!(
                count = rejected.len(),
                "Skipping probe candidates with newlines or dot segments in the path"
            );
            self.skip(rejected.len());
        }
        if candidates.is_empty() {
            return BatchOutcome::Checked {
                existing: 0,
                missing: 0,
            };
        }

        let paths: Vec<&str> = candidates.iter().map(|c| c.server_path.as_str()).collect();
        let script = match build_script(&paths) {
            Ok(script) => script,
            Err(e) => {
                warn!(error = %e, "Could not assemble probe script");
                self.skip(candidates.len());
                return BatchOutcome::GaveUp { attempts: 0 };
            }
        };
        let timeout = self.timeout_for(candidates.len());
        let max_attempts = self.config.max_retries.saturating_add(1);

        // One probe in flight at a time.
        let _guard = self.in_flight.lock().await;

        for attempt in 1..=max_attempts {
            if self.breaker.is_open() {
                self.skip(candidates.len());
                return BatchOutcome::CircuitOpen;
            }

            match self.invoke(&script, timeout).await {
                Ok(stdout) => return self.record_reply(&candidates, &stdout).await,
                Err(ProbeFailure::Permanent(reason)) => {
                    self.breaker.trip(&reason);
                    self.skip(candidates.len());
                    return BatchOutcome::CircuitOpen;
                }
                Err(ProbeFailure::Transient(reason)) => {
                    warn!(attempt, max_attempts, reason = %reason, "Existence probe failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff()).await;
                    }
                }
            }
        }

        warn!(
            candidates = candidates.len(),
            attempts = max_attempts,
            "Giving up on existence probe batch"
        );
        self.skip(candidates.len());
        BatchOutcome::GaveUp {
            attempts: max_attempts,
        }
    }

    async fn invoke(&self, script: &str, timeout: Duration) -> Result<String, ProbeFailure> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                return Err(ProbeFailure::Transient(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )))
            }
            Ok(Err(e)) => {
                return Err(ProbeFailure::Transient(format!(
                    "failed to start '{}': {e}",
                    self.config.program
                )))
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        match classify_failure(output.status.code(), stderr) {
            FailureKind::Permanent => Err(ProbeFailure::Permanent(format!(
                "{}: {stderr}",
                output.status
            ))),
            FailureKind::Transient => Err(ProbeFailure::Transient(format!(
                "{}: {stderr}",
                output.status
            ))),
        }
    }

    async fn record_reply(
        &self,
        candidates: &[UnresolvedCandidate],
        stdout: &str,
    ) -> BatchOutcome {
        let reply = parse_reply(stdout);
        let mut existing = 0;
        let mut unanswered = 0;
        for candidate in candidates {
            if !reply.answered(&candidate.server_path) {
                unanswered += 1;
            } else if reply.existing.contains(&candidate.server_path) {
                existing += 1;
                self.side_channel
                    .record_remote_exists(&candidate.host, &candidate.path, &candidate.server_path)
                    .await;
            }
        }

        let missing = candidates.len() - existing - unanswered;
        if unanswered > 0 || reply.unrecognized > 0 {
            debug!(unanswered, unrecognized = reply.unrecognized, "Incomplete probe reply");
        }
        self.counters
            .existing
            .fetch_add(existing as u64, Ordering::Relaxed);
        self.counters
            .missing
            .fetch_add(missing as u64, Ordering::Relaxed);
        self.counters
            .skipped
            .fetch_add(unanswered as u64, Ordering::Relaxed);

        BatchOutcome::Checked { existing, missing }
    }

    fn skip(&self, count: usize) {
        self.counters
            .skipped
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> ProbeConfig {
        ProbeConfig {
            enabled: true,
            program: "sh".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            max_retries: 0,
            retry_backoff_secs: 0,
            ..ProbeConfig::default()
        }
    }

    fn batcher(config: ProbeConfig, dir: &std::path::Path) -> ExistenceBatcher {
        ExistenceBatcher::new(
            config,
            Arc::new(CircuitBreaker::new()),
            Arc::new(SideChannel::new(dir.join("side"))),
        )
    }

    #[tokio::test]
    async fn existing_paths_go_to_the_side_channel() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("www");
        std::fs::create_dir_all(root.join("a.example/v")).unwrap();
        std::fs::write(root.join("a.example/v/it's here.mp4"), b"x").unwrap();

        let mut cfg = config(&["-c"]);
        cfg.server_root = root.display().to_string();
        let batcher = batcher(cfg, dir.path());

        let outcome = batcher
            .check(vec![
                batcher.candidate("a.example", "/v/it's here.mp4"),
                batcher.candidate("a.example", "/v/gone.mp4"),
            ])
            .await;
        assert_eq!(
            outcome,
            BatchOutcome::Checked {
                existing: 1,
                missing: 1
            }
        );

        let log = std::fs::read_to_string(dir.path().join("side/remote_exists.log")).unwrap();
        assert!(log.starts_with("a.example\t/v/it's here.mp4\t"));
        assert_eq!(log.lines().count(), 1);
        assert_eq!(batcher.stats().invocations, 1);
    }

    #[tokio::test]
    async fn dot_segments_never_reach_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("www");
        std::fs::create_dir_all(root.join("a.example")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"x").unwrap();

        let mut cfg = config(&["-c"]);
        cfg.server_root = root.display().to_string();
        let batcher = batcher(cfg, dir.path());

        let outcome = batcher
            .check(vec![
                batcher.candidate("a.example", "/../../secret.txt"),
                batcher.candidate("..", "/secret.txt"),
            ])
            .await;
        assert_eq!(
            outcome,
            BatchOutcome::Checked {
                existing: 0,
                missing: 0
            }
        );
        assert_eq!(batcher.stats().skipped, 2);
        assert_eq!(batcher.stats().invocations, 0);
        assert!(!dir.path().join("side/remote_exists.log").exists());
    }

    #[tokio::test]
    async fn disabled_probe_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&["-c"]);
        cfg.enabled = false;
        let batcher = batcher(cfg, dir.path());

        let outcome = batcher.check(vec![batcher.candidate("a", "/x")]).await;
        assert_eq!(outcome, BatchOutcome::Disabled);
        assert_eq!(batcher.stats().invocations, 0);
        assert_eq!(batcher.stats().skipped, 1);
    }

    #[tokio::test]
    async fn auth_failure_opens_the_breaker_once() {
        let dir = tempfile::tempdir().unwrap();
        // The generated script lands in $0 and is ignored.
        let mut cfg = config(&["-c", "echo 'git@host: Permission denied (publickey).' >&2; exit 1"]);
        cfg.max_retries = 5;
        let batcher = batcher(cfg, dir.path());

        for _ in 0..3 {
            let outcome = batcher.check(vec![batcher.candidate("a", "/x")]).await;
            assert_eq!(outcome, BatchOutcome::CircuitOpen);
        }
        assert_eq!(batcher.stats().invocations, 1);
        assert!(batcher.breaker.is_open());
        assert!(!batcher.breaker.trip("again"));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&["-c", "echo 'Connection reset' >&2; exit 3"]);
        cfg.max_retries = 2;
        let batcher = batcher(cfg, dir.path());

        let outcome = batcher.check(vec![batcher.candidate("a", "/x")]).await;
        assert_eq!(outcome, BatchOutcome::GaveUp { attempts: 3 });
        assert_eq!(batcher.stats().invocations, 3);
        assert!(!batcher.breaker.is_open());
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&["-c", "sleep 5"]);
        cfg.max_timeout_secs = 1;
        let batcher = batcher(cfg, dir.path());

        let started = std::time::Instant::now();
        let outcome = batcher.check(vec![batcher.candidate("a", "/x")]).await;
        assert_eq!(outcome, BatchOutcome::GaveUp { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_scales_with_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let batcher = batcher(ProbeConfig::default(), dir.path());
        assert_eq!(batcher.timeout_for(1), Duration::from_secs(2));
        assert_eq!(batcher.timeout_for(30), Duration::from_secs(31));
        assert_eq!(batcher.timeout_for(500), Duration::from_secs(60));
    }
}
