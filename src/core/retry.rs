//! Failure classification and retry/backoff policy.
//!
//! [`RetryManager::on_failure`] is a pure decision function: given a batch and
//! a classified [`FailureReason`] it answers [`RetryDecision::Requeue`] or
//! [`RetryDecision::FailJob`]. The scheduler applies the decision.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::job::Batch;

/// Coarse failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network blip, crash, timeout: retried.
    TransientWorkerFailure,
    /// Malformed input or unsupported feature: the job fails.
    PermanentJobFailure,
}

/// Classified reason a batch attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Transport failure between worker and coordinator or asset storage.
    Network(String),
    /// Worker went offline or deregistered while holding the batch.
    WorkerLost,
    /// Batch exceeded its dispatch deadline.
    Timeout,
    /// Renderer process exited abnormally.
    RendererCrash(String),
    /// Local cache/buffer exhaustion that persisted past its bound.
    ResourceExhausted(String),
    /// Scene file missing, unreadable, or malformed.
    InvalidScene(String),
    /// Renderer cannot execute a feature the scene requires.
    UnsupportedFeature(String),
    /// Nothing matched; treated as transient with a capped retry count.
    Unclassified(String),
}

impl FailureReason {
    /// Taxonomy bucket for this reason.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::InvalidScene(_) | Self::UnsupportedFeature(_) => FailureClass::PermanentJobFailure,
            Self::Network(_)
            | Self::WorkerLost
            | Self::Timeout
            | Self::RendererCrash(_)
            | Self::ResourceExhausted(_)
            | Self::Unclassified(_) => FailureClass::TransientWorkerFailure,
        }
    }

    /// Losses are the node's fault, not the batch's: they requeue without delay.
    #[must_use]
    pub const fn is_worker_loss(&self) -> bool {
        matches!(self, Self::WorkerLost | Self::Timeout)
    }

    /// Classify a free-text failure message reported by a worker.
    #[must_use]
    pub fn classify_message(message: &str) -> Self {
        const SCENE: &[&str] = &[
            "no such file",
            "not found",
            "invalid scene",
            "parse error",
            "syntax error",
            "corrupt",
        ];
        const UNSUPPORTED: &[&str] = &["unsupported", "not supported", "missing plugin", "unknown node"];
        const NETWORK: &[&str] = &["connection", "network", "unreachable", "broken pipe", "dns"];
        const CRASH: &[&str] = &["crash", "segfault", "segmentation fault", "exit code", "killed", "signal"];
        const RESOURCE: &[&str] = &["out of memory", "buffer pool", "cache full", "no space left"];

        let lower = message.to_ascii_lowercase();
        let hit = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        let detail = message.to_string();

        if hit(UNSUPPORTED) {
            Self::UnsupportedFeature(detail)
        } else if hit(SCENE) {
            Self::InvalidScene(detail)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if hit(NETWORK) {
            Self::Network(detail)
        } else if hit(RESOURCE) {
            Self::ResourceExhausted(detail)
        } else if hit(CRASH) {
            Self::RendererCrash(detail)
        } else {
            Self::Unclassified(detail)
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(d) => write!(f, "network error: {d}"),
            Self::WorkerLost => f.write_str("worker lost"),
            Self::Timeout => f.write_str("dispatch timeout"),
            Self::RendererCrash(d) => write!(f, "renderer crashed: {d}"),
            Self::ResourceExhausted(d) => write!(f, "resource exhausted: {d}"),
            Self::InvalidScene(d) => write!(f, "invalid scene: {d}"),
            Self::UnsupportedFeature(d) => write!(f, "unsupported feature: {d}"),
            Self::Unclassified(d) => write!(f, "unclassified failure: {d}"),
        }
    }
}

/// Exponential backoff: delay for attempt `n` is `first × factor^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(5),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 0-indexed retry attempt.
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Outcome of [`RetryManager::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the batch to pending after `delay`.
    Requeue {
        /// Backoff before the batch becomes eligible again.
        delay: Duration,
    },
    /// Fail the batch and its job terminally.
    FailJob,
}

/// Retry policy invoked by the scheduler on batch failure or worker loss.
#[derive(Debug, Clone)]
pub struct RetryManager {
    max_retries: u32,
    unclassified_retry_cap: u32,
    backoff: BackoffPolicy,
}

impl RetryManager {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_retries: u32, unclassified_retry_cap: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            unclassified_retry_cap,
            backoff,
        }
    }

    /// Configured retry bound.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide whether a failed attempt of `batch` is requeued or fails the job.
    ///
    /// `batch.attempts` is the count before this failure, so a batch whose
    /// every attempt fails transiently runs exactly `max_retries + 1` times.
    #[must_use]
    pub fn on_failure(&self, batch: &Batch, reason: &FailureReason) -> RetryDecision {
        if reason.class() == FailureClass::PermanentJobFailure {
            return RetryDecision::FailJob;
        }
        let limit = match reason {
            FailureReason::Unclassified(_) => self.max_retries.min(self.unclassified_retry_cap),
            _ => self.max_retries,
        };
        if batch.attempts >= limit {
            return RetryDecision::FailJob;
        }
        let delay = if reason.is_worker_loss() {
            Duration::ZERO
        } else {
            self.backoff.next(batch.attempts)
        };
        RetryDecision::Requeue { delay }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(3, 2, BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{Job, JobSpec};
    use crate::util::serde::{FrameRange, RendererKind};

    fn batch_with_attempts(attempts: u32) -> Batch {
        let spec = JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 10).unwrap());
        let job = Job::from_spec(&spec, 0);
        let mut batch = Batch::new(&job, 0, spec.frames, 0);
        batch.attempts = attempts;
        batch
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        };
        assert_eq!(backoff.next(0), Duration::from_millis(100));
        assert_eq!(backoff.next(1), Duration::from_millis(200));
        assert_eq!(backoff.next(10), Duration::from_secs(1));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn transient_failures_requeue_until_exhausted() {
        let retry = RetryManager::new(2, 1, BackoffPolicy::default());
        let reason = FailureReason::RendererCrash("exit code 139".into());
        assert!(matches!(retry.on_failure(&batch_with_attempts(0), &reason), RetryDecision::Requeue { .. }));
        assert!(matches!(retry.on_failure(&batch_with_attempts(1), &reason), RetryDecision::Requeue { .. }));
        assert_eq!(retry.on_failure(&batch_with_attempts(2), &reason), RetryDecision::FailJob);
    }

    #[test]
    fn permanent_failure_fails_immediately() {
        let retry = RetryManager::default();
        let reason = FailureReason::InvalidScene("comp.nk".into());
        assert_eq!(retry.on_failure(&batch_with_attempts(0), &reason), RetryDecision::FailJob);
    }

    #[test]
    fn unclassified_failures_use_the_lower_cap() {
        let retry = RetryManager::new(5, 1, BackoffPolicy::default());
        let reason = FailureReason::Unclassified("???".into());
        assert!(matches!(retry.on_failure(&batch_with_attempts(0), &reason), RetryDecision::Requeue { .. }));
        assert_eq!(retry.on_failure(&batch_with_attempts(1), &reason), RetryDecision::FailJob);
    }

    #[test]
    fn worker_loss_requeues_without_delay() {
        let retry = RetryManager::default();
        let decision = retry.on_failure(&batch_with_attempts(1), &FailureReason::WorkerLost);
        assert_eq!(decision, RetryDecision::Requeue { delay: Duration::ZERO });
    }

    #[test]
    fn classify_common_messages() {
        assert!(matches!(
            FailureReason::classify_message("Connection reset by peer"),
            FailureReason::Network(_)
        ));
        assert!(matches!(
            FailureReason::classify_message("ERROR: comp.nk: No such file or directory"),
            FailureReason::InvalidScene(_)
        ));
        assert!(matches!(
            FailureReason::classify_message("Render timed out after 1800s"),
            FailureReason::Timeout
        ));
        assert!(matches!(
            FailureReason::classify_message("node type Foo is not supported"),
            FailureReason::UnsupportedFeature(_)
        ));
        assert!(matches!(
            FailureReason::classify_message("process killed by signal 9"),
            FailureReason::RendererCrash(_)
        ));
        assert!(matches!(
            FailureReason::classify_message("weird"),
            FailureReason::Unclassified(_)
        ));
    }
}
