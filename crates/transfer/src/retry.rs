//! Retry/backoff decisions for failed chunk attempts.

use std::io;
use std::time::Duration;

use haul_protocol::{ChunkRecord, ErrorClass, RetryPolicy};
use rand::Rng;

/// Outcome of [`RetryController::decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry(Duration),
    /// Stop retrying this chunk.
    GiveUp(String),
}

/// Applies a [`RetryPolicy`] to classified chunk failures.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `attempts` (1-based), without jitter.
    ///
    /// `base * multiplier^(attempts-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(63) as i32;
        let secs = self.policy.base_backoff.as_secs_f64() * self.policy.multiplier.powi(exp);
        let capped = secs.min(self.policy.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.policy.jitter.clamp(0.0, 1.0);
        if fraction == 0.0 || delay.is_zero() {
            return delay;
        }
        let offset: f64 = rand::thread_rng().gen_range(-fraction..=fraction);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + offset)).max(0.0))
    }

    /// Decides what to do after `chunk` failed with `class`.
    ///
    /// `chunk` is the record as it stood during the failed attempt:
    /// `attempts` already counts that attempt and `mismatches` counts only
    /// the earlier ones.
    pub fn decide(&self, chunk: &ChunkRecord, class: ErrorClass) -> RetryDecision {
        self.decide_attempt(chunk.attempts, chunk.mismatches, class)
            .map_reason(|reason| format!("chunk {}: {reason}", chunk.index))
    }

    /// Same rules as [`decide`](Self::decide) for operations that are not
    /// tied to a chunk record. `prior_mismatches` counts earlier attempts
    /// that failed verification.
    pub fn decide_attempt(
        &self,
        attempts: u32,
        prior_mismatches: u32,
        class: ErrorClass,
    ) -> RetryDecision {
        match class {
            ErrorClass::InvalidRequest | ErrorClass::Permanent => {
                return RetryDecision::GiveUp(format!("{class} error"));
            }
            ErrorClass::IntegrityMismatch if prior_mismatches > 0 => {
                return RetryDecision::GiveUp(
                    "integrity verification failed after a fresh re-fetch".into(),
                );
            }
            ErrorClass::IntegrityMismatch | ErrorClass::Transient => {}
        }

        if attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp(format!(
                "exhausted {attempts} attempts (last error: {class})"
            ));
        }
        RetryDecision::Retry(self.jittered(self.backoff(attempts)))
    }
}

impl RetryDecision {
    fn map_reason(self, f: impl FnOnce(String) -> String) -> Self {
        match self {
            RetryDecision::GiveUp(reason) => RetryDecision::GiveUp(f(reason)),
            retry => retry,
        }
    }
}

/// Classifies a local or network I/O error.
pub fn classify_io(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;
    match err.kind() {
        TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe
        | Interrupted | WouldBlock | UnexpectedEof | NotConnected => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}
