use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use haul_protocol::{JobId, ProgressEvent};
use tokio::time::Instant;

/// Default minimum spacing between progress notifications.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with coalesced progress.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Coalesces per-chunk progress of one job into rate-limited events.
///
/// Reported byte counts never decrease, even if callers report out of
/// order.
pub struct ProgressReporter {
    job_id: JobId,
    total: u64,
    interval: Duration,
    callback: ProgressCallback,
    inner: Mutex<ReporterInner>,
}

struct ReporterInner {
    completed: u64,
    last_emitted: Option<u64>,
    last_emit_at: Option<Instant>,
}

impl ProgressReporter {
    /// Creates a reporter for a job of `total` bytes.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(
        job_id: JobId,
        total: u64,
        interval: Option<Duration>,
        callback: ProgressCallback,
    ) -> Self {
        Self {
            job_id,
            total,
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            callback,
            inner: Mutex::new(ReporterInner {
                completed: 0,
                last_emitted: None,
                last_emit_at: None,
            }),
        }
    }

    /// Bytes completed so far (highest value reported).
    pub fn completed(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
    }

    /// Records the absolute number of completed bytes.
    ///
    /// Emits an event if the interval has elapsed since the last one.
    pub fn record(&self, bytes_completed: u64) {
        let event = {
            let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            s.completed = s.completed.max(bytes_completed.min(self.total));
            let now = Instant::now();
            let due = s
                .last_emit_at
                .is_none_or(|at| now.duration_since(at) >= self.interval);
            if !due || s.last_emitted == Some(s.completed) {
                return;
            }
            s.last_emitted = Some(s.completed);
            s.last_emit_at = Some(now);
            self.event(s.completed)
        };
        (self.callback)(event);
    }

    /// Emits the current count unless it was already the last one emitted.
    pub fn flush(&self) {
        let event = {
            let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if s.last_emitted == Some(s.completed) {
                return;
            }
            s.last_emitted = Some(s.completed);
            s.last_emit_at = Some(Instant::now());
            self.event(s.completed)
        };
        (self.callback)(event);
    }

    fn event(&self, completed: u64) -> ProgressEvent {
        ProgressEvent {
            job_id: self.job_id.clone(),
            bytes_completed: completed,
            bytes_total: self.total,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collecting(total: u64, interval: Duration) -> (ProgressReporter, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let reporter = ProgressReporter::new(
            JobId::from("job"),
            total,
            Some(interval),
            Box::new(move |ev| s.lock().unwrap().push(ev.bytes_completed)),
        );
        (reporter, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_within_interval() {
        let (r, seen) = collecting(100, Duration::from_millis(500));
        r.record(10);
        r.record(20);
        r.record(30);
        assert_eq!(*seen.lock().unwrap(), vec![10]);

        tokio::time::advance(Duration::from_millis(600)).await;
        r.record(40);
        assert_eq!(*seen.lock().unwrap(), vec![10, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_decreases() {
        let (r, seen) = collecting(100, Duration::ZERO);
        r.record(50);
        r.record(20);
        r.record(70);
        assert_eq!(*seen.lock().unwrap(), vec![50, 70]);
        assert_eq!(r.completed(), 70);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_emits_final_value_once() {
        let (r, seen) = collecting(100, Duration::from_secs(10));
        r.record(10);
        r.record(100);
        r.flush();
        r.flush();
        assert_eq!(*seen.lock().unwrap(), vec![10, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn clamps_to_total() {
        let (r, _) = collecting(100, Duration::ZERO);
        r.record(150);
        assert_eq!(r.completed(), 100);
    }
}
