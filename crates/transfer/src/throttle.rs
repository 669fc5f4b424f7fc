//! Token-bucket bandwidth throttle shared by chunk workers.
//!
//! One token is permission to move one byte. Waiters are served strictly
//! in arrival order: the fair async mutex queues them, and the waiter at the
//! head of the queue keeps the lock while it sleeps for refill.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Aggregate byte-rate ceiling.
///
/// Pass it around as `Arc<Throttle>`; an unlimited throttle never blocks.
#[derive(Debug)]
pub struct Throttle {
    bucket: Option<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    capacity: u64,
    rate: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: u64, rate: u64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate as f64).min(capacity as f64);
        self.last_refill = now;
    }
}

impl Throttle {
    /// Creates a bucket refilling at `rate` bytes/sec holding at most
    /// `capacity` bytes. The bucket starts full.
    pub fn new(rate: u64, capacity: u64) -> Self {
        let rate = rate.max(1);
        let capacity = capacity.max(1);
        Self {
            bucket: Some(Bucket {
                capacity,
                rate,
                state: Mutex::new(BucketState {
                    tokens: capacity as f64,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    /// Bucket whose capacity equals one second of traffic.
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, rate)
    }

    /// A throttle that never blocks.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Builds from an optional cap; `None` means unlimited.
    pub fn from_cap(cap: Option<u64>) -> Self {
        match cap {
            Some(rate) => Self::per_second(rate),
            None => Self::unlimited(),
        }
    }

    /// Tokens currently available (after refill). `None` when unlimited.
    pub async fn available(&self) -> Option<u64> {
        let bucket = self.bucket.as_ref()?;
        let mut state = bucket.state.lock().await;
        state.refill(bucket.capacity, bucket.rate);
        Some(state.tokens.floor() as u64)
    }

    /// Blocks until `n` tokens have been debited.
    ///
    /// Requests larger than the capacity are debited in capacity-sized
    /// slices, so they always complete and never take more than the bucket
    /// holds at once.
    pub async fn acquire(&self, n: u64) {
        let Some(bucket) = self.bucket.as_ref() else {
            return;
        };
        if n == 0 {
            return;
        }

        let mut state = bucket.state.lock().await;
        let mut remaining = n;
        while remaining > 0 {
            let slice = remaining.min(bucket.capacity);
            state.refill(bucket.capacity, bucket.rate);
            if state.tokens >= slice as f64 {
                state.tokens -= slice as f64;
                remaining -= slice;
                continue;
            }

            let deficit = slice as f64 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / bucket.rate as f64);
            trace!(
                requested = n,
                remaining,
                wait_ms = wait.as_millis() as u64,
                "throttle waiting for refill"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
