//! Time-bucketed outcome ledger.
//!
//! A [`Timeline`] keeps one [`Counter`] per fixed-duration bucket for the last
//! `window` buckets. Buckets live in a ring indexed by `bucket % window`, so a
//! new bucket overwrites the slot of the one that fell out of the window.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

/// The observed result of one forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend answered with a status below 500.
    Success,
    /// The backend answered with a 5xx status.
    ServerError,
    /// The backend did not answer before the request deadline.
    Timeout,
    /// The backend could not be reached.
    Unreachable,
}

impl Outcome {
    /// Classifies a backend response status.
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            Outcome::ServerError
        } else {
            Outcome::Success
        }
    }

    /// Whether the outcome counts against the backend.
    pub fn is_failure(self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

/// Outcome tally for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counter {
    /// Bucket start, in milliseconds since the Unix epoch.
    pub start: u64,
    /// Responses below 500.
    pub success: u64,
    /// 5xx responses.
    pub server_error: u64,
    /// Requests that hit the deadline.
    pub timeout: u64,
    /// Requests whose backend could not be reached.
    pub unreachable: u64,
    /// How many of the outcomes above came from half-open probes.
    pub probes: u64,
    /// How many probe outcomes were failures.
    pub probe_failures: u64,
}

impl Counter {
    fn new(start: u64) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    /// All recorded outcomes.
    pub fn total(&self) -> u64 {
        self.success + self.failures()
    }

    /// Outcomes that count as failures.
    pub fn failures(&self) -> u64 {
        self.server_error + self.timeout + self.unreachable
    }

    /// Failures produced by regular, non-probe traffic.
    pub fn regular_failures(&self) -> u64 {
        self.failures().saturating_sub(self.probe_failures)
    }

    fn add(&mut self, outcome: Outcome, probe: bool) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::ServerError => self.server_error += 1,
            Outcome::Timeout => self.timeout += 1,
            Outcome::Unreachable => self.unreachable += 1,
        }
        if probe {
            self.probes += 1;
            if outcome.is_failure() {
                self.probe_failures += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    bucket: u64,
    counter: Counter,
}

/// A bounded sliding window of [`Counter`]s.
#[derive(Debug)]
pub struct Timeline {
    bucket_ms: u64,
    window: u64,
    epoch: Instant,
    epoch_unix_ms: u64,
    slots: RwLock<Vec<Option<Slot>>>,
}

impl Timeline {
    /// Creates an empty timeline with `window` buckets of `bucket` each.
    pub fn new(bucket: Duration, window: usize) -> Self {
        let window = window.max(1);
        let epoch_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            bucket_ms: (bucket.as_millis() as u64).max(1),
            window: window as u64,
            epoch: Instant::now(),
            epoch_unix_ms,
            slots: RwLock::new(vec![None; window]),
        }
    }

    /// Records one outcome into the current bucket.
    pub fn record(&self, outcome: Outcome, probe: bool) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);

        // Read the clock under the lock so buckets roll over in order.
        let bucket = self.bucket_at(Instant::now());
        let idx = (bucket % self.window) as usize;

        match &mut slots[idx] {
            Some(slot) if slot.bucket == bucket => slot.counter.add(outcome, probe),
            entry => {
                let mut counter = Counter::new(self.bucket_start(bucket));
                counter.add(outcome, probe);
                *entry = Some(Slot { bucket, counter });
            }
        }
    }

    /// Copies every live bucket, oldest first.
    pub fn snapshot(&self) -> Vec<Counter> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let current = self.bucket_at(Instant::now());

        let mut live: Vec<Slot> = slots
            .iter()
            .flatten()
            .filter(|slot| slot.bucket + self.window > current)
            .copied()
            .collect();
        drop(slots);

        live.sort_by_key(|slot| slot.bucket);
        live.into_iter().map(|slot| slot.counter).collect()
    }

    /// The current time on the same millisecond scale as [`Counter::start`].
    pub fn now_ms(&self) -> u64 {
        self.epoch_unix_ms + self.elapsed_ms(Instant::now())
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn bucket_at(&self, now: Instant) -> u64 {
        self.elapsed_ms(now) / self.bucket_ms
    }

    fn bucket_start(&self, bucket: u64) -> u64 {
        self.epoch_unix_ms + bucket * self.bucket_ms
    }
}
