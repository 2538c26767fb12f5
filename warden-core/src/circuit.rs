//! Circuit state derived from a timeline snapshot.
//!
//! The state is never stored. Every admission recomputes it from the live
//! buckets:
//!
//! 1. With fewer than `min_samples` outcomes, or an error rate at or below
//!    `open_threshold`, the circuit is closed.
//! 2. Otherwise it tripped. The newest bucket holding a regular (non-probe)
//!    failure anchors the cooldown at the end of that bucket. The anchor is the
//!    newest failing bucket, not the oldest live one, so a backend that keeps
//!    failing stays open.
//! 3. Probe outcomes recorded after the anchor are folded into rounds of
//!    `probe_quota`. A round with an error rate below `close_threshold` closes the
//!    circuit; a worse round moves the anchor to the end of the bucket that
//!    completed it.
//! 4. Before `anchor + cooldown` the circuit is open, after it half-open.

use crate::config::BreakerConfig;
use crate::timeline::Counter;

/// Admission state of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Forward everything.
    Closed,
    /// Reject everything.
    Open {
        /// When probing may start, on the [`Counter::start`] clock.
        until_ms: u64,
    },
    /// Forward up to the probe quota, reject the rest.
    HalfOpen {
        /// Identifies the probe round: its cooldown anchor.
        round: u64,
    },
}

impl CircuitState {
    /// Lower-case name used in logs and the admin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

fn rate(failures: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        failures as f64 / total as f64
    }
}

/// Computes the circuit state from buckets ordered oldest first.
pub fn evaluate(counters: &[Counter], now_ms: u64, config: &BreakerConfig) -> CircuitState {
    let total: u64 = counters.iter().map(Counter::total).sum();
    let failures: u64 = counters.iter().map(Counter::failures).sum();

    if total < config.min_samples || rate(failures, total) <= config.open_threshold {
        return CircuitState::Closed;
    }

    let trip = counters
        .iter()
        .rposition(|c| c.regular_failures() > 0)
        .or_else(|| counters.iter().rposition(|c| c.failures() > 0));
    let Some(trip) = trip else {
        return CircuitState::Closed;
    };

    let bucket_ms = config.bucket_ms();
    let mut anchor = counters[trip].start + bucket_ms;
    let mut probes = 0;
    let mut probe_failures = 0;

    for counter in &counters[trip + 1..] {
        probes += counter.probes;
        probe_failures += counter.probe_failures;

        if probes >= config.probe_quota {
            if rate(probe_failures, probes) < config.close_threshold {
                return CircuitState::Closed;
            }
            anchor = counter.start + bucket_ms;
            probes = 0;
            probe_failures = 0;
        }
    }

    let until_ms = anchor + config.cooldown_ms();
    if now_ms < until_ms {
        CircuitState::Open { until_ms }
    } else {
        CircuitState::HalfOpen { round: anchor }
    }
}
