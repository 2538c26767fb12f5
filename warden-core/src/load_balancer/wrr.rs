//! Smooth weighted round robin.
//!
//! Every selection adds each backend's weight to its running "current weight",
//! picks the backend with the highest current weight and subtracts the total
//! weight from it. Over `total` selections each backend is picked exactly
//! `weight` times, and high-weight backends are interleaved with the others
//! instead of being picked in bursts: weights `[5, 1, 1]` yield
//! `a a b a c a a`.

use std::sync::{Mutex, PoisonError};

use crate::domain::backend::{Backend, SharedBackend};
use crate::error::BalancerError;

/// Weighted round-robin selector over a fixed backend list.
#[derive(Debug)]
pub struct Balancer {
    backends: Vec<SharedBackend>,
    total_weight: i64,
    /// Running current weight per backend, indexed like `backends`.
    current: Mutex<Vec<i64>>,
}

impl Balancer {
    /// Creates a balancer over `backends`, preserving their order.
    pub fn new(backends: Vec<Backend>) -> Self {
        let total_weight = backends.iter().map(|b| i64::from(b.weight)).sum();
        let current = vec![0; backends.len()];
        Self {
            backends: backends.into_iter().map(SharedBackend::new).collect(),
            total_weight,
            current: Mutex::new(current),
        }
    }

    /// Selects the next backend.
    ///
    /// Fails with [`BalancerError::Exhausted`] when no backend has a positive weight.
    pub fn select(&self) -> Result<SharedBackend, BalancerError> {
        if self.is_exhausted() {
            return Err(BalancerError::Exhausted);
        }

        // A panic while holding the lock cannot leave the weights inconsistent
        // beyond one skewed pick, so recover the guard.
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<usize> = None;
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.weight == 0 {
                continue;
            }
            current[i] += i64::from(backend.weight);
            if best.map_or(true, |b| current[i] > current[b]) {
                best = Some(i);
            }
        }

        let chosen = best.ok_or(BalancerError::Exhausted)?;
        current[chosen] -= self.total_weight;
        Ok(self.backends[chosen].clone())
    }

    /// Whether [`Balancer::select`] is guaranteed to fail.
    pub fn is_exhausted(&self) -> bool {
        self.total_weight == 0
    }

    /// All configured backends, including zero-weight ones.
    pub fn backends(&self) -> &[SharedBackend] {
        &self.backends
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
