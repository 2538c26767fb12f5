//! Lock-free hot pool implementation using DashMap and SegQueue.

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;

use crate::ProxyBody;

/// Idle senders kept per backend before extra ones are dropped.
const DEFAULT_MAX_IDLE: usize = 64;

/// A lock-free pool of idle HTTP/1.1 senders, keyed by backend authority.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    idle_connections: Arc<DashMap<String, Arc<SegQueue<SendRequest<ProxyBody>>>>>,
    max_idle: usize,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl ConnectionPool {
    /// Creates an empty pool holding at most `max_idle` senders per backend.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle_connections: Arc::new(DashMap::new()),
            max_idle,
        }
    }

    /// Pops an idle sender to `addr` that can take a request right away.
    ///
    /// Closed senders are discarded. Senders still busy with a previous
    /// response body are put back.
    pub fn try_pop(&self, addr: &str) -> Option<SendRequest<ProxyBody>> {
        let queue = self.idle_connections.get(addr)?.value().clone();
        let mut busy = Vec::new();
        let mut found = None;

        while let Some(sender) = queue.pop() {
            if sender.is_closed() {
                continue;
            }
            if sender.is_ready() {
                found = Some(sender);
                break;
            }
            busy.push(sender);
        }

        for sender in busy {
            queue.push(sender);
        }
        found
    }

    /// Returns a sender to the pool for reuse.
    pub fn push(&self, addr: &str, sender: SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        let queue = match self.idle_connections.get(addr) {
            Some(queue) => queue.value().clone(),
            None => self
                .idle_connections
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(SegQueue::new()))
                .value()
                .clone(),
        };

        if queue.len() < self.max_idle {
            queue.push(sender);
        }
    }

    /// Number of pooled senders for `addr`, including busy ones.
    pub fn idle(&self, addr: &str) -> usize {
        self.idle_connections
            .get(addr)
            .map_or(0, |queue| queue.len())
    }
}
