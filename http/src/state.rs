//! Per-IP rate limiting and the live SSE connection count, the HTTP
//! adapter's analogue of the websocket adapter's `Registry` — there is no
//! persistent per-client connection object for a bare request/response
//! cycle, so bookkeeping is keyed by address instead.

use crate::ratelimit::RateLimiter;
use dashmap::DashMap;
use lens_core::LensConfig;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    limiters: DashMap<IpAddr, Arc<RateLimiter>>,
    sse_connections: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn allow(&self, ip: IpAddr, config: &LensConfig) -> bool {
        self.limiters.entry(ip).or_insert_with(|| Arc::new(RateLimiter::new(&config.rate_limit))).allow()
    }

    pub fn sse_connection_count(&self) -> usize { self.sse_connections.load(Ordering::Relaxed) }

    /// Reserves one SSE slot, returning a guard that releases it on drop.
    /// Returns `None` if `max_connections` is already reached.
    pub fn try_reserve_sse(self: &Arc<Self>, max_connections: usize) -> Option<SseGuard> {
        if self.sse_connections.fetch_add(1, Ordering::AcqRel) >= max_connections {
            self.sse_connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(SseGuard { registry: self.clone() })
    }
}

pub struct SseGuard {
    registry: Arc<Registry>,
}

impl Drop for SseGuard {
    fn drop(&mut self) { self.registry.sse_connections.fetch_sub(1, Ordering::AcqRel); }
}
