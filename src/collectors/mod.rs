//! C4 — source collectors.
//!
//! Every source (an odds API, a schedule API, an HTML page) implements
//! the same `Collector` trait so the orchestrator can treat them
//! uniformly: `test_connection` for startup/health checks, `collect` for
//! one poll, `cleanup` for releasing any per-collector resources on
//! shutdown. Individual collectors are grounded in the teacher's
//! `fetch_events` / `fetch_event_h1_odds` HTTP pattern, generalized past
//! its single hard-coded provider.

pub mod html;
pub mod odds_api;
pub mod schedule;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::RawCollectionRecord;

/// Named return shape for one `collect()` pass: the records plus the
/// metadata C6's latency-based failure detection and the request
/// accounting in `/metrics` both need. `success`/`errors` here are
/// distinct from the outer `Result` a collector returns — the outer
/// `Result` is reserved for the call not completing at all (network
/// error, timeout); a completed call that came back thin or partially
/// malformed is still `Ok`, with `success=false` and `errors` populated,
/// the same "collect never silently returns empty data on failure"
/// posture the original observes for its fetch functions.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub success: bool,
    pub data: Vec<RawCollectionRecord>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<String>,
    pub response_time_ms: u64,
    pub request_count: u32,
}

impl CollectionResult {
    pub fn success(
        source: impl Into<String>,
        data: Vec<RawCollectionRecord>,
        response_time_ms: u64,
        request_count: u32,
    ) -> Self {
        Self {
            success: true,
            data,
            source: source.into(),
            timestamp: Utc::now(),
            errors: Vec::new(),
            response_time_ms,
            request_count,
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_name(&self) -> &str;

    /// Lightweight reachability check, used at startup and by the health
    /// surface; must not count against the source's own rate limit.
    async fn test_connection(&self) -> Result<bool>;

    /// One collection pass.
    async fn collect(&self) -> Result<CollectionResult>;

    /// Releases any per-collector resources (connection pools, cached
    /// auth tokens). Called once during graceful shutdown.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
