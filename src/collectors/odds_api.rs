//! Generalized odds-API collector.
//!
//! Carries over the teacher's `OddsApiEvent`/`Bookmaker`/`Market`/
//! `Outcome` wire shape and its `fetch_events` HTTP pattern — query-string
//! auth, `x-requests-remaining` header logging, american odds format —
//! but parameterizes the sport key, market set, and bookmaker allowlist
//! instead of hard-coding one NCAA basketball configuration. Gates its
//! own HTTP calls with a `governor` token bucket the way the teacher
//! gates `fetch_events`/`fetch_event_h1_odds`; the richer per-source
//! admission policy in `rate_limiter` sits in front of this at the
//! orchestrator level.

use std::num::NonZeroU32;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::Deserialize;
use tracing::{info, warn};

use super::{Collector, CollectionResult};
use crate::error::{PipelineError, Result};
use crate::types::RawCollectionRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct OddsApiEvent {
    pub id: String,
    pub sport_key: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub price: Option<i32>,
    pub point: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OddsApiConfig {
    pub source_name: String,
    pub api_key: String,
    pub sport_key: String,
    pub markets: String,
    pub bookmakers: String,
    pub requests_per_minute: u32,
}

type GovernorDirect =
    GovernorRateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

pub struct OddsApiCollector {
    config: OddsApiConfig,
    http_client: reqwest::Client,
    rate_limiter: GovernorDirect,
}

impl OddsApiCollector {
    pub fn new(config: OddsApiConfig, http_client: reqwest::Client) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.requests_per_minute.max(1)).expect("nonzero by construction"),
        );
        Self {
            config,
            http_client,
            rate_limiter: GovernorRateLimiter::direct(quota),
        }
    }

    async fn fetch_events(&self) -> Result<Vec<OddsApiEvent>> {
        self.rate_limiter.until_ready().await;

        let url = format!(
            "https://api.the-odds-api.com/v4/sports/{}/odds",
            self.config.sport_key
        );

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("apiKey", self.config.api_key.as_str()),
                ("regions", "us"),
                ("markets", self.config.markets.as_str()),
                ("bookmakers", self.config.bookmakers.as_str()),
                ("oddsFormat", "american"),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;

        if let Some(remaining) = response.headers().get("x-requests-remaining") {
            info!(
                source = %self.config.source_name,
                remaining = remaining.to_str().unwrap_or("?"),
                "odds api quota remaining"
            );
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(PipelineError::throttling(self.config.source_name.clone(), body));
        }
        if !status.is_success() {
            return Err(PipelineError::transient(
                self.config.source_name.clone(),
                format!("status {status}: {body}"),
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| PipelineError::schema(self.config.source_name.clone(), e.to_string()))
    }
}

#[async_trait]
impl Collector for OddsApiCollector {
    fn source_name(&self) -> &str {
        &self.config.source_name
    }

    async fn test_connection(&self) -> Result<bool> {
        let url = format!(
            "https://api.the-odds-api.com/v4/sports/{}/odds",
            self.config.sport_key
        );
        let response = self
            .http_client
            .head(&url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;
        Ok(response.status().is_success() || response.status().as_u16() == 405)
    }

    async fn collect(&self) -> Result<CollectionResult> {
        let started = Instant::now();
        let events = self.fetch_events().await?;
        let response_time_ms = started.elapsed().as_millis() as u64;
        if events.is_empty() {
            warn!(source = %self.config.source_name, "odds api returned zero events");
        }

        let now = Utc::now();
        let data = events
            .into_iter()
            .map(|event| RawCollectionRecord {
                source: self.config.source_name.clone(),
                external_game_key: event.id.clone(),
                sportsbook_external_key: None,
                payload: serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                collected_at: now,
                history: None,
            })
            .collect();

        Ok(CollectionResult::success(
            self.config.source_name.clone(),
            data,
            response_time_ms,
            1,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_deserializes_with_optional_fields() {
        let json = serde_json::json!({
            "id": "evt1",
            "sport_key": "basketball_ncaab",
            "commence_time": "2026-03-01T18:00:00Z",
            "home_team": "Duke",
            "away_team": "UNC",
            "bookmakers": []
        });
        let event: OddsApiEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.home_team, "Duke");
        assert!(event.bookmakers.is_empty());
    }
}
