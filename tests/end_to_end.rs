//! Integration tests exercising more than one component together —
//! collection through the orchestrator feeding the staging processor,
//! and the game-id resolver's batch path. Single-component behavior is
//! covered by each module's own `#[cfg(test)]` suite; these tests only
//! cover what crosses module boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use odds_pipeline::alerts::{AlertManager, LoggingChannel};
use odds_pipeline::circuit_breaker::CircuitBreaker;
use odds_pipeline::collectors::{Collector, CollectionResult};
use odds_pipeline::config::{CircuitBreakerConfig, OrchestratorConfig};
use odds_pipeline::error::Result;
use odds_pipeline::orchestrator::{Orchestrator, Priority, SourceConfig, TaskStatus};
use odds_pipeline::rate_limiter::RateLimiter;
use odds_pipeline::resolver::{GameIdResolver, GameLookup};
use odds_pipeline::staging::{SportsbookDirectory, StagingProcessor};
use odds_pipeline::resolver::teams::TeamStandardizer;
use odds_pipeline::types::RawCollectionRecord;
use uuid::Uuid;

struct TenRecordCollector {
    name: String,
}

#[async_trait]
impl Collector for TenRecordCollector {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<bool> {
        Ok(true)
    }

    async fn collect(&self) -> Result<CollectionResult> {
        let now = Utc::now();
        let data = (0..10)
            .map(|i| RawCollectionRecord {
                source: self.name.clone(),
                external_game_key: format!("game-{i}"),
                sportsbook_external_key: None,
                payload: serde_json::json!({
                    "home_team": "Yankees",
                    "away_team": "Red Sox",
                    "bookmakers": [{
                        "key": "dk",
                        "markets": [
                            {"key": "h2h", "outcomes": [
                                {"name": "Yankees", "price": -150},
                                {"name": "Red Sox", "price": 130}
                            ]}
                        ]
                    }]
                }),
                collected_at: now,
                history: None,
            })
            .collect();
        Ok(CollectionResult::success(self.name.clone(), data, 20, 1))
    }
}

/// Scenario: configure one source, inject a collector that returns 10
/// records; the plan completes HEALTHY with no failures, and every
/// record consolidates into one unified staging row apiece.
#[tokio::test]
async fn happy_path_collection_feeds_staging_consolidation() {
    let source_name = "odds_api";
    let mut breakers = HashMap::new();
    breakers.insert(
        source_name.to_string(),
        CircuitBreaker::new(source_name, CircuitBreakerConfig::default()),
    );
    let mut collectors: HashMap<String, Arc<dyn Collector>> = HashMap::new();
    collectors.insert(
        source_name.to_string(),
        Arc::new(TenRecordCollector { name: source_name.to_string() }),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(RateLimiter::new()),
        breakers,
        collectors,
        Arc::new(AlertManager::new(vec![], vec![Box::new(LoggingChannel)])),
        OrchestratorConfig {
            concurrency_cap: 5,
            total_deadline: Duration::from_secs(30),
        },
    ));

    let sources = vec![SourceConfig::new(source_name, Priority::Normal, Duration::from_secs(5))];
    let mut plan = orchestrator.build_plan(&sources);
    let results = orchestrator.run_plan(&mut plan, &sources).await;

    assert_eq!(results.len(), 1);
    let result = results.values().next().unwrap();
    assert_eq!(result.classification, TaskStatus::Success);
    assert!(result.health.is_healthy(), "expected healthy source, got {:?}", result.health);
    assert_eq!(result.records.len(), 10);

    let processor = StagingProcessor::new(TeamStandardizer::new(vec![]), SportsbookDirectory::new(HashMap::new()));
    let mut rows = Vec::new();
    for record in &result.records {
        let output = processor.process_raw_row(
            &record.source,
            source_name,
            &record.external_game_key,
            None,
            &record.payload,
            record.history.as_ref(),
            "raw_odds_api",
            Uuid::new_v4(),
            record.collected_at,
        );
        rows.extend(output.rows);
    }
    assert_eq!(rows.len(), 10, "each raw record consolidates into exactly one staging row");
    assert!(rows.iter().all(|r| r.market_type == "moneyline"));
}

struct CountingLookup {
    calls: AtomicU32,
}

#[async_trait]
impl GameLookup for CountingLookup {
    async fn lookup(&self, external_game_id: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("canonical-{external_game_id}")))
    }

    async fn attach_external_id(&self, _canonical_id: &str, _external_game_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Scenario: batch-resolving `[g1, g1, g2, g3]` with g1 already cached
/// calls the lookup at most once per distinct uncached id.
#[tokio::test]
async fn batch_resolution_avoids_duplicate_lookups() {
    let lookup = Arc::new(CountingLookup { calls: AtomicU32::new(0) });
    let resolver = GameIdResolver::new(lookup.clone());

    resolver.resolve_game_id("g1").await.unwrap();
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

    let ids = vec!["g1".to_string(), "g1".to_string(), "g2".to_string(), "g3".to_string()];
    let (resolved, api_calls_saved) = resolver.batch_resolve_games(&ids).await.unwrap();

    assert_eq!(resolved.len(), 3);
    assert_eq!(resolved.get("g1").unwrap().as_deref(), Some("canonical-g1"));
    assert_eq!(resolved.get("g2").unwrap().as_deref(), Some("canonical-g2"));
    assert_eq!(resolved.get("g3").unwrap().as_deref(), Some("canonical-g3"));
    // one g1 deduplicated within the batch, plus g1 served from the prior cache hit
    assert_eq!(api_calls_saved, 2);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 3, "only g1 (once), g2, g3 ever reach the lookup");
}
