//! Collection & alignment engine entry point.
//!
//! Wires C1–C9 together the way the teacher's `main` wires its single
//! `OddsIngestionService`: load config, build the pool and every
//! component once, start the health/metrics server, then either run a
//! single pass (`RUN_ONCE=true`) or loop on `poll_interval_seconds` with
//! `ctrl_c` for graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use odds_pipeline::alerts::{
    detect_cascade, detect_collection_gap, AlertCondition, AlertManager, AlertRule, Comparator,
    LoggingChannel, MetricAtom, MetricSnapshot,
};
use odds_pipeline::health::CollectionHealthMetrics;
use odds_pipeline::circuit_breaker::CircuitBreaker;
use odds_pipeline::collectors::html::{ColumnSpec, HtmlCollector, HtmlCollectorConfig};
use odds_pipeline::collectors::odds_api::{OddsApiCollector, OddsApiConfig};
use odds_pipeline::collectors::schedule::{ScheduleApiCollector, ScheduleApiConfig};
use odds_pipeline::collectors::Collector;
use odds_pipeline::config::{read_secret, CircuitBreakerConfig, PipelineConfig};
use odds_pipeline::db::{self, PgGameLookup, PgScheduleLookup};
use odds_pipeline::orchestrator::{Orchestrator, Priority, SourceConfig};
use odds_pipeline::rate_limiter::RateLimiter;
use odds_pipeline::resolver::teams::TeamStandardizer;
use odds_pipeline::resolver::GameIdResolver;
use odds_pipeline::staging::{SportsbookDirectory, StagingProcessor};
use odds_pipeline::types::TeamRef;

/// A representative slice of the reference table; extended per league as
/// new sources are onboarded, same posture as `TeamStandardizer`'s
/// fuzzy-keyword map.
fn reference_teams() -> Vec<TeamRef> {
    vec![
        TeamRef {
            code: "NYY".into(),
            full_name: "New York Yankees".into(),
            aliases: vec!["Yankees".into()],
            division: "AL East".into(),
            league_id: "MLB".into(),
        },
        TeamRef {
            code: "BOS".into(),
            full_name: "Boston Red Sox".into(),
            aliases: vec!["Red Sox".into()],
            division: "AL East".into(),
            league_id: "MLB".into(),
        },
        TeamRef {
            code: "LAD".into(),
            full_name: "Los Angeles Dodgers".into(),
            aliases: vec!["Dodgers".into()],
            division: "NL West".into(),
            league_id: "MLB".into(),
        },
        TeamRef {
            code: "SF".into(),
            full_name: "San Francisco Giants".into(),
            aliases: vec!["Giants".into()],
            division: "NL West".into(),
            league_id: "MLB".into(),
        },
    ]
}

fn default_alert_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "low-confidence",
            AlertCondition::Compare {
                metric: MetricAtom::ConfidenceScore,
                comparator: Comparator::LessThan,
                threshold: 0.5,
            },
            odds_pipeline::health::AlertSeverity::Warning,
            Duration::from_secs(900),
        ),
        AlertRule::new(
            "collection-stalled",
            AlertCondition::Compare {
                metric: MetricAtom::GapHours,
                comparator: Comparator::GreaterThanOrEqual,
                threshold: 2.0,
            },
            odds_pipeline::health::AlertSeverity::Critical,
            Duration::from_secs(900),
        )
        .with_failure_count_threshold(3, 30),
    ]
}

/// One configured source: its collector, rate-limit/circuit-breaker
/// setup, and the `SourceConfig` the orchestrator schedules it under.
struct ActiveSource {
    config: SourceConfig,
    collector: Arc<dyn Collector>,
}

fn configured_sources(http_client: &reqwest::Client) -> Vec<ActiveSource> {
    let mut sources = Vec::new();

    if let Ok(base_url) = std::env::var("SCHEDULE_API_BASE_URL") {
        let collector = ScheduleApiCollector::new(
            ScheduleApiConfig {
                source_name: "schedule_api".into(),
                base_url,
                sport_id: std::env::var("SCHEDULE_API_SPORT_ID").unwrap_or_else(|_| "1".into()),
            },
            http_client.clone(),
        );
        sources.push(ActiveSource {
            config: SourceConfig::new("schedule_api", Priority::High, Duration::from_secs(15)),
            collector: Arc::new(collector),
        });
    } else {
        warn!("SCHEDULE_API_BASE_URL not set, schedule_api source disabled");
    }

    if let Ok(api_key) = read_secret("/run/secrets/odds_api_key", "ODDS_API_KEY") {
        let collector = OddsApiCollector::new(
            OddsApiConfig {
                source_name: "odds_api".into(),
                api_key,
                sport_key: std::env::var("ODDS_API_SPORT_KEY")
                    .unwrap_or_else(|_| "baseball_mlb".into()),
                markets: std::env::var("ODDS_API_MARKETS")
                    .unwrap_or_else(|_| "h2h,spreads,totals".into()),
                bookmakers: std::env::var("ODDS_API_BOOKMAKERS").unwrap_or_else(|_| "".into()),
                requests_per_minute: 30,
            },
            http_client.clone(),
        );
        let mut cfg = SourceConfig::new("odds_api", Priority::Normal, Duration::from_secs(20));
        if sources.iter().any(|s| s.config.name == "schedule_api") {
            cfg = cfg.depends_on(vec!["schedule_api".to_string()]);
        }
        sources.push(ActiveSource {
            config: cfg,
            collector: Arc::new(collector),
        });
    } else {
        warn!("ODDS_API_KEY not configured, odds_api source disabled");
    }

    if let Ok(page_url) = std::env::var("VSIN_PAGE_URL") {
        let collector = HtmlCollector::new(
            HtmlCollectorConfig {
                source_name: "vsin".into(),
                page_url,
                row_selector: std::env::var("VSIN_ROW_SELECTOR")
                    .unwrap_or_else(|_| "table.freezetable tbody tr".into()),
                game_key_field: "matchup".into(),
                columns: vec![
                    ColumnSpec {
                        field_name: "matchup".into(),
                        selector: "td:nth-child(1)".into(),
                    },
                    ColumnSpec {
                        field_name: "handle_percent".into(),
                        selector: "td:nth-child(2)".into(),
                    },
                    ColumnSpec {
                        field_name: "bets_percent".into(),
                        selector: "td:nth-child(3)".into(),
                    },
                ],
            },
            http_client.clone(),
        );
        sources.push(ActiveSource {
            config: SourceConfig::new("vsin", Priority::Low, Duration::from_secs(20)),
            collector: Arc::new(collector),
        });
    } else {
        warn!("VSIN_PAGE_URL not set, vsin source disabled");
    }

    sources
}

/// One full collect → resolve → stage pass across every configured source.
async fn run_cycle(
    pool: &sqlx::PgPool,
    orchestrator: &Arc<Orchestrator>,
    resolver: &GameIdResolver,
    staging: &StagingProcessor,
    sources: &[SourceConfig],
) -> Result<usize> {
    let mut plan = orchestrator.build_plan(sources);
    let results = orchestrator.run_plan(&mut plan, sources).await;

    let mut staged_rows = 0usize;
    for task in &plan.tasks {
        let Some(result) = results.get(&task.id) else {
            continue;
        };
        for record in &result.records {
            let raw_row_id = db::insert_raw_record(pool, record).await?;

            let mut output = staging.process_raw_row(
                &record.source,
                &task.source,
                &record.external_game_key,
                None,
                &record.payload,
                record.history.as_ref(),
                "raw_data",
                raw_row_id,
                record.collected_at,
            );

            let mut canonical_id = None;
            for row in output.rows.iter_mut() {
                let (resolved, _confidence) = resolver
                    .resolve_with_context(&row.external_game_id, &row.home_team, &row.away_team, None)
                    .await?;
                row.canonical_game_id = resolved.clone();
                canonical_id = resolved;
            }
            for point in output.historical_points.iter_mut() {
                point.canonical_game_id = canonical_id.clone();
            }

            db::replace_staging_rows(pool, raw_row_id, &output.rows).await?;
            db::insert_historical_odds_points(pool, &output.historical_points).await?;
            staged_rows += output.rows.len();
        }
    }

    Ok(staged_rows)
}

const MAX_COLLECTION_GAP_HOURS: f64 = 4.0;
const CASCADE_FAILURE_THRESHOLD: f64 = 0.5;
const DEAD_TUPLE_VACUUM_THRESHOLD: f64 = 0.2;

fn metric_snapshot(metrics: &CollectionHealthMetrics) -> MetricSnapshot {
    let mut snapshot = MetricSnapshot::default();
    snapshot
        .set(MetricAtom::SuccessRate, metrics.success_rate)
        .set(MetricAtom::ConfidenceScore, metrics.confidence_score)
        .set(MetricAtom::GapHours, metrics.gap_hours)
        .set(MetricAtom::ConsecutiveFailures, metrics.consecutive_failures as f64);
    snapshot
}

/// Cross-cutting checks that don't belong to any one source's collection
/// attempt: per-source alert evaluation, a db-grounded staleness check
/// (independent of the in-memory gap tracked by C6), the cascade detector
/// across all sources at once, and a vacuum-health check on the tables
/// this service writes to.
async fn run_health_checks(pool: &sqlx::PgPool, orchestrator: &Arc<Orchestrator>) -> Result<()> {
    let health = orchestrator.health_snapshot().await;
    let alert_manager = orchestrator.alert_manager();

    for (source, metrics) in &health {
        let snapshot = metric_snapshot(metrics);
        alert_manager.evaluate(source, &snapshot).await;
    }

    let unhealthy = health.values().filter(|m| !m.is_healthy()).count();
    if detect_cascade(unhealthy, health.len(), CASCADE_FAILURE_THRESHOLD) {
        error!(unhealthy, total = health.len(), "cascading failure across sources");
    }

    let now = chrono::Utc::now();
    for (source, latest) in db::latest_collection_per_source(pool).await? {
        let gap_hours = (now - latest).num_minutes() as f64 / 60.0;
        if detect_collection_gap(gap_hours, MAX_COLLECTION_GAP_HOURS) {
            warn!(source = %source, gap_hours, "collection gap detected against persisted record");
        }
    }

    for (table, ratio) in db::dead_tuple_ratios(pool).await? {
        if ratio >= DEAD_TUPLE_VACUUM_THRESHOLD {
            warn!(table = %table, dead_ratio = ratio, "table approaching vacuum threshold");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("collection_engine=info".parse().unwrap()),
        )
        .init();

    info!("collection & alignment engine starting");

    let config = PipelineConfig::from_env()?;
    let pool = db::connect_with_retry(&config.database_url, 5).await?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let teams = reference_teams();
    let lookup = Arc::new(PgGameLookup::new(pool.clone()));
    let schedule_lookup = Arc::new(PgScheduleLookup::new(pool.clone()));
    let mut resolver = GameIdResolver::with_schedule(lookup, schedule_lookup, teams.clone());
    if let Some(redis_url) = &config.redis_url {
        match odds_pipeline::resolver::session_cache::RedisSessionStore::connect(redis_url).await {
            Ok(store) => {
                info!("resolver session cache backed by redis");
                resolver = resolver.with_session_store(Box::new(store));
            }
            Err(err) => warn!(%err, "failed to connect to redis, falling back to in-memory session cache"),
        }
    }

    let sportsbooks = SportsbookDirectory::new(HashMap::new());
    let staging = StagingProcessor::new(TeamStandardizer::new(teams), sportsbooks);

    let active_sources = configured_sources(&http_client);
    if active_sources.is_empty() {
        warn!("no sources configured — set SCHEDULE_API_BASE_URL, ODDS_API_KEY, or VSIN_PAGE_URL");
    }

    let rate_limiter = Arc::new(RateLimiter::new());
    let mut circuit_breakers = HashMap::new();
    let mut collectors: HashMap<String, Arc<dyn Collector>> = HashMap::new();
    let mut source_configs = Vec::new();
    for source in active_sources {
        circuit_breakers.insert(
            source.config.name.clone(),
            CircuitBreaker::new(&source.config.name, CircuitBreakerConfig::default()),
        );
        collectors.insert(source.config.name.clone(), source.collector);
        source_configs.push(source.config);
    }

    let alert_manager = Arc::new(AlertManager::new(
        default_alert_rules(),
        vec![Box::new(LoggingChannel)],
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        rate_limiter,
        circuit_breakers,
        collectors,
        alert_manager,
        config.orchestrator.clone(),
    ));

    let api_state = odds_pipeline::api::ApiState {
        orchestrator: Arc::clone(&orchestrator),
    };
    let app = odds_pipeline::api::router(api_state);
    let health_addr = format!("0.0.0.0:{}", config.health_port);
    info!("health/metrics endpoint listening on {health_addr}");
    let listener = tokio::net::TcpListener::bind(&health_addr).await?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "http server exited");
        }
    });

    if config.run_once {
        info!("running in one-shot mode (RUN_ONCE=true)");
        match run_cycle(&pool, &orchestrator, &resolver, &staging, &source_configs).await {
            Ok(count) => info!(rows = count, "one-shot cycle completed"),
            Err(err) => {
                error!(%err, "one-shot cycle failed");
                return Err(err);
            }
        }
        if let Err(err) = run_health_checks(&pool, &orchestrator).await {
            error!(%err, "post-cycle health checks failed");
        }
        return Ok(());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(config.poll_interval_seconds));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_cycle(&pool, &orchestrator, &resolver, &staging, &source_configs).await {
                    Ok(count) => info!(rows = count, "collection cycle completed"),
                    Err(err) => error!(%err, "collection cycle failed"),
                }
                if let Err(err) = run_health_checks(&pool, &orchestrator).await {
                    error!(%err, "post-cycle health checks failed");
                }
            }
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
