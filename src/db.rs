//! Relational store access.
//!
//! Ported from the teacher's `connect_db_with_retry` (exponential backoff
//! on pool acquisition) and its `sqlx::query_as`/`query_scalar` style —
//! no compile-time-checked `sqlx::query!` macros, since those require a
//! live `DATABASE_URL` at build time and the teacher avoids that. Owns
//! the schemas spec.md §6 names: `games` (one external-id column per
//! source is modeled here as a side table, `game_external_ids`, since a
//! fixed per-source column set doesn't scale to onboarding a new
//! provider without a migration — see DESIGN.md), `raw_<source>` tables,
//! `staging_odds`, `historical_odds_points`, `health_metric_snapshots`,
//! and `alerts`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::resolver::{GameLookup, ScheduleGame, ScheduleLookup};
use crate::types::{HistoricalOddsPoint, UnifiedStagingRow};

pub async fn connect_with_retry(database_url: &str, max_retries: u32) -> Result<PgPool> {
    let mut attempt = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("connected to postgres");
                return Ok(pool);
            }
            Err(err) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(anyhow!(
                        "failed to connect to database after {max_retries} attempts: {err}"
                    ));
                }
                warn!(attempt, %err, "database connection attempt failed, retrying");
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
        }
    }
}

/// One row of raw collection data, as read back for C9's "unprocessed"
/// scan: `raw_row_id` / `collected_at` drive the "not yet in staging, or
/// newer than the last processed version" predicate from spec.md §4.9.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawRow {
    pub id: Uuid,
    pub source: String,
    pub external_game_key: String,
    pub sportsbook_external_key: Option<String>,
    pub payload: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub history: Option<serde_json::Value>,
}

/// Postgres-backed implementation of C3's durable cache tier.
pub struct PgGameLookup {
    pool: PgPool,
}

impl PgGameLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GameLookup for PgGameLookup {
    async fn lookup(&self, external_game_id: &str) -> crate::error::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT g.canonical_id
            FROM games g
            JOIN game_external_ids e ON e.canonical_id = g.canonical_id
            WHERE e.external_id = $1
            "#,
        )
        .bind(external_game_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn attach_external_id(
        &self,
        canonical_id: &str,
        external_game_id: &str,
    ) -> crate::error::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO games (canonical_id) VALUES ($1)
            ON CONFLICT (canonical_id) DO NOTHING
            "#,
        )
        .bind(canonical_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO game_external_ids (canonical_id, external_id)
            VALUES ($1, $2)
            ON CONFLICT (external_id) DO UPDATE SET canonical_id = EXCLUDED.canonical_id
            "#,
        )
        .bind(canonical_id)
        .bind(external_game_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Postgres-backed schedule source, populated by the schedule-API
/// collector and cached 30 days rolling per spec.md §6.
pub struct PgScheduleLookup {
    pool: PgPool,
}

impl PgScheduleLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduleLookup for PgScheduleLookup {
    async fn games_for_date(
        &self,
        date: chrono::NaiveDate,
    ) -> crate::error::Result<Vec<ScheduleGame>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT canonical_id, home_team, away_team
            FROM games
            WHERE scheduled_date = $1
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(canonical_id, home_team, away_team)| ScheduleGame {
                canonical_id,
                home_team,
                away_team,
            })
            .collect())
    }
}

/// Inserts one raw collection record into its source-specific raw table,
/// never mutated once written.
pub async fn insert_raw_record(
    pool: &PgPool,
    record: &crate::types::RawCollectionRecord,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO raw_data (id, source, external_game_key, sportsbook_external_key, payload, collected_at, history)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(&record.source)
    .bind(&record.external_game_key)
    .bind(&record.sportsbook_external_key)
    .bind(&record.payload)
    .bind(record.collected_at)
    .bind(&record.history)
    .execute(pool)
    .await
    .context("inserting raw collection record")?;

    Ok(id)
}

/// Raw rows not yet reflected in staging, or whose raw `collected_at` is
/// newer than the staging row's `processed_at` — the two branches of the
/// "unprocessed" predicate from spec.md §4.9.
pub async fn fetch_unprocessed_raw(pool: &PgPool, limit: i64) -> Result<Vec<RawRow>> {
    let rows = sqlx::query_as::<_, RawRow>(
        r#"
        SELECT r.id, r.source, r.external_game_key, r.sportsbook_external_key,
               r.payload, r.collected_at, r.history
        FROM raw_data r
        LEFT JOIN staging_odds s ON s.raw_row_id = r.id
        WHERE s.raw_row_id IS NULL OR r.collected_at > s.processed_at
        ORDER BY r.collected_at
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetching unprocessed raw rows")?;

    Ok(rows)
}

/// Deletes any staging rows keyed to `raw_row_id`, then batch-inserts
/// `rows` in one transaction — the delete-then-reinsert sequence spec.md
/// §8 requires for per-raw-row idempotence on reprocessing.
pub async fn replace_staging_rows(
    pool: &PgPool,
    raw_row_id: Uuid,
    rows: &[UnifiedStagingRow],
) -> Result<()> {
    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    sqlx::query("DELETE FROM staging_odds WHERE raw_row_id = $1")
        .bind(raw_row_id)
        .execute(&mut *tx)
        .await?;

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO staging_odds (
                raw_row_id, source_name, collector_name, canonical_game_id, external_game_id,
                home_team, away_team, sportsbook_id, sportsbook_name, market_type,
                moneyline_home_odds, moneyline_away_odds,
                spread_line, spread_home_odds, spread_away_odds,
                total_line, over_odds, under_odds,
                lineage, quality_score, validation_status, validation_errors, processing_time
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                $19, $20, $21, $22, $23
            )
            ON CONFLICT (external_game_id, sportsbook_id, processing_time) DO UPDATE SET
                lineage = EXCLUDED.lineage,
                quality_score = EXCLUDED.quality_score
            "#,
        )
        .bind(raw_row_id)
        .bind(&row.source_name)
        .bind(&row.collector_name)
        .bind(&row.canonical_game_id)
        .bind(&row.external_game_id)
        .bind(&row.home_team)
        .bind(&row.away_team)
        .bind(&row.sportsbook_id)
        .bind(&row.sportsbook_name)
        .bind(&row.market_type)
        .bind(row.moneyline_home_odds)
        .bind(row.moneyline_away_odds)
        .bind(row.spread_line)
        .bind(row.spread_home_odds)
        .bind(row.spread_away_odds)
        .bind(row.total_line)
        .bind(row.over_odds)
        .bind(row.under_odds)
        .bind(serde_json::to_value(&row.lineage).unwrap_or(serde_json::Value::Null))
        .bind(row.quality_score)
        .bind(matches!(row.validation_status, crate::types::ValidationStatus::Valid))
        .bind(&row.validation_errors)
        .bind(row.processing_time)
        .execute(&mut *tx)
        .await
        .context("inserting unified staging row")?;
    }

    tx.commit().await.context("committing staging batch")?;
    Ok(())
}

/// Upserts `points` into `historical_odds_points`, keyed on the
/// uniqueness invariant from spec.md §8 (game-ext-id, sportsbook-ext-id,
/// market, side, effective_instant). A conflicting row keeps its
/// existing `is_current_odds` flag untouched by a later backfill;
/// staging marks the row current at insert time, same as
/// `replace_staging_rows`' own insert-then-upsert shape.
pub async fn insert_historical_odds_points(pool: &PgPool, points: &[HistoricalOddsPoint]) -> Result<()> {
    if points.is_empty() {
        return Ok(());
    }

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    for point in points {
        sqlx::query(
            r#"
            INSERT INTO historical_odds_points (
                canonical_game_id, game_external_id, sportsbook_external_id,
                market, side, american_odds, line_value, effective_instant, is_current_odds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (game_external_id, sportsbook_external_id, market, side, effective_instant)
            DO UPDATE SET canonical_game_id = EXCLUDED.canonical_game_id
            "#,
        )
        .bind(&point.canonical_game_id)
        .bind(&point.game_external_id)
        .bind(&point.sportsbook_external_id)
        .bind(point.market.label())
        .bind(point.side.label())
        .bind(point.american_odds)
        .bind(point.line_value)
        .bind(point.effective_instant)
        .bind(point.is_current_odds)
        .execute(&mut *tx)
        .await
        .context("inserting historical odds point")?;
    }

    tx.commit().await.context("committing historical odds points batch")?;
    Ok(())
}

/// Persists one rolling health-metrics snapshot, for the `history`
/// subcommand and trend analysis. Durable state; in-memory metrics in
/// `health.rs` are the cache on top of this.
pub async fn insert_health_snapshot(
    pool: &PgPool,
    source: &str,
    metrics: &crate::health::CollectionHealthMetrics,
    snapshot_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO health_metric_snapshots
            (source, success_rate, confidence_score, gap_hours, consecutive_failures, snapshot_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(source)
    .bind(metrics.success_rate)
    .bind(metrics.confidence_score)
    .bind(metrics.gap_hours)
    .bind(metrics.consecutive_failures as i32)
    .bind(snapshot_at)
    .execute(pool)
    .await
    .context("inserting health metric snapshot")?;

    Ok(())
}

/// Latest successful `collected_at` per source, the input to the gap
/// detector (spec.md §4.7).
pub async fn latest_collection_per_source(pool: &PgPool) -> Result<Vec<(String, DateTime<Utc>)>> {
    let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT source, MAX(collected_at) AS latest
        FROM raw_data
        GROUP BY source
        "#,
    )
    .fetch_all(pool)
    .await
    .context("fetching latest collection per source")?;

    Ok(rows)
}

/// Per-table dead/live tuple ratio, the input to the dead-tuple detector
/// (spec.md §4.7), read from Postgres's own statistics view rather than
/// a bespoke counter.
pub async fn dead_tuple_ratios(pool: &PgPool) -> Result<Vec<(String, f64)>> {
    let rows: Vec<(String, Option<i64>, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT relname, n_live_tup, n_dead_tup
        FROM pg_stat_user_tables
        "#,
    )
    .fetch_all(pool)
    .await
    .context("fetching dead tuple stats")?;

    Ok(rows
        .into_iter()
        .filter_map(|(table, live, dead)| {
            let live = live.unwrap_or(0);
            let dead = dead.unwrap_or(0);
            let total = live + dead;
            if total == 0 {
                return None;
            }
            Some((table, dead as f64 / total as f64))
        })
        .collect())
}
