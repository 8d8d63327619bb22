//! Shared domain types for the collection & alignment engine.
//!
//! These are the entities from the data model: games, teams, sportsbooks,
//! raw collection records, historical odds points, and the unified staging
//! row that C9 produces. Kept as plain structs the way the teacher's
//! `OddsApiEvent` / `OddsSnapshot` are: `Serialize`/`Deserialize` for wire
//! and storage, `Clone` for passing between buffers and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One real sporting event. The canonical id is filled in by the
/// game-id resolver (C3) once a source's external id is matched against
/// the schedule API; until then the row exists with `canonical_id: None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub canonical_id: Option<String>,
    pub external_ids: std::collections::HashMap<String, String>,
    pub home_team: String,
    pub away_team: String,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub date: Option<chrono::NaiveDate>,
    pub season: Option<String>,
}

impl Game {
    /// `home != away` is an invariant enforced at construction, not just checked later.
    pub fn new(home_team: String, away_team: String) -> Result<Self, String> {
        if home_team == away_team {
            return Err(format!(
                "home and away teams must differ, got '{home_team}' for both"
            ));
        }
        Ok(Self {
            canonical_id: None,
            external_ids: std::collections::HashMap::new(),
            home_team,
            away_team,
            scheduled_start: None,
            date: None,
            season: None,
        })
    }
}

/// Market a betting line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Moneyline,
    Spread,
    Total,
}

impl Market {
    pub fn label(&self) -> &'static str {
        match self {
            Market::Moneyline => "moneyline",
            Market::Spread => "spread",
            Market::Total => "total",
        }
    }

    /// The sides a given market allows, used to validate `Side` combinations.
    pub fn allowed_sides(&self) -> &'static [Side] {
        match self {
            Market::Moneyline | Market::Spread => &[Side::Home, Side::Away],
            Market::Total => &[Side::Over, Side::Under],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
    Over,
    Under,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
            Side::Over => "over",
            Side::Under => "under",
        }
    }
}

/// One fetch from one source: the durable, never-mutated unit C4 produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCollectionRecord {
    pub source: String,
    pub external_game_key: String,
    pub sportsbook_external_key: Option<String>,
    pub payload: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub history: Option<Vec<serde_json::Value>>,
}

/// One (game, sportsbook, market, side, time) observation, derived from a
/// raw payload's history array plus its current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalOddsPoint {
    pub canonical_game_id: Option<String>,
    pub game_external_id: String,
    pub sportsbook_external_id: String,
    pub market: Market,
    pub side: Side,
    pub american_odds: i32,
    /// Always `None` for `Market::Moneyline`.
    pub line_value: Option<f64>,
    pub effective_instant: DateTime<Utc>,
    pub is_current_odds: bool,
}

impl HistoricalOddsPoint {
    /// Enforces the moneyline-line-value-is-null invariant and the
    /// market/side compatibility invariant at construction.
    pub fn new(
        game_external_id: String,
        sportsbook_external_id: String,
        market: Market,
        side: Side,
        american_odds: i32,
        line_value: Option<f64>,
        effective_instant: DateTime<Utc>,
        is_current_odds: bool,
    ) -> Result<Self, String> {
        if market == Market::Moneyline && line_value.is_some() {
            return Err("line_value must be null for moneyline".to_string());
        }
        if !market.allowed_sides().contains(&side) {
            return Err(format!("side {side:?} not allowed for market {market:?}"));
        }
        Ok(Self {
            canonical_game_id: None,
            game_external_id,
            sportsbook_external_id,
            market,
            side,
            american_odds,
            line_value,
            effective_instant,
            is_current_odds,
        })
    }

    /// Uniqueness key: `(game-ext-id, sportsbook-ext-id, market, side, effective_instant)`.
    pub fn dedup_key(&self) -> (String, String, Market, Side, DateTime<Utc>) {
        (
            self.game_external_id.clone(),
            self.sportsbook_external_id.clone(),
            self.market,
            self.side,
            self.effective_instant,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[default]
    Valid,
    Invalid,
}

/// Lineage blob attached to every unified staging row: where it came
/// from and how it was produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformationMetadata {
    pub processor_name: String,
    pub processor_version: String,
    pub transformed_at: Option<DateTime<Utc>>,
    pub source_field_names: Vec<String>,
    pub quality_checks_performed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLineage {
    pub raw_table: String,
    pub raw_row_id: Uuid,
    pub metadata: TransformationMetadata,
}

/// Consolidated view of one (game, sportsbook) across markets at one
/// processing time — the output of C9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedStagingRow {
    pub source_name: String,
    pub collector_name: String,

    pub canonical_game_id: Option<String>,
    pub external_game_id: String,

    pub home_team: String,
    pub away_team: String,

    pub sportsbook_id: String,
    pub sportsbook_name: String,

    pub market_type: String,

    pub moneyline_home_odds: Option<i32>,
    pub moneyline_away_odds: Option<i32>,

    pub spread_line: Option<f64>,
    pub spread_home_odds: Option<i32>,
    pub spread_away_odds: Option<i32>,

    pub total_line: Option<f64>,
    pub over_odds: Option<i32>,
    pub under_odds: Option<i32>,

    pub lineage: DataLineage,
    pub quality_score: f64,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,

    pub processing_time: DateTime<Utc>,
}

impl UnifiedStagingRow {
    /// `(external game id, sportsbook external id, processing time)` — the
    /// idempotence key C9 upserts on.
    pub fn idempotence_key(&self) -> (String, String, DateTime<Utc>) {
        (
            self.external_game_id.clone(),
            self.sportsbook_id.clone(),
            self.processing_time,
        )
    }

    pub fn has_moneyline(&self) -> bool {
        self.moneyline_home_odds.is_some() || self.moneyline_away_odds.is_some()
    }

    pub fn has_spread(&self) -> bool {
        self.spread_home_odds.is_some() || self.spread_away_odds.is_some()
    }

    pub fn has_total(&self) -> bool {
        self.over_odds.is_some() || self.under_odds.is_some()
    }
}

/// Fixed reference entry for a team (30-entry static set per league).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRef {
    pub code: String,
    pub full_name: String,
    pub aliases: Vec<String>,
    pub division: String,
    pub league_id: String,
}

/// Fixed reference entry for a sportsbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportsbookRef {
    pub internal_id: String,
    pub display_name: String,
    pub external_ids: std::collections::HashMap<String, String>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn game_rejects_equal_home_away() {
        assert!(Game::new("NYY".into(), "NYY".into()).is_err());
        assert!(Game::new("NYY".into(), "BOS".into()).is_ok());
    }

    #[test]
    fn moneyline_point_rejects_line_value() {
        let t = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let err = HistoricalOddsPoint::new(
            "g1".into(),
            "sb1".into(),
            Market::Moneyline,
            Side::Home,
            -150,
            Some(1.5),
            t,
            true,
        )
        .unwrap_err();
        assert!(err.contains("line_value"));
    }

    #[test]
    fn moneyline_point_accepts_null_line_value() {
        let t = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let point = HistoricalOddsPoint::new(
            "g1".into(),
            "sb1".into(),
            Market::Moneyline,
            Side::Home,
            -150,
            None,
            t,
            true,
        )
        .unwrap();
        assert_eq!(point.line_value, None);
    }

    #[test]
    fn total_rejects_home_away_sides() {
        let t = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let err = HistoricalOddsPoint::new(
            "g1".into(),
            "sb1".into(),
            Market::Total,
            Side::Home,
            -110,
            Some(8.5),
            t,
            true,
        )
        .unwrap_err();
        assert!(err.contains("side"));
    }

    #[test]
    fn dedup_key_is_distinguishing() {
        let t = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let a = HistoricalOddsPoint::new(
            "g1".into(),
            "sb1".into(),
            Market::Total,
            Side::Over,
            -110,
            Some(8.5),
            t,
            true,
        )
        .unwrap();
        let b = HistoricalOddsPoint::new(
            "g1".into(),
            "sb1".into(),
            Market::Total,
            Side::Under,
            -110,
            Some(8.5),
            t,
            true,
        )
        .unwrap();
        assert_ne!(a.dedup_key(), b.dedup_key());
    }
}
