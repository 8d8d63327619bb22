//! C9 — raw→staging processor.
//!
//! Consolidates the per-market/per-side rows an odds payload carries
//! into one unified row per (game, sportsbook, processing time), ported
//! from the Python original's `unified_staging_processor.py`: source
//! attribution straight from row metadata, a sportsbook lookup that
//! degrades to a placeholder rather than dropping the row, a five-step
//! team-resolution waterfall, fill-absent-without-overwrite
//! consolidation by key (not by bet side), and a weighted
//! completeness/accuracy/consistency quality score. Only the unified
//! path is implemented — see spec.md §9's Open Question #3 and
//! DESIGN.md.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::resolver::teams::TeamStandardizer;
use crate::types::{
    DataLineage, HistoricalOddsPoint, Market, Side, TransformationMetadata, UnifiedStagingRow,
    ValidationStatus,
};

pub const PROCESSOR_NAME: &str = "unified_staging_processor";
pub const PROCESSOR_VERSION: &str = "1.0.0";

/// One market/side observation pulled out of a raw payload, the
/// intermediate shape both the odds-API and generic extraction paths
/// produce before consolidation groups them by sportsbook.
#[derive(Debug, Clone)]
struct MarketEntry {
    sportsbook_external_id: String,
    market: Market,
    side: Side,
    odds: i32,
    line: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

/// Sportsbook id → display-name directory. The static map is the seed;
/// DB-resolved overrides win on disagreement, per spec.md §9's Open
/// Question resolution ("the DB is authoritative").
#[derive(Debug, Clone, Default)]
pub struct SportsbookDirectory {
    static_map: HashMap<String, String>,
    db_overrides: HashMap<String, String>,
}

impl SportsbookDirectory {
    pub fn new(static_map: HashMap<String, String>) -> Self {
        Self {
            static_map,
            db_overrides: HashMap::new(),
        }
    }

    pub fn with_db_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.db_overrides = overrides;
        self
    }

    /// Resolves an external sportsbook id to a display name and whether
    /// the resolution was a real hit. On a miss, returns the
    /// `Unknown_<id>` placeholder rather than failing the row (spec.md
    /// §4.9 step 2: "fail row with placeholder and degrade quality score
    /// rather than drop").
    fn resolve(&self, external_id: &str) -> (String, bool) {
        if let Some(name) = self.db_overrides.get(external_id) {
            return (name.clone(), true);
        }
        if let Some(name) = self.static_map.get(external_id) {
            return (name.clone(), true);
        }
        (format!("Unknown_{external_id}"), false)
    }
}

/// Outcome of the team-resolution waterfall: the standardized codes plus
/// whether a real match was found (vs. the total-failure placeholder
/// path).
struct TeamResolution {
    home: String,
    away: String,
    valid: bool,
}

fn finalize_teams(home: &str, away: &str, standardizer: &TeamStandardizer) -> Option<TeamResolution> {
    let home_code = standardizer
        .standardize(home)
        .map(|(code, _)| code)
        .unwrap_or_else(|| home.trim().to_string());
    let away_code = standardizer
        .standardize(away)
        .map(|(code, _)| code)
        .unwrap_or_else(|| away.trim().to_string());

    if home_code.is_empty() || away_code.is_empty() || home_code == away_code {
        return None;
    }
    Some(TeamResolution {
        home: home_code,
        away: away_code,
        valid: true,
    })
}

/// Five-step waterfall from spec.md §4.9 step 3: direct fields → `game`
/// sub-object → `teams[]` with `is_home` flags → team-id/code fields →
/// pattern inference over any key mentioning "home"/"away"/"team". On
/// total failure, produces informative placeholder codes derived from
/// the external game id rather than aborting the row.
fn resolve_teams(
    payload: &serde_json::Value,
    standardizer: &TeamStandardizer,
    external_game_id: &str,
) -> TeamResolution {
    if let (Some(h), Some(a)) = (
        payload.get("home_team").and_then(|v| v.as_str()),
        payload.get("away_team").and_then(|v| v.as_str()),
    ) {
        if let Some(r) = finalize_teams(h, a, standardizer) {
            return r;
        }
    }

    if let Some(game) = payload.get("game") {
        if let (Some(h), Some(a)) = (
            game.get("home_team").and_then(|v| v.as_str()),
            game.get("away_team").and_then(|v| v.as_str()),
        ) {
            if let Some(r) = finalize_teams(h, a, standardizer) {
                return r;
            }
        }
    }

    if let Some(teams) = payload.get("teams").and_then(|v| v.as_array()) {
        let home = teams
            .iter()
            .find(|t| t.get("is_home").and_then(|v| v.as_bool()) == Some(true))
            .and_then(|t| t.get("name").and_then(|v| v.as_str()));
        let away = teams
            .iter()
            .find(|t| t.get("is_home").and_then(|v| v.as_bool()) == Some(false))
            .and_then(|t| t.get("name").and_then(|v| v.as_str()));
        if let (Some(h), Some(a)) = (home, away) {
            if let Some(r) = finalize_teams(h, a, standardizer) {
                return r;
            }
        }
    }

    if let (Some(h), Some(a)) = (
        payload.get("home_team_code").and_then(|v| v.as_str()),
        payload.get("away_team_code").and_then(|v| v.as_str()),
    ) {
        if let Some(r) = finalize_teams(h, a, standardizer) {
            return r;
        }
    }

    let mut home_guess = None;
    let mut away_guess = None;
    if let Some(obj) = payload.as_object() {
        for (key, value) in obj {
            let lower = key.to_lowercase();
            if !lower.contains("team") {
                continue;
            }
            if lower.contains("home") {
                home_guess = value.as_str();
            } else if lower.contains("away") {
                away_guess = value.as_str();
            }
        }
    }
    if let (Some(h), Some(a)) = (home_guess, away_guess) {
        if let Some(r) = finalize_teams(h, a, standardizer) {
            return r;
        }
    }

    TeamResolution {
        home: format!("UNK_HOME_{external_game_id}"),
        away: format!("UNK_AWAY_{external_game_id}"),
        valid: false,
    }
}

fn parse_rfc3339(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extracts per-market/per-side entries from a raw payload. Two declared
/// paths, not a duck-typed search: the odds-API shape
/// (`bookmakers[].markets[].outcomes[]`) and a flat generic shape with
/// directly-named fields, used by the HTML/splits collectors and tests.
fn extract_market_entries(payload: &serde_json::Value) -> Vec<MarketEntry> {
    if let Some(bookmakers) = payload.get("bookmakers").and_then(|v| v.as_array()) {
        let home_team = payload.get("home_team").and_then(|v| v.as_str()).unwrap_or("");
        let mut entries = Vec::new();

        for bookmaker in bookmakers {
            let sportsbook_external_id = bookmaker
                .get("key")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let bookmaker_updated = bookmaker.get("last_update").and_then(parse_rfc3339);

            for market in bookmaker.get("markets").and_then(|v| v.as_array()).into_iter().flatten() {
                let key = market.get("key").and_then(|v| v.as_str()).unwrap_or("");
                let market_kind = match key {
                    "h2h" => Market::Moneyline,
                    "spreads" => Market::Spread,
                    "totals" => Market::Total,
                    _ => continue,
                };
                let updated_at = market
                    .get("last_update")
                    .and_then(parse_rfc3339)
                    .or(bookmaker_updated);

                for outcome in market.get("outcomes").and_then(|v| v.as_array()).into_iter().flatten() {
                    let Some(price) = outcome.get("price").and_then(|v| v.as_i64()) else {
                        continue;
                    };
                    let name = outcome.get("name").and_then(|v| v.as_str()).unwrap_or("");
                    let point = outcome.get("point").and_then(|v| v.as_f64());

                    let side = match market_kind {
                        Market::Total => {
                            if name.eq_ignore_ascii_case("over") {
                                Side::Over
                            } else {
                                Side::Under
                            }
                        }
                        _ => {
                            if name == home_team {
                                Side::Home
                            } else {
                                Side::Away
                            }
                        }
                    };
                    let line = if market_kind == Market::Moneyline { None } else { point };

                    entries.push(MarketEntry {
                        sportsbook_external_id: sportsbook_external_id.clone(),
                        market: market_kind,
                        side,
                        odds: price as i32,
                        line,
                        updated_at,
                    });
                }
            }
        }
        return entries;
    }

    let mut entries = Vec::new();
    let sportsbook_external_id = payload
        .get("sportsbook_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let updated_at = payload.get("updated_at").and_then(parse_rfc3339);

    let mut push = |market: Market, side: Side, field: &str, line: Option<f64>| {
        if let Some(odds) = payload.get(field).and_then(|v| v.as_i64()) {
            entries.push(MarketEntry {
                sportsbook_external_id: sportsbook_external_id.clone(),
                market,
                side,
                odds: odds as i32,
                line,
                updated_at,
            });
        }
    };

    push(Market::Moneyline, Side::Home, "moneyline_home_odds", None);
    push(Market::Moneyline, Side::Away, "moneyline_away_odds", None);
    let spread_line = payload.get("spread_line").and_then(|v| v.as_f64());
    push(Market::Spread, Side::Home, "spread_home_odds", spread_line);
    push(Market::Spread, Side::Away, "spread_away_odds", spread_line);
    let total_line = payload.get("total_line").and_then(|v| v.as_f64());
    push(Market::Total, Side::Over, "over_odds", total_line);
    push(Market::Total, Side::Under, "under_odds", total_line);

    entries
}

/// Declared extraction path for the `history[]` array: one entry per
/// `{sportsbook_id, market, side, odds, value, updated_at}` record. Each
/// entry is self-contained, so over/under and home/away pairing falls
/// naturally out of one pass rather than needing a second alignment step.
fn expand_historical(
    history: &[serde_json::Value],
    external_game_id: &str,
    sportsbook_external_id_fallback: &str,
    canonical_game_id: Option<&str>,
) -> Vec<HistoricalOddsPoint> {
    let mut points = Vec::new();

    for item in history {
        let sportsbook_external_id = item
            .get("sportsbook_id")
            .and_then(|v| v.as_str())
            .unwrap_or(sportsbook_external_id_fallback)
            .to_string();

        let market = match item.get("market").and_then(|v| v.as_str()) {
            Some("moneyline") => Market::Moneyline,
            Some("spread") => Market::Spread,
            Some("total") => Market::Total,
            _ => continue,
        };
        let side = match item.get("side").and_then(|v| v.as_str()) {
            Some("home") => Side::Home,
            Some("away") => Side::Away,
            Some("over") => Side::Over,
            Some("under") => Side::Under,
            _ => continue,
        };
        let Some(odds) = item.get("odds").and_then(|v| v.as_i64()) else {
            continue;
        };
        let Some(effective_instant) = item.get("updated_at").and_then(parse_rfc3339) else {
            continue;
        };
        let line_value = if market == Market::Moneyline {
            None
        } else {
            item.get("value").and_then(|v| v.as_f64())
        };

        if let Ok(mut point) = HistoricalOddsPoint::new(
            external_game_id.to_string(),
            sportsbook_external_id,
            market,
            side,
            odds as i32,
            line_value,
            effective_instant,
            false,
        ) {
            point.canonical_game_id = canonical_game_id.map(str::to_string);
            points.push(point);
        }
    }

    points
}

const MARKET_ORDER: [Market; 3] = [Market::Moneyline, Market::Spread, Market::Total];

pub struct StagingProcessor {
    standardizer: TeamStandardizer,
    sportsbooks: SportsbookDirectory,
}

/// Output of one raw row's transformation: the unified rows (one per
/// sportsbook present in the payload) plus every historical odds point
/// derived from the current snapshot and any `history[]` array.
pub struct StagingOutput {
    pub rows: Vec<UnifiedStagingRow>,
    pub historical_points: Vec<HistoricalOddsPoint>,
}

impl StagingProcessor {
    pub fn new(standardizer: TeamStandardizer, sportsbooks: SportsbookDirectory) -> Self {
        Self {
            standardizer,
            sportsbooks,
        }
    }

    /// Transforms one raw row into unified staging rows + historical
    /// points. `raw_table`/`raw_row_id` become the lineage pointer;
    /// `processing_time` is the row's idempotence-key timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn process_raw_row(
        &self,
        source_name: &str,
        collector_name: &str,
        external_game_id: &str,
        canonical_game_id: Option<String>,
        payload: &serde_json::Value,
        history: Option<&Vec<serde_json::Value>>,
        raw_table: &str,
        raw_row_id: Uuid,
        processing_time: DateTime<Utc>,
    ) -> StagingOutput {
        let team_resolution = resolve_teams(payload, &self.standardizer, external_game_id);
        let entries = extract_market_entries(payload);

        let mut by_sportsbook: HashMap<String, Vec<MarketEntry>> = HashMap::new();
        for entry in entries {
            by_sportsbook
                .entry(entry.sportsbook_external_id.clone())
                .or_default()
                .push(entry);
        }
        if by_sportsbook.is_empty() {
            by_sportsbook.insert("unknown".to_string(), Vec::new());
        }

        let mut rows = Vec::new();
        let mut historical_points = Vec::new();

        for (sportsbook_external_id, sb_entries) in by_sportsbook {
            let (sportsbook_name, sportsbook_known) = self.sportsbooks.resolve(&sportsbook_external_id);

            let mut row = UnifiedStagingRow {
                source_name: source_name.to_string(),
                collector_name: collector_name.to_string(),
                canonical_game_id: canonical_game_id.clone(),
                external_game_id: external_game_id.to_string(),
                home_team: team_resolution.home.clone(),
                away_team: team_resolution.away.clone(),
                sportsbook_id: sportsbook_external_id.clone(),
                sportsbook_name: sportsbook_name.clone(),
                market_type: String::new(),
                moneyline_home_odds: None,
                moneyline_away_odds: None,
                spread_line: None,
                spread_home_odds: None,
                spread_away_odds: None,
                total_line: None,
                over_odds: None,
                under_odds: None,
                lineage: DataLineage {
                    raw_table: raw_table.to_string(),
                    raw_row_id,
                    metadata: TransformationMetadata {
                        processor_name: PROCESSOR_NAME.to_string(),
                        processor_version: PROCESSOR_VERSION.to_string(),
                        transformed_at: Some(processing_time),
                        source_field_names: field_names(payload),
                        quality_checks_performed: vec![
                            "completeness".to_string(),
                            "accuracy".to_string(),
                            "consistency".to_string(),
                        ],
                    },
                },
                quality_score: 0.0,
                validation_status: ValidationStatus::Valid,
                validation_errors: Vec::new(),
                processing_time,
            };

            let mut markets_seen: Vec<Market> = Vec::new();
            for entry in &sb_entries {
                if !markets_seen.contains(&entry.market) {
                    markets_seen.push(entry.market);
                }
                match (entry.market, entry.side) {
                    (Market::Moneyline, Side::Home) => {
                        row.moneyline_home_odds.get_or_insert(entry.odds);
                    }
                    (Market::Moneyline, Side::Away) => {
                        row.moneyline_away_odds.get_or_insert(entry.odds);
                    }
                    (Market::Spread, Side::Home) => {
                        if row.spread_line.is_none() {
                            row.spread_line = entry.line;
                        }
                        row.spread_home_odds.get_or_insert(entry.odds);
                    }
                    (Market::Spread, Side::Away) => {
                        if row.spread_line.is_none() {
                            row.spread_line = entry.line;
                        }
                        row.spread_away_odds.get_or_insert(entry.odds);
                    }
                    (Market::Total, Side::Over) => {
                        if row.total_line.is_none() {
                            row.total_line = entry.line;
                        }
                        row.over_odds.get_or_insert(entry.odds);
                    }
                    (Market::Total, Side::Under) => {
                        if row.total_line.is_none() {
                            row.total_line = entry.line;
                        }
                        row.under_odds.get_or_insert(entry.odds);
                    }
                    _ => {}
                }

                // Every current-snapshot entry is also a historical odds
                // point (spec.md §3: "derived from history[] + current
                // snapshot"), flagged `is_current_odds`.
                if let Ok(mut point) = HistoricalOddsPoint::new(
                    external_game_id.to_string(),
                    sportsbook_external_id.clone(),
                    entry.market,
                    entry.side,
                    entry.odds,
                    entry.line,
                    entry.updated_at.unwrap_or(processing_time),
                    true,
                ) {
                    point.canonical_game_id = canonical_game_id.clone();
                    historical_points.push(point);
                }
            }

            row.market_type = if markets_seen.is_empty() {
                "unknown".to_string()
            } else {
                MARKET_ORDER
                    .iter()
                    .filter(|m| markets_seen.contains(m))
                    .map(|m| m.label())
                    .collect::<Vec<_>>()
                    .join("+")
            };

            apply_quality_and_validation(&mut row, team_resolution.valid, sportsbook_known);
            rows.push(row);
        }

        if let Some(history_entries) = history {
            historical_points.extend(expand_historical(
                history_entries,
                external_game_id,
                "unknown",
                canonical_game_id.as_deref(),
            ));
        }

        StagingOutput {
            rows,
            historical_points,
        }
    }
}

fn field_names(payload: &serde_json::Value) -> Vec<String> {
    payload
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

/// Weighted quality score (completeness 0.4, accuracy 0.3, consistency
/// 0.3) and validation status, ported from
/// `_calculate_quality_metrics`'s three helper scores.
fn apply_quality_and_validation(row: &mut UnifiedStagingRow, team_valid: bool, sportsbook_known: bool) {
    let required_present = [
        !row.external_game_id.is_empty(),
        !row.sportsbook_name.is_empty(),
        !row.home_team.is_empty(),
        !row.away_team.is_empty(),
        !row.source_name.is_empty(),
        !row.market_type.is_empty(),
    ];
    let completeness =
        required_present.iter().filter(|present| **present).count() as f64 / required_present.len() as f64;

    let mut accuracy = 1.0;
    if row.sportsbook_name.to_lowercase().contains("unknown") {
        accuracy -= 0.2;
    }
    if !team_valid {
        accuracy -= 0.3;
    }
    let odds_out_of_range = [
        row.moneyline_home_odds,
        row.moneyline_away_odds,
        row.spread_home_odds,
        row.spread_away_odds,
        row.over_odds,
        row.under_odds,
    ]
    .into_iter()
    .flatten()
    .any(|odds| !(-5000..=5000).contains(&odds));
    if odds_out_of_range {
        accuracy -= 0.1;
    }
    let accuracy = accuracy.max(0.0);

    let mut consistency = 1.0;
    if row.market_type.contains("moneyline") && !row.has_moneyline() {
        consistency -= 0.3;
    }
    if row.market_type.contains("spread") && !row.has_spread() {
        consistency -= 0.3;
    }
    if row.market_type.contains("total") && !row.has_total() {
        consistency -= 0.3;
    }
    let consistency = consistency.max(0.0);

    row.quality_score = (completeness * 0.4 + accuracy * 0.3 + consistency * 0.3).clamp(0.0, 1.0);

    if !team_valid {
        row.validation_errors
            .push("team resolution fell back to placeholder codes".to_string());
    }
    if !sportsbook_known {
        row.validation_errors
            .push(format!("unknown sportsbook id '{}'", row.sportsbook_id));
    }
    row.validation_status = if row.validation_errors.is_empty() {
        ValidationStatus::Valid
    } else {
        ValidationStatus::Invalid
    };
}
