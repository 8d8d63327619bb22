//! HTML-table collector.
//!
//! Grounded in the Python original's VSIN processor, which fetches a
//! betting-splits page and parses it with BeautifulSoup against a
//! declarative column layout (`staging_vsin_betting_processor.py`'s
//! handle/bets-percent table). `scraper` plays the equivalent role here:
//! a CSS selector per column, one row per game/sportsbook pairing. Raw
//! cell text is carried through untouched in `payload`; numeric/percent
//! parsing happens downstream in staging (C9), consistent with "collect
//! never transforms" elsewhere in this crate.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use tracing::warn;

use super::{Collector, CollectionResult};
use crate::error::{PipelineError, Result};
use crate::types::RawCollectionRecord;

/// One table column to extract, keyed by the field name it becomes in
/// the row's JSON payload.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub field_name: String,
    pub selector: String,
}

#[derive(Debug, Clone)]
pub struct HtmlCollectorConfig {
    pub source_name: String,
    pub page_url: String,
    pub row_selector: String,
    pub game_key_field: String,
    pub columns: Vec<ColumnSpec>,
}

pub struct HtmlCollector {
    config: HtmlCollectorConfig,
    http_client: reqwest::Client,
}

impl HtmlCollector {
    pub fn new(config: HtmlCollectorConfig, http_client: reqwest::Client) -> Self {
        Self { config, http_client }
    }

    fn parse_rows(&self, body: &str) -> Result<Vec<serde_json::Value>> {
        let document = Html::parse_document(body);
        let row_selector = Selector::parse(&self.config.row_selector)
            .map_err(|e| PipelineError::schema(self.config.source_name.clone(), format!("{e:?}")))?;

        let mut rows = Vec::new();
        for row_element in document.select(&row_selector) {
            let mut fields = serde_json::Map::new();
            for column in &self.config.columns {
                let Ok(selector) = Selector::parse(&column.selector) else {
                    continue;
                };
                let text = row_element
                    .select(&selector)
                    .next()
                    .map(|el| el.text().collect::<String>().trim().to_string())
                    .unwrap_or_default();
                fields.insert(column.field_name.clone(), serde_json::Value::String(text));
            }
            rows.push(serde_json::Value::Object(fields));
        }
        Ok(rows)
    }
}

#[async_trait]
impl Collector for HtmlCollector {
    fn source_name(&self) -> &str {
        &self.config.source_name
    }

    async fn test_connection(&self) -> Result<bool> {
        let response = self
            .http_client
            .head(&self.config.page_url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn collect(&self) -> Result<CollectionResult> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(&self.config.page_url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::transient(
                self.config.source_name.clone(),
                format!("status {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::transient(self.config.source_name.clone(), e.to_string()))?;

        let rows = self.parse_rows(&body)?;
        let response_time_ms = started.elapsed().as_millis() as u64;
        if rows.is_empty() {
            warn!(source = %self.config.source_name, "html table yielded zero rows, layout may have changed");
        }

        let now = Utc::now();
        let data = rows
            .into_iter()
            .filter_map(|row| {
                let external_game_key = row.get(&self.config.game_key_field)?.as_str()?.to_string();
                if external_game_key.is_empty() {
                    return None;
                }
                Some(RawCollectionRecord {
                    source: self.config.source_name.clone(),
                    external_game_key,
                    sportsbook_external_key: None,
                    payload: row,
                    collected_at: now,
                    history: None,
                })
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

    fn config() -> HtmlCollectorConfig {
        HtmlCollectorConfig {
            source_name: "vsin".into(),
            page_url: "https://example.com/splits".into(),
            row_selector: "tr.game-row".into(),
            game_key_field: "matchup_id".into(),
            columns: vec![
                ColumnSpec {
                    field_name: "matchup_id".into(),
                    selector: "td.matchup".into(),
                },
                ColumnSpec {
                    field_name: "handle_percent".into(),
                    selector: "td.handle".into(),
                },
            ],
        }
    }

    #[test]
    fn parses_rows_from_declared_columns() {
        let html = r#"
            <table>
              <tr class="game-row">
                <td class="matchup">NYY@BOS</td>
                <td class="handle">63%</td>
              </tr>
            </table>
        "#;
        let collector = HtmlCollector::new(
            config(),
            reqwest::Client::new(),
        );
        let rows = collector.parse_rows(html).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["matchup_id"], "NYY@BOS");
        assert_eq!(rows[0]["handle_percent"], "63%");
    }

    #[test]
    fn missing_rows_yields_empty_vec() {
        let collector = HtmlCollector::new(config(), reqwest::Client::new());
        let rows = collector.parse_rows("<table></table>").unwrap();
        assert!(rows.is_empty());
    }
}
