//! C6 — collection health / confidence analysis.
//!
//! Ported from the Python original's `health_monitoring.py`: a
//! confidence-score formula with fixed penalties, three-tier health
//! classification (HEALTHY/DEGRADED/CRITICAL), and a failure-pattern
//! detector that looks at error text and item counts to decide whether a
//! collection attempt is a transient blip or something systemic.

use std::collections::VecDeque;

use serde::Serialize;

pub const WARNING_PENALTY: f64 = 0.1;
pub const ERROR_PENALTY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePattern {
    NetworkTimeout,
    RateLimiting,
    SchemaChange,
    DataCorruption,
    SystematicFailure,
    CollectionGap,
}

/// Rolling metrics for one source, accumulated across poll cycles.
#[derive(Debug, Clone)]
pub struct CollectionHealthMetrics {
    pub success_rate: f64,
    pub confidence_score: f64,
    pub gap_hours: f64,
    pub consecutive_failures: u32,
}

impl CollectionHealthMetrics {
    pub fn is_healthy(&self) -> bool {
        self.success_rate >= 0.9
            && self.confidence_score >= 0.8
            && self.gap_hours < 1.0
            && self.consecutive_failures < 3
    }

    pub fn is_degraded(&self) -> bool {
        (self.success_rate >= 0.5 && self.success_rate < 0.9)
            || (self.confidence_score >= 0.5 && self.confidence_score < 0.8)
            || (self.gap_hours >= 1.0 && self.gap_hours < 4.0)
            || (self.consecutive_failures >= 3 && self.consecutive_failures < 5)
    }

    pub fn is_critical(&self) -> bool {
        !self.is_healthy() && !self.is_degraded()
    }

    pub fn health_status(&self) -> HealthStatus {
        if self.is_healthy() {
            HealthStatus::Healthy
        } else if self.is_degraded() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

/// Outcome of one collection attempt, fed into the confidence analyzer.
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub source: String,
    pub items_collected: usize,
    pub expected_min_items: Option<usize>,
    pub expected_max_items: Option<usize>,
    pub error_messages: Vec<String>,
    pub schema_valid: bool,
    pub freshness_score: f64,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionHealthResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub confidence_score: f64,
    pub health_status_hint: Option<HealthStatus>,
    pub detected_patterns: Vec<FailurePattern>,
    pub recovery_suggestions: Vec<String>,
    pub is_recoverable: bool,
    pub requires_alert: bool,
    pub alert_severity: Option<AlertSeverity>,
}

impl CollectionHealthResult {
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// History of recent outcomes for a source, used for the ±30%/+50%
/// deviation tolerance band in `_analyze_historical_patterns` and the
/// observed-vs-historical latency check.
pub struct SourceHistory {
    recent_item_counts: VecDeque<usize>,
    recent_latencies_ms: VecDeque<u64>,
}

impl Default for SourceHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceHistory {
    const CAPACITY: usize = 30;

    pub fn new() -> Self {
        Self {
            recent_item_counts: VecDeque::new(),
            recent_latencies_ms: VecDeque::new(),
        }
    }

    pub fn record(&mut self, items: usize) {
        self.recent_item_counts.push_back(items);
        if self.recent_item_counts.len() > Self::CAPACITY {
            self.recent_item_counts.pop_front();
        }
    }

    pub fn record_latency(&mut self, response_time_ms: u64) {
        self.recent_latencies_ms.push_back(response_time_ms);
        if self.recent_latencies_ms.len() > Self::CAPACITY {
            self.recent_latencies_ms.pop_front();
        }
    }

    fn average(&self) -> Option<f64> {
        if self.recent_item_counts.is_empty() {
            return None;
        }
        Some(
            self.recent_item_counts.iter().sum::<usize>() as f64
                / self.recent_item_counts.len() as f64,
        )
    }

    fn average_latency_ms(&self) -> Option<f64> {
        if self.recent_latencies_ms.is_empty() {
            return None;
        }
        Some(
            self.recent_latencies_ms.iter().sum::<u64>() as f64
                / self.recent_latencies_ms.len() as f64,
        )
    }
}

pub struct CollectionConfidenceAnalyzer;

impl CollectionConfidenceAnalyzer {
    pub fn analyze_result(
        outcome: &CollectionOutcome,
        history: &SourceHistory,
    ) -> CollectionHealthResult {
        let mut result = CollectionHealthResult::default();
        result.confidence_score = Self::calculate_confidence_score(outcome, &mut result);

        Self::analyze_historical_patterns(outcome, history, &mut result);
        Self::detect_failure_patterns(outcome, &mut result);
        result.health_status_hint = Some(Self::determine_health_status(&result));
        Self::generate_recovery_suggestions(&mut result);
        Self::assess_alert_necessity(&mut result);

        result
    }

    fn calculate_confidence_score(
        outcome: &CollectionOutcome,
        result: &mut CollectionHealthResult,
    ) -> f64 {
        let mut score = 1.0;

        score -= outcome.error_messages.len() as f64 * ERROR_PENALTY;
        // Warnings accumulate separately in `result.warnings`, not from
        // the outcome directly; callers append warnings before scoring
        // finalizes via `add_warning`, matching the original's mutable
        // pass-through.
        score -= result.warnings.len() as f64 * WARNING_PENALTY;

        if !outcome.schema_valid {
            score -= 0.2;
        }

        score *= outcome.freshness_score;

        if outcome.items_collected == 0 {
            score -= 0.4;
            result.add_warning("zero items collected");
        } else if let Some(min) = outcome.expected_min_items {
            if outcome.items_collected < min {
                score -= 0.2;
                result.add_warning(format!(
                    "collected {} items, below expected minimum {}",
                    outcome.items_collected, min
                ));
            }
        }
        if let Some(max) = outcome.expected_max_items {
            if outcome.items_collected > max {
                score -= 0.1;
                result.add_warning(format!(
                    "collected {} items, above expected maximum {}",
                    outcome.items_collected, max
                ));
            }
        }

        score.clamp(0.0, 1.0)
    }

    /// ±30% of the rolling average is tolerated silently; a deviation
    /// beyond 50% is flagged as a warning. A count under 70% of the
    /// rolling mean is additionally treated as possible data corruption,
    /// not just a deviation warning.
    fn analyze_historical_patterns(
        outcome: &CollectionOutcome,
        history: &SourceHistory,
        result: &mut CollectionHealthResult,
    ) {
        let Some(average) = history.average() else {
            return;
        };
        if average <= 0.0 {
            return;
        }
        let deviation = (outcome.items_collected as f64 - average).abs() / average;
        if deviation > 0.5 {
            result.add_warning(format!(
                "item count {} deviates {:.0}% from rolling average {:.1}",
                outcome.items_collected,
                deviation * 100.0,
                average
            ));
        }
        if (outcome.items_collected as f64) < average * 0.7 {
            result.detected_patterns.push(FailurePattern::DataCorruption);
        }

        if let Some(avg_latency) = history.average_latency_ms() {
            if avg_latency > 0.0 && (outcome.response_time_ms as f64) > avg_latency * 2.0 {
                result.detected_patterns.push(FailurePattern::NetworkTimeout);
            }
        }
    }

    fn detect_failure_patterns(outcome: &CollectionOutcome, result: &mut CollectionHealthResult) {
        let joined = outcome.error_messages.join(" ").to_lowercase();

        if joined.contains("429") || joined.contains("rate limit") {
            result.detected_patterns.push(FailurePattern::RateLimiting);
        }
        if joined.contains("timeout") || joined.contains("timed out") {
            result.detected_patterns.push(FailurePattern::NetworkTimeout);
        }
        if outcome.error_messages.is_empty() && outcome.items_collected == 0 && outcome.schema_valid
        {
            result.detected_patterns.push(FailurePattern::SchemaChange);
        }
    }

    fn determine_health_status(result: &CollectionHealthResult) -> HealthStatus {
        if result
            .detected_patterns
            .contains(&FailurePattern::SystematicFailure)
        {
            return HealthStatus::Critical;
        }
        if result.confidence_score >= 0.8 && result.errors.is_empty() {
            HealthStatus::Healthy
        } else if result.confidence_score >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    fn generate_recovery_suggestions(result: &mut CollectionHealthResult) {
        result.is_recoverable = true;

        for pattern in &result.detected_patterns {
            match pattern {
                FailurePattern::RateLimiting => result
                    .recovery_suggestions
                    .push("increase backoff / reduce poll frequency for this source".into()),
                FailurePattern::NetworkTimeout => result
                    .recovery_suggestions
                    .push("retry with longer timeout; check source availability".into()),
                FailurePattern::SchemaChange => {
                    result
                        .recovery_suggestions
                        .push("source returned zero items with a valid schema; inspect for an upstream layout change".into());
                    result.is_recoverable = false;
                }
                FailurePattern::DataCorruption => result
                    .recovery_suggestions
                    .push("quarantine payload and alert for manual schema review".into()),
                FailurePattern::SystematicFailure => {
                    result
                        .recovery_suggestions
                        .push("escalate: repeated failures across sources".into());
                    result.is_recoverable = false;
                }
                FailurePattern::CollectionGap => result
                    .recovery_suggestions
                    .push("trigger a backfill collection for the missed window".into()),
            }
        }
    }

    fn assess_alert_necessity(result: &mut CollectionHealthResult) {
        let status = result.health_status_hint.unwrap_or(HealthStatus::Unknown);
        match status {
            HealthStatus::Critical => {
                result.requires_alert = true;
                result.alert_severity = Some(AlertSeverity::Critical);
            }
            HealthStatus::Degraded => {
                result.requires_alert = true;
                result.alert_severity = Some(AlertSeverity::Warning);
            }
            HealthStatus::Healthy | HealthStatus::Unknown => {
                result.requires_alert = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_outcome() -> CollectionOutcome {
        CollectionOutcome {
            source: "vsin".into(),
            items_collected: 20,
            expected_min_items: Some(10),
            expected_max_items: Some(50),
            error_messages: vec![],
            schema_valid: true,
            freshness_score: 1.0,
            response_time_ms: 100,
        }
    }

    #[test]
    fn healthy_metrics_classify_as_healthy() {
        let metrics = CollectionHealthMetrics {
            success_rate: 0.95,
            confidence_score: 0.9,
            gap_hours: 0.2,
            consecutive_failures: 0,
        };
        assert_eq!(metrics.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn degraded_metrics_classify_as_degraded() {
        let metrics = CollectionHealthMetrics {
            success_rate: 0.7,
            confidence_score: 0.9,
            gap_hours: 0.2,
            consecutive_failures: 0,
        };
        assert_eq!(metrics.health_status(), HealthStatus::Degraded);
    }

    #[test]
    fn critical_metrics_classify_as_critical() {
        let metrics = CollectionHealthMetrics {
            success_rate: 0.1,
            confidence_score: 0.1,
            gap_hours: 10.0,
            consecutive_failures: 10,
        };
        assert_eq!(metrics.health_status(), HealthStatus::Critical);
    }

    #[test]
    fn zero_items_penalized_and_flagged() {
        let outcome = CollectionOutcome {
            items_collected: 0,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &SourceHistory::new());
        assert!(result.confidence_score < 0.7);
        assert!(result.warnings.iter().any(|w| w.contains("zero items")));
    }

    #[test]
    fn zero_items_with_valid_schema_and_no_errors_detects_schema_change() {
        let outcome = CollectionOutcome {
            items_collected: 0,
            expected_min_items: None,
            expected_max_items: None,
            error_messages: vec![],
            schema_valid: true,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &SourceHistory::new());
        assert!(result
            .detected_patterns
            .contains(&FailurePattern::SchemaChange));
        assert!(!result.is_recoverable);
    }

    #[test]
    fn rate_limit_error_text_detected() {
        let outcome = CollectionOutcome {
            error_messages: vec!["HTTP 429 Too Many Requests".into()],
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &SourceHistory::new());
        assert!(result
            .detected_patterns
            .contains(&FailurePattern::RateLimiting));
    }

    #[test]
    fn large_deviation_from_rolling_average_flagged() {
        let mut history = SourceHistory::new();
        for _ in 0..10 {
            history.record(20);
        }
        let outcome = CollectionOutcome {
            items_collected: 2,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &history);
        assert!(result.warnings.iter().any(|w| w.contains("deviates")));
    }

    #[test]
    fn count_under_70_percent_of_mean_detects_data_corruption() {
        let mut history = SourceHistory::new();
        for _ in 0..10 {
            history.record(20);
        }
        let outcome = CollectionOutcome {
            items_collected: 13,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &history);
        assert!(result
            .detected_patterns
            .contains(&FailurePattern::DataCorruption));
    }

    #[test]
    fn count_above_70_percent_of_mean_does_not_flag_corruption() {
        let mut history = SourceHistory::new();
        for _ in 0..10 {
            history.record(20);
        }
        let outcome = CollectionOutcome {
            items_collected: 15,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &history);
        assert!(!result
            .detected_patterns
            .contains(&FailurePattern::DataCorruption));
    }

    #[test]
    fn latency_over_double_historical_mean_detects_secondary_network_timeout() {
        let mut history = SourceHistory::new();
        for _ in 0..10 {
            history.record_latency(200);
        }
        let outcome = CollectionOutcome {
            response_time_ms: 500,
            ..healthy_outcome()
        };
        let result = CollectionConfidenceAnalyzer::analyze_result(&outcome, &history);
        assert!(result
            .detected_patterns
            .contains(&FailurePattern::NetworkTimeout));
    }
}
