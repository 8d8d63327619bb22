//! C7 — alert rules and delivery.
//!
//! Ported from the Python original's alert manager: a small, closed rule
//! DSL (no `eval`, a fixed set of comparison atoms combined with AND/OR),
//! per-rule cooldown bookkeeping so a flapping condition doesn't spam a
//! channel, and multi-channel delivery where one channel's failure never
//! blocks another's.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::health::AlertSeverity;

/// A single named metric the rule engine can compare against. Kept as a
/// closed enum, not a free-form string key, so a rule can never reference
/// a field that doesn't exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricAtom {
    SuccessRate,
    ConfidenceScore,
    GapHours,
    ConsecutiveFailures,
    ItemsCollected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
}

#[derive(Debug, Clone)]
pub enum AlertCondition {
    Compare {
        metric: MetricAtom,
        comparator: Comparator,
        threshold: f64,
    },
    And(Box<AlertCondition>, Box<AlertCondition>),
    Or(Box<AlertCondition>, Box<AlertCondition>),
}

/// Snapshot of metric values a condition is evaluated against. Built by
/// the health analyzer (C6) per source per cycle.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    pub values: HashMap<MetricAtom, f64>,
}

impl MetricSnapshot {
    pub fn set(&mut self, metric: MetricAtom, value: f64) -> &mut Self {
        self.values.insert(metric, value);
        self
    }
}

impl AlertCondition {
    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> bool {
        match self {
            AlertCondition::Compare {
                metric,
                comparator,
                threshold,
            } => {
                let Some(&value) = snapshot.values.get(metric) else {
                    return false;
                };
                match comparator {
                    Comparator::LessThan => value < *threshold,
                    Comparator::LessThanOrEqual => value <= *threshold,
                    Comparator::GreaterThan => value > *threshold,
                    Comparator::GreaterThanOrEqual => value >= *threshold,
                    Comparator::Equal => (value - *threshold).abs() < f64::EPSILON,
                }
            }
            AlertCondition::And(left, right) => left.evaluate(snapshot) && right.evaluate(snapshot),
            AlertCondition::Or(left, right) => left.evaluate(snapshot) || right.evaluate(snapshot),
        }
    }
}

/// Per-rule channel enablement (spec.md §6's "channel flags"): a rule
/// fires through the intersection of its enabled kinds and whatever
/// channels `AlertManager` was constructed with.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFlags {
    pub email: bool,
    pub webhook: bool,
    pub chat: bool,
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            email: true,
            webhook: true,
            chat: true,
        }
    }
}

impl ChannelFlags {
    fn allows(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Email => self.email,
            ChannelKind::Webhook => self.webhook,
            ChannelKind::Chat => self.chat,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub cooldown: Duration,
    /// How many times `condition` must evaluate true within
    /// `time_window_minutes` before the rule is armed to fire. `1` is the
    /// immediate-fire behavior the rule engine originally had.
    pub failure_count_threshold: u32,
    pub time_window_minutes: u32,
    /// Caps deliveries of this rule across all sources combined; once hit,
    /// further evaluations are suppressed until the hour rolls off.
    pub max_alerts_per_hour: u32,
    pub channels: ChannelFlags,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        condition: AlertCondition,
        severity: AlertSeverity,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            condition,
            severity,
            cooldown,
            failure_count_threshold: 1,
            time_window_minutes: 60,
            max_alerts_per_hour: 10,
            channels: ChannelFlags::default(),
        }
    }

    pub fn with_failure_count_threshold(mut self, threshold: u32, time_window_minutes: u32) -> Self {
        self.failure_count_threshold = threshold;
        self.time_window_minutes = time_window_minutes;
        self
    }

    pub fn with_max_alerts_per_hour(mut self, max: u32) -> Self {
        self.max_alerts_per_hour = max;
        self
    }

    pub fn with_channels(mut self, channels: ChannelFlags) -> Self {
        self.channels = channels;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub rule_name: String,
    pub source: String,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Alert type, used by the gap/dead-tuple/cascade detectors and the
/// per-result rule engine alike so the Alert API can filter on one field
/// regardless of which detector raised the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RuleTriggered,
    CollectionGap,
    DeadTuples,
    Cascade,
}

/// The durable alert entity from spec.md §3: created by a detector or
/// the rule engine, lives active until explicitly resolved, retained
/// afterward for audit. Alert Manager exclusively owns this state.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionAlert {
    pub id: Uuid,
    pub source: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub auto_recoverable: bool,
    pub metadata: HashMap<String, String>,
    pub recovery_suggestions: Vec<String>,
    pub resolution_notes: Option<String>,
}

impl CollectionAlert {
    pub fn new(
        source: impl Into<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        auto_recoverable: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            alert_type,
            severity,
            message: message.into(),
            created_at: Utc::now(),
            resolved_at: None,
            is_active: true,
            auto_recoverable,
            metadata: HashMap::new(),
            recovery_suggestions: Vec::new(),
            resolution_notes: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_recovery_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.recovery_suggestions = suggestions;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Email,
    Webhook,
    Chat,
}

#[async_trait::async_trait]
pub trait AlertChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, event: &AlertEvent) -> Result<(), String>;
}

/// Logs the alert instead of delivering it anywhere. Always present so
/// operators running without configured channels still see alerts.
pub struct LoggingChannel;

#[async_trait::async_trait]
impl AlertChannel for LoggingChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), String> {
        info!(
            rule = %event.rule_name,
            source = %event.source,
            severity = ?event.severity,
            "{}",
            event.message
        );
        Ok(())
    }
}

pub struct AlertManager {
    rules: Vec<AlertRule>,
    channels: Vec<Box<dyn AlertChannel>>,
    last_fired: Mutex<HashMap<(String, String), Instant>>,
    alerts: Mutex<HashMap<Uuid, CollectionAlert>>,
    /// Timestamps of recent true condition-evaluations per (rule, source),
    /// for the `failure_count_threshold`/`time_window_minutes` gate.
    recent_trips: Mutex<HashMap<(String, String), std::collections::VecDeque<Instant>>>,
    /// Timestamps of recent deliveries per rule, for `max_alerts_per_hour`.
    recent_fires: Mutex<HashMap<String, std::collections::VecDeque<Instant>>>,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>, channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self {
            rules,
            channels,
            last_fired: Mutex::new(HashMap::new()),
            alerts: Mutex::new(HashMap::new()),
            recent_trips: Mutex::new(HashMap::new()),
            recent_fires: Mutex::new(HashMap::new()),
        }
    }

    /// Records a new alert and delivers it to every channel; the
    /// returned id is what `resolve` later takes.
    pub async fn raise(&self, alert: CollectionAlert) -> Uuid {
        let id = alert.id;
        let event = AlertEvent {
            rule_name: format!("{:?}", alert.alert_type),
            source: alert.source.clone(),
            severity: alert.severity,
            message: alert.message.clone(),
        };

        for channel in &self.channels {
            if let Err(err) = channel.send(&event).await {
                error!(channel = ?channel.kind(), error = %err, "alert delivery failed");
            }
        }

        self.alerts.lock().await.insert(id, alert);
        id
    }

    /// Marks an alert inactive with a resolution timestamp and operator
    /// notes. Returns `false` if no alert with that id is known.
    pub async fn resolve(&self, alert_id: Uuid, notes: impl Into<String>) -> bool {
        let mut alerts = self.alerts.lock().await;
        let Some(alert) = alerts.get_mut(&alert_id) else {
            return false;
        };
        alert.is_active = false;
        alert.resolved_at = Some(Utc::now());
        alert.resolution_notes = Some(notes.into());
        true
    }

    /// Active alerts, optionally filtered by source and/or severity —
    /// backs the Alert API's list endpoint.
    pub async fn list_active(
        &self,
        source: Option<&str>,
        severity: Option<AlertSeverity>,
    ) -> Vec<CollectionAlert> {
        self.alerts
            .lock()
            .await
            .values()
            .filter(|a| a.is_active)
            .filter(|a| source.map(|s| a.source == s).unwrap_or(true))
            .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Evaluates every rule against `snapshot` for `source`, honoring each
    /// rule's cooldown, its `failure_count_threshold`/`time_window_minutes`
    /// arming window, and its `max_alerts_per_hour` rate cap, delivering
    /// any that clear all three to every channel its `channels` flags
    /// allow. One channel erroring is logged and does not stop delivery to
    /// the rest.
    pub async fn evaluate(&self, source: &str, snapshot: &MetricSnapshot) -> Vec<AlertEvent> {
        let mut fired = Vec::new();

        for rule in &self.rules {
            if !rule.condition.evaluate(snapshot) {
                continue;
            }

            let now = Instant::now();
            let window = Duration::from_secs(rule.time_window_minutes as u64 * 60);
            let trip_key = (rule.name.clone(), source.to_string());
            let armed = {
                let mut recent_trips = self.recent_trips.lock().await;
                let trips = recent_trips.entry(trip_key).or_default();
                trips.push_back(now);
                while trips.front().map(|t| now.duration_since(*t) > window).unwrap_or(false) {
                    trips.pop_front();
                }
                trips.len() as u32 >= rule.failure_count_threshold
            };
            if !armed {
                continue;
            }

            let cooldown_key = (rule.name.clone(), source.to_string());
            {
                let mut last_fired = self.last_fired.lock().await;
                if let Some(&last) = last_fired.get(&cooldown_key) {
                    if last.elapsed() < rule.cooldown {
                        continue;
                    }
                }
                last_fired.insert(cooldown_key, now);
            }

            let rate_limited = {
                let mut recent_fires = self.recent_fires.lock().await;
                let fires = recent_fires.entry(rule.name.clone()).or_default();
                while fires.front().map(|t| now.duration_since(*t) > Duration::from_secs(3600)).unwrap_or(false) {
                    fires.pop_front();
                }
                if fires.len() as u32 >= rule.max_alerts_per_hour {
                    true
                } else {
                    fires.push_back(now);
                    false
                }
            };
            if rate_limited {
                continue;
            }

            let event = AlertEvent {
                rule_name: rule.name.clone(),
                source: source.to_string(),
                severity: rule.severity,
                message: format!("rule '{}' fired for source '{source}'", rule.name),
            };

            for channel in &self.channels {
                if !rule.channels.allows(channel.kind()) {
                    continue;
                }
                if let Err(err) = channel.send(&event).await {
                    error!(channel = ?channel.kind(), error = %err, "alert delivery failed");
                }
            }

            fired.push(event);
        }

        fired
    }
}

/// Detects a source going silent: no successful collection within
/// `max_gap_hours`.
pub fn detect_collection_gap(gap_hours: f64, max_gap_hours: f64) -> bool {
    gap_hours >= max_gap_hours
}

/// Detects cascading failure: more than `threshold` distinct sources
/// simultaneously unhealthy, which the per-source breaker/alert logic
/// alone wouldn't surface as a single signal.
pub fn detect_cascade(unhealthy_source_count: usize, total_source_count: usize, threshold: f64) -> bool {
    if total_source_count == 0 {
        return false;
    }
    unhealthy_source_count as f64 / total_source_count as f64 >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(success_rate: f64, consecutive_failures: f64) -> MetricSnapshot {
        let mut s = MetricSnapshot::default();
        s.set(MetricAtom::SuccessRate, success_rate);
        s.set(MetricAtom::ConsecutiveFailures, consecutive_failures);
        s
    }

    #[test]
    fn compare_condition_evaluates_threshold() {
        let condition = AlertCondition::Compare {
            metric: MetricAtom::SuccessRate,
            comparator: Comparator::LessThan,
            threshold: 0.9,
        };
        assert!(condition.evaluate(&snapshot(0.5, 0.0)));
        assert!(!condition.evaluate(&snapshot(0.95, 0.0)));
    }

    #[test]
    fn and_condition_requires_both() {
        let condition = AlertCondition::And(
            Box::new(AlertCondition::Compare {
                metric: MetricAtom::SuccessRate,
                comparator: Comparator::LessThan,
                threshold: 0.9,
            }),
            Box::new(AlertCondition::Compare {
                metric: MetricAtom::ConsecutiveFailures,
                comparator: Comparator::GreaterThanOrEqual,
                threshold: 3.0,
            }),
        );
        assert!(!condition.evaluate(&snapshot(0.5, 0.0)));
        assert!(condition.evaluate(&snapshot(0.5, 3.0)));
    }

    #[test]
    fn missing_metric_never_fires() {
        let condition = AlertCondition::Compare {
            metric: MetricAtom::GapHours,
            comparator: Comparator::GreaterThan,
            threshold: 1.0,
        };
        assert!(!condition.evaluate(&snapshot(0.5, 0.0)));
    }

    struct FailingChannel;
    #[async_trait::async_trait]
    impl AlertChannel for FailingChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Webhook
        }
        async fn send(&self, _event: &AlertEvent) -> Result<(), String> {
            Err("webhook unreachable".into())
        }
    }

    fn low_success_rule(cooldown: Duration) -> AlertRule {
        AlertRule::new(
            "low_success",
            AlertCondition::Compare {
                metric: MetricAtom::SuccessRate,
                comparator: Comparator::LessThan,
                threshold: 0.9,
            },
            AlertSeverity::Warning,
            cooldown,
        )
    }

    #[tokio::test]
    async fn one_channel_failing_does_not_block_others() {
        let rule = low_success_rule(Duration::from_secs(60));
        let manager = AlertManager::new(
            vec![rule],
            vec![Box::new(FailingChannel), Box::new(LoggingChannel)],
        );
        let fired = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_fire() {
        let rule = low_success_rule(Duration::from_secs(300));
        let manager = AlertManager::new(vec![rule], vec![Box::new(LoggingChannel)]);
        let first = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        let second = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[tokio::test]
    async fn failure_count_threshold_requires_repeated_trips_before_arming() {
        let rule = low_success_rule(Duration::from_secs(0)).with_failure_count_threshold(3, 60);
        let manager = AlertManager::new(vec![rule], vec![Box::new(LoggingChannel)]);

        let first = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        let second = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        let third = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;

        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(third.len(), 1, "third trip within the window arms the rule");
    }

    #[tokio::test]
    async fn max_alerts_per_hour_suppresses_once_cap_reached() {
        let rule = low_success_rule(Duration::from_secs(0)).with_max_alerts_per_hour(1);
        let manager = AlertManager::new(vec![rule], vec![Box::new(LoggingChannel)]);

        let first = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        let second = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;

        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "second delivery exceeds the per-hour cap");
    }

    #[tokio::test]
    async fn channel_flags_restrict_delivery_to_enabled_kinds() {
        let rule = low_success_rule(Duration::from_secs(60)).with_channels(ChannelFlags {
            email: false,
            webhook: false,
            chat: true,
        });
        let manager = AlertManager::new(vec![rule], vec![Box::new(FailingChannel), Box::new(LoggingChannel)]);
        // FailingChannel reports Webhook, which this rule disables, so its
        // failure must never surface and the rule still fires via chat.
        let fired = manager.evaluate("vsin", &snapshot(0.1, 0.0)).await;
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn cascade_detected_above_threshold() {
        assert!(detect_cascade(3, 5, 0.5));
        assert!(!detect_cascade(1, 5, 0.5));
    }

    #[tokio::test]
    async fn raised_alert_is_listed_active_until_resolved() {
        let manager = AlertManager::new(vec![], vec![Box::new(LoggingChannel)]);
        let alert = CollectionAlert::new(
            "vsin",
            AlertType::CollectionGap,
            AlertSeverity::Critical,
            "no collection in 9h",
            false,
        );
        let id = manager.raise(alert).await;

        let active = manager.list_active(Some("vsin"), None).await;
        assert_eq!(active.len(), 1);
        assert!(active[0].is_active);

        assert!(manager.resolve(id, "backfilled manually").await);
        let active = manager.list_active(Some("vsin"), None).await;
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn resolve_unknown_alert_returns_false() {
        let manager = AlertManager::new(vec![], vec![Box::new(LoggingChannel)]);
        assert!(!manager.resolve(Uuid::new_v4(), "n/a").await);
    }
}
