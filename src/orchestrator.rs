//! C8 — plans, schedules, and executes collection tasks, wiring C1–C7
//! together.
//!
//! Ported from the Python original's `enhanced_orchestrator.py` /
//! `orchestrator.py`: a priority-ordered, dependency-gated scheduling
//! loop with a concurrency cap, per-task execution through the rate
//! limiter and circuit breaker, health analysis and alerting on every
//! result, and a recovery-plan builder keyed off detected failure
//! patterns. `tokio::task::JoinSet` plays the role of the original's
//! asyncio task set for the "await any-complete" step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::{AlertManager, AlertType, CollectionAlert};
use crate::circuit_breaker::{CallOutcome, CircuitBreaker};
use crate::collectors::Collector;
use crate::config::OrchestratorConfig;
use crate::error::PipelineError;
use crate::health::{
    AlertSeverity, CollectionConfidenceAnalyzer, CollectionHealthMetrics, CollectionOutcome,
    FailurePattern, SourceHistory,
};
use crate::rate_limiter::RateLimiter;
use crate::sync::{DataSynchronizer, TimestampedData};
use crate::types::RawCollectionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub priority: Priority,
    pub interval: Duration,
    pub retries: u32,
    pub timeout: Duration,
    pub require_schema_valid: bool,
    pub depends_on: Vec<String>,
    pub params: HashMap<String, String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, priority: Priority, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            priority,
            interval: Duration::from_secs(30),
            retries: 3,
            timeout,
            require_schema_valid: true,
            depends_on: Vec::new(),
            params: HashMap::new(),
        }
    }

    pub fn depends_on(mut self, sources: Vec<String>) -> Self {
        self.depends_on = sources;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    /// Reserved for fidelity with spec.md's status set; C1's `acquire`
    /// never fails (it slow-paths instead), so this port never actually
    /// produces it.
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct CollectionTask {
    pub id: Uuid,
    pub source: String,
    pub priority: Priority,
    pub deadline: Instant,
    pub attempts: u32,
    pub status: TaskStatus,
    pub depends_on: Vec<Uuid>,
    pub dependents: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Timeout,
}

pub struct CollectionPlan {
    pub id: Uuid,
    pub tasks: Vec<CollectionTask>,
    pub concurrency_cap: usize,
    pub total_deadline: Duration,
    pub status: PlanStatus,
}

/// Outcome of one task's execution, keyed by task id in the map
/// `run_plan` returns — the "result ref" from spec.md's `CollectionTask`.
pub struct TaskResult {
    pub records: Vec<RawCollectionRecord>,
    pub health: CollectionHealthMetrics,
    pub classification: TaskStatus,
}

impl TaskResult {
    fn unavailable(source: &str, reason: &str) -> Self {
        warn!(source, reason, "task could not run");
        Self {
            records: Vec::new(),
            health: CollectionHealthMetrics {
                success_rate: 0.0,
                confidence_score: 0.0,
                gap_hours: 0.0,
                consecutive_failures: 0,
            },
            classification: TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RetryWithBackoff,
    RestartCollector,
    SwitchToFallback,
    EnableDegraded,
    AlertManualIntervention,
}

/// Exact action table from spec.md §4.8: the detected pattern (first
/// match wins, checked in the table's own order) decides the recovery
/// sequence.
fn recovery_actions_for(patterns: &[FailurePattern]) -> Vec<RecoveryAction> {
    if patterns.contains(&FailurePattern::RateLimiting) {
        return vec![RecoveryAction::RetryWithBackoff, RecoveryAction::EnableDegraded];
    }
    if patterns.contains(&FailurePattern::NetworkTimeout) {
        return vec![
            RecoveryAction::RetryWithBackoff,
            RecoveryAction::RestartCollector,
            RecoveryAction::SwitchToFallback,
        ];
    }
    if patterns.contains(&FailurePattern::SchemaChange) {
        return vec![RecoveryAction::AlertManualIntervention, RecoveryAction::EnableDegraded];
    }
    if patterns.contains(&FailurePattern::SystematicFailure) {
        return vec![
            RecoveryAction::RestartCollector,
            RecoveryAction::SwitchToFallback,
            RecoveryAction::AlertManualIntervention,
        ];
    }
    vec![
        RecoveryAction::RetryWithBackoff,
        RecoveryAction::RestartCollector,
        RecoveryAction::EnableDegraded,
        RecoveryAction::AlertManualIntervention,
    ]
}

/// SUCCESS classification rule from spec.md §4.8: underlying success AND
/// confidence ≥ 0.7.
fn classify(underlying_success: bool, confidence_score: f64) -> TaskStatus {
    if underlying_success && confidence_score >= 0.7 {
        TaskStatus::Success
    } else {
        TaskStatus::Failed
    }
}

/// Repeated-failure trigger from spec.md §4.8: consecutive ≥ 3 OR
/// confidence < 0.5 OR gap ≥ 2h.
fn should_trigger_recovery(consecutive_failures: u32, confidence_score: f64, gap_hours: f64) -> bool {
    consecutive_failures >= 3 || confidence_score < 0.5 || gap_hours >= 2.0
}

/// Selects ready tasks (pending, not already running, every dependency
/// completed), highest priority first, FIFO within a priority tier,
/// capped at `available_slots`. Pulled out as a pure function so the
/// scheduling decision can be tested without spinning up tasks.
fn select_ready(
    tasks: &[CollectionTask],
    completed: &HashSet<Uuid>,
    running: &HashSet<Uuid>,
    available_slots: usize,
) -> Vec<Uuid> {
    let mut ready: Vec<&CollectionTask> = tasks
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Pending
                && !running.contains(&t.id)
                && t.depends_on.iter().all(|dep| completed.contains(dep))
        })
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    ready.into_iter().take(available_slots).map(|t| t.id).collect()
}

#[derive(Default)]
struct RollingMetrics {
    total_success: u64,
    total_failure: u64,
    consecutive_failures: u32,
    last_success: Option<Instant>,
}

impl RollingMetrics {
    fn success_rate(&self) -> f64 {
        let total = self.total_success + self.total_failure;
        if total == 0 {
            1.0
        } else {
            self.total_success as f64 / total as f64
        }
    }

    fn gap_hours(&self) -> f64 {
        self.last_success.map(|t| t.elapsed().as_secs_f64() / 3600.0).unwrap_or(0.0)
    }

    fn record(&mut self, success: bool) {
        if success {
            self.total_success += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(Instant::now());
        } else {
            self.total_failure += 1;
            self.consecutive_failures += 1;
        }
    }
}

/// Owns the collectors and wires C1 (rate limiter), C2 (per-source
/// circuit breakers), C6 (confidence analysis), and C7 (alerts) around
/// every collection attempt. One instance per running pipeline process.
pub struct Orchestrator {
    rate_limiter: Arc<RateLimiter>,
    circuit_breakers: HashMap<String, Arc<CircuitBreaker>>,
    collectors: HashMap<String, Arc<dyn Collector>>,
    alert_manager: Arc<AlertManager>,
    histories: Mutex<HashMap<String, SourceHistory>>,
    rolling_metrics: Mutex<HashMap<String, RollingMetrics>>,
    last_health: Mutex<HashMap<String, CollectionHealthMetrics>>,
    active_recovery: Mutex<HashSet<String>>,
    synchronizer: Mutex<DataSynchronizer>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        circuit_breakers: HashMap<String, Arc<CircuitBreaker>>,
        collectors: HashMap<String, Arc<dyn Collector>>,
        alert_manager: Arc<AlertManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            rate_limiter,
            circuit_breakers,
            collectors,
            alert_manager,
            histories: Mutex::new(HashMap::new()),
            rolling_metrics: Mutex::new(HashMap::new()),
            last_health: Mutex::new(HashMap::new()),
            active_recovery: Mutex::new(HashSet::new()),
            synchronizer: Mutex::new(DataSynchronizer::new()),
            config,
        }
    }

    /// Time-aligned data API (spec.md §6), backed by C5's rolling buffer
    /// of each source's most recent successful collection.
    pub async fn get_time_aligned_data(
        &self,
        sources: &[String],
        max_age_seconds: f64,
        window_seconds: f64,
    ) -> Option<HashMap<String, serde_json::Value>> {
        let synchronizer = self.synchronizer.lock().await;
        synchronizer.get_time_aligned_data(sources, max_age_seconds, window_seconds, Utc::now())
    }

    /// Snapshot of each known source's most recent health metrics, for the
    /// `/metrics` endpoint.
    pub async fn health_snapshot(&self) -> HashMap<String, CollectionHealthMetrics> {
        self.last_health.lock().await.clone()
    }

    /// Current circuit-breaker state per source, for the `/metrics` and
    /// `/circuit-breakers` endpoints.
    pub async fn circuit_breaker_states(&self) -> HashMap<String, crate::circuit_breaker::CircuitState> {
        let mut states = HashMap::new();
        for (name, breaker) in &self.circuit_breakers {
            states.insert(name.clone(), breaker.state().await);
        }
        states
    }

    /// Sources with a recovery plan currently running.
    pub async fn active_recovery_sources(&self) -> Vec<String> {
        self.active_recovery.lock().await.iter().cloned().collect()
    }

    pub fn alert_manager(&self) -> Arc<AlertManager> {
        Arc::clone(&self.alert_manager)
    }

    /// Builds one task per source, resolving `depends_on` names to task
    /// ids within this plan. A dependency naming a source absent from
    /// `sources` is dropped rather than failing plan construction.
    pub fn build_plan(&self, sources: &[SourceConfig]) -> CollectionPlan {
        let mut tasks: Vec<CollectionTask> = sources
            .iter()
            .map(|s| CollectionTask {
                id: Uuid::new_v4(),
                source: s.name.clone(),
                priority: s.priority,
                deadline: Instant::now() + s.timeout,
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        let name_to_id: HashMap<String, Uuid> =
            tasks.iter().map(|t| (t.source.clone(), t.id)).collect();

        for (task, source) in tasks.iter_mut().zip(sources.iter()) {
            task.depends_on = source
                .depends_on
                .iter()
                .filter_map(|name| name_to_id.get(name).copied())
                .collect();
        }

        let edges: Vec<(Uuid, Uuid)> = tasks
            .iter()
            .flat_map(|t| t.depends_on.iter().map(move |dep| (*dep, t.id)))
            .collect();
        for (dep_id, dependent_id) in edges {
            if let Some(dep_task) = tasks.iter_mut().find(|t| t.id == dep_id) {
                dep_task.dependents.push(dependent_id);
            }
        }

        CollectionPlan {
            id: Uuid::new_v4(),
            tasks,
            concurrency_cap: self.config.concurrency_cap,
            total_deadline: self.config.total_deadline,
            status: PlanStatus::Pending,
        }
    }

    /// Runs `plan` to completion or until its total deadline elapses.
    /// Requires `self` behind an `Arc` so spawned tasks can hold a
    /// reference to the orchestrator for the lifetime of their execution.
    pub async fn run_plan(
        self: &Arc<Self>,
        plan: &mut CollectionPlan,
        sources: &[SourceConfig],
    ) -> HashMap<Uuid, TaskResult> {
        let source_map: HashMap<String, SourceConfig> =
            sources.iter().cloned().map(|s| (s.name.clone(), s)).collect();

        plan.status = PlanStatus::Running;
        let start = Instant::now();
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut running: HashSet<Uuid> = HashSet::new();
        let mut results: HashMap<Uuid, TaskResult> = HashMap::new();
        let mut join_set: JoinSet<(Uuid, TaskResult)> = JoinSet::new();

        loop {
            if completed.len() == plan.tasks.len() {
                plan.status = PlanStatus::Completed;
                break;
            }
            if start.elapsed() >= plan.total_deadline {
                plan.status = PlanStatus::Timeout;
                join_set.abort_all();
                for task in plan.tasks.iter_mut() {
                    if !completed.contains(&task.id) {
                        task.status = TaskStatus::Timeout;
                    }
                }
                break;
            }

            let available_slots = plan.concurrency_cap.saturating_sub(running.len());
            let ready = select_ready(&plan.tasks, &completed, &running, available_slots);

            if ready.is_empty() && running.is_empty() {
                // Nothing runnable and nothing in flight, but not all
                // tasks are done: an unsatisfiable dependency. Cancel the
                // remainder rather than spin.
                for task in plan.tasks.iter_mut() {
                    if !completed.contains(&task.id) {
                        task.status = TaskStatus::Cancelled;
                        completed.insert(task.id);
                    }
                }
                continue;
            }

            for task_id in ready {
                let Some(task) = plan.tasks.iter_mut().find(|t| t.id == task_id) else {
                    continue;
                };
                let Some(source_config) = source_map.get(&task.source) else {
                    task.status = TaskStatus::Cancelled;
                    completed.insert(task_id);
                    continue;
                };
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.deadline = Instant::now() + source_config.timeout;
                running.insert(task_id);

                let orchestrator = Arc::clone(self);
                let source_config = source_config.clone();
                join_set.spawn(async move {
                    let result = orchestrator.execute_with_recovery(&source_config).await;
                    (task_id, result)
                });
            }

            match tokio::time::timeout(Duration::from_secs(10), join_set.join_next()).await {
                Ok(Some(Ok((task_id, result)))) => {
                    running.remove(&task_id);
                    completed.insert(task_id);
                    if let Some(task) = plan.tasks.iter_mut().find(|t| t.id == task_id) {
                        task.status = result.classification;
                    }
                    results.insert(task_id, result);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(%join_err, "collection task panicked");
                }
                Ok(None) | Err(_) => {
                    // join_set empty, or the 10s tick elapsed with nothing
                    // ready yet — loop back and re-check deadline/readiness.
                }
            }
        }

        results
    }

    async fn execute_with_recovery(&self, source: &SourceConfig) -> TaskResult {
        self.rate_limiter.acquire(&source.name, 1).await;

        let Some(breaker) = self.circuit_breakers.get(&source.name) else {
            return TaskResult::unavailable(&source.name, "no circuit breaker configured");
        };
        let Some(collector) = self.collectors.get(&source.name) else {
            return TaskResult::unavailable(&source.name, "no collector configured");
        };

        let timeout = source.timeout;
        let call_result = breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, collector.collect()).await {
                    Ok(inner) => inner,
                    Err(_) => Err(PipelineError::transient(source.name.clone(), "collection timed out")),
                }
            })
            .await;

        let (records, error_messages, schema_valid, response_time_ms, request_count) =
            match call_result {
                Ok(CallOutcome::Live(result)) => (
                    result.data,
                    result.errors,
                    true,
                    result.response_time_ms,
                    result.request_count,
                ),
                Ok(CallOutcome::Fallback(result)) => (
                    result.data,
                    result.errors,
                    true,
                    result.response_time_ms,
                    result.request_count,
                ),
                Ok(CallOutcome::Degraded) => (
                    Vec::new(),
                    vec!["circuit breaker degraded mode".to_string()],
                    true,
                    0,
                    0,
                ),
                Err(err) => {
                    let schema_valid = !matches!(err, PipelineError::Schema { .. });
                    (Vec::new(), vec![err.to_string()], schema_valid, 0, 0)
                }
            };
        let underlying_success = error_messages.is_empty();
        tracing::debug!(
            source = %source.name,
            request_count,
            response_time_ms,
            "collection call completed"
        );

        if let Some(latest) = records.last() {
            self.synchronizer.lock().await.add_data(TimestampedData {
                data: serde_json::json!(records),
                collected_at: latest.collected_at,
                source: source.name.clone(),
                source_sequence_id: None,
            });
        }

        let outcome = CollectionOutcome {
            source: source.name.clone(),
            items_collected: records.len(),
            expected_min_items: None,
            expected_max_items: None,
            error_messages: error_messages.clone(),
            schema_valid,
            freshness_score: 1.0,
            response_time_ms,
        };

        let analysis = {
            let mut histories = self.histories.lock().await;
            let history = histories.entry(source.name.clone()).or_default();
            let analysis = CollectionConfidenceAnalyzer::analyze_result(&outcome, history);
            history.record(records.len());
            history.record_latency(response_time_ms);
            analysis
        };

        let (consecutive_failures, gap_hours) = {
            let mut rolling = self.rolling_metrics.lock().await;
            let state = rolling.entry(source.name.clone()).or_default();
            state.record(underlying_success);
            (state.consecutive_failures, state.gap_hours())
        };
        let success_rate = {
            let rolling = self.rolling_metrics.lock().await;
            rolling.get(&source.name).map(|s| s.success_rate()).unwrap_or(1.0)
        };

        self.rate_limiter.record_result(&source.name, underlying_success).await;

        let health = CollectionHealthMetrics {
            success_rate,
            confidence_score: analysis.confidence_score,
            gap_hours,
            consecutive_failures,
        };
        self.last_health
            .lock()
            .await
            .insert(source.name.clone(), health.clone());

        if analysis.requires_alert {
            let alert = CollectionAlert::new(
                source.name.clone(),
                AlertType::RuleTriggered,
                analysis.alert_severity.unwrap_or(AlertSeverity::Warning),
                format!(
                    "collection health degraded for '{}': confidence {:.2}",
                    source.name, analysis.confidence_score
                ),
                analysis.is_recoverable,
            )
            .with_recovery_suggestions(analysis.recovery_suggestions.clone());
            self.alert_manager.raise(alert).await;
        }

        let classification = classify(underlying_success, health.confidence_score);

        if should_trigger_recovery(consecutive_failures, health.confidence_score, health.gap_hours) {
            let already_recovering = {
                let mut active = self.active_recovery.lock().await;
                if active.contains(&source.name) {
                    true
                } else {
                    active.insert(source.name.clone());
                    false
                }
            };
            if !already_recovering {
                // SystematicFailure/CollectionGap describe multi-cycle,
                // rolling-metric conditions rather than anything visible
                // in a single CollectionOutcome, so they're appended here
                // from the same rolling state that gated this branch
                // rather than invented inside a single-call analyzer.
                let mut patterns = analysis.detected_patterns.clone();
                if consecutive_failures >= 5 {
                    patterns.push(FailurePattern::SystematicFailure);
                }
                if gap_hours >= 4.0 {
                    patterns.push(FailurePattern::CollectionGap);
                }
                self.run_recovery_plan(source, &patterns, collector.as_ref()).await;
                self.active_recovery.lock().await.remove(&source.name);
            }
        }

        TaskResult {
            records,
            health,
            classification,
        }
    }

    async fn run_recovery_plan(
        &self,
        source: &SourceConfig,
        patterns: &[FailurePattern],
        collector: &dyn Collector,
    ) {
        const MAX_ATTEMPTS_PER_ACTION: u32 = 3;
        let actions = recovery_actions_for(patterns);

        for action in actions {
            for attempt in 0..MAX_ATTEMPTS_PER_ACTION {
                self.apply_recovery_action(source, action, attempt).await;
                if matches!(collector.test_connection().await, Ok(true)) {
                    info!(source = %source.name, ?action, "recovery probe succeeded");
                    return;
                }
            }
        }
        warn!(source = %source.name, "recovery plan exhausted without a successful probe");
    }

    async fn apply_recovery_action(&self, source: &SourceConfig, action: RecoveryAction, attempt: u32) {
        match action {
            RecoveryAction::RetryWithBackoff => {
                tokio::time::sleep(Duration::from_secs_f64(2f64.powi(attempt as i32))).await;
            }
            RecoveryAction::RestartCollector => {
                if let Some(collector) = self.collectors.get(&source.name) {
                    let _ = collector.cleanup().await;
                }
            }
            RecoveryAction::SwitchToFallback | RecoveryAction::EnableDegraded => {
                // Degraded-mode responses are already served by the
                // circuit breaker while open; nothing further to flip here.
            }
            RecoveryAction::AlertManualIntervention => {
                let alert = CollectionAlert::new(
                    source.name.clone(),
                    AlertType::RuleTriggered,
                    AlertSeverity::Critical,
                    format!("source '{}' requires manual intervention", source.name),
                    false,
                );
                self.alert_manager.raise(alert).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LoggingChannel;
    use crate::config::CircuitBreakerConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn highest_priority_selected_first_fifo_within_tier() {
        let tasks = vec![
            CollectionTask {
                id: Uuid::new_v4(),
                source: "a".into(),
                priority: Priority::Normal,
                deadline: Instant::now(),
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: vec![],
                dependents: vec![],
            },
            CollectionTask {
                id: Uuid::new_v4(),
                source: "b".into(),
                priority: Priority::Critical,
                deadline: Instant::now(),
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: vec![],
                dependents: vec![],
            },
            CollectionTask {
                id: Uuid::new_v4(),
                source: "c".into(),
                priority: Priority::Normal,
                deadline: Instant::now(),
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: vec![],
                dependents: vec![],
            },
        ];
        let ready = select_ready(&tasks, &HashSet::new(), &HashSet::new(), 10);
        assert_eq!(ready[0], tasks[1].id, "critical priority task runs first");
        assert_eq!(ready[1], tasks[0].id, "normal tasks stay FIFO: a before c");
        assert_eq!(ready[2], tasks[2].id);
    }

    #[test]
    fn dependent_task_blocked_until_dependency_completes() {
        let dep_id = Uuid::new_v4();
        let tasks = vec![
            CollectionTask {
                id: dep_id,
                source: "schedule".into(),
                priority: Priority::Normal,
                deadline: Instant::now(),
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: vec![],
                dependents: vec![],
            },
            CollectionTask {
                id: Uuid::new_v4(),
                source: "odds_api".into(),
                priority: Priority::Normal,
                deadline: Instant::now(),
                attempts: 0,
                status: TaskStatus::Pending,
                depends_on: vec![dep_id],
                dependents: vec![],
            },
        ];

        let ready = select_ready(&tasks, &HashSet::new(), &HashSet::new(), 10);
        assert_eq!(ready, vec![dep_id]);

        let mut completed = HashSet::new();
        completed.insert(dep_id);
        let ready = select_ready(&tasks, &completed, &HashSet::new(), 10);
        assert_eq!(ready, vec![tasks[1].id]);
    }

    #[test]
    fn success_classification_requires_confidence_threshold() {
        assert_eq!(classify(true, 0.7), TaskStatus::Success);
        assert_eq!(classify(true, 0.69), TaskStatus::Failed);
        assert_eq!(classify(false, 0.95), TaskStatus::Failed);
    }

    #[test]
    fn recovery_trigger_matches_any_of_three_conditions() {
        assert!(should_trigger_recovery(3, 0.9, 0.0));
        assert!(should_trigger_recovery(0, 0.4, 0.0));
        assert!(should_trigger_recovery(0, 0.9, 2.5));
        assert!(!should_trigger_recovery(0, 0.9, 0.0));
    }

    #[test]
    fn recovery_action_table_matches_spec() {
        assert_eq!(
            recovery_actions_for(&[FailurePattern::RateLimiting]),
            vec![RecoveryAction::RetryWithBackoff, RecoveryAction::EnableDegraded]
        );
        assert_eq!(
            recovery_actions_for(&[FailurePattern::NetworkTimeout]),
            vec![
                RecoveryAction::RetryWithBackoff,
                RecoveryAction::RestartCollector,
                RecoveryAction::SwitchToFallback
            ]
        );
        assert_eq!(
            recovery_actions_for(&[FailurePattern::SchemaChange]),
            vec![RecoveryAction::AlertManualIntervention, RecoveryAction::EnableDegraded]
        );
        assert_eq!(
            recovery_actions_for(&[FailurePattern::SystematicFailure]),
            vec![
                RecoveryAction::RestartCollector,
                RecoveryAction::SwitchToFallback,
                RecoveryAction::AlertManualIntervention
            ]
        );
        assert_eq!(
            recovery_actions_for(&[]),
            vec![
                RecoveryAction::RetryWithBackoff,
                RecoveryAction::RestartCollector,
                RecoveryAction::EnableDegraded,
                RecoveryAction::AlertManualIntervention
            ]
        );
    }

    struct StubCollector {
        name: String,
        calls: AtomicU32,
        fail_first_n: u32,
        connection_ok: AtomicBool,
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn source_name(&self) -> &str {
            &self.name
        }

        async fn test_connection(&self) -> crate::error::Result<bool> {
            Ok(self.connection_ok.load(Ordering::SeqCst))
        }

        async fn collect(&self) -> crate::error::Result<crate::collectors::CollectionResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err(PipelineError::transient(self.name.clone(), "simulated failure"));
            }
            Ok(crate::collectors::CollectionResult::success(
                self.name.clone(),
                vec![RawCollectionRecord {
                    source: self.name.clone(),
                    external_game_key: "game-1".into(),
                    sportsbook_external_key: None,
                    payload: serde_json::json!({"ok": true}),
                    collected_at: Utc::now(),
                    history: None,
                }],
                5,
                1,
            ))
        }
    }

    fn orchestrator_with(name: &str, fail_first_n: u32) -> Arc<Orchestrator> {
        let mut breakers = HashMap::new();
        breakers.insert(
            name.to_string(),
            CircuitBreaker::new(name, CircuitBreakerConfig::default()),
        );
        let mut collectors: HashMap<String, Arc<dyn Collector>> = HashMap::new();
        collectors.insert(
            name.to_string(),
            Arc::new(StubCollector {
                name: name.to_string(),
                calls: AtomicU32::new(0),
                fail_first_n,
                connection_ok: AtomicBool::new(true),
            }),
        );

        Arc::new(Orchestrator::new(
            Arc::new(RateLimiter::new()),
            breakers,
            collectors,
            Arc::new(AlertManager::new(vec![], vec![Box::new(LoggingChannel)])),
            OrchestratorConfig {
                concurrency_cap: 5,
                total_deadline: Duration::from_secs(30),
            },
        ))
    }

    #[tokio::test]
    async fn plan_completes_and_classifies_success() {
        let orchestrator = orchestrator_with("vsin", 0);
        let sources = vec![SourceConfig::new("vsin", Priority::Normal, Duration::from_secs(5))];
        let mut plan = orchestrator.build_plan(&sources);

        let results = orchestrator.run_plan(&mut plan, &sources).await;

        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(results.len(), 1);
        let result = results.values().next().unwrap();
        assert_eq!(result.classification, TaskStatus::Success);
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn dependency_runs_before_dependent() {
        let mut breakers = HashMap::new();
        let mut collectors: HashMap<String, Arc<dyn Collector>> = HashMap::new();
        for name in ["schedule", "odds_api"] {
            breakers.insert(
                name.to_string(),
                CircuitBreaker::new(name, CircuitBreakerConfig::default()),
            );
            collectors.insert(
                name.to_string(),
                Arc::new(StubCollector {
                    name: name.to_string(),
                    calls: AtomicU32::new(0),
                    fail_first_n: 0,
                    connection_ok: AtomicBool::new(true),
                }) as Arc<dyn Collector>,
            );
        }
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

        let sources = vec![
            SourceConfig::new("schedule", Priority::High, Duration::from_secs(5)),
            SourceConfig::new("odds_api", Priority::Normal, Duration::from_secs(5))
                .depends_on(vec!["schedule".to_string()]),
        ];
        let mut plan = orchestrator.build_plan(&sources);
        let results = orchestrator.run_plan(&mut plan, &sources).await;

        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.classification == TaskStatus::Success));
    }
}
