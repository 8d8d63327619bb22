//! C5 — cross-source time synchronization and alignment.
//!
//! Ported field-for-field from the Python original's `core/timing.py`:
//! a rolling buffer of timestamped per-source data, a windowed grouping
//! query, a best-alignment search across sources within a tolerance, and
//! a synchronization quality score derived from interval variance.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct TimestampedData {
    pub data: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub source: String,
    pub source_sequence_id: Option<String>,
}

impl TimestampedData {
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.collected_at).num_milliseconds() as f64 / 1000.0
    }
}

/// A window centered on a point in time, with an acceptable-skew bound
/// used to flag data that technically falls in-window but arrived too
/// late to be trusted as simultaneous.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizationWindow {
    pub center_time: DateTime<Utc>,
    pub window_seconds: f64,
    pub max_acceptable_skew_seconds: f64,
}

impl SynchronizationWindow {
    pub fn new(center_time: DateTime<Utc>, window_seconds: f64, max_acceptable_skew_seconds: f64) -> Self {
        Self {
            center_time,
            window_seconds,
            max_acceptable_skew_seconds,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.center_time - ChronoDuration::milliseconds((self.window_seconds * 1000.0 / 2.0) as i64)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.center_time + ChronoDuration::milliseconds((self.window_seconds * 1000.0 / 2.0) as i64)
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start_time() && timestamp <= self.end_time()
    }

    pub fn is_acceptable_skew(&self, timestamp: DateTime<Utc>) -> bool {
        (timestamp - self.center_time).num_milliseconds().abs() as f64 / 1000.0
            <= self.max_acceptable_skew_seconds
    }
}

/// One successful alignment across sources: the chosen anchor item from
/// each source, all within `max_time_diff_seconds` of each other.
#[derive(Debug, Clone)]
pub struct TimeAlignment {
    pub anchor_source: String,
    pub picks: HashMap<String, TimestampedData>,
    pub time_spread_seconds: f64,
}

/// Rolling buffer of recent per-source data and the windowed query /
/// alignment search over it. Shared (`Arc<Mutex<_>>`) across collectors
/// feeding it and the orchestrator reading from it.
#[derive(Default)]
pub struct DataSynchronizer {
    buffer: Vec<TimestampedData>,
}

impl DataSynchronizer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn add_data(&mut self, data: TimestampedData) {
        self.buffer.push(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Groups buffered items within `window` by source, sorted by time.
    /// Errors if `required_sources` names a source with no items in
    /// window and `require_all_sources` is set.
    pub fn get_synchronized_data(
        &self,
        window: SynchronizationWindow,
        required_sources: &[String],
        require_all_sources: bool,
    ) -> Result<HashMap<String, Vec<TimestampedData>>, String> {
        let mut grouped: HashMap<String, Vec<TimestampedData>> = HashMap::new();
        for item in &self.buffer {
            if window.contains(item.collected_at) {
                grouped.entry(item.source.clone()).or_default().push(item.clone());
            }
        }
        for items in grouped.values_mut() {
            items.sort_by_key(|i| i.collected_at);
        }

        if require_all_sources {
            for source in required_sources {
                if !grouped.contains_key(source) {
                    return Err(format!("required source '{source}' missing from window"));
                }
            }
        }

        Ok(grouped)
    }

    /// Finds the tightest cross-source alignment: for every candidate
    /// anchor item, picks the closest item from every other source and
    /// keeps the alignment with the smallest total spread, discarding any
    /// anchor for which some source has no item within `max_time_diff_seconds`.
    pub fn find_best_time_alignment(
        data_sets: &HashMap<String, Vec<TimestampedData>>,
        max_time_diff_seconds: f64,
    ) -> Option<TimeAlignment> {
        if data_sets.len() < 2 {
            return None;
        }

        let mut best: Option<TimeAlignment> = None;

        for (anchor_source, anchor_items) in data_sets {
            for anchor_item in anchor_items {
                let mut picks = HashMap::new();
                picks.insert(anchor_source.clone(), anchor_item.clone());
                let mut aligned = true;

                for (other_source, other_items) in data_sets {
                    if other_source == anchor_source {
                        continue;
                    }
                    let closest = other_items.iter().min_by(|a, b| {
                        let da = (a.collected_at - anchor_item.collected_at).num_milliseconds().abs();
                        let db = (b.collected_at - anchor_item.collected_at).num_milliseconds().abs();
                        da.cmp(&db)
                    });
                    match closest {
                        Some(item)
                            if ((item.collected_at - anchor_item.collected_at)
                                .num_milliseconds()
                                .abs() as f64
                                / 1000.0)
                                <= max_time_diff_seconds =>
                        {
                            picks.insert(other_source.clone(), item.clone());
                        }
                        _ => {
                            aligned = false;
                            break;
                        }
                    }
                }

                if !aligned {
                    continue;
                }

                let min_time = picks.values().map(|d| d.collected_at).min().unwrap();
                let max_time = picks.values().map(|d| d.collected_at).max().unwrap();
                let spread = (max_time - min_time).num_milliseconds() as f64 / 1000.0;

                if best.as_ref().map(|b| spread < b.time_spread_seconds).unwrap_or(true) {
                    best = Some(TimeAlignment {
                        anchor_source: anchor_source.clone(),
                        picks,
                        time_spread_seconds: spread,
                    });
                }
            }
        }

        best
    }

    pub fn cleanup_old_data(&mut self, max_age_seconds: f64, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds((max_age_seconds * 1000.0) as i64);
        self.buffer.retain(|item| item.collected_at >= cutoff);
    }

    /// Time-aligned data API (spec.md §6): the best cross-source
    /// alignment within `window_seconds` of now, keyed by source name to
    /// its payload, or `None` if any requested source has no item in the
    /// window or the chosen alignment's newest pick is older than
    /// `max_age_seconds`. Centered on `now` with `window_seconds` also
    /// used as the acceptable cross-source time difference, matching
    /// `find_best_time_alignment`'s own tolerance parameter.
    pub fn get_time_aligned_data(
        &self,
        sources: &[String],
        max_age_seconds: f64,
        window_seconds: f64,
        now: DateTime<Utc>,
    ) -> Option<HashMap<String, serde_json::Value>> {
        let window = SynchronizationWindow::new(now, window_seconds, window_seconds);
        let grouped = self.get_synchronized_data(window, sources, true).ok()?;

        let alignment = Self::find_best_time_alignment(&grouped, window_seconds)?;
        if sources.iter().any(|s| !alignment.picks.contains_key(s)) {
            return None;
        }

        let newest = alignment.picks.values().map(|d| d.collected_at).max()?;
        if (now - newest).num_milliseconds() as f64 / 1000.0 > max_age_seconds {
            return None;
        }

        Some(
            alignment
                .picks
                .into_iter()
                .map(|(source, item)| (source, item.data))
                .collect(),
        )
    }
}

/// `quality = max(0, min(1, 1 - variance(intervals, expected) / max_acceptable_variance))`
/// where `max_acceptable_variance = (expected * 0.5)^2`. A perfectly
/// regular cadence at the expected interval scores 1.0; a bursty or
/// irregular cadence decays toward 0.0.
pub fn calculate_synchronization_quality(
    timestamps: &[DateTime<Utc>],
    expected_interval_seconds: f64,
) -> f64 {
    if timestamps.len() < 2 {
        return 1.0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let intervals: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .collect();

    let variance: f64 = intervals
        .iter()
        .map(|i| (i - expected_interval_seconds).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;

    let max_acceptable_variance = (expected_interval_seconds * 0.5).powi(2);
    (1.0 - variance / max_acceptable_variance).clamp(0.0, 1.0)
}

/// Rolling synchronization statistics, reported through the health
/// surface alongside per-source metrics.
#[derive(Debug, Clone, Default)]
pub struct TimingMetrics {
    pub total_data_points: usize,
    pub sources_count: usize,
    pub time_span_seconds: f64,
    pub average_source_delay_seconds: f64,
    pub max_source_delay_seconds: f64,
    pub synchronization_success_rate: f64,
    pub timing_anomalies: Vec<String>,
}

impl TimingMetrics {
    const MAX_ANOMALIES: usize = 100;

    pub fn add_timing_anomaly(&mut self, description: impl Into<String>) {
        self.timing_anomalies.push(description.into());
        if self.timing_anomalies.len() > Self::MAX_ANOMALIES {
            self.timing_anomalies.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(offset_seconds)
    }

    fn item(source: &str, offset_seconds: i64) -> TimestampedData {
        TimestampedData {
            data: serde_json::json!({}),
            collected_at: ts(offset_seconds),
            source: source.to_string(),
            source_sequence_id: None,
        }
    }

    #[test]
    fn window_contains_respects_bounds() {
        let window = SynchronizationWindow::new(ts(0), 60.0, 300.0);
        assert!(window.contains(ts(29)));
        assert!(!window.contains(ts(31)));
    }

    #[test]
    fn find_best_alignment_picks_closest_across_sources() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), vec![item("a", 0)]);
        data.insert("b".to_string(), vec![item("b", 5), item("b", 100)]);

        let alignment = DataSynchronizer::find_best_time_alignment(&data, 180.0).unwrap();
        assert_eq!(alignment.time_spread_seconds, 5.0);
    }

    #[test]
    fn find_best_alignment_none_when_source_out_of_tolerance() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), vec![item("a", 0)]);
        data.insert("b".to_string(), vec![item("b", 500)]);

        assert!(DataSynchronizer::find_best_time_alignment(&data, 180.0).is_none());
    }

    #[test]
    fn find_best_alignment_none_with_single_source() {
        let mut data = HashMap::new();
        data.insert("a".to_string(), vec![item("a", 0)]);
        assert!(DataSynchronizer::find_best_time_alignment(&data, 180.0).is_none());
    }

    #[test]
    fn synchronization_quality_perfect_cadence_scores_one() {
        let timestamps: Vec<_> = (0..5).map(|i| ts(i * 60)).collect();
        let quality = calculate_synchronization_quality(&timestamps, 60.0);
        assert!((quality - 1.0).abs() < 1e-9);
    }

    #[test]
    fn synchronization_quality_irregular_cadence_decays() {
        let timestamps = vec![ts(0), ts(5), ts(200), ts(203)];
        let quality = calculate_synchronization_quality(&timestamps, 60.0);
        assert!(quality < 1.0);
    }

    #[test]
    fn cleanup_old_data_evicts_past_cutoff() {
        let mut synchronizer = DataSynchronizer::new();
        synchronizer.add_data(item("a", -1000));
        synchronizer.add_data(item("a", 0));
        synchronizer.cleanup_old_data(300.0, ts(0));
        assert_eq!(synchronizer.len(), 1);
    }

    #[test]
    fn time_aligned_data_null_when_alignment_older_than_max_age() {
        let mut synchronizer = DataSynchronizer::new();
        synchronizer.add_data(item("a", 0));
        synchronizer.add_data(item("b", 60));

        let now = ts(120);
        let sources = vec!["a".to_string(), "b".to_string()];
        // both picks fall inside the 300s-wide window, but the newest is
        // 60s old against a 30s max age
        assert!(synchronizer
            .get_time_aligned_data(&sources, 30.0, 300.0, now)
            .is_none());
    }

    #[test]
    fn time_aligned_data_present_when_within_max_age_and_window() {
        let mut synchronizer = DataSynchronizer::new();
        synchronizer.add_data(item("a", 0));
        synchronizer.add_data(item("b", 5));

        let now = ts(5);
        let sources = vec!["a".to_string(), "b".to_string()];
        let aligned = synchronizer
            .get_time_aligned_data(&sources, 60.0, 180.0, now)
            .expect("both sources present and fresh");
        assert_eq!(aligned.len(), 2);
        assert!(aligned.contains_key("a"));
        assert!(aligned.contains_key("b"));
    }

    #[test]
    fn time_aligned_data_null_when_required_source_missing() {
        let mut synchronizer = DataSynchronizer::new();
        synchronizer.add_data(item("a", 0));

        let sources = vec!["a".to_string(), "b".to_string()];
        assert!(synchronizer
            .get_time_aligned_data(&sources, 60.0, 180.0, ts(0))
            .is_none());
    }
}
