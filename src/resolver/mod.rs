//! C3 — game-id resolution.
//!
//! Ported from the Python original's `OptimizedGameResolutionService`: a
//! three-tier cache (in-process memory, session-scoped, durable) in front
//! of whatever lookup actually hits the schedule source, with in-flight
//! de-duplication so concurrent requests for the same external id share
//! one resolution instead of racing. The original is a process-wide
//! singleton reached through a classmethod; here it's one `Arc`-shared
//! instance constructed in `main` and handed to every collector and the
//! orchestrator, so tests can run several independent instances side by
//! side without resetting global state.

pub mod session_cache;
pub mod teams;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use session_cache::{InMemorySessionStore, SessionStore};
use teams::{MatchConfidence, TeamStandardizer};

/// Durable lookup the resolver falls back to on a full cache miss.
/// Implemented against Postgres in `db`; a stub is used in tests.
#[async_trait]
pub trait GameLookup: Send + Sync {
    async fn lookup(&self, external_game_id: &str) -> Result<Option<String>>;

    /// Upserts `external_game_id` onto the canonical row for
    /// `canonical_id`, creating the row if none matches yet. Called after
    /// a schedule-API match so the next lookup by this source+id is a
    /// direct hit.
    async fn attach_external_id(&self, canonical_id: &str, external_game_id: &str) -> Result<()>;
}

/// One game as returned by the authoritative schedule source, keyed by
/// the canonical schedule id — step 4 of spec.md §4.3's resolution
/// waterfall.
#[derive(Debug, Clone)]
pub struct ScheduleGame {
    pub canonical_id: String,
    pub home_team: String,
    pub away_team: String,
}

/// Authoritative schedule lookup, queried only on a full cache+durable
/// miss. `date_known` controls the confidence the resolver reports: a
/// hit against a known date is `High`, a hit found by searching ±7 days
/// because the date was unknown is `Medium`.
#[async_trait]
pub trait ScheduleLookup: Send + Sync {
    async fn games_for_date(&self, date: NaiveDate) -> Result<Vec<ScheduleGame>>;
}

/// Confidence attached to a resolve outcome, per spec.md §4.3: `None`
/// when nothing matched, `Low` for a fuzzy/partial team match, `Medium`
/// for a schedule-API hit without a known date, `High` for a direct
/// cache/DB hit or a schedule-API hit with a known date.
pub use MatchConfidence as ResolveConfidence;

#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub api_calls_avoided: u64,
    pub batch_operations: u64,
    pub games_resolved: u64,
}

impl ResolverStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

pub struct GameIdResolver {
    lookup: Arc<dyn GameLookup>,
    schedule: Option<Arc<dyn ScheduleLookup>>,
    standardizer: TeamStandardizer,
    memory_cache: Mutex<HashMap<String, String>>,
    session_cache: Box<dyn SessionStore>,
    session_ttl: Duration,
    pending: Mutex<HashMap<String, Arc<Notify>>>,
    stats: Mutex<ResolverStats>,
}

impl GameIdResolver {
    pub fn new(lookup: Arc<dyn GameLookup>) -> Self {
        Self {
            lookup,
            schedule: None,
            standardizer: TeamStandardizer::new(Vec::new()),
            memory_cache: Mutex::new(HashMap::new()),
            session_cache: Box::new(InMemorySessionStore::new()),
            session_ttl: Duration::from_secs(3600),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(ResolverStats::default()),
        }
    }

    /// Wires in the schedule-API fallback (step 4 of the resolution
    /// waterfall) and the team reference set used to standardize names
    /// before matching against it.
    pub fn with_schedule(
        lookup: Arc<dyn GameLookup>,
        schedule: Arc<dyn ScheduleLookup>,
        teams: Vec<crate::types::TeamRef>,
    ) -> Self {
        Self {
            lookup,
            schedule: Some(schedule),
            standardizer: TeamStandardizer::new(teams),
            memory_cache: Mutex::new(HashMap::new()),
            session_cache: Box::new(InMemorySessionStore::new()),
            session_ttl: Duration::from_secs(3600),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(ResolverStats::default()),
        }
    }

    /// Swaps the session-scoped cache tier for a pre-built store — e.g. a
    /// `RedisSessionStore` when `REDIS_URL` is configured, keeping the
    /// default in-memory store otherwise.
    pub fn with_session_store(mut self, store: Box<dyn SessionStore>) -> Self {
        self.session_cache = store;
        self
    }

    pub async fn stats(&self) -> ResolverStats {
        self.stats.lock().await.clone()
    }

    async fn cache_get(&self, external_game_id: &str) -> Option<String> {
        if let Some(id) = self.memory_cache.lock().await.get(external_game_id) {
            return Some(id.clone());
        }
        self.session_cache.get(external_game_id).await
    }

    async fn cache_put(&self, external_game_id: &str, canonical_id: &str) {
        self.memory_cache
            .lock()
            .await
            .insert(external_game_id.to_string(), canonical_id.to_string());
        self.session_cache
            .put(external_game_id, canonical_id, self.session_ttl)
            .await;
    }

    /// Resolves one external id to a canonical game id. Concurrent callers
    /// for the same id wait on the first caller's in-flight resolution
    /// rather than issuing duplicate lookups.
    pub async fn resolve_game_id(&self, external_game_id: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache_get(external_game_id).await {
            self.stats.lock().await.cache_hits += 1;
            return Ok(Some(cached));
        }

        let notify = {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(external_game_id) {
                Some(existing.clone())
            } else {
                pending.insert(external_game_id.to_string(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            self.stats.lock().await.api_calls_avoided += 1;
            return Ok(self.cache_get(external_game_id).await);
        }

        self.stats.lock().await.cache_misses += 1;
        let resolved = self.lookup.lookup(external_game_id).await?;

        if let Some(ref canonical_id) = resolved {
            self.cache_put(external_game_id, canonical_id).await;
            self.stats.lock().await.games_resolved += 1;
        }

        let notify = self.pending.lock().await.remove(external_game_id);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        Ok(resolved)
    }

    /// Full resolution waterfall (spec.md §4.3 steps 1-5): memory/session
    /// cache, in-flight de-duplication, durable-store lookup, then a
    /// schedule-API search (exact date, or ±7 days when `date` is
    /// unknown) matched against standardized team names. Returns the
    /// canonical id alongside the confidence spec.md attaches to each
    /// tier: `High` for a direct cache/DB hit or a known-date schedule
    /// hit, `Medium` for a schedule hit found without a known date,
    /// `Low` when only a fuzzy team match made the schedule hit possible,
    /// `None` when nothing matched.
    pub async fn resolve_with_context(
        &self,
        external_game_id: &str,
        home: &str,
        away: &str,
        date: Option<NaiveDate>,
    ) -> Result<(Option<String>, ResolveConfidence)> {
        if let Some(cached) = self.cache_get(external_game_id).await {
            self.stats.lock().await.cache_hits += 1;
            return Ok((Some(cached), ResolveConfidence::High));
        }

        let notify = {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(external_game_id) {
                Some(existing.clone())
            } else {
                pending.insert(external_game_id.to_string(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            self.stats.lock().await.api_calls_avoided += 1;
            let cached = self.cache_get(external_game_id).await;
            let confidence = if cached.is_some() {
                ResolveConfidence::High
            } else {
                ResolveConfidence::None
            };
            return Ok((cached, confidence));
        }

        self.stats.lock().await.cache_misses += 1;
        let durable_hit = self.lookup.lookup(external_game_id).await?;
        if let Some(canonical_id) = durable_hit {
            self.cache_put(external_game_id, &canonical_id).await;
            self.stats.lock().await.games_resolved += 1;
            self.clear_pending(external_game_id).await;
            return Ok((Some(canonical_id), ResolveConfidence::High));
        }

        let result = self.resolve_via_schedule(external_game_id, home, away, date).await?;
        self.clear_pending(external_game_id).await;
        Ok(result)
    }

    async fn clear_pending(&self, external_game_id: &str) {
        let notify = self.pending.lock().await.remove(external_game_id);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    async fn resolve_via_schedule(
        &self,
        external_game_id: &str,
        home: &str,
        away: &str,
        date: Option<NaiveDate>,
    ) -> Result<(Option<String>, ResolveConfidence)> {
        let Some(schedule) = self.schedule.as_ref() else {
            return Ok((None, ResolveConfidence::None));
        };

        let Some((home_code, home_confidence)) = self.standardizer.standardize(home) else {
            return Ok((None, ResolveConfidence::None));
        };
        let Some((away_code, away_confidence)) = self.standardizer.standardize(away) else {
            return Ok((None, ResolveConfidence::None));
        };
        let team_confidence = home_confidence.min(away_confidence);

        let date_known = date.is_some();
        let candidate_dates: Vec<NaiveDate> = match date {
            Some(d) => vec![d],
            None => {
                let today = Utc::now().date_naive();
                (-7..=7).map(|offset| today + chrono::Duration::days(offset)).collect()
            }
        };

        for candidate in candidate_dates {
            let games = schedule.games_for_date(candidate).await?;
            let Some(game) = games.into_iter().find(|g| {
                let Some((g_home, _)) = self.standardizer.standardize(&g.home_team) else {
                    return false;
                };
                let Some((g_away, _)) = self.standardizer.standardize(&g.away_team) else {
                    return false;
                };
                g_home == home_code && g_away == away_code
            }) else {
                continue;
            };

            self.lookup
                .attach_external_id(&game.canonical_id, external_game_id)
                .await?;
            self.cache_put(external_game_id, &game.canonical_id).await;
            self.stats.lock().await.games_resolved += 1;

            let confidence = if team_confidence == MatchConfidence::Low {
                ResolveConfidence::Low
            } else if date_known {
                ResolveConfidence::High
            } else {
                ResolveConfidence::Medium
            };
            return Ok((Some(game.canonical_id), confidence));
        }

        Ok((None, ResolveConfidence::None))
    }

    /// Resolves a batch of external ids with cache-aware de-duplication:
    /// duplicates within the batch and already-cached ids never reach the
    /// lookup. `api_calls_saved` reports how many lookups were avoided
    /// relative to issuing one lookup per input id.
    pub async fn batch_resolve_games(
        &self,
        external_game_ids: &[String],
    ) -> Result<(HashMap<String, Option<String>>, u64)> {
        self.stats.lock().await.batch_operations += 1;

        let unique: Vec<String> = {
            let mut seen = std::collections::HashSet::new();
            external_game_ids
                .iter()
                .filter(|id| seen.insert((*id).clone()))
                .cloned()
                .collect()
        };

        let mut resolved = HashMap::new();
        let mut uncached = Vec::new();
        for id in &unique {
            if let Some(cached) = self.cache_get(id).await {
                self.stats.lock().await.cache_hits += 1;
                resolved.insert(id.clone(), Some(cached));
            } else {
                uncached.push(id.clone());
            }
        }

        for id in &uncached {
            let canonical = self.resolve_game_id(id).await?;
            resolved.insert(id.clone(), canonical);
        }

        let api_calls_saved = external_game_ids.len() as u64 - uncached.len() as u64;

        Ok((resolved, api_calls_saved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLookup {
        calls: AtomicU32,
    }

    #[async_trait]
    impl GameLookup for CountingLookup {
        async fn lookup(&self, external_game_id: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Some(format!("canonical-{external_game_id}")))
        }

        async fn attach_external_id(&self, _canonical_id: &str, _external_game_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct NoMatchLookup;

    #[async_trait]
    impl GameLookup for NoMatchLookup {
        async fn lookup(&self, _external_game_id: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn attach_external_id(&self, _canonical_id: &str, _external_game_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StubSchedule {
        games: Vec<ScheduleGame>,
    }

    #[async_trait]
    impl ScheduleLookup for StubSchedule {
        async fn games_for_date(&self, _date: NaiveDate) -> Result<Vec<ScheduleGame>> {
            Ok(self.games.clone())
        }
    }

    fn yankees_vs_red_sox() -> Vec<crate::types::TeamRef> {
        vec![
            crate::types::TeamRef {
                code: "NYY".into(),
                full_name: "New York Yankees".into(),
                aliases: vec!["Yankees".into()],
                division: "AL EAST".into(),
                league_id: "MLB".into(),
            },
            crate::types::TeamRef {
                code: "BOS".into(),
                full_name: "Boston Red Sox".into(),
                aliases: vec!["Red Sox".into()],
                division: "AL EAST".into(),
                league_id: "MLB".into(),
            },
        ]
    }

    #[tokio::test]
    async fn resolves_and_caches() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
        });
        let resolver = GameIdResolver::new(lookup.clone());

        let first = resolver.resolve_game_id("g1").await.unwrap();
        let second = resolver.resolve_game_id("g1").await.unwrap();

        assert_eq!(first, Some("canonical-g1".to_string()));
        assert_eq!(second, first);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_id_share_one_lookup() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
        });
        let resolver = Arc::new(GameIdResolver::new(lookup.clone()));

        let r1 = resolver.clone();
        let r2 = resolver.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.resolve_game_id("shared").await.unwrap() }),
            tokio::spawn(async move { r2.resolve_game_id("shared").await.unwrap() }),
        );

        assert_eq!(a.unwrap(), Some("canonical-shared".to_string()));
        assert_eq!(b.unwrap(), Some("canonical-shared".to_string()));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_resolve_dedupes_and_reports_savings() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
        });
        let resolver = GameIdResolver::new(lookup.clone());

        let ids = vec![
            "g1".to_string(),
            "g1".to_string(),
            "g2".to_string(),
        ];
        let (resolved, saved) = resolver.batch_resolve_games(&ids).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn batch_resolve_skips_already_cached_ids() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicU32::new(0),
        });
        let resolver = GameIdResolver::new(lookup.clone());
        resolver.resolve_game_id("g1").await.unwrap();

        let ids = vec!["g1".to_string(), "g2".to_string()];
        let (resolved, _saved) = resolver.batch_resolve_games(&ids).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn schedule_fallback_matches_known_date_with_high_confidence() {
        let schedule = Arc::new(StubSchedule {
            games: vec![ScheduleGame {
                canonical_id: "game-1".into(),
                home_team: "Yankees".into(),
                away_team: "Red Sox".into(),
            }],
        });
        let resolver = GameIdResolver::with_schedule(
            Arc::new(NoMatchLookup),
            schedule,
            yankees_vs_red_sox(),
        );

        let date = Utc::now().date_naive();
        let (canonical, confidence) = resolver
            .resolve_with_context("espn-123", "Yankees", "Red Sox", Some(date))
            .await
            .unwrap();

        assert_eq!(canonical, Some("game-1".to_string()));
        assert_eq!(confidence, ResolveConfidence::High);
    }

    #[tokio::test]
    async fn schedule_fallback_without_known_date_is_medium_confidence() {
        let schedule = Arc::new(StubSchedule {
            games: vec![ScheduleGame {
                canonical_id: "game-2".into(),
                home_team: "Yankees".into(),
                away_team: "Red Sox".into(),
            }],
        });
        let resolver = GameIdResolver::with_schedule(
            Arc::new(NoMatchLookup),
            schedule,
            yankees_vs_red_sox(),
        );

        let (canonical, confidence) = resolver
            .resolve_with_context("espn-999", "Yankees", "Red Sox", None)
            .await
            .unwrap();

        assert_eq!(canonical, Some("game-2".to_string()));
        assert_eq!(confidence, ResolveConfidence::Medium);
    }

    #[tokio::test]
    async fn schedule_fallback_no_match_returns_none_confidence() {
        let schedule = Arc::new(StubSchedule { games: vec![] });
        let resolver = GameIdResolver::with_schedule(
            Arc::new(NoMatchLookup),
            schedule,
            yankees_vs_red_sox(),
        );

        let (canonical, confidence) = resolver
            .resolve_with_context("espn-404", "Yankees", "Red Sox", Some(Utc::now().date_naive()))
            .await
            .unwrap();

        assert_eq!(canonical, None);
        assert_eq!(confidence, ResolveConfidence::None);
    }
}
