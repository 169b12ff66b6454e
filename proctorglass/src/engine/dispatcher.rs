// proctorglass/src/engine/dispatcher.rs
//
// Deep behavioral analysis, decoupled from the ingestion path. The
// ingestion caller returns as soon as the rule/pattern pass lands; when a
// session crosses the dispatch thresholds, the oracle round-trip runs as
// a detached tokio task and its result is folded in later through the
// combiner.
//
// Dedup: one cache entry per (session, event-count, elapsed-minutes)
// state — repeated ingestion of the same event set never re-triggers the
// oracle. Failures leave no cache entry and no trace on the session
// score: the session keeps its rule-based-only score. A transport
// timeout is the same failure as any other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::combiner::ScoreCombiner;
use crate::events::{DeepAnalysis, Recommendation};
use crate::oracle::client::OracleClient;
use crate::oracle::parse;
use crate::state::window::SessionStateStore;

#[derive(Debug, Clone)]
enum CacheState {
    InFlight,
    Done(DeepAnalysis),
}

pub struct DeepAnalysisDispatcher {
    oracle: Arc<OracleClient>,
    combiner: Arc<ScoreCombiner>,
    state: Arc<SessionStateStore>,
    score_trigger: u8,
    event_trigger: usize,
    timeout: Duration,
    cache: DashMap<String, CacheState>,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
}

impl DeepAnalysisDispatcher {
    pub fn new(
        oracle: Arc<OracleClient>,
        combiner: Arc<ScoreCombiner>,
        state: Arc<SessionStateStore>,
        cfg: &Config,
    ) -> Self {
        Self {
            oracle,
            combiner,
            state,
            score_trigger: cfg.deep_score_trigger,
            event_trigger: cfg.deep_event_trigger,
            timeout: Duration::from_secs(cfg.deep_timeout_secs),
            cache: DashMap::new(),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Schedule a deep analysis if the session crosses the thresholds and
    /// this exact ingestion state hasn't been analyzed already. Returns
    /// whether a task was spawned; never blocks on the oracle.
    pub fn maybe_dispatch(
        self: &Arc<Self>,
        session_id: &str,
        rule_score: u8,
        event_count: usize,
        task_description: &str,
    ) -> bool {
        if rule_score <= self.score_trigger && event_count <= self.event_trigger {
            return false;
        }

        let elapsed = self.state.elapsed_minutes(session_id);
        let key = format!("{session_id}:{event_count}:{elapsed}");
        // entry() holds the shard lock just long enough to claim the key.
        match self.cache.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CacheState::InFlight);
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(session_id, rule_score, event_count, "deep analysis dispatched");

        let this = Arc::clone(self);
        let session = session_id.to_string();
        let task = task_description.to_string();
        tokio::spawn(async move {
            this.run_analysis(session, key, event_count, elapsed, task).await;
        });
        true
    }

    async fn run_analysis(
        self: Arc<Self>,
        session_id: String,
        cache_key: String,
        event_count: usize,
        elapsed_minutes: i64,
        task_description: String,
    ) {
        let events = self.state.window_events(&session_id);
        let events_json =
            serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string());
        let prompt =
            OracleClient::behavior_prompt(&events_json, &task_description, elapsed_minutes);
        let model = self.oracle.config().chat_model.name.clone();

        let outcome =
            tokio::time::timeout(self.timeout, self.oracle.complete(&prompt, &model, 0.3, Some(1000)))
                .await;

        let analysis = match outcome {
            Err(_) => {
                warn!(session_id, "deep analysis timed out; keeping rule-based score");
                self.cache.remove(&cache_key);
                return;
            }
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "deep analysis oracle unavailable");
                self.cache.remove(&cache_key);
                return;
            }
            Ok(Ok(text)) => parse::parse_deep(&text).unwrap_or_else(|| {
                // Malformed answer → first-class neutral verdict.
                warn!(session_id, "deep analysis answer unparseable; neutral verdict");
                DeepAnalysis {
                    risk_score: 50,
                    flagged_events: vec![],
                    reasoning: "oracle answer could not be parsed".to_string(),
                    recommendation: Recommendation::Watch,
                }
            }),
        };

        self.cache
            .insert(cache_key, CacheState::Done(analysis.clone()));
        self.completed.fetch_add(1, Ordering::Relaxed);

        match self
            .combiner
            .apply_deep_analysis(&session_id, analysis, event_count)
            .await
        {
            Ok(Some(score)) => {
                info!(session_id, final_score = score.final_score, "deep analysis folded in")
            }
            Ok(None) => debug!(session_id, "deep analysis result was stale"),
            Err(e) => warn!(session_id, error = %e, "deep analysis store write failed"),
        }
    }

    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, TelemetryEvent};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::collections::{BTreeSet, HashMap};

    fn harness() -> (Arc<DeepAnalysisDispatcher>, Arc<ScoreCombiner>, Arc<SessionStateStore>) {
        let cfg = Config::default();
        let oracle = Arc::new(OracleClient::new(cfg.oracle.clone()));
        let combiner = Arc::new(ScoreCombiner::new(
            Arc::new(MemoryStore::new()),
            cfg.rule_weight,
            cfg.oracle_weight,
        ));
        let state = Arc::new(SessionStateStore::new(cfg.window_minutes));
        let dispatcher = Arc::new(DeepAnalysisDispatcher::new(
            oracle,
            combiner.clone(),
            state.clone(),
            &cfg,
        ));
        (dispatcher, combiner, state)
    }

    fn ev(session: &str, kind: EventKind) -> TelemetryEvent {
        TelemetryEvent {
            session_id: session.to_string(),
            kind,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn below_thresholds_never_dispatches() {
        let (dispatcher, _, _) = harness();
        assert!(!dispatcher.maybe_dispatch("s1", 50, 20, "task"));
        assert_eq!(dispatcher.dispatched.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn high_rule_score_dispatches_and_folds_in() {
        let (dispatcher, combiner, state) = harness();
        state.ingest_batch("s1", vec![ev("s1", EventKind::DevtoolsDetected), ev("s1", EventKind::ClipboardPaste)]);
        combiner.update("s1", 60, BTreeSet::new()).await.unwrap();

        assert!(dispatcher.maybe_dispatch("s1", 60, 2, "task"));

        // Offline oracle is deterministic: 2 events → risk 8.
        let mut waited = 0;
        loop {
            if let Some(score) = combiner.get("s1").await.unwrap() {
                if score.llm_risk_score.is_some() {
                    assert_eq!(score.llm_risk_score, Some(8));
                    // 0.4·60 + 0.6·8 ≈ 29
                    assert_eq!(score.final_score, 29);
                    break;
                }
            }
            waited += 1;
            assert!(waited < 100, "deep analysis never landed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn identical_ingestion_state_is_deduplicated() {
        let (dispatcher, _, state) = harness();
        state.ingest_batch("s1", vec![ev("s1", EventKind::DevtoolsDetected)]);
        assert!(dispatcher.maybe_dispatch("s1", 90, 1, "task"));
        assert!(!dispatcher.maybe_dispatch("s1", 90, 1, "task"));
        assert_eq!(dispatcher.dispatched.load(Ordering::Relaxed), 1);
    }
}
