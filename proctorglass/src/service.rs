// proctorglass/src/service.rs
//
// The scoring core's outward face: the four operations the transport
// layer calls. Wires the state store, rule engine, pattern detector,
// combiner, originality analyzer and dispatcher together the way the
// daemon pipeline uses them.
//
// Propagation policy: nothing oracle- or store-shaped escapes
// ingest_events / submit_code — failures degrade to the deterministic
// rule/heuristic values and get logged. Only get_session_score can fail,
// and only with SessionNotFound.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, warn};

use crate::config::Config;
use crate::engine::combiner::{risk_level, ScoreCombiner, ScoreHook};
use crate::engine::dispatcher::DeepAnalysisDispatcher;
use crate::engine::{patterns, rules};
use crate::error::{CoreError, Result};
use crate::events::{
    IngestOutcome, OriginalityVerdict, SessionScore, SessionSummary, TelemetryEvent,
};
use crate::oracle::client::OracleClient;
use crate::originality::analyzer::OriginalityAnalyzer;
use crate::originality::corpus::CorpusIndex;
use crate::state::window::SessionStateStore;
use crate::store::KvStore;

/// Stand-in task context for deep analysis when the session layer doesn't
/// supply one.
const DEFAULT_TASK_DESCRIPTION: &str = "technical interview coding task";

pub struct ProctoringService {
    state: Arc<SessionStateStore>,
    combiner: Arc<ScoreCombiner>,
    dispatcher: Arc<DeepAnalysisDispatcher>,
    analyzer: OriginalityAnalyzer,
    corpus: Arc<CorpusIndex>,
    // Last code snapshot per session, for jump detection between submissions.
    last_snapshot: dashmap::DashMap<String, String>,
}

impl ProctoringService {
    pub fn new(cfg: Config, store: Arc<dyn KvStore>, hook: Option<ScoreHook>) -> Arc<Self> {
        let oracle = Arc::new(OracleClient::new(cfg.oracle.clone()));
        let state = Arc::new(SessionStateStore::new(cfg.window_minutes));
        let corpus = Arc::new(CorpusIndex::new(cfg.corpus_capacity, cfg.corpus_evict_batch));

        let mut combiner = ScoreCombiner::new(store, cfg.rule_weight, cfg.oracle_weight);
        if let Some(hook) = hook {
            combiner = combiner.with_hook(hook);
        }
        let combiner = Arc::new(combiner);

        let dispatcher = Arc::new(DeepAnalysisDispatcher::new(
            Arc::clone(&oracle),
            Arc::clone(&combiner),
            Arc::clone(&state),
            &cfg,
        ));
        let analyzer = OriginalityAnalyzer::new(Arc::clone(&oracle), Arc::clone(&corpus));

        Arc::new(Self {
            state,
            combiner,
            dispatcher,
            analyzer,
            corpus,
            last_snapshot: dashmap::DashMap::new(),
        })
    }

    // ── Event ingestion ───────────────────────────────────────────────────────

    /// Score a batch of behavioral events. Synchronous rule/pattern pass
    /// only; deep analysis, if triggered, lands out of band.
    pub async fn ingest_events(
        &self,
        session_id: &str,
        events: Vec<TelemetryEvent>,
    ) -> IngestOutcome {
        self.state.ingest_batch(session_id, events);
        let window = self.state.window_events(session_id);

        let rule = rules::score_events(&window);
        let scan = patterns::detect(&window);

        let behavior_score =
            (u32::from(rule.score) + scan.bonus).min(100) as u8;

        // Flagged set: kinds behind critical rules plus kinds implicated by
        // firing patterns.
        let mut flagged: BTreeSet<String> = scan.implicated.clone();
        for (kind, count) in &rule.per_type_counts {
            if *count == 0 {
                continue;
            }
            if rules::rule_for(*kind).map(|r| r.critical).unwrap_or(false) {
                flagged.insert(kind.to_string());
            }
        }

        if let Err(e) = self
            .combiner
            .update(session_id, behavior_score, flagged.clone())
            .await
        {
            error!(session_id, error = %e, "score upsert failed; serving computed values");
        }

        self.dispatcher.maybe_dispatch(
            session_id,
            behavior_score,
            window.len(),
            DEFAULT_TASK_DESCRIPTION,
        );

        IngestOutcome {
            session_id: session_id.to_string(),
            rule_score: behavior_score,
            flagged_events: flagged,
            patterns: scan.patterns,
            events_in_window: window.len(),
        }
    }

    // ── Code submission ───────────────────────────────────────────────────────

    /// Analyze one code snapshot and feed its verdict back into the
    /// session's behavioral risk.
    pub async fn submit_code(
        &self,
        session_id: &str,
        task_id: &str,
        code: &str,
        language: &str,
    ) -> OriginalityVerdict {
        let verdict = self
            .analyzer
            .analyze(code, task_id, DEFAULT_TASK_DESCRIPTION, language)
            .await;

        // A snapshot that shares almost nothing with its predecessor is
        // worth an operator's glance even before the verdict lands.
        if let Some(prev) = self.last_snapshot.get(session_id).map(|p| p.clone()) {
            let delta = crate::originality::analyzer::compare_snapshots(&prev, code);
            if !delta.identical && delta.similarity < 0.3 {
                warn!(
                    session_id,
                    similarity = delta.similarity,
                    added = delta.added_lines,
                    "large jump between code snapshots"
                );
            }
        }
        self.last_snapshot
            .insert(session_id.to_string(), code.to_string());

        if let Err(e) = self
            .combiner
            .flag_suspicious_code(session_id, verdict.score, &verdict.suspicious_patterns)
            .await
        {
            warn!(session_id, error = %e, "originality feedback skipped");
        }

        verdict
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Current score. A known session with nothing scored yet reads back
    /// as an explicit zero score; an unknown id is a distinct not-found.
    pub async fn get_session_score(&self, session_id: &str) -> Result<SessionScore> {
        if let Ok(Some(score)) = self.combiner.get(session_id).await {
            return Ok(score);
        }
        if self.state.known(session_id) {
            return Ok(SessionScore::empty(session_id));
        }
        Err(CoreError::SessionNotFound(session_id.to_string()))
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary> {
        let score = self.get_session_score(session_id).await?;
        Ok(SessionSummary {
            risk_level: risk_level(score.final_score),
            session_id: score.session_id,
            rule_based_score: score.rule_based_score,
            llm_risk_score: score.llm_risk_score,
            code_originality_score: score.code_originality_score,
            final_score: score.final_score,
            flagged_event_types: score.flagged_event_types,
            llm_recommendation: score.llm_recommendation,
            llm_reasoning: score.llm_reasoning,
            updated_at: score.updated_at,
        })
    }

    // ── Gauges for the stats loop ─────────────────────────────────────────────

    pub fn n_sessions(&self) -> usize {
        self.state.n_sessions()
    }

    pub fn total_events(&self) -> u64 {
        self.state
            .total_events
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    pub fn state_store(&self) -> Arc<SessionStateStore> {
        Arc::clone(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn quiet_config() -> Config {
        // Thresholds parked out of reach so tests stay deterministic.
        Config { deep_score_trigger: 100, deep_event_trigger: 10_000, ..Config::default() }
    }

    fn service() -> Arc<ProctoringService> {
        ProctoringService::new(quiet_config(), Arc::new(MemoryStore::new()), None)
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
    async fn devtools_plus_large_paste_clamps_to_100() {
        let svc = service();
        let mut paste = ev("s1", EventKind::ClipboardPaste);
        paste.metadata.insert("textLength".into(), json!(600));

        let outcome = svc
            .ingest_events("s1", vec![ev("s1", EventKind::DevtoolsDetected), paste])
            .await;

        // rule 30 + (20+40) = 90, devtools_with_paste pattern +30, clamped.
        assert_eq!(outcome.rule_score, 100);
        assert!(outcome.flagged_events.contains("devtools_detected"));
        assert!(outcome.flagged_events.contains("clipboard_paste"));

        let score = svc.get_session_score("s1").await.unwrap();
        assert_eq!(score.final_score, 100);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_but_empty_session_is_zero() {
        let svc = service();
        assert!(matches!(
            svc.get_session_score("ghost").await,
            Err(CoreError::SessionNotFound(_))
        ));

        svc.ingest_events("s1", vec![]).await;
        let score = svc.get_session_score("s1").await.unwrap();
        assert_eq!(score.final_score, 0);
        assert!(score.flagged_event_types.is_empty());
    }

    #[tokio::test]
    async fn low_originality_code_raises_session_risk() {
        let svc = service();
        svc.ingest_events("s1", vec![]).await;

        let line = "let total = compute(items)\n";
        let original: String = line.repeat(80);
        let first = svc.submit_code("s1", "task-1", &original, "rust").await;
        assert!(!first.cached);

        // A near-identical long resubmission: corpus similarity drags the
        // verdict under the floor and feeds back into the session score.
        let mut near_copy = line.repeat(79);
        near_copy.push_str("let total = compute_all(items)\n");
        let second = svc.submit_code("s1", "task-1", &near_copy, "rust").await;
        assert!(second.score < 50, "expected penalized verdict, got {}", second.score);

        let score = svc.get_session_score("s1").await.unwrap();
        assert_eq!(score.code_originality_score, Some(second.score));
        assert!(score.flagged_event_types.contains("suspicious_code"));
        assert_eq!(score.rule_based_score, 50 - second.score);
    }

    #[tokio::test]
    async fn summary_carries_the_risk_band() {
        let svc = service();
        let mut paste = ev("s1", EventKind::ClipboardPaste);
        paste.metadata.insert("textLength".into(), json!(600));
        svc.ingest_events("s1", vec![ev("s1", EventKind::DevtoolsDetected), paste])
            .await;

        let summary = svc.session_summary("s1").await.unwrap();
        assert_eq!(summary.final_score, 100);
        assert_eq!(summary.risk_level, crate::events::RiskLevel::Critical);
    }
}
