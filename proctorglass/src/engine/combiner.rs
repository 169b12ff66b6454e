// proctorglass/src/engine/combiner.rs
//
// Score combination and session-score ownership. Every SessionScore
// mutation in the process goes through this type, under a per-session
// async mutex — a rule-pass update racing a completing deep-oracle update
// can't drop either side's contribution.
//
// final_score is a pure function of the stored fields:
//   no oracle judgment yet  →  final = rule
//   oracle judgment applied →  final = round(w_rule·rule + w_llm·llm)
// so any stored row can be recomputed from its parts.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{DeepAnalysis, RiskLevel, SessionScore, SessionSummary};
use crate::store::KvStore;

/// Invoked after every persisted score change; the transport layer hangs
/// its live-observer push (WebSocket or otherwise) off this.
pub type ScoreHook = Arc<dyn Fn(&str, u8, &BTreeSet<String>) + Send + Sync>;

/// Flag set on a session whose submitted code scored below the
/// originality floor.
pub const SUSPICIOUS_CODE_FLAG: &str = "suspicious_code";
/// Originality below this adds a behavioral penalty.
const ORIGINALITY_FLOOR: u8 = 50;

pub struct ScoreCombiner {
    store: Arc<dyn KvStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    // Event-count snapshot of the last applied deep result per session;
    // anything older is stale and discarded.
    last_deep_snapshot: DashMap<String, usize>,
    rule_weight: f64,
    oracle_weight: f64,
    hook: Option<ScoreHook>,
}

impl ScoreCombiner {
    pub fn new(store: Arc<dyn KvStore>, rule_weight: f64, oracle_weight: f64) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            last_deep_snapshot: DashMap::new(),
            rule_weight,
            oracle_weight,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: ScoreHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn key(session_id: &str) -> String {
        format!("score:{session_id}")
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionScore>> {
        let raw = self.store.get(&Self::key(session_id)).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn persist(&self, score: &SessionScore) -> Result<()> {
        let json = serde_json::to_string(score)
            .map_err(|e| crate::error::CoreError::Store(e.to_string()))?;
        self.store.upsert(&Self::key(&score.session_id), json).await?;
        if let Some(hook) = &self.hook {
            hook(&score.session_id, score.final_score, &score.flagged_event_types);
        }
        Ok(())
    }

    fn recompute_final(&self, score: &mut SessionScore) {
        score.final_score = match score.llm_risk_score {
            Some(llm) => (self.rule_weight * f64::from(score.rule_based_score)
                + self.oracle_weight * f64::from(llm))
            .round()
            .clamp(0.0, 100.0) as u8,
            None => score.rule_based_score,
        };
        score.updated_at = Utc::now();
    }

    // ── Rule/pattern updates ──────────────────────────────────────────────────

    /// Upsert the rule-derived side of a session's score. Window-derived
    /// flags are replaced wholesale (they are recomputed each scan); the
    /// code-derived suspicious_code flag survives.
    pub async fn update(
        &self,
        session_id: &str,
        rule_score: u8,
        flagged: BTreeSet<String>,
    ) -> Result<SessionScore> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut score = self
            .load(session_id)
            .await?
            .unwrap_or_else(|| SessionScore::empty(session_id));

        let keep_code_flag = score
            .flagged_event_types
            .contains(SUSPICIOUS_CODE_FLAG);
        score.rule_based_score = rule_score.min(100);
        score.flagged_event_types = flagged;
        if keep_code_flag {
            score
                .flagged_event_types
                .insert(SUSPICIOUS_CODE_FLAG.to_string());
        }

        self.recompute_final(&mut score);
        self.persist(&score).await?;
        debug!(session_id, rule_score, final_score = score.final_score, "rule score upserted");
        Ok(score)
    }

    // ── Code-originality penalty ──────────────────────────────────────────────

    /// Record a code-originality verdict against the session. A score
    /// under the floor feeds back into behavioral risk: penalty
    /// max(0, 50 − originality) on the rule score, plus the
    /// suspicious_code flag — no new behavioral events required.
    pub async fn flag_suspicious_code(
        &self,
        session_id: &str,
        originality_score: u8,
        patterns: &[String],
    ) -> Result<SessionScore> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut score = self
            .load(session_id)
            .await?
            .unwrap_or_else(|| SessionScore::empty(session_id));

        score.code_originality_score = Some(originality_score);
        if originality_score < ORIGINALITY_FLOOR {
            let penalty = ORIGINALITY_FLOOR - originality_score;
            score.rule_based_score =
                score.rule_based_score.saturating_add(penalty).min(100);
            score
                .flagged_event_types
                .insert(SUSPICIOUS_CODE_FLAG.to_string());
            info!(
                session_id,
                originality_score, penalty, patterns = patterns.len(),
                "low-originality code raised session risk"
            );
        }

        self.recompute_final(&mut score);
        self.persist(&score).await?;
        Ok(score)
    }

    // ── Deep-oracle results ───────────────────────────────────────────────────

    /// Fold a completed deep behavioral analysis into the session score.
    /// The rule-derived state is re-read here, at application time — never
    /// a snapshot captured at dispatch. A result whose event-count
    /// snapshot is older than one already applied is discarded.
    pub async fn apply_deep_analysis(
        &self,
        session_id: &str,
        analysis: DeepAnalysis,
        snapshot_events: usize,
    ) -> Result<Option<SessionScore>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(applied) = self.last_deep_snapshot.get(session_id) {
            if *applied > snapshot_events {
                debug!(session_id, snapshot_events, "stale deep result discarded");
                return Ok(None);
            }
        }

        let mut score = self
            .load(session_id)
            .await?
            .unwrap_or_else(|| SessionScore::empty(session_id));

        score.llm_risk_score = Some(analysis.risk_score);
        score.llm_recommendation = Some(analysis.recommendation);
        score.llm_reasoning = Some(analysis.reasoning);
        for flag in analysis.flagged_events {
            score.flagged_event_types.insert(flag);
        }

        self.recompute_final(&mut score);
        self.persist(&score).await?;
        self.last_deep_snapshot
            .insert(session_id.to_string(), snapshot_events);
        info!(
            session_id,
            llm_risk = analysis.risk_score,
            final_score = score.final_score,
            "deep analysis applied"
        );
        Ok(Some(score))
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionScore>> {
        self.load(session_id).await
    }

    pub async fn summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        Ok(self.load(session_id).await?.map(|s| SessionSummary {
            risk_level: risk_level(s.final_score),
            session_id: s.session_id,
            rule_based_score: s.rule_based_score,
            llm_risk_score: s.llm_risk_score,
            code_originality_score: s.code_originality_score,
            final_score: s.final_score,
            flagged_event_types: s.flagged_event_types,
            llm_recommendation: s.llm_recommendation,
            llm_reasoning: s.llm_reasoning,
            updated_at: s.updated_at,
        }))
    }
}

/// Single risk banding policy: 5 ordered, non-overlapping bands.
pub fn risk_level(score: u8) -> RiskLevel {
    if score >= 80 {
        RiskLevel::Critical
    } else if score >= 60 {
        RiskLevel::High
    } else if score >= 40 {
        RiskLevel::Medium
    } else if score >= 20 {
        RiskLevel::Low
    } else {
        RiskLevel::Minimal
    }
}
