// proctorglass/src/originality/analyzer.rs
//
// Code-originality verdicts. Pipeline per submission:
//
//   normalize → hash → exact-duplicate cache hit?
//   local heuristics (no network)
//   oracle judgment (permissively parsed, neutral on parse failure)
//   embedding similarity vs. same-task corpus entries
//   weighted blend → corpus insert
//
// Oracle and embedding failures never propagate: the verdict degrades to
// the local heuristic score and says so.

use std::sync::{Arc, OnceLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::events::{AnalysisMethod, CodeDelta, CodeOriginalityRecord, OriginalityVerdict};
use crate::oracle::client::OracleClient;
use crate::oracle::parse;
use crate::originality::corpus::CorpusIndex;

// Blend weights: local heuristics vs. oracle(+similarity) judgment.
const LOCAL_WEIGHT: f64 = 0.3;
const ORACLE_WEIGHT: f64 = 0.7;

// Similarity penalty bands.
const SIM_STRONG: f32 = 0.85;
const SIM_WEAK: f32 = 0.70;
const SIM_STRONG_PENALTY: i32 = 30;
const SIM_WEAK_PENALTY: i32 = 15;

/// Markers typical of shared template solutions rather than typed code.
const TEMPLATE_MARKERS: &[&str] = &["TODO:", "FIXME:", "solution("];

static MARKER_AC: OnceLock<AhoCorasick> = OnceLock::new();

fn marker_automaton() -> &'static AhoCorasick {
    MARKER_AC.get_or_init(|| {
        AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostFirst)
            .build(TEMPLATE_MARKERS)
            .expect("static marker patterns")
    })
}

pub struct OriginalityAnalyzer {
    oracle: Arc<OracleClient>,
    corpus: Arc<CorpusIndex>,
}

impl OriginalityAnalyzer {
    pub fn new(oracle: Arc<OracleClient>, corpus: Arc<CorpusIndex>) -> Self {
        Self { oracle, corpus }
    }

    pub fn corpus(&self) -> &CorpusIndex {
        &self.corpus
    }

    pub async fn analyze(
        &self,
        code: &str,
        task_id: &str,
        task_description: &str,
        language: &str,
    ) -> OriginalityVerdict {
        let normalized = normalize_code(code);
        let content_hash = hash_code(&normalized);

        // Exact-duplicate dedup — a strict content-addressable hit, not a
        // fuzzy match.
        if let Some(record) = self.corpus.get(&content_hash) {
            debug!(%content_hash, "originality cache hit");
            return OriginalityVerdict {
                score: record.originality_score,
                suspicious_patterns: record.suspicious_patterns,
                explanation: record.explanation,
                method: record.method,
                cached: true,
            };
        }

        let (local_score, mut patterns) = local_heuristics(code, &normalized);

        // Oracle judgment. Unreachable oracle → local-only verdict;
        // unparseable answer → fixed neutral 50.
        let prompt = OracleClient::originality_prompt(code, task_description, language);
        let model = self.oracle.config().code_model.name.clone();
        let oracle_judgment = match self.oracle.complete(&prompt, &model, 0.3, None).await {
            Ok(text) => match parse::parse_originality(&text) {
                Some(j) => Some(j),
                None => Some(parse::OriginalityJudgment {
                    score: 50,
                    suspicious_patterns: vec![],
                    explanation: "oracle answer could not be parsed; neutral verdict".to_string(),
                }),
            },
            Err(e) => {
                warn!(error = %e, "originality oracle pass unavailable");
                None
            }
        };

        // Embedding similarity against same-task corpus entries.
        let embed_model = self.oracle.config().embed_model.name.clone();
        let embedding = match self.oracle.embed(&normalized, &embed_model).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding pass unavailable");
                Vec::new()
            }
        };
        let mut similarity_note = None;
        let mut similarity_penalty = 0i32;
        if !embedding.is_empty() {
            if let Some((sim, source)) = self.corpus.best_match(task_id, &embedding) {
                if sim > SIM_STRONG {
                    similarity_penalty = SIM_STRONG_PENALTY;
                } else if sim > SIM_WEAK {
                    similarity_penalty = SIM_WEAK_PENALTY;
                }
                if similarity_penalty > 0 {
                    patterns.push(format!(
                        "similar solution in corpus ({:.0}% match, {})",
                        sim * 100.0,
                        &source[..source.len().min(12)]
                    ));
                    similarity_note = Some(interpret_similarity(sim));
                }
            }
        }

        // Blend.
        let (score, method, mut explanation) = match oracle_judgment {
            Some(j) => {
                patterns.extend(j.suspicious_patterns);
                let adjusted = (i32::from(j.score) - similarity_penalty).clamp(0, 100) as f64;
                let blended = (LOCAL_WEIGHT * f64::from(local_score) + ORACLE_WEIGHT * adjusted)
                    .round()
                    .clamp(0.0, 100.0) as u8;
                let method = if similarity_penalty > 0 {
                    AnalysisMethod::Both
                } else {
                    AnalysisMethod::Llm
                };
                (blended, method, j.explanation)
            }
            None => {
                let adjusted =
                    (i32::from(local_score) - similarity_penalty).clamp(0, 100) as u8;
                (
                    adjusted,
                    AnalysisMethod::Local,
                    "oracle unavailable; local heuristic verdict".to_string(),
                )
            }
        };
        if let Some(note) = similarity_note {
            if !explanation.is_empty() {
                explanation.push(' ');
            }
            explanation.push_str(&note);
        }

        self.corpus.insert(CodeOriginalityRecord {
            content_hash,
            task_id: task_id.to_string(),
            originality_score: score,
            suspicious_patterns: patterns.clone(),
            explanation: explanation.clone(),
            method,
            embedding,
            cached_at: chrono::Utc::now(),
        });

        OriginalityVerdict {
            score,
            suspicious_patterns: patterns,
            explanation,
            method,
            cached: false,
        }
    }
}

// ── Normalization & hashing ───────────────────────────────────────────────────

/// Strip per-line comments and surrounding whitespace, drop blank lines.
/// Two submissions differing only in comments/formatting normalize (and
/// hash) identically.
pub(crate) fn normalize_code(code: &str) -> String {
    code.lines()
        .map(|line| {
            let cut = line
                .find("//")
                .into_iter()
                .chain(line.find('#'))
                .min()
                .unwrap_or(line.len());
            line[..cut].trim()
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn hash_code(normalized: &str) -> String {
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    hex::encode(h.finalize())
}

// ── Local heuristics ──────────────────────────────────────────────────────────

/// Cheap no-network pass. Starts at 100, subtracts 10 per distinct
/// triggered heuristic. Returns the sub-score and human-readable flags.
fn local_heuristics(code: &str, normalized: &str) -> (u8, Vec<String>) {
    let mut flags = Vec::new();

    let code_lines = normalized.lines().count();
    if code_lines < 3 {
        flags.push("too short to be independently derived".to_string());
    }

    let non_blank: Vec<&str> = code
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let comment_lines = non_blank
        .iter()
        .filter(|l| l.starts_with("//") || l.starts_with('#'))
        .count();
    if !non_blank.is_empty() && comment_lines as f64 / non_blank.len() as f64 > 0.5 {
        flags.push("mostly comment text".to_string());
    }

    if marker_automaton().is_match(code) {
        flags.push("template markers present".to_string());
    }

    let score = 100i32 - 10 * flags.len() as i32;
    (score.clamp(0, 100) as u8, flags)
}

fn interpret_similarity(sim: f32) -> String {
    if sim > 0.95 {
        "Nearly identical to a known solution — strong copy signal.".to_string()
    } else if sim > SIM_STRONG {
        "Very close to a known solution — likely copied.".to_string()
    } else {
        "Resembles a known solution; overlap may be legitimate.".to_string()
    }
}

// ── Snapshot diffing ──────────────────────────────────────────────────────────

/// Line-set similarity between two snapshots of one session's code. Used
/// to annotate large jumps between consecutive submissions.
pub fn compare_snapshots(before: &str, after: &str) -> CodeDelta {
    if hash_code(&normalize_code(before)) == hash_code(&normalize_code(after)) {
        return CodeDelta { identical: true, similarity: 1.0, added_lines: 0, removed_lines: 0 };
    }

    let a: std::collections::HashSet<&str> =
        before.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let b: std::collections::HashSet<&str> =
        after.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let common = a.intersection(&b).count();
    let union = a.union(&b).count();

    CodeDelta {
        identical: false,
        similarity: if union == 0 { 0.0 } else { common as f64 / union as f64 },
        added_lines: b.difference(&a).count(),
        removed_lines: a.difference(&b).count(),
    }
}
