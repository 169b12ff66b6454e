// proctorglass/src/events.rs
//
// Shared event types and all domain types flowing through Proctorglass.
// Telemetry arrives from the browser monitor as JSONL batches; everything
// downstream (rule engine, pattern detector, combiner, originality
// analyzer) works on the types in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ── Telemetry events ──────────────────────────────────────────────────────────

/// Behavioral event kinds reported by the in-browser proctoring monitor.
/// The enumeration is closed, but feeds may carry kinds we don't know yet —
/// those deserialize to `Unknown`, score zero, and stay in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DevtoolsDetected,
    ExtensionDetected,
    ClipboardPaste,
    ClipboardCopy,
    ClipboardCut,
    TabSwitch,
    VisibilityChange,
    FaceDetection,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DevtoolsDetected => write!(f, "devtools_detected"),
            Self::ExtensionDetected => write!(f, "extension_detected"),
            Self::ClipboardPaste => write!(f, "clipboard_paste"),
            Self::ClipboardCopy => write!(f, "clipboard_copy"),
            Self::ClipboardCut => write!(f, "clipboard_cut"),
            Self::TabSwitch => write!(f, "tab_switch"),
            Self::VisibilityChange => write!(f, "visibility_change"),
            Self::FaceDetection => write!(f, "face_detection"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One behavioral event. Immutable once recorded; append-only per session.
/// Ordering by timestamp matters for pattern detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub session_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Face-detection severity as reported in event metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceSeverity {
    Normal,
    Warning,
    Critical,
}

impl TelemetryEvent {
    /// Pasted text length for clipboard events (`metadata.textLength`).
    pub fn text_length(&self) -> u64 {
        self.metadata
            .get("textLength")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Severity of a face_detection event (`metadata.severity`).
    pub fn face_severity(&self) -> FaceSeverity {
        match self.metadata.get("severity").and_then(|v| v.as_str()) {
            Some("critical") => FaceSeverity::Critical,
            Some("warning") => FaceSeverity::Warning,
            _ => FaceSeverity::Normal,
        }
    }

    /// Number of faces in frame for face_detection events
    /// (`metadata.currentCount`, defaults to 1).
    pub fn face_count(&self) -> u32 {
        self.metadata
            .get("currentCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32
    }
}

// ── Rule table entries ────────────────────────────────────────────────────────

/// Static scoring rule for one event kind.
/// `base_score` ∈ [0,100]; `repeat_multiplier` ≥ 1.0.
#[derive(Debug, Clone, Copy)]
pub struct EventRule {
    pub base_score: f64,
    pub repeat_multiplier: f64,
    pub critical: bool,
    pub dynamic: bool,
}

/// Output of one rule-engine pass over a session window.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub score: u8,
    pub critical_event_count: usize,
    pub per_type_counts: HashMap<EventKind, u32>,
}

impl RuleOutcome {
    pub fn empty() -> Self {
        Self {
            score: 0,
            critical_event_count: 0,
            per_type_counts: HashMap::new(),
        }
    }
}

// ── Suspicious patterns ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    RapidPasting,
    DevtoolsWithPaste,
    ExtensionWithLargePaste,
    ExcessiveTabSwitching,
    MultiplePeopleDetected,
    FrequentDisappearance,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RapidPasting => write!(f, "rapid_pasting"),
            Self::DevtoolsWithPaste => write!(f, "devtools_with_paste"),
            Self::ExtensionWithLargePaste => write!(f, "extension_with_large_paste"),
            Self::ExcessiveTabSwitching => write!(f, "excessive_tab_switching"),
            Self::MultiplePeopleDetected => write!(f, "multiple_people_detected"),
            Self::FrequentDisappearance => write!(f, "frequent_disappearance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Fixed additive bonus a firing pattern contributes to the final score.
    pub fn bonus(self) -> u32 {
        match self {
            Self::Critical => 30,
            Self::High => 20,
            Self::Medium => 10,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A co-occurrence or temporal-burst pattern detected in the window.
/// Derived on every scan, never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousPattern {
    pub kind: PatternKind,
    pub severity: Severity,
    pub description: String,
    pub supporting_events: usize,
}

// ── Session scores ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Pass,
    Watch,
    Fail,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Watch => write!(f, "watch"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Minimal,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
            Self::Minimal => write!(f, "MINIMAL"),
        }
    }
}

/// Per-session risk state. One row per session, upsert semantics.
/// `final_score` is always recomputed from the other fields — the combiner
/// never mutates it independently, so any stored row can be re-derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionScore {
    pub session_id: String,
    pub rule_based_score: u8,
    pub llm_risk_score: Option<u8>,
    pub code_originality_score: Option<u8>,
    pub final_score: u8,
    pub flagged_event_types: BTreeSet<String>,
    pub llm_recommendation: Option<Recommendation>,
    pub llm_reasoning: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionScore {
    pub fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            rule_based_score: 0,
            llm_risk_score: None,
            code_originality_score: None,
            final_score: 0,
            flagged_event_types: BTreeSet::new(),
            llm_recommendation: None,
            llm_reasoning: None,
            updated_at: Utc::now(),
        }
    }
}

/// Read-side report combining the stored score with its risk band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub rule_based_score: u8,
    pub llm_risk_score: Option<u8>,
    pub code_originality_score: Option<u8>,
    pub final_score: u8,
    pub risk_level: RiskLevel,
    pub flagged_event_types: BTreeSet<String>,
    pub llm_recommendation: Option<Recommendation>,
    pub llm_reasoning: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Parsed result of a deep behavioral oracle judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysis {
    pub risk_score: u8,
    #[serde(default)]
    pub flagged_events: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    pub recommendation: Recommendation,
}

// ── Code originality ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Local,
    Llm,
    Both,
}

impl std::fmt::Display for AnalysisMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Llm => write!(f, "llm"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// The originality analyzer's answer for one code submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalityVerdict {
    pub score: u8,
    pub suspicious_patterns: Vec<String>,
    pub explanation: String,
    pub method: AnalysisMethod,
    pub cached: bool,
}

/// Corpus entry for one analyzed code body. Keyed by the SHA-256 of the
/// normalized code; immutable once written; evicted oldest-first past the
/// configured corpus capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeOriginalityRecord {
    pub content_hash: String,
    pub task_id: String,
    pub originality_score: u8,
    pub suspicious_patterns: Vec<String>,
    pub explanation: String,
    pub method: AnalysisMethod,
    pub embedding: Vec<f32>,
    pub cached_at: DateTime<Utc>,
}

/// Line-set diff between two snapshots of one session's code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeDelta {
    pub identical: bool,
    pub similarity: f64,
    pub added_lines: usize,
    pub removed_lines: usize,
}

// ── Ingestion outcome ─────────────────────────────────────────────────────────

/// What the ingestion caller gets back synchronously: the cheap rule/pattern
/// verdict. Deep oracle analysis, when triggered, lands later out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub session_id: String,
    pub rule_score: u8,
    pub flagged_events: BTreeSet<String>,
    pub patterns: Vec<SuspiciousPattern>,
    pub events_in_window: usize,
}
