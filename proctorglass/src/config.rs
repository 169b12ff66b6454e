// proctorglass/src/config.rs
//
// Construction-time configuration for the scoring core. Nothing in the
// engine reads the environment directly — main() builds one Config (env
// overrides on top of defaults) and hands it down.

use serde::{Deserialize, Serialize};

// ── Oracle ────────────────────────────────────────────────────────────────────

/// One logical oracle model: the wire name plus its requests-per-second
/// ceiling. The rate limiter enforces a minimum of 1/rps seconds between
/// calls to the same model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleModel {
    pub name: String,
    pub rps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// No key → deterministic offline mode; every capability still answers.
    pub api_key: Option<String>,
    pub base_url: String,
    /// General chat model used for deep behavioral judgment.
    pub chat_model: OracleModel,
    /// Code-tuned chat model used for originality judgment.
    pub code_model: OracleModel,
    /// Embedding model used for similarity search.
    pub embed_model: OracleModel,
    /// Per-request transport timeout, seconds.
    pub request_timeout_secs: u64,
    /// Dimensionality of offline-mode embeddings.
    pub embed_dim: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://llm.t1v.scibox.tech".to_string(),
            chat_model: OracleModel { name: "qwen3-32b-awq".to_string(), rps: 2.0 },
            code_model: OracleModel {
                name: "qwen3-coder-30b-a3b-instruct-fp8".to_string(),
                rps: 2.0,
            },
            embed_model: OracleModel { name: "bge-m3".to_string(), rps: 7.0 },
            request_timeout_secs: 30,
            embed_dim: 256,
        }
    }
}

// ── Core ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub oracle: OracleConfig,

    /// Trailing analysis window over session events, minutes.
    pub window_minutes: i64,

    /// Deep oracle analysis fires when the rule score exceeds this...
    pub deep_score_trigger: u8,
    /// ...or the window holds more events than this.
    pub deep_event_trigger: usize,
    /// Upper bound on one background deep-analysis round-trip, seconds.
    pub deep_timeout_secs: u64,

    /// Originality corpus capacity; eviction drops the oldest entries.
    pub corpus_capacity: usize,
    /// How many oldest entries one eviction pass removes.
    pub corpus_evict_batch: usize,

    /// final = rule_weight·rule + oracle_weight·llm once the oracle has
    /// spoken. Empirically chosen policy, not physics — hence configurable.
    pub rule_weight: f64,
    pub oracle_weight: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle: OracleConfig::default(),
            window_minutes: 30,
            deep_score_trigger: 50,
            deep_event_trigger: 20,
            deep_timeout_secs: 120,
            corpus_capacity: 1000,
            corpus_evict_batch: 100,
            rule_weight: 0.4,
            oracle_weight: 0.6,
        }
    }
}

impl Config {
    /// Defaults with environment overrides. Only the operational knobs are
    /// env-driven; policy weights stay in config files / construction.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(key) = std::env::var("ORACLE_API_KEY") {
            if !key.is_empty() {
                cfg.oracle.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("ORACLE_BASE_URL") {
            if !url.is_empty() {
                cfg.oracle.base_url = url;
            }
        }
        if let Ok(mins) = std::env::var("PROCTORGLASS_WINDOW_MINUTES") {
            if let Ok(m) = mins.parse() {
                cfg.window_minutes = m;
            }
        }
        cfg
    }
}
