// proctorglass/src/oracle/client.rs
//
// Rate-limited transport to the external judgment service. Two
// capabilities, nothing else: free-text chat completion and vector
// embedding generation.
//
// Throttling: one single-slot limiter per model — a mutex-guarded
// last-call instant. A caller for model M holds M's slot across the
// 1/rps(M) wait, so concurrent callers for the same model serialize and
// callers for different models never touch each other. No burst credit.
//
// Failure policy: network errors, non-2xx and transport timeouts all
// surface as OracleUnavailable. The client never retries — retry is a
// caller decision, and every caller here prefers falling back to offline
// heuristics over hammering a rate-limited service.
//
// Offline mode: with no credential configured, complete() and embed()
// still return well-typed deterministic values, so every downstream
// component stays exercised without network access. The offline embedding
// is a hashed-n-gram random-feature vector: tokenize into word n-grams
// (n=1..3), hash each into ±1 features, sum, L2-normalize.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::{CoreError, Result};
use crate::oracle::parse;

// ── Rate limiter ──────────────────────────────────────────────────────────────

struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(rps: f64) -> Self {
        let rps = rps.max(0.1);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            last_call: Mutex::new(None),
        }
    }

    /// Block until the minimum inter-call interval has elapsed, then claim
    /// the slot. The mutex is held across the sleep on purpose: that is
    /// what serializes same-model callers.
    async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct OracleClient {
    cfg: OracleConfig,
    http: reqwest::Client,
    limiters: HashMap<String, RateLimiter>,
}

impl OracleClient {
    pub fn new(cfg: OracleConfig) -> Self {
        let mut limiters = HashMap::new();
        for model in [&cfg.chat_model, &cfg.code_model, &cfg.embed_model] {
            limiters
                .entry(model.name.clone())
                .or_insert_with(|| RateLimiter::new(model.rps));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { cfg, http, limiters }
    }

    pub fn offline(&self) -> bool {
        self.cfg.api_key.is_none()
    }

    pub fn config(&self) -> &OracleConfig {
        &self.cfg
    }

    async fn throttle(&self, model: &str) {
        if let Some(limiter) = self.limiters.get(model) {
            limiter.acquire().await;
        }
    }

    // ── Chat completion ───────────────────────────────────────────────────────

    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        self.throttle(model).await;

        if self.offline() {
            debug!(model, "oracle offline — answering from heuristics");
            return Ok(offline_completion(prompt));
        }

        let mut payload = json!({
            "model": model,
            "messages": [
                {"role": "system",
                 "content": "You are an expert proctoring analyst. You always answer with valid JSON."},
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
        });
        if let Some(max) = max_tokens {
            payload["max_tokens"] = json!(max);
        }

        let url = format!("{}/v1/chat/completions", self.cfg.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.cfg.api_key.as_deref().unwrap_or_default())
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::OracleUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CoreError::OracleUnavailable(format!(
                "chat completion returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::OracleUnavailable(e.to_string()))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                CoreError::MalformedOracleResponse("completion payload had no content".into())
            })
    }

    // ── Embeddings ────────────────────────────────────────────────────────────

    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        self.throttle(model).await;

        if self.offline() {
            return Ok(hashed_embedding(text, self.cfg.embed_dim));
        }

        let url = format!("{}/v1/embeddings", self.cfg.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.cfg.api_key.as_deref().unwrap_or_default())
            .json(&json!({"model": model, "input": text}))
            .send()
            .await
            .map_err(|e| CoreError::OracleUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CoreError::OracleUnavailable(format!(
                "embeddings returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::OracleUnavailable(e.to_string()))?;
        let embedding = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| {
                CoreError::MalformedOracleResponse("embedding payload had no vector".into())
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();
        if embedding.is_empty() {
            warn!(model, "oracle returned an empty embedding");
        }
        Ok(embedding)
    }

    // ── Prompt builders ───────────────────────────────────────────────────────

    pub fn originality_prompt(code: &str, task_description: &str, language: &str) -> String {
        format!(
            "Analyze the following code for signs that it was copied from an external \
             source (public repositories, Q&A sites, shared solutions).\n\n\
             Code:\n```{language}\n{code}\n```\n\n\
             Task: {task_description}\n\n\
             Return JSON with fields:\n\
             - originality_score: number 0-100 (100 = fully original)\n\
             - suspicious_patterns: list of strings (may be empty)\n\
             - explanation: why you scored it that way\n\n\
             Answer ONLY with valid JSON, no extra text."
        )
    }

    pub fn behavior_prompt(
        events_json: &str,
        task_description: &str,
        elapsed_minutes: i64,
    ) -> String {
        format!(
            "Review this remote-interview proctoring event history and judge whether \
             the candidate is cheating.\n\n\
             Events:\n{events_json}\n\n\
             Task: {task_description}\n\
             Time on task: {elapsed_minutes} minutes\n\n\
             Return JSON with fields:\n\
             - risk_score: number 0-100 (0 = no risk, 100 = certain cheating)\n\
             - flagged_events: list of suspicious event types\n\
             - reasoning: short explanation\n\
             - recommendation: one of \"pass\", \"watch\", \"fail\"\n\n\
             Answer ONLY with valid JSON, no extra text."
        )
    }
}

// ── Offline heuristics ────────────────────────────────────────────────────────

/// Offline code-size threshold: bodies past this many characters read as
/// likely pasted rather than typed.
const OFFLINE_LONG_CODE_CHARS: usize = 1200;

fn offline_completion(prompt: &str) -> String {
    if prompt.contains("originality_score") {
        let code_len = parse::fenced_block(prompt).map(|b| b.trim().len()).unwrap_or(0);
        let (score, patterns, explanation) = if code_len > OFFLINE_LONG_CODE_CHARS {
            (
                35,
                vec!["long pasted fragment"],
                "offline heuristic: large code bodies are treated as suspect",
            )
        } else {
            (82, vec![], "offline heuristic: code size looks hand-written")
        };
        return json!({
            "originality_score": score,
            "suspicious_patterns": patterns,
            "explanation": explanation,
        })
        .to_string();
    }

    // Behavioral judgment: step the risk with reported event volume.
    let n_events = prompt.matches("\"kind\"").count();
    let risk = (n_events * 4).min(85) as u8;
    let recommendation = if risk >= 60 {
        "fail"
    } else if risk >= 30 {
        "watch"
    } else {
        "pass"
    };
    json!({
        "risk_score": risk,
        "flagged_events": [],
        "reasoning": format!("offline heuristic over {n_events} events"),
        "recommendation": recommendation,
    })
    .to_string()
}

/// Deterministic ±1 feature vector for one token, spread from a SHA-256
/// digest across `dim` dimensions (cyclic past 256 bits).
fn token_feature(token: &str, dim: usize, out: &mut [f32]) {
    let mut h = Sha256::new();
    h.update(b"pg_rfh_v1:");
    h.update(token.as_bytes());
    let digest = h.finalize();
    for i in 0..dim {
        let bit = (digest[(i / 8) % digest.len()] >> (i % 8)) & 1;
        out[i] += if bit == 1 { 1.0 } else { -1.0 };
    }
}

/// Build a unit-length embedding for a text: word n-grams (n=1..3) hashed
/// into ±1 features, summed, L2-normalized.
pub fn hashed_embedding(text: &str, dim: usize) -> Vec<f32> {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let mut vec = vec![0.0f32; dim];
    for n in 1..=3usize {
        for window in tokens.windows(n) {
            token_feature(&window.join(" "), dim, &mut vec);
        }
    }

    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;
    use crate::oracle::parse::parse_originality;

    fn offline_client() -> OracleClient {
        OracleClient::new(OracleConfig::default())
    }

    #[tokio::test]
    async fn offline_originality_band_long_code() {
        let client = offline_client();
        let code = "x".repeat(2000);
        let prompt = OracleClient::originality_prompt(&code, "sum two numbers", "python");
        let text = client
            .complete(&prompt, &client.config().code_model.name.clone(), 0.3, None)
            .await
            .unwrap();
        let judgment = parse_originality(&text).unwrap();
        assert_eq!(judgment.score, 35);
    }

    #[tokio::test]
    async fn offline_originality_band_short_code() {
        let client = offline_client();
        let prompt =
            OracleClient::originality_prompt("def add(a, b):\n    return a + b", "sum", "python");
        let text = client
            .complete(&prompt, &client.config().code_model.name.clone(), 0.3, None)
            .await
            .unwrap();
        let judgment = parse_originality(&text).unwrap();
        assert_eq!(judgment.score, 82);
    }

    #[tokio::test]
    async fn offline_behavior_judgment_is_well_typed() {
        let client = offline_client();
        let events = r#"[{"kind":"tab_switch"},{"kind":"tab_switch"}]"#;
        let prompt = OracleClient::behavior_prompt(events, "task", 12);
        let text = client
            .complete(&prompt, &client.config().chat_model.name.clone(), 0.3, Some(1000))
            .await
            .unwrap();
        let deep = crate::oracle::parse::parse_deep(&text).unwrap();
        assert_eq!(deep.risk_score, 8); // 2 events × 4
    }

    #[tokio::test]
    async fn offline_embedding_is_unit_length_and_deterministic() {
        let client = offline_client();
        let a = client.embed("fn main() { println!(\"hi\"); }", "bge-m3").await.unwrap();
        let b = client.embed("fn main() { println!(\"hi\"); }", "bge-m3").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_same_model_calls() {
        let limiter = RateLimiter::new(10.0); // 100ms interval
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two enforced gaps of ~100ms each.
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[test]
    fn embedding_dimension_matches_config() {
        assert_eq!(hashed_embedding("some text here", 256).len(), 256);
        assert_eq!(hashed_embedding("some text here", 64).len(), 64);
    }
}
