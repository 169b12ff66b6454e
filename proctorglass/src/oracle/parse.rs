// proctorglass/src/oracle/parse.rs
//
// The oracle answers in free text that is *supposed* to be JSON. This
// module is the ordered chain of parse strategies, each a value-returning
// step — no exception-driven control flow:
//
//   1. strict parse of the whole response
//   2. JSON inside a fenced ``` block
//   3. first balanced-looking {...} / [...] substring
//
// A chain miss is `Extracted::Failed`; the caller substitutes its neutral
// verdict.

use serde::Deserialize;

use crate::events::{DeepAnalysis, Recommendation};

#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Parsed(serde_json::Value),
    Failed,
}

pub fn extract_json(text: &str) -> Extracted {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Extracted::Parsed(v);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(block.trim()) {
            return Extracted::Parsed(v);
        }
    }

    if let Some(candidate) = balanced_substring(trimmed) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
            return Extracted::Parsed(v);
        }
    }

    Extracted::Failed
}

/// Body of the first fenced code block, tolerating a language tag after
/// the opening fence. Also used by the offline client to size the code
/// payload inside a prompt.
pub(crate) fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// First substring that opens with `{` or `[` and closes balanced,
/// skipping brackets inside string literals.
fn balanced_substring(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let (open, close) = if bytes[start] == b'{' { (b'{', b'}') } else { (b'[', b']') };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Typed verdict extraction ──────────────────────────────────────────────────

/// Raw originality judgment as the oracle phrases it. Scores arrive as
/// whatever number shape the model felt like; clamp on conversion.
#[derive(Debug, Deserialize)]
struct RawOriginality {
    originality_score: f64,
    #[serde(default)]
    suspicious_patterns: Vec<String>,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Clone)]
pub struct OriginalityJudgment {
    pub score: u8,
    pub suspicious_patterns: Vec<String>,
    pub explanation: String,
}

pub fn parse_originality(text: &str) -> Option<OriginalityJudgment> {
    match extract_json(text) {
        Extracted::Parsed(v) => {
            let raw: RawOriginality = serde_json::from_value(v).ok()?;
            Some(OriginalityJudgment {
                score: raw.originality_score.clamp(0.0, 100.0).round() as u8,
                suspicious_patterns: raw.suspicious_patterns,
                explanation: raw.explanation,
            })
        }
        Extracted::Failed => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawDeep {
    risk_score: f64,
    #[serde(default)]
    flagged_events: Vec<String>,
    #[serde(default)]
    reasoning: String,
    recommendation: Option<Recommendation>,
}

pub fn parse_deep(text: &str) -> Option<DeepAnalysis> {
    match extract_json(text) {
        Extracted::Parsed(v) => {
            let raw: RawDeep = serde_json::from_value(v).ok()?;
            Some(DeepAnalysis {
                risk_score: raw.risk_score.clamp(0.0, 100.0).round() as u8,
                flagged_events: raw.flagged_events,
                reasoning: raw.reasoning,
                recommendation: raw.recommendation.unwrap_or(Recommendation::Watch),
            })
        }
        Extracted::Failed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses_first() {
        let out = extract_json(r#"{"originality_score": 80}"#);
        assert!(matches!(out, Extracted::Parsed(_)));
    }

    #[test]
    fn fenced_block_with_language_tag() {
        let text = "Here is my answer:\n```json\n{\"originality_score\": 72}\n```\nDone.";
        let j = parse_originality(text).unwrap();
        assert_eq!(j.score, 72);
    }

    #[test]
    fn balanced_substring_inside_prose() {
        let text = "The verdict is {\"originality_score\": 45, \"explanation\": \"a {brace} in a string\"} overall.";
        let j = parse_originality(text).unwrap();
        assert_eq!(j.score, 45);
        assert_eq!(j.explanation, "a {brace} in a string");
    }

    #[test]
    fn hopeless_text_fails_cleanly() {
        assert_eq!(extract_json("no json here at all"), Extracted::Failed);
        assert!(parse_originality("I refuse to answer in JSON").is_none());
    }

    #[test]
    fn scores_clamp_on_conversion() {
        let j = parse_originality(r#"{"originality_score": 350}"#).unwrap();
        assert_eq!(j.score, 100);
        let j = parse_originality(r#"{"originality_score": -5}"#).unwrap();
        assert_eq!(j.score, 0);
    }

    #[test]
    fn deep_analysis_defaults_missing_fields() {
        let d = parse_deep(r#"{"risk_score": 65}"#).unwrap();
        assert_eq!(d.risk_score, 65);
        assert_eq!(d.recommendation, crate::events::Recommendation::Watch);
        assert!(d.flagged_events.is_empty());
    }

    #[test]
    fn deep_analysis_full_payload() {
        let d = parse_deep(
            r#"```
            {"risk_score": 88, "flagged_events": ["clipboard_paste"],
             "reasoning": "heavy pasting", "recommendation": "fail"}
            ```"#,
        )
        .unwrap();
        assert_eq!(d.risk_score, 88);
        assert_eq!(d.recommendation, crate::events::Recommendation::Fail);
        assert_eq!(d.flagged_events, vec!["clipboard_paste"]);
    }
}
