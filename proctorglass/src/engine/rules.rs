// proctorglass/src/engine/rules.rs
//
// Rule-based event scoring — the cheap, deterministic half of the risk
// signal. One canonical rule table; the scorer itself is a pure function
// of the event slice, so re-running it over the same window always yields
// the same outcome.
//
// Score shape per event:
//   contribution = base_score                  (static rules)
//   contribution = dynamic(metadata)           (dynamic rules)
//   contribution *= repeat_multiplier^(n-1)    (nth occurrence of the kind)
// Sum over the window, clamped to [0,100].

use std::collections::HashMap;

use crate::events::{EventKind, EventRule, FaceSeverity, RuleOutcome, TelemetryEvent};

// Canonical rule table. base_score ∈ [0,100], repeat_multiplier ≥ 1.0.
const RULES: &[(EventKind, EventRule)] = &[
    (
        EventKind::DevtoolsDetected,
        EventRule { base_score: 30.0, repeat_multiplier: 1.5, critical: true, dynamic: false },
    ),
    (
        EventKind::ExtensionDetected,
        EventRule { base_score: 20.0, repeat_multiplier: 1.2, critical: true, dynamic: false },
    ),
    (
        EventKind::ClipboardPaste,
        EventRule { base_score: 20.0, repeat_multiplier: 1.3, critical: false, dynamic: true },
    ),
    (
        EventKind::ClipboardCopy,
        EventRule { base_score: 3.0, repeat_multiplier: 1.0, critical: false, dynamic: false },
    ),
    (
        EventKind::ClipboardCut,
        EventRule { base_score: 2.0, repeat_multiplier: 1.0, critical: false, dynamic: false },
    ),
    (
        EventKind::TabSwitch,
        EventRule { base_score: 10.0, repeat_multiplier: 1.1, critical: false, dynamic: false },
    ),
    (
        EventKind::VisibilityChange,
        EventRule { base_score: 15.0, repeat_multiplier: 1.2, critical: false, dynamic: false },
    ),
    (
        EventKind::FaceDetection,
        EventRule { base_score: 0.0, repeat_multiplier: 1.0, critical: false, dynamic: true },
    ),
];

pub fn rule_for(kind: EventKind) -> Option<EventRule> {
    RULES.iter().find(|(k, _)| *k == kind).map(|(_, r)| *r)
}

/// Pasted-size severity bands, added on top of the paste base score.
fn paste_band(text_length: u64) -> f64 {
    if text_length > 500 {
        40.0
    } else if text_length > 200 {
        25.0
    } else if text_length > 100 {
        15.0
    } else if text_length > 50 {
        8.0
    } else {
        3.0
    }
}

/// Dynamic contribution for rules that read event metadata. Paste severity
/// adds to the base score; face severity overrides it entirely.
fn dynamic_contribution(event: &TelemetryEvent, rule: &EventRule) -> f64 {
    match event.kind {
        EventKind::ClipboardPaste => rule.base_score + paste_band(event.text_length()),
        EventKind::FaceDetection => match event.face_severity() {
            FaceSeverity::Critical => 15.0 * f64::from(event.face_count()),
            FaceSeverity::Warning => 3.0,
            FaceSeverity::Normal => 0.0,
        },
        _ => rule.base_score,
    }
}

/// Score one session's trailing-window events. Pure: identical input lists
/// always yield identical outcomes.
pub fn score_events(events: &[TelemetryEvent]) -> RuleOutcome {
    let mut total = 0.0f64;
    let mut counts: HashMap<EventKind, u32> = HashMap::new();
    let mut critical_event_count = 0usize;

    for event in events {
        let count = counts.entry(event.kind).or_insert(0);
        *count += 1;

        let rule = match rule_for(event.kind) {
            Some(r) => r,
            None => continue, // unknown kind: counted, scores zero
        };

        let mut contribution = if rule.dynamic {
            dynamic_contribution(event, &rule)
        } else {
            rule.base_score
        };

        if *count > 1 {
            contribution *= rule.repeat_multiplier.powi(*count as i32 - 1);
        }

        total += contribution;
        if rule.critical {
            critical_event_count += 1;
        }
    }

    RuleOutcome {
        score: total.clamp(0.0, 100.0).round() as u8,
        critical_event_count,
        per_type_counts: counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn ev(kind: EventKind, secs_ago: i64) -> TelemetryEvent {
        TelemetryEvent {
            session_id: "s1".to_string(),
            kind,
            timestamp: Utc::now() - Duration::seconds(secs_ago),
            metadata: HashMap::new(),
        }
    }

    fn paste(text_length: u64, secs_ago: i64) -> TelemetryEvent {
        let mut e = ev(EventKind::ClipboardPaste, secs_ago);
        e.metadata.insert("textLength".into(), json!(text_length));
        e
    }

    #[test]
    fn single_devtools_scores_exactly_30() {
        let out = score_events(&[ev(EventKind::DevtoolsDetected, 10)]);
        assert_eq!(out.score, 30);
        assert_eq!(out.critical_event_count, 1);
    }

    #[test]
    fn paste_bands() {
        assert_eq!(score_events(&[paste(600, 1)]).score, 60); // base 20 + 40
        assert_eq!(score_events(&[paste(0, 1)]).score, 23); // base 20 + 3
    }

    #[test]
    fn face_severity_overrides_base() {
        let mut critical = ev(EventKind::FaceDetection, 5);
        critical.metadata.insert("severity".into(), json!("critical"));
        critical.metadata.insert("currentCount".into(), json!(2));
        assert_eq!(score_events(&[critical]).score, 30); // 15 × 2

        let mut warning = ev(EventKind::FaceDetection, 5);
        warning.metadata.insert("severity".into(), json!("warning"));
        assert_eq!(score_events(&[warning]).score, 3);

        let normal = ev(EventKind::FaceDetection, 5);
        assert_eq!(score_events(&[normal]).score, 0);
    }

    #[test]
    fn repeats_escalate_with_multiplier() {
        // 6 tab switches, base 10, multiplier 1.1:
        // 10·(1 + 1.1 + 1.1² + 1.1³ + 1.1⁴ + 1.1⁵) ≈ 77.16
        let evs: Vec<_> = (0..6).map(|i| ev(EventKind::TabSwitch, 60 - i)).collect();
        let out = score_events(&evs);
        assert_eq!(out.score, 77);
        assert_eq!(out.per_type_counts[&EventKind::TabSwitch], 6);
    }

    #[test]
    fn unknown_kinds_count_but_score_zero() {
        let out = score_events(&[ev(EventKind::Unknown, 1), ev(EventKind::Unknown, 2)]);
        assert_eq!(out.score, 0);
        assert_eq!(out.per_type_counts[&EventKind::Unknown], 2);
    }

    #[test]
    fn score_is_clamped_to_100() {
        let evs: Vec<_> = (0..10).map(|i| ev(EventKind::DevtoolsDetected, 100 - i)).collect();
        assert_eq!(score_events(&evs).score, 100);
    }

    #[test]
    fn scoring_is_pure() {
        let evs = vec![ev(EventKind::DevtoolsDetected, 30), paste(600, 10)];
        let a = score_events(&evs);
        let b = score_events(&evs);
        assert_eq!(a, b);
        assert_eq!(a.score, 90); // 30 + (20+40)
    }

    #[test]
    fn empty_window_scores_zero() {
        let out = score_events(&[]);
        assert_eq!(out, RuleOutcome::empty());
    }
}
