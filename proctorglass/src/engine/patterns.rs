// proctorglass/src/engine/patterns.rs
//
// Suspicious-pattern detection — co-occurrence and temporal-burst signals
// across one session's trailing window. Detectors are independent and
// non-exclusive; each firing pattern contributes a fixed severity bonus
// (critical +30, high +20, medium +10) exactly once per pattern kind, and
// implicates its event kinds in the flagged set.
//
// Like the rule engine, this is a pure function over the event slice.

use std::collections::BTreeSet;

use crate::events::{
    EventKind, FaceSeverity, PatternKind, Severity, SuspiciousPattern, TelemetryEvent,
};

/// Two pastes closer than this (milliseconds) inside the five most recent
/// count as a burst.
const RAPID_PASTE_GAP_MS: i64 = 5000;
/// A paste this large co-occurring with an extension is its own signal.
const LARGE_PASTE_CHARS: u64 = 200;

#[derive(Debug, Clone, Default)]
pub struct PatternScan {
    pub patterns: Vec<SuspiciousPattern>,
    pub bonus: u32,
    pub implicated: BTreeSet<String>,
}

pub fn detect(events: &[TelemetryEvent]) -> PatternScan {
    let mut scan = PatternScan::default();

    let pastes: Vec<&TelemetryEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::ClipboardPaste)
        .collect();
    let devtools = events
        .iter()
        .filter(|e| e.kind == EventKind::DevtoolsDetected)
        .count();
    let extensions = events
        .iter()
        .filter(|e| e.kind == EventKind::ExtensionDetected)
        .count();
    let tab_switches = events
        .iter()
        .filter(|e| e.kind == EventKind::TabSwitch)
        .count();
    let faces: Vec<&TelemetryEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::FaceDetection)
        .collect();

    // Rapid pasting: >3 pastes, and any adjacent pair among the five most
    // recent lands within the burst gap.
    if pastes.len() > 3 {
        let mut recent = pastes.clone();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(5);
        let burst = recent.windows(2).any(|w| {
            (w[0].timestamp - w[1].timestamp)
                .num_milliseconds()
                .abs()
                < RAPID_PASTE_GAP_MS
        });
        if burst {
            fire(
                &mut scan,
                PatternKind::RapidPasting,
                Severity::High,
                "multiple pastes in rapid succession",
                recent.len(),
                &[EventKind::ClipboardPaste],
            );
        }
    }

    // DevTools open anywhere in the window while pasting happened.
    if devtools > 0 && !pastes.is_empty() {
        fire(
            &mut scan,
            PatternKind::DevtoolsWithPaste,
            Severity::Critical,
            "devtools open during clipboard pastes",
            devtools + pastes.len(),
            &[EventKind::DevtoolsDetected, EventKind::ClipboardPaste],
        );
    }

    // Browser extension active alongside a large paste.
    if extensions > 0 {
        let large = pastes
            .iter()
            .filter(|e| e.text_length() > LARGE_PASTE_CHARS)
            .count();
        if large > 0 {
            fire(
                &mut scan,
                PatternKind::ExtensionWithLargePaste,
                Severity::High,
                "extension active during large pastes",
                extensions + large,
                &[EventKind::ExtensionDetected, EventKind::ClipboardPaste],
            );
        }
    }

    if tab_switches > 5 {
        fire(
            &mut scan,
            PatternKind::ExcessiveTabSwitching,
            Severity::Medium,
            "excessive tab switching",
            tab_switches,
            &[EventKind::TabSwitch],
        );
    }

    let critical_faces = faces
        .iter()
        .filter(|e| e.face_severity() == FaceSeverity::Critical)
        .count();
    if critical_faces >= 1 {
        fire(
            &mut scan,
            PatternKind::MultiplePeopleDetected,
            Severity::Critical,
            "multiple people detected in frame",
            critical_faces,
            &[EventKind::FaceDetection],
        );
    }

    let warning_faces = faces
        .iter()
        .filter(|e| e.face_severity() == FaceSeverity::Warning)
        .count();
    if warning_faces > 5 {
        fire(
            &mut scan,
            PatternKind::FrequentDisappearance,
            Severity::High,
            "candidate frequently leaves the frame",
            warning_faces,
            &[EventKind::FaceDetection],
        );
    }

    scan
}

fn fire(
    scan: &mut PatternScan,
    kind: PatternKind,
    severity: Severity,
    description: &str,
    supporting: usize,
    implicated: &[EventKind],
) {
    scan.bonus += severity.bonus();
    for k in implicated {
        scan.implicated.insert(k.to_string());
    }
    scan.patterns.push(SuspiciousPattern {
        kind,
        severity,
        description: description.to_string(),
        supporting_events: supporting,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::HashMap;

    fn ev(kind: EventKind, ms_ago: i64) -> TelemetryEvent {
        TelemetryEvent {
            session_id: "s1".to_string(),
            kind,
            timestamp: Utc::now() - Duration::milliseconds(ms_ago),
            metadata: HashMap::new(),
        }
    }

    fn paste(text_length: u64, ms_ago: i64) -> TelemetryEvent {
        let mut e = ev(EventKind::ClipboardPaste, ms_ago);
        e.metadata.insert("textLength".into(), json!(text_length));
        e
    }

    fn kinds(scan: &PatternScan) -> Vec<PatternKind> {
        scan.patterns.iter().map(|p| p.kind).collect()
    }

    #[test]
    fn rapid_pasting_needs_tight_gaps() {
        // Four pastes 2s apart → burst.
        let evs: Vec<_> = (0..4).map(|i| paste(10, i * 2000)).collect();
        let scan = detect(&evs);
        assert!(kinds(&scan).contains(&PatternKind::RapidPasting));
        assert!(scan.implicated.contains("clipboard_paste"));

        // Four pastes a minute apart → quiet.
        let evs: Vec<_> = (0..4).map(|i| paste(10, i * 60_000)).collect();
        assert!(!kinds(&detect(&evs)).contains(&PatternKind::RapidPasting));
    }

    #[test]
    fn devtools_with_paste_is_critical() {
        let scan = detect(&[ev(EventKind::DevtoolsDetected, 9000), paste(600, 100)]);
        let p = scan
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::DevtoolsWithPaste)
            .unwrap();
        assert_eq!(p.severity, Severity::Critical);
        assert_eq!(scan.bonus, 30);
    }

    #[test]
    fn extension_with_large_paste_requires_size() {
        let scan = detect(&[ev(EventKind::ExtensionDetected, 500), paste(500, 100)]);
        assert!(kinds(&scan).contains(&PatternKind::ExtensionWithLargePaste));

        let scan = detect(&[ev(EventKind::ExtensionDetected, 500), paste(100, 100)]);
        assert!(!kinds(&scan).contains(&PatternKind::ExtensionWithLargePaste));
    }

    #[test]
    fn six_tab_switches_fire_medium_pattern() {
        let evs: Vec<_> = (0..6).map(|i| ev(EventKind::TabSwitch, i * 1000)).collect();
        let scan = detect(&evs);
        let p = scan
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::ExcessiveTabSwitching)
            .unwrap();
        assert_eq!(p.severity, Severity::Medium);
        assert_eq!(scan.bonus, 10);
    }

    #[test]
    fn face_patterns() {
        let mut critical = ev(EventKind::FaceDetection, 100);
        critical.metadata.insert("severity".into(), json!("critical"));
        let scan = detect(&[critical]);
        assert!(kinds(&scan).contains(&PatternKind::MultiplePeopleDetected));

        let warnings: Vec<_> = (0..6)
            .map(|i| {
                let mut e = ev(EventKind::FaceDetection, i * 1000);
                e.metadata.insert("severity".into(), json!("warning"));
                e
            })
            .collect();
        let scan = detect(&warnings);
        assert!(kinds(&scan).contains(&PatternKind::FrequentDisappearance));
    }

    #[test]
    fn bonuses_apply_once_per_pattern_kind() {
        // Two devtools + two pastes: devtools_with_paste still fires once.
        let scan = detect(&[
            ev(EventKind::DevtoolsDetected, 20_000),
            ev(EventKind::DevtoolsDetected, 15_000),
            paste(600, 10_000),
            paste(600, 9_000),
        ]);
        let devtools_firings = scan
            .patterns
            .iter()
            .filter(|p| p.kind == PatternKind::DevtoolsWithPaste)
            .count();
        assert_eq!(devtools_firings, 1);
    }

    #[test]
    fn quiet_window_fires_nothing() {
        let scan = detect(&[ev(EventKind::ClipboardCopy, 100)]);
        assert!(scan.patterns.is_empty());
        assert_eq!(scan.bonus, 0);
        assert!(scan.implicated.is_empty());
    }
}
