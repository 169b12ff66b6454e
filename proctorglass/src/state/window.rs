// proctorglass/src/state/window.rs
//
// Sliding-window session state.
// DashMap = sharded concurrent HashMap — safe across tokio tasks with no
// global mutex; per-session windows sit behind their own RwLock.
//
// Design:
//   - Per-session event buffer (VecDeque, auto-expiring)
//   - Trailing analysis window (configurable, default 30 min) read on every
//     rule/pattern pass
//   - Retention beyond the analysis window so deep analysis can look back
//   - Global counters for the stats loop

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::events::TelemetryEvent;

/// Events older than this are dropped by housekeeping regardless of the
/// analysis window length.
pub const RETENTION_SECS: i64 = 24 * 60 * 60;

// ── Per-session window ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SessionWindow {
    pub session_id: String,
    pub events: VecDeque<TelemetryEvent>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_events: u64,
}

impl SessionWindow {
    pub fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            events: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            total_events: 0,
        }
    }

    pub fn ingest(&mut self, event: TelemetryEvent) {
        if event.timestamp > self.last_seen {
            self.last_seen = event.timestamp;
        }
        self.total_events += 1;
        self.events.push_back(event);
    }

    /// Events within the trailing window, oldest first. Feeds can deliver
    /// batches out of order, so the slice is re-sorted by timestamp.
    pub fn events_in(&self, minutes: i64) -> Vec<TelemetryEvent> {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        let mut evs: Vec<TelemetryEvent> = self
            .events
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();
        evs.sort_by_key(|e| e.timestamp);
        evs
    }

    pub fn elapsed_minutes(&self) -> i64 {
        (Utc::now() - self.first_seen).num_minutes().max(0)
    }

    pub fn expire_old(&mut self) {
        let cutoff = Utc::now() - Duration::seconds(RETENTION_SECS);
        while self
            .events
            .front()
            .map(|e| e.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.events.pop_front();
        }
    }
}

// ── Global state store ────────────────────────────────────────────────────────

pub struct SessionStateStore {
    sessions: DashMap<String, Arc<RwLock<SessionWindow>>>,
    window_minutes: i64,
    pub total_events: AtomicU64,
    pub total_sessions: AtomicU64,
}

impl SessionStateStore {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            window_minutes,
            total_events: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
        }
    }

    pub fn window_minutes(&self) -> i64 {
        self.window_minutes
    }

    /// Append a batch for one session. Returns the number of events now in
    /// the trailing analysis window.
    pub fn ingest_batch(&self, session_id: &str, events: Vec<TelemetryEvent>) -> usize {
        let is_new = !self.sessions.contains_key(session_id);
        let window = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SessionWindow::new(session_id, Utc::now()))))
            .clone();

        if is_new {
            self.total_sessions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_events
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        let mut w = window.write();
        for ev in events {
            w.ingest(ev);
        }
        w.events_in(self.window_minutes).len()
    }

    pub fn get_window(&self, session_id: &str) -> Option<Arc<RwLock<SessionWindow>>> {
        self.sessions.get(session_id).map(|w| w.clone())
    }

    /// Snapshot of the trailing window for one session, oldest first.
    pub fn window_events(&self, session_id: &str) -> Vec<TelemetryEvent> {
        self.get_window(session_id)
            .map(|w| w.read().events_in(self.window_minutes))
            .unwrap_or_default()
    }

    pub fn elapsed_minutes(&self, session_id: &str) -> i64 {
        self.get_window(session_id)
            .map(|w| w.read().elapsed_minutes())
            .unwrap_or(0)
    }

    pub fn known(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn n_sessions(&self) -> usize {
        self.sessions.len()
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            for entry in self.sessions.iter() {
                entry.value().write().expire_old();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::collections::HashMap;

    fn ev(session: &str, kind: EventKind, secs_ago: i64) -> TelemetryEvent {
        TelemetryEvent {
            session_id: session.to_string(),
            kind,
            timestamp: Utc::now() - Duration::seconds(secs_ago),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn ingest_counts_window_events() {
        let store = SessionStateStore::new(30);
        let n = store.ingest_batch(
            "s1",
            vec![
                ev("s1", EventKind::TabSwitch, 10),
                ev("s1", EventKind::TabSwitch, 5),
            ],
        );
        assert_eq!(n, 2);
        assert_eq!(store.n_sessions(), 1);
    }

    #[test]
    fn trailing_window_excludes_old_events() {
        let store = SessionStateStore::new(30);
        store.ingest_batch(
            "s1",
            vec![
                ev("s1", EventKind::TabSwitch, 40 * 60), // outside 30 min
                ev("s1", EventKind::TabSwitch, 60),
            ],
        );
        let evs = store.window_events("s1");
        assert_eq!(evs.len(), 1);
    }

    #[test]
    fn window_events_sorted_even_for_out_of_order_batches() {
        let store = SessionStateStore::new(30);
        store.ingest_batch(
            "s1",
            vec![
                ev("s1", EventKind::ClipboardPaste, 5),
                ev("s1", EventKind::DevtoolsDetected, 20),
            ],
        );
        let evs = store.window_events("s1");
        assert_eq!(evs[0].kind, EventKind::DevtoolsDetected);
        assert_eq!(evs[1].kind, EventKind::ClipboardPaste);
    }

    #[test]
    fn unknown_session_yields_empty_window() {
        let store = SessionStateStore::new(30);
        assert!(store.window_events("nope").is_empty());
        assert!(!store.known("nope"));
    }
}
