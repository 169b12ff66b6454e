// proctorglass/src/originality/corpus.rs
//
// Content-addressed corpus of analyzed code bodies — the similarity-search
// index shared across sessions and tasks.
//
// Reads vastly outnumber writes: every analysis scans the corpus for its
// task, one insert lands at the end. DashMap's sharding keeps the scan
// from blocking concurrent inserts for longer than the scan itself.
// Eviction is capacity-triggered and oldest-first; records themselves are
// immutable once written.

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::events::CodeOriginalityRecord;

/// Cosine similarity. Zero-length or dimension-mismatched vectors are a
/// hard mismatch (0.0), not an error.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub struct CorpusIndex {
    records: DashMap<String, CodeOriginalityRecord>,
    // Insertion order, oldest at the front — the eviction queue.
    order: Mutex<VecDeque<String>>,
    capacity: usize,
    evict_batch: usize,
}

impl CorpusIndex {
    pub fn new(capacity: usize, evict_batch: usize) -> Self {
        Self {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            evict_batch: evict_batch.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Exact-duplicate lookup by normalized-content hash.
    pub fn get(&self, content_hash: &str) -> Option<CodeOriginalityRecord> {
        self.records.get(content_hash).map(|r| r.clone())
    }

    /// Insert a freshly analyzed record. Re-inserting an existing hash is a
    /// no-op — records never mutate. Over capacity, the oldest entries go.
    pub fn insert(&self, record: CodeOriginalityRecord) {
        let hash = record.content_hash.clone();
        if self.records.contains_key(&hash) {
            return;
        }
        self.records.insert(hash.clone(), record);
        let mut order = self.order.lock();
        order.push_back(hash);

        if order.len() > self.capacity {
            let mut evicted = 0usize;
            for _ in 0..self.evict_batch {
                match order.pop_front() {
                    Some(old) => {
                        self.records.remove(&old);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            debug!(evicted, remaining = order.len(), "corpus eviction pass");
        }
    }

    /// Highest cosine similarity against entries for the same task.
    /// Returns the score and the matching record's hash.
    pub fn best_match(&self, task_id: &str, embedding: &[f32]) -> Option<(f32, String)> {
        let mut best: Option<(f32, String)> = None;
        for entry in self.records.iter() {
            if entry.task_id != task_id {
                continue;
            }
            let sim = cosine(embedding, &entry.embedding);
            if best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                best = Some((sim, entry.content_hash.clone()));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(hash: &str, task: &str, embedding: Vec<f32>) -> CodeOriginalityRecord {
        CodeOriginalityRecord {
            content_hash: hash.to_string(),
            task_id: task.to_string(),
            originality_score: 80,
            suspicious_patterns: vec![],
            explanation: String::new(),
            method: crate::events::AnalysisMethod::Llm,
            embedding,
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn cosine_of_self_is_one() {
        let v = vec![0.3, -0.5, 0.8, 0.1];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_and_mismatch_are_zero() {
        let v = vec![0.3, 0.5];
        assert_eq!(cosine(&v, &[0.0, 0.0]), 0.0);
        assert_eq!(cosine(&v, &[]), 0.0);
        assert_eq!(cosine(&v, &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn best_match_is_scoped_to_task() {
        let corpus = CorpusIndex::new(100, 10);
        corpus.insert(record("h1", "task-a", vec![1.0, 0.0]));
        corpus.insert(record("h2", "task-b", vec![0.0, 1.0]));

        let (sim, hash) = corpus.best_match("task-a", &[1.0, 0.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
        assert_eq!(hash, "h1");

        assert!(corpus.best_match("task-c", &[1.0, 0.0]).is_none());
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let corpus = CorpusIndex::new(3, 2);
        for i in 0..4 {
            corpus.insert(record(&format!("h{i}"), "t", vec![1.0]));
        }
        // Fourth insert tips capacity: h0 and h1 evicted.
        assert_eq!(corpus.len(), 2);
        assert!(corpus.get("h0").is_none());
        assert!(corpus.get("h1").is_none());
        assert!(corpus.get("h2").is_some());
        assert!(corpus.get("h3").is_some());
    }

    #[test]
    fn reinsert_same_hash_is_noop() {
        let corpus = CorpusIndex::new(10, 1);
        corpus.insert(record("h1", "t", vec![1.0]));
        corpus.insert(record("h1", "t", vec![0.5]));
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get("h1").unwrap().embedding, vec![1.0]);
    }
}
