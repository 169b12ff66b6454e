// proctorglass/src/error.rs
//
// Core error taxonomy. Everything oracle-shaped is non-fatal by policy:
// the ingestion path absorbs these into deterministic fallbacks and the
// session keeps its rule-based score.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Network/auth/non-2xx/timeout talking to the judgment service.
    /// Callers fall back to offline heuristics; the client never retries.
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The oracle answered, but none of the parse strategies could extract
    /// the expected structured verdict. Callers substitute the neutral one.
    #[error("malformed oracle response: {0}")]
    MalformedOracleResponse(String),

    /// Unknown session id — distinct from a known session with no events,
    /// which reads back as an explicit zero score.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Persistence layer failure (file I/O, serialization).
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
