//! Compression tuning.

use serde::{Deserialize, Serialize};

/// Thresholds and sizes used by the compression engine.
///
/// Ages are measured from the request's `now` to the end of a remote span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Spans that ended within this window are `recent`.
    pub recent_window_ms: u64,
    /// Spans older than `recent` but within this window are `mid_term`.
    pub mid_term_window_ms: u64,
    /// Threads scoring at or above this are kept whole.
    pub high_relevance: f32,
    /// Threads scoring at or above this keep boundary exchanges and a summary.
    pub medium_relevance: f32,
    /// Messages a historical span may keep beside its summary.
    pub historical_key_messages: usize,
    /// Length of trimmed text.
    pub trimmed_chars: usize,
    /// Length of generated summaries.
    pub summary_chars: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            recent_window_ms: 60 * 60 * 1000,
            mid_term_window_ms: 24 * 60 * 60 * 1000,
            high_relevance: 0.5,
            medium_relevance: 0.2,
            historical_key_messages: 2,
            trimmed_chars: 280,
            summary_chars: 120,
        }
    }
}
