//! Compression hints attached to renderable elements.
//!
//! Hints are advisory: they steer the compression engine's choices but never
//! override its invariants. `preserve_verbatim` is the one exception the
//! engine treats as binding.

use serde::{Deserialize, Serialize};

/// Advisory compression metadata for one element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionHint {
    /// Higher survives longer. `None` falls back to recency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    /// IDs of elements this one should travel with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_elements: Vec<String>,
    /// Text to use instead of a generated summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_summary: Option<String>,
    /// Exempt from every compression pass.
    #[serde(default)]
    pub preserve_verbatim: bool,
}

impl CompressionHint {
    pub fn verbatim() -> Self {
        Self { preserve_verbatim: true, ..Self::default() }
    }

    pub fn with_importance(importance: f32) -> Self {
        Self { importance: Some(importance), ..Self::default() }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.suggested_summary = Some(summary.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        assert!(CompressionHint::verbatim().preserve_verbatim);
        let hint = CompressionHint::with_importance(0.8).summary("short");
        assert_eq!(hint.importance, Some(0.8));
        assert_eq!(hint.suggested_summary.as_deref(), Some("short"));
        assert!(!hint.preserve_verbatim);
    }

    #[test]
    fn test_json_defaults() {
        let hint: CompressionHint = serde_json::from_str("{}").unwrap();
        assert_eq!(hint, CompressionHint::default());
    }
}
