//! Loom configuration, loaded from RON.
//!
//! Every field has a default, so an empty file (`()`) is a valid config.
//!
//! ```ron
//! (
//!     db_path: Some("/var/lib/loom"),
//!     notify_capacity: 4096,
//!     compression: (recent_window_ms: 1800000),
//!     uplink: (history_timeout_ms: 5000),
//! )
//! ```

use std::path::{Path, PathBuf};

use loom_compress::CompressionConfig;
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// Environment variable overriding `db_path`.
pub const ENV_DB: &str = "LOOM_DB";
/// Environment variable overriding `uplink.history_timeout_ms`.
pub const ENV_HISTORY_TIMEOUT: &str = "LOOM_HISTORY_TIMEOUT_MS";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// Directory holding one sqlite file per space. `None` keeps everything
    /// in memory.
    pub db_path: Option<PathBuf>,
    /// Per-subscriber queue depth that triggers a slow-consumer warning.
    /// Delivery never drops; this is only a tripwire.
    pub notify_capacity: usize,
    /// Ancestry walks longer than this are treated as cycles.
    pub max_ancestor_depth: usize,
    pub compression: CompressionConfig,
    pub uplink: UplinkConfig,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            notify_capacity: 1024,
            max_ancestor_depth: 1_000_000,
            compression: CompressionConfig::default(),
            uplink: UplinkConfig::default(),
        }
    }
}

/// Uplink-side tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Deadline for one history page request.
    pub history_timeout_ms: u64,
    /// Events requested per history page.
    pub history_page_size: u32,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            history_timeout_ms: 10_000,
            history_page_size: 256,
        }
    }
}

impl LoomConfig {
    pub fn from_ron_str(s: &str) -> Result<Self> {
        ron::from_str(s).map_err(|e| LoomError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LoomError::Config(format!("{}: {e}", path.display())))?;
        Self::from_ron_str(&text)
    }

    /// Apply `LOOM_DB` and `LOOM_HISTORY_TIMEOUT_MS` on top of the loaded values.
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(db) = get(ENV_DB).filter(|v| !v.is_empty()) {
            self.db_path = Some(PathBuf::from(db));
        }
        if let Some(raw) = get(ENV_HISTORY_TIMEOUT) {
            match raw.parse() {
                Ok(ms) => self.uplink.history_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "ignoring unparseable {ENV_HISTORY_TIMEOUT}"),
            }
        }
    }
}
