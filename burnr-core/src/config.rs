//! Pipeline configuration.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on the pause between burning and ejecting.
pub const MAX_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Default pause between burning and ejecting, giving the platform time to
/// flush write buffers before the device is detached.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 3_000;

/// Name of the staging directory under the system temp directory.
pub const STAGING_DIR_NAME: &str = "burnr-staging";

/// Settings for one [`crate::BurnController`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory the run exclusively owns for the staged image.
    pub staging_dir: PathBuf,
    /// Wait before ejecting, in milliseconds. Clamped to [`MAX_SETTLE_DELAY`].
    pub settle_delay_ms: u64,
    /// Read the device back after writing and compare checksums.
    pub verify: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join(STAGING_DIR_NAME),
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            verify: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// The effective settle delay, never above [`MAX_SETTLE_DELAY`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms).min(MAX_SETTLE_DELAY)
    }
}
