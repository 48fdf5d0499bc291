use crate::vr::Extent;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_IMAGE_WAIT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_TRANSITION_POLL_BUDGET: u32 = 512;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSpaceMode {
    /// Seated (LOCAL) space.
    Seated,
    /// Room-scale (STAGE) space.
    #[default]
    Standing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrConfig {
    pub application_name: String,
    pub reference_space: ReferenceSpaceMode,
    /// Per-eye swapchain resolution; the runtime's recommendation when absent.
    pub resolution: Option<Extent>,
    pub downscale_factor: u32,
    /// Rotate runtime poses 180 degrees about X for scenes with +Y down and +Z forward.
    pub axis_correction: bool,
    /// Offset eye poses by the host's desktop camera position.
    pub recenter_on_host_camera: bool,
    pub image_wait_timeout_ms: u64,
    pub transition_poll_budget: u32,
    pub preferred_swapchain_format: Option<i64>,
}

impl Default for XrConfig {
    fn default() -> Self {
        Self {
            application_name: "HMD Stereo".to_string(),
            reference_space: ReferenceSpaceMode::Standing,
            resolution: None,
            downscale_factor: 1,
            axis_correction: true,
            recenter_on_host_camera: false,
            image_wait_timeout_ms: DEFAULT_IMAGE_WAIT_TIMEOUT_MS,
            transition_poll_budget: DEFAULT_TRANSITION_POLL_BUDGET,
            preferred_swapchain_format: None,
        }
    }
}

impl XrConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: XrConfig = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downscale_factor == 0 {
            return Err(ConfigError::Invalid("downscale_factor must be at least 1"));
        }
        if self.image_wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid("image_wait_timeout_ms must be positive"));
        }
        if self.transition_poll_budget == 0 {
            return Err(ConfigError::Invalid("transition_poll_budget must be positive"));
        }
        if let Some(extent) = self.resolution {
            if extent.width == 0 || extent.height == 0 {
                return Err(ConfigError::Invalid("resolution must be non-zero"));
            }
        }
        Ok(())
    }

    pub fn image_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.image_wait_timeout_ms)
    }
}
