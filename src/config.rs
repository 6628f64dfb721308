//! Configuration management for camcalib

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::demosaic::{BayerPattern, DemosaicMethod};
use crate::error::CalibError;

/// Module identity and calibration group selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name used in log output
    #[serde(default = "default_name")]
    pub name: String,
    /// Name of the table holding the calibration parameters
    #[serde(default)]
    pub group: Option<String>,
    /// Log per-frame timing
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    "/camCalib".to_string()
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            group: None,
            verbose: false,
        }
    }
}

/// Preferred capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower USB bandwidth)
    #[default]
    Mjpeg,
    /// Prefer uncompressed YUYV
    Yuyv,
    /// Prefer raw single-channel Bayer data straight from the sensor
    Bayer,
}

/// Video source and sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_device: String,
    /// v4l2loopback device receiving corrected frames. Without it, incoming
    /// frames are not processed.
    #[serde(default)]
    pub output_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub format: CaptureFormat,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_device: "/dev/video0".to_string(),
            output_device: None,
            width: 640,
            height: 480,
            fps: 30,
            format: CaptureFormat::default(),
        }
    }
}

/// Control server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Process-level processing settings; initial values of the runtime knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Saturation delta on the 0-255 scale
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    /// Output width, 0 keeps the undistorted size
    #[serde(default)]
    pub outwidth: u32,
    /// Output height, 0 keeps the undistorted size
    #[serde(default)]
    pub outheight: u32,
    /// Sharpening amount, 0 disables
    #[serde(default)]
    pub sharpen: f64,
    /// Colour filter layout of the sensor
    #[serde(default)]
    pub bayer_pattern: BayerPattern,
    #[serde(default)]
    pub demosaic: DemosaicMethod,
}

fn default_saturation() -> f64 {
    1.0
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            saturation: default_saturation(),
            outwidth: 0,
            outheight: 0,
            sharpen: 0.0,
            bayer_pattern: BayerPattern::default(),
            demosaic: DemosaicMethod::default(),
        }
    }
}

/// Main configuration structure
///
/// Any top-level table other than the known sections is kept as a named
/// group; `module.group` selects which one holds the calibration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub module: ModuleConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(flatten)]
    pub groups: BTreeMap<String, toml::Value>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The calibration group selected by `module.group`
    pub fn calibration_group(&self) -> Result<&toml::Table, CalibError> {
        let name = self.module.group.as_deref().ok_or(CalibError::GroupMissing)?;
        match self.groups.get(name) {
            Some(toml::Value::Table(table)) => {
                tracing::info!("Loading configuration from group {}", name);
                Ok(table)
            }
            _ => Err(CalibError::GroupNotFound(name.to_string())),
        }
    }
}
