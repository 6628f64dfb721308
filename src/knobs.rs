//! Runtime-adjustable processing settings
//!
//! The control surface may change these at any time while frames are being
//! processed. Each frame takes a single snapshot at its start, so a frame
//! never observes a half-applied update.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ProcessingConfig;
use crate::error::CalibError;
use crate::undistort::FrameSize;

/// Largest accepted output width or height
pub const MAX_OUTPUT_DIMENSION: u32 = 8192;

/// One consistent set of processing settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Knobs {
    /// Added to the 8-bit HSV saturation channel (0 = skip the HSV pass)
    pub saturation: f64,
    /// Output width (0 = keep the undistorted size)
    pub output_width: u32,
    /// Output height (0 = keep the undistorted size)
    pub output_height: u32,
    /// Unsharp mask amount (0 = no sharpening)
    pub sharpen: f64,
}

impl Knobs {
    /// Requested output size, if both dimensions are set
    pub fn output_size(&self) -> Option<FrameSize> {
        if self.output_width != 0 && self.output_height != 0 {
            Some(FrameSize::new(self.output_width, self.output_height))
        } else {
            None
        }
    }

    /// Reject settings no frame can be produced with
    pub fn validate(&self) -> Result<(), CalibError> {
        check_dimension("outwidth", self.output_width)?;
        check_dimension("outheight", self.output_height)?;
        check_finite("saturation", self.saturation)?;
        check_finite("sharpen", self.sharpen)
    }
}

fn check_dimension(key: &'static str, value: u32) -> Result<(), CalibError> {
    if value > MAX_OUTPUT_DIMENSION {
        return Err(CalibError::InvalidValue {
            key,
            reason: format!("{} exceeds the maximum of {}", value, MAX_OUTPUT_DIMENSION),
        });
    }
    Ok(())
}

fn check_finite(key: &'static str, value: f64) -> Result<(), CalibError> {
    if !value.is_finite() {
        return Err(CalibError::InvalidValue { key, reason: format!("{} is not finite", value) });
    }
    Ok(())
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            saturation: 1.0,
            output_width: 0,
            output_height: 0,
            sharpen: 0.0,
        }
    }
}

impl From<&ProcessingConfig> for Knobs {
    fn from(cfg: &ProcessingConfig) -> Self {
        Self {
            saturation: cfg.saturation,
            output_width: cfg.outwidth,
            output_height: cfg.outheight,
            sharpen: cfg.sharpen,
        }
    }
}

/// Partial update as accepted from the control surface
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct KnobsUpdate {
    pub saturation: Option<f64>,
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    pub sharpen: Option<f64>,
}

impl KnobsUpdate {
    pub fn validate(&self) -> Result<(), CalibError> {
        if let Some(v) = self.output_width {
            check_dimension("output_width", v)?;
        }
        if let Some(v) = self.output_height {
            check_dimension("output_height", v)?;
        }
        if let Some(v) = self.saturation {
            check_finite("saturation", v)?;
        }
        if let Some(v) = self.sharpen {
            check_finite("sharpen", v)?;
        }
        Ok(())
    }
}

/// Shared, lock-free holder for the current [`Knobs`]
pub struct RuntimeKnobs {
    current: ArcSwap<Knobs>,
}

impl RuntimeKnobs {
    pub fn new(initial: Knobs) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Settings to use for the frame about to be processed
    pub fn snapshot(&self) -> Knobs {
        **self.current.load()
    }

    pub fn set_saturation(&self, value: f64) {
        self.update(|k| k.saturation = value);
    }

    pub fn set_sharpen(&self, value: f64) {
        self.update(|k| k.sharpen = value);
    }

    /// Apply the fields present in `update` in one step. An out-of-range
    /// field rejects the whole update.
    pub fn apply(&self, update: &KnobsUpdate) -> Result<Knobs, CalibError> {
        update.validate()?;
        Ok(self.update(|k| {
            if let Some(v) = update.saturation {
                k.saturation = v;
            }
            if let Some(v) = update.output_width {
                k.output_width = v;
            }
            if let Some(v) = update.output_height {
                k.output_height = v;
            }
            if let Some(v) = update.sharpen {
                k.sharpen = v;
            }
        }))
    }

    fn update<F: Fn(&mut Knobs)>(&self, f: F) -> Knobs {
        let previous = self.current.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            Arc::new(next)
        });
        let mut next = *previous;
        f(&mut next);
        next
    }
}

impl Default for RuntimeKnobs {
    fn default() -> Self {
        Self::new(Knobs::default())
    }
}
