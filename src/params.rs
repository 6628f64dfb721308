//! Pinhole calibration parameters
//!
//! Parameters are read from a single configuration group, for example:
//!
//! ```toml
//! [CAMERA_CALIBRATION]
//! projection = "pinhole"
//! w  = 320
//! h  = 240
//! fx = 325.42
//! fy = 332.31
//! cx = 177.29
//! cy = 127.3
//! k1 = -0.4153
//! k2 = 0.2467
//! p1 = -0.00195
//! p2 = 0.00185
//! drawCenterCross = 0
//! ```
//!
//! Every key is required. A missing key aborts the load even though a
//! sensible default exists for most of them.

use toml::{Table, Value};
use tracing::{error, info};

use crate::error::CalibError;
use crate::undistort::{Distortion, FrameSize, Intrinsics};

/// Keys that must be present, in the order they are checked
pub const REQUIRED_KEYS: [&str; 11] = [
    "drawCenterCross", "w", "h", "fx", "fy", "cx", "cy", "k1", "k2", "p1", "p2",
];

/// Calibration data for one camera setup
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeParams {
    /// Resolution the parameters were computed for
    pub calib_size: FrameSize,
    pub intrinsics: Intrinsics,
    pub distortion: Distortion,
    /// Draw a cross at the principal point of every output frame
    pub draw_center_cross: bool,
}

impl PinholeParams {
    /// Load and validate parameters from a configuration group.
    /// The failing key is logged before the error is returned.
    pub fn from_group(group: &Table) -> Result<Self, CalibError> {
        Self::read(group).map_err(|e| {
            error!("{}", e);
            e
        })
    }

    fn read(group: &Table) -> Result<Self, CalibError> {
        for key in REQUIRED_KEYS {
            if !group.contains_key(key) {
                return Err(CalibError::MissingKey(key));
            }
        }

        let params = Self {
            calib_size: FrameSize::new(dimension(group, "w")?, dimension(group, "h")?),
            intrinsics: Intrinsics {
                fx: number(group, "fx")?,
                fy: number(group, "fy")?,
                cx: number(group, "cx")?,
                cy: number(group, "cy")?,
            },
            distortion: Distortion {
                k1: number(group, "k1")?,
                k2: number(group, "k2")?,
                p1: number(group, "p1")?,
                p2: number(group, "p2")?,
            },
            draw_center_cross: flag(group, "drawCenterCross")?,
        };

        info!("fx={}", params.intrinsics.fx);
        info!("fy={}", params.intrinsics.fy);
        info!("cx={}", params.intrinsics.cx);
        info!("cy={}", params.intrinsics.cy);

        Ok(params)
    }
}

fn number(group: &Table, key: &'static str) -> Result<f64, CalibError> {
    match group.get(key) {
        Some(Value::Float(v)) if v.is_finite() => Ok(*v),
        Some(Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(CalibError::InvalidValue {
            key,
            reason: format!("expected a finite number, got {}", other),
        }),
        None => Err(CalibError::MissingKey(key)),
    }
}

fn dimension(group: &Table, key: &'static str) -> Result<u32, CalibError> {
    match group.get(key) {
        Some(Value::Integer(v)) if *v > 0 && *v <= u32::MAX as i64 => Ok(*v as u32),
        Some(other) => Err(CalibError::InvalidValue {
            key,
            reason: format!("expected a positive integer, got {}", other),
        }),
        None => Err(CalibError::MissingKey(key)),
    }
}

fn flag(group: &Table, key: &'static str) -> Result<bool, CalibError> {
    match group.get(key) {
        Some(Value::Integer(v)) => Ok(*v != 0),
        Some(Value::Boolean(b)) => Ok(*b),
        Some(other) => Err(CalibError::InvalidValue {
            key,
            reason: format!("expected 0, 1 or a boolean, got {}", other),
        }),
        None => Err(CalibError::MissingKey(key)),
    }
}
