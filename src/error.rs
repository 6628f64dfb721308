//! Error types for parameter loading and frame correction

use thiserror::Error;

use crate::undistort::FrameSize;

#[derive(Debug, Error)]
pub enum CalibError {
    /// A required calibration key is absent from the configuration group
    #[error("There seem to be an error loading parameters \"{0}\", stopping module")]
    MissingKey(&'static str),

    #[error("Invalid value for \"{key}\": {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// No `group` option was given in the module section
    #[error(
        "There seem to be an error loading parameters (group section missing), stopping module"
    )]
    GroupMissing,

    #[error("Group {0} not found")]
    GroupNotFound(String),

    /// The camera matrix could not be inverted while building the undistortion map
    #[error("Intrinsic matrix is singular (fx={fx}, fy={fy})")]
    SingularIntrinsics { fx: f64, fy: f64 },

    #[error("Frame size {frame} does not match undistortion map size {map}")]
    SizeMismatch { frame: FrameSize, map: FrameSize },

    #[error("Output size {0} is too large")]
    OutputTooLarge(FrameSize),

    #[error("Received an empty frame")]
    EmptyFrame,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl CalibError {
    /// Whether the error makes the loaded configuration unusable,
    /// as opposed to spoiling a single frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CalibError::MissingKey(_)
                | CalibError::InvalidValue { .. }
                | CalibError::GroupMissing
                | CalibError::GroupNotFound(_)
                | CalibError::SingularIntrinsics { .. }
        )
    }
}
