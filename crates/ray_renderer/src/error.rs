//! Errors raised while configuring a renderer or exporting its buffers.
//!
//! Render calls themselves never fail: a mismatched or unfinalized scene is
//! logged and skipped, and an empty scratch pool just allocates.

use thiserror::Error;

/// Construction and configuration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("invalid renderer settings: {0}")]
    InvalidSettings(String),

    #[error("no device matching '{0}'")]
    DeviceNotFound(String),

    #[error("invalid denoiser weights: {0}")]
    InvalidWeights(String),

    #[error("failed to write image: {0}")]
    ImageWrite(String),
}

pub type RenderResult<T> = Result<T, RenderError>;
