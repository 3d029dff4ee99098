//! Errors raised while building a scene.

use thiserror::Error;

/// Errors that can occur while adding objects to a [`Scene`](crate::Scene).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("invalid {kind} handle: {index}")]
    InvalidHandle { kind: &'static str, index: u32 },

    #[error("invalid mesh '{name}': {reason}")]
    InvalidMesh { name: String, reason: String },

    #[error("invalid texture '{name}': {reason}")]
    InvalidTexture { name: String, reason: String },

    #[error("invalid material: {0}")]
    InvalidMaterial(String),

    #[error("too many {kind} (limit {limit})")]
    LimitExceeded { kind: &'static str, limit: usize },
}

pub type SceneResult<T> = Result<T, SceneError>;
