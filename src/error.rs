use crate::instance::InstanceId;
use crate::worker::RequestId;
use std::sync::Arc;
use thiserror::Error;

pub type AnimResult<T> = std::result::Result<T, AnimationError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnimationError {
    #[error("animation '{clip}' not found on model '{model}'")]
    AnimationNotFound { model: Arc<str>, clip: String },

    #[error("clip '{clip}' track {track} is malformed: {reason}")]
    MalformedTrack { clip: Arc<str>, track: usize, reason: String },

    #[error("malformed model: {0}")]
    MalformedModel(String),

    #[error("parent node {0} does not exist")]
    InvalidParent(u32),

    #[error("moving node {node} under node {parent} would create a cycle")]
    CycleDetected { node: u32, parent: u32 },

    #[error("node {0} not found")]
    NodeNotFound(u32),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("model '{0}' is already registered")]
    ModelAlreadyLoaded(String),

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("animation worker unavailable")]
    WorkerUnavailable,

    #[error("model '{0}' is not cached on the animation worker yet")]
    ModelNotReady(String),

    #[error("request {0} cancelled")]
    Cancelled(RequestId),

    #[error("animation worker failed request {request_id}: {message}")]
    WorkerFailure { request_id: RequestId, message: String },
}

impl AnimationError {
    /// Errors that should make the caller fall back to the inline evaluator.
    pub fn is_worker_fallback(&self) -> bool {
        matches!(self, AnimationError::WorkerUnavailable | AnimationError::ModelNotReady(_))
    }
}
