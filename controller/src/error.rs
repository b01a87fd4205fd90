//! Errors surfaced to callers of the control layer.

use crate::engine::EngineError;
use streamctl_types::{CapsError, ElementKind, PipelineState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Tensor metadata mismatch on {element}: {reason}")]
    TypeMismatch { element: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource unavailable: {0}")]
    Resource(String),

    #[error("Pipeline is in error state: {0}")]
    ErrorState(String),

    #[error("Try again: {0}")]
    TryAgain(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Failed to construct pipeline: {0}")]
    Construction(String),

    #[error("Element factory not available on this host: {0}")]
    PluginUnavailable(String),
}

impl PipelineError {
    /// Stable identifier of the error class, for logs and scripting.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidParameter(_) => "invalid-parameter",
            PipelineError::NotFound(_) => "not-found",
            PipelineError::NotSupported(_) => "not-supported",
            PipelineError::TypeMismatch { .. } => "type-mismatch",
            PipelineError::InvalidState(_) => "invalid-state",
            PipelineError::Resource(_) => "resource",
            PipelineError::ErrorState(_) => "error-state",
            PipelineError::TryAgain(_) => "try-again",
            PipelineError::OutOfMemory(_) => "out-of-memory",
            PipelineError::Construction(_) => "construction",
            PipelineError::PluginUnavailable(_) => "plugin-unavailable",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TryAgain(_))
    }

    pub(crate) fn invalid_state(state: PipelineState, reason: impl Into<String>) -> Self {
        PipelineError::InvalidState(format!("{} (pipeline is {})", reason.into(), state))
    }

    pub(crate) fn unsupported_kind(element: &str, kind: ElementKind, operation: &str) -> Self {
        PipelineError::NotSupported(format!(
            "{} is not available on '{}' ({} element)",
            operation, element, kind
        ))
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Parse(msg) => PipelineError::Construction(msg),
            EngineError::NoSuchElement(factory) => PipelineError::PluginUnavailable(factory),
            EngineError::Link(msg) => PipelineError::Construction(msg),
            EngineError::StateChange(msg) => PipelineError::ErrorState(msg),
            EngineError::QueueFull(node) => {
                PipelineError::TryAgain(format!("input queue of '{}' is full", node))
            }
            EngineError::Flow { node, reason } => {
                PipelineError::ErrorState(format!("'{}' refused data: {}", node, reason))
            }
            EngineError::UnknownProperty { node, property } => PipelineError::InvalidParameter(
                format!("'{}' has no property '{}'", node, property),
            ),
            EngineError::InvalidProperty {
                node,
                property,
                reason,
            } => PipelineError::InvalidParameter(format!(
                "invalid value for {}.{}: {}",
                node, property, reason
            )),
            EngineError::UnknownPad { node, pad } => {
                PipelineError::InvalidParameter(format!("'{}' has no pad '{}'", node, pad))
            }
            EngineError::Unsupported(msg) => PipelineError::NotSupported(msg),
            EngineError::Caps(err) => PipelineError::Construction(err.to_string()),
            EngineError::Shutdown => {
                PipelineError::InvalidState("the engine graph is shutting down".to_string())
            }
        }
    }
}

impl From<CapsError> for PipelineError {
    fn from(err: CapsError) -> Self {
        PipelineError::InvalidParameter(err.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
