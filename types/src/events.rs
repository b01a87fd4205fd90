//! Notifications emitted by a running pipeline.

use crate::state::PipelineState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pipeline instance.
pub type PipelineId = Uuid;

/// Event types delivered to the state-change subscriber and broadcast to
/// every event stream of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PipelineEvent {
    /// The pipeline completed a transition
    StateChanged {
        pipeline_id: PipelineId,
        old: PipelineState,
        new: PipelineState,
        /// Final target when this was an intermediate step
        pending: Option<PipelineState>,
    },
    /// Every sink of the pipeline reached end of stream
    Eos { pipeline_id: PipelineId },
    /// The engine reported an unrecoverable fault
    Error {
        pipeline_id: PipelineId,
        error: String,
        source: Option<String>,
    },
    /// The engine reported a recoverable problem
    Warning {
        pipeline_id: PipelineId,
        warning: String,
        source: Option<String>,
    },
}

impl PipelineEvent {
    /// Get the pipeline this event belongs to.
    pub fn pipeline_id(&self) -> PipelineId {
        match self {
            PipelineEvent::StateChanged { pipeline_id, .. }
            | PipelineEvent::Eos { pipeline_id }
            | PipelineEvent::Error { pipeline_id, .. }
            | PipelineEvent::Warning { pipeline_id, .. } => *pipeline_id,
        }
    }

    /// Whether the pipeline will not produce further data after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::Eos { .. } | PipelineEvent::Error { .. })
    }

    /// Get a human-readable description of the event.
    pub fn description(&self) -> String {
        match self {
            PipelineEvent::StateChanged {
                pipeline_id,
                old,
                new,
                ..
            } => format!("Pipeline {} state changed: {} -> {}", pipeline_id, old, new),
            PipelineEvent::Eos { pipeline_id } => {
                format!("Pipeline {} reached end of stream", pipeline_id)
            }
            PipelineEvent::Error {
                pipeline_id,
                error,
                source,
            } => {
                if let Some(src) = source {
                    format!("Pipeline error in {} from {}: {}", pipeline_id, src, error)
                } else {
                    format!("Pipeline error in {}: {}", pipeline_id, error)
                }
            }
            PipelineEvent::Warning {
                pipeline_id,
                warning,
                source,
            } => {
                if let Some(src) = source {
                    format!(
                        "Pipeline warning in {} from {}: {}",
                        pipeline_id, src, warning
                    )
                } else {
                    format!("Pipeline warning in {}: {}", pipeline_id, warning)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let pipeline_id = Uuid::new_v4();
        let event = PipelineEvent::StateChanged {
            pipeline_id,
            old: PipelineState::Ready,
            new: PipelineState::Paused,
            pending: Some(PipelineState::Playing),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StateChanged");
        assert_eq!(json["data"]["new"], "Paused");

        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_description_mentions_source() {
        let event = PipelineEvent::Error {
            pipeline_id: Uuid::nil(),
            error: "not negotiated".to_string(),
            source: Some("filter".to_string()),
        };
        assert!(event.description().contains("from filter"));
        assert!(event.is_terminal());
    }
}
