//! Shared types for the streamctl pipeline control layer.
//!
//! This crate contains the domain models shared between the controller
//! library, its engines and the command line front end.

pub mod element;
pub mod events;
pub mod state;
pub mod tensor;

// Re-export commonly used types
pub use element::{ElementKind, PropertyValue};
pub use events::{PipelineEvent, PipelineId};
pub use state::PipelineState;
pub use tensor::{
    CapsError, StreamCaps, TensorFormat, TensorInfo, TensorType, TensorsData, TensorsInfo,
    TENSOR_RANK_LIMIT, TENSOR_SIZE_LIMIT,
};
