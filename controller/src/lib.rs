//! streamctl control layer library.
//!
//! Handle-based control of running tensor stream pipelines: construct a
//! [`Pipeline`] from a graph description, look up its elements, push and
//! receive data, toggle valves and switches, and follow state changes.
//!
//! ```no_run
//! use streamctl::engine::{create_engine, EngineKind};
//! use streamctl::{Pipeline, PipelineState, TensorsData};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = create_engine(EngineKind::Loopback)?;
//! let pipeline = Pipeline::construct(
//!     &engine,
//!     "appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! appsink name=sink",
//! )?;
//!
//! let sink = pipeline.get_element("sink")?;
//! let _client = sink.attach_sink_callback(|data| {
//!     println!("received {} bytes", data.total_size());
//!     Ok(())
//! })?;
//!
//! pipeline.start()?;
//! pipeline.wait_state(PipelineState::Playing, Duration::from_secs(1))?;
//! pipeline.get_element("src")?.push(TensorsData::single(vec![1, 2, 3, 4]))?;
//! pipeline.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod custom;
pub mod element;
pub mod engine;
pub mod error;
pub mod pipeline;

pub use custom::{register_custom_condition, register_custom_filter};
pub use element::{Capability, ClientHandle, ElementHandle, SourceCallbacks};
pub use engine::{EngineKind, PushMode};
pub use error::{PipelineError, Result};
pub use pipeline::{
    check_element_availability, GraphLease, Pipeline, PipelineBuilder, PipelineOptions,
};
pub use streamctl_types::{
    ElementKind, PipelineEvent, PipelineId, PipelineState, PropertyValue, StreamCaps, TensorInfo,
    TensorType, TensorsData, TensorsInfo,
};
