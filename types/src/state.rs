//! Pipeline lifecycle state definitions.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pipeline.
///
/// These states correspond to the GStreamer GST_STATE enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PipelineState {
    /// No state has been set (initial state)
    #[default]
    Null,
    /// The graph is constructed and resources are allocated
    Ready,
    /// The graph is prerolled but the clock is not running
    Paused,
    /// Data is flowing
    Playing,
}

impl PipelineState {
    /// Position in the `NULL -> READY -> PAUSED -> PLAYING` ladder.
    pub fn rank(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Ready => 1,
            Self::Paused => 2,
            Self::Playing => 3,
        }
    }

    /// The adjacent state one step closer to `target`, or `None` when
    /// `self` already is `target`.
    pub fn step_towards(self, target: PipelineState) -> Option<PipelineState> {
        use std::cmp::Ordering;

        let next = match self.rank().cmp(&target.rank()) {
            Ordering::Equal => return None,
            Ordering::Less => self.rank() + 1,
            Ordering::Greater => self.rank() - 1,
        };
        Some(match next {
            0 => Self::Null,
            1 => Self::Ready,
            2 => Self::Paused,
            _ => Self::Playing,
        })
    }

    /// Whether data may be pushed into sources in this state.
    pub fn accepts_data(self) -> bool {
        matches!(self, Self::Paused | Self::Playing)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ready => write!(f, "READY"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Playing => write!(f, "PLAYING"),
        }
    }
}
