//! Update rate control for consumer-facing streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Update rate for frame and gaze streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every published value, as fast as the capture service sends it
    #[default]
    Native,

    /// At most this many updates per second, latest value wins
    Max(u32),
}

impl UpdateRate {
    /// Throttle interval, or `None` when no throttling applies.
    ///
    /// `Max(0)` is treated as `Native`.
    pub fn throttle_interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
