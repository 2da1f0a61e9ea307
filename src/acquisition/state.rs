//! Acquisition run state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one acquisition run.
///
/// ```text
/// Idle -> Preparing -> Acquiring <-> Correcting -> Finalizing -> Done
///                 \         \                                \
///                  \         +-> Aborted                      +-> Failed
///                   +-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcqState {
    /// No run in progress.
    Idle,
    /// Validating the request and positioning focus.
    Preparing,
    /// Scanning points of the current sub-block.
    Acquiring,
    /// Acquiring an anchor frame and re-estimating drift.
    Correcting,
    /// Assembling and persisting the run data.
    Finalizing,
    /// Run completed, full data set persisted.
    Done,
    /// Run stopped at a sub-block boundary; partial data persisted.
    Aborted,
    /// Run failed; whatever was recorded is persisted as partial data.
    Failed,
}

impl AcqState {
    /// Terminal states: the run is over and a new one may start.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcqState::Done | AcqState::Aborted | AcqState::Failed)
    }

    /// Whether a run is currently in progress.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            AcqState::Preparing | AcqState::Acquiring | AcqState::Correcting | AcqState::Finalizing
        )
    }

    /// Whether a new run may be started from this state.
    pub fn can_start(&self) -> bool {
        !self.is_running()
    }
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcqState::Idle => "idle",
            AcqState::Preparing => "preparing",
            AcqState::Acquiring => "acquiring",
            AcqState::Correcting => "correcting",
            AcqState::Finalizing => "finalizing",
            AcqState::Done => "done",
            AcqState::Aborted => "aborted",
            AcqState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}
