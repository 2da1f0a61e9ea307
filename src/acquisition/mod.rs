//! Drift-corrected acquisition.
//!
//! The acquisition loop drives the scanner over a requested region,
//! reading the detector at every point and periodically re-estimating the
//! specimen drift from anchor frames. Estimated drift is applied as a
//! correction to all subsequent scan targets, never retroactively to
//! already-recorded samples.
//!
//! The loop's lifecycle is a state machine ([`AcqState`]) exposed through
//! a regular attribute, so local and remote clients observe progress the
//! same way they observe any hardware value.

mod data;
mod runner;
mod state;

pub use data::{AcquiredData, AcquisitionRequest, DataSink, MemorySink};
pub use runner::{AbortHandle, AcquisitionLoop, ScanInterface};
pub use state::AcqState;
