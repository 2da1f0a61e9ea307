//! Acquisition request and result structures.

use crate::error::{ScopeError, ScopeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Parameters of one drift-corrected scan.
///
/// The region is a rectangle `(min, max)` in scanner coordinates (meters,
/// relative to the field center); the scan visits `resolution.0 x
/// resolution.1` pixel-center positions inside it, row by row.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    /// `((min_x, min_y), (max_x, max_y))` corners of the scanned region.
    pub region: ((f64, f64), (f64, f64)),
    /// Points per row, number of rows.
    pub resolution: (usize, usize),
    /// Per-point dwell time in seconds, applied to the scanner.
    pub dwell_time: f64,
    /// Points between drift checks.
    pub correction_period: usize,
    /// Abort is honored only at multiples of this many points.
    pub sub_block: usize,
    /// Consecutive inconclusive drift estimates tolerated before the run
    /// fails.
    pub max_inconclusive: u32,
    /// Optional focus position applied during preparation.
    pub focus: Option<f64>,
    /// Bound on waiting for a detector reading at one point.
    pub point_timeout: Duration,
    /// Bound on acquiring one anchor frame.
    pub anchor_timeout: Duration,
}

impl AcquisitionRequest {
    pub fn new(region: ((f64, f64), (f64, f64)), resolution: (usize, usize), dwell_time: f64) -> Self {
        Self {
            region,
            resolution,
            dwell_time,
            correction_period: 64,
            sub_block: 16,
            max_inconclusive: 3,
            focus: None,
            point_timeout: Duration::from_secs(5),
            anchor_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_correction_period(mut self, points: usize) -> Self {
        self.correction_period = points;
        self
    }

    pub fn with_sub_block(mut self, points: usize) -> Self {
        self.sub_block = points;
        self
    }

    pub fn with_max_inconclusive(mut self, count: u32) -> Self {
        self.max_inconclusive = count;
        self
    }

    pub fn with_focus(mut self, position: f64) -> Self {
        self.focus = Some(position);
        self
    }

    pub fn with_point_timeout(mut self, timeout: Duration) -> Self {
        self.point_timeout = timeout;
        self
    }

    pub fn with_anchor_timeout(mut self, timeout: Duration) -> Self {
        self.anchor_timeout = timeout;
        self
    }

    /// Total number of points the scan visits.
    pub fn total_points(&self) -> usize {
        self.resolution.0 * self.resolution.1
    }

    /// Structural checks that need no hardware knowledge. Range checks
    /// against the scanner attributes happen in the loop's preparing step.
    pub fn check(&self) -> ScopeResult<()> {
        let ((min_x, min_y), (max_x, max_y)) = self.region;
        if min_x >= max_x || min_y >= max_y {
            return Err(ScopeError::InvalidRequest(format!(
                "degenerate region ({min_x:e}, {min_y:e}) .. ({max_x:e}, {max_y:e})"
            )));
        }
        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err(ScopeError::InvalidRequest("zero resolution".into()));
        }
        if self.correction_period == 0 {
            return Err(ScopeError::InvalidRequest(
                "correction_period must be at least 1 point".into(),
            ));
        }
        if self.sub_block == 0 {
            return Err(ScopeError::InvalidRequest(
                "sub_block must be at least 1 point".into(),
            ));
        }
        Ok(())
    }
}

/// The assembled result of one run, handed to a [`DataSink`].
///
/// All per-point vectors run in scan order and have equal length; for a
/// complete run that length equals `total_requested`. `coordinates` holds
/// the positions actually written to the scanner (drift correction
/// included), `offsets` the correction that was in force at each point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquiredData {
    pub run_id: Uuid,
    pub started: DateTime<Utc>,
    pub coordinates: Vec<(f64, f64)>,
    pub samples: Vec<f64>,
    pub offsets: Vec<(f64, f64)>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub total_requested: usize,
    pub complete: bool,
    pub final_offset: (f64, f64),
}

impl AcquiredData {
    /// Internal consistency check, run before the data leaves the loop.
    pub fn validate(&self) -> ScopeResult<()> {
        let n = self.samples.len();
        if self.coordinates.len() != n || self.offsets.len() != n || self.timestamps.len() != n {
            return Err(ScopeError::Validation(format!(
                "run {}: per-point vectors disagree ({} coordinates, {} samples, {} offsets, {} timestamps)",
                self.run_id,
                self.coordinates.len(),
                n,
                self.offsets.len(),
                self.timestamps.len()
            )));
        }
        if n > self.total_requested {
            return Err(ScopeError::Validation(format!(
                "run {}: {} samples recorded for {} requested points",
                self.run_id, n, self.total_requested
            )));
        }
        if self.complete && n != self.total_requested {
            return Err(ScopeError::Validation(format!(
                "run {}: marked complete with {} of {} points",
                self.run_id, n, self.total_requested
            )));
        }
        Ok(())
    }
}

/// Receives finished (or partial) run data. The sink owns the persistent
/// format; the loop only guarantees the data passed in is consistent.
pub trait DataSink: Send + Sync {
    fn store(&self, data: &AcquiredData) -> ScopeResult<()>;
}

/// In-memory sink, used by the test suite and as a default.
#[derive(Default)]
pub struct MemorySink {
    runs: Mutex<Vec<AcquiredData>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything stored so far.
    pub fn runs(&self) -> Vec<AcquiredData> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DataSink for MemorySink {
    fn store(&self, data: &AcquiredData) -> ScopeResult<()> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(data.clone());
        Ok(())
    }
}
