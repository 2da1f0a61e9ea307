//! The drift-corrected scan driver.

use crate::acquisition::data::{AcquiredData, AcquisitionRequest, DataSink};
use crate::acquisition::state::AcqState;
use crate::attribute::Attribute;
use crate::component::PointSource;
use crate::drift::{AnchorSource, DriftEstimate, DriftEstimator, DriftSample};
use crate::error::{ScopeError, ScopeResult};
use crate::tree::ComponentTree;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The typed attribute handles the loop drives, resolved once from the
/// component tree by role.
pub struct ScanInterface {
    pub position: Arc<Attribute<(f64, f64)>>,
    pub dwell_time: Arc<Attribute<f64>>,
    pub intensity: Arc<Attribute<f64>>,
    pub focus: Option<Arc<Attribute<f64>>>,
    pub anchor: Arc<dyn AnchorSource>,
    pub point: Arc<dyn PointSource>,
}

impl ScanInterface {
    /// Resolve the scanner, detector and (optional) focus roles.
    pub fn from_tree(tree: &ComponentTree) -> ScopeResult<Self> {
        let scanner = tree
            .find_by_role("scanner")
            .ok_or_else(|| ScopeError::NotFound("no scanner in the component tree".into()))?;
        let detector = tree
            .find_by_role("detector")
            .ok_or_else(|| ScopeError::NotFound("no detector in the component tree".into()))?;

        let position = scanner
            .attributes()
            .get_typed::<(f64, f64)>("position")
            .ok_or_else(|| ScopeError::NotFound("scanner has no position attribute".into()))?;
        let dwell_time = scanner
            .attributes()
            .get_typed::<f64>("dwell_time")
            .ok_or_else(|| ScopeError::NotFound("scanner has no dwell_time attribute".into()))?;
        let intensity = detector
            .attributes()
            .get_typed::<f64>("intensity")
            .ok_or_else(|| ScopeError::NotFound("detector has no intensity attribute".into()))?;
        let anchor = detector
            .clone()
            .anchor_source()
            .ok_or_else(|| ScopeError::NotFound("detector cannot provide anchor frames".into()))?;
        let point = detector
            .point_source()
            .ok_or_else(|| ScopeError::NotFound("detector cannot take on-demand readings".into()))?;
        let focus = tree
            .find_by_role("focus")
            .and_then(|f| f.attributes().get_typed::<f64>("position"));

        Ok(Self {
            position,
            dwell_time,
            intensity,
            focus,
            anchor,
            point,
        })
    }
}

/// Cooperative cancellation for a running acquisition. Cloneable; honored
/// only at sub-block boundaries so already-started points finish cleanly.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.flag.borrow()
    }
}

enum ScanOutcome {
    Completed,
    Aborted,
}

#[derive(Default)]
struct RunLog {
    coordinates: Vec<(f64, f64)>,
    samples: Vec<f64>,
    offsets: Vec<(f64, f64)>,
    timestamps: Vec<DateTime<Utc>>,
    /// Correction currently in force; becomes `final_offset` of the run.
    correction: (f64, f64),
}

/// Drives a full drift-corrected scan over a [`ScanInterface`].
///
/// One loop instance runs one acquisition at a time; its lifecycle state
/// is exposed through an attribute so clients can subscribe to progress.
pub struct AcquisitionLoop {
    scan: ScanInterface,
    sink: Arc<dyn DataSink>,
    confidence_threshold: f64,
    state: Arc<Attribute<AcqState>>,
    abort_tx: Arc<watch::Sender<bool>>,
    /// Held for the duration of a run; enforces one run at a time.
    running: Mutex<()>,
}

impl AcquisitionLoop {
    pub fn new(scan: ScanInterface, sink: Arc<dyn DataSink>) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            scan,
            sink,
            confidence_threshold: 0.3,
            state: Arc::new(
                Attribute::new("acquisition_state", AcqState::Idle)
                    .with_description("lifecycle state of the acquisition loop")
                    .read_only(),
            ),
            abort_tx: Arc::new(abort_tx),
            running: Mutex::new(()),
        }
    }

    /// Minimum drift-estimate confidence accepted as a usable shift.
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// The observable lifecycle state.
    pub fn state(&self) -> &Arc<Attribute<AcqState>> {
        &self.state
    }

    /// A handle that stops the current run at the next sub-block boundary.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort_tx.clone(),
        }
    }

    /// Execute one acquisition run to a terminal state.
    ///
    /// Returns the acquired data on `Done` and on `Aborted` (with
    /// `complete = false`); failures persist whatever was recorded before
    /// returning the error.
    pub async fn run(&self, request: AcquisitionRequest) -> ScopeResult<AcquiredData> {
        let _running = self.running.try_lock().map_err(|_| {
            ScopeError::InvalidRequest("an acquisition run is already in progress".into())
        })?;
        self.abort_tx.send_replace(false);
        self.set_state(AcqState::Preparing);

        let run_id = Uuid::new_v4();
        let started = Utc::now();
        info!(
            %run_id,
            region = ?request.region,
            resolution = ?request.resolution,
            "starting acquisition run"
        );

        if let Err(e) = self.prepare(&request) {
            warn!(%run_id, error = %e, "acquisition request rejected");
            self.set_state(AcqState::Failed);
            return Err(e);
        }

        let targets = scan_grid(request.region, request.resolution);
        let mut estimator = DriftEstimator::new(self.confidence_threshold);
        let mut log = RunLog::default();

        // Baseline anchor frame, still part of preparation.
        match self.acquire_anchor(&request).await {
            Ok(sample) => estimator.baseline(sample),
            Err(e) => {
                warn!(%run_id, error = %e, "baseline anchor acquisition failed");
                self.set_state(AcqState::Failed);
                return Err(e);
            }
        }

        match self.drive(&request, &targets, &mut estimator, &mut log).await {
            Ok(ScanOutcome::Completed) => {
                self.set_state(AcqState::Finalizing);
                let data = assemble(run_id, started, targets.len(), true, log);
                match data.validate().and_then(|_| self.sink.store(&data)) {
                    Ok(()) => {
                        info!(%run_id, samples = data.samples.len(), "acquisition run complete");
                        self.set_state(AcqState::Done);
                        Ok(data)
                    }
                    Err(e) => {
                        warn!(%run_id, error = %e, "failed to finalize run data");
                        self.set_state(AcqState::Failed);
                        Err(e)
                    }
                }
            }
            Ok(ScanOutcome::Aborted) => {
                self.set_state(AcqState::Finalizing);
                let data = assemble(run_id, started, targets.len(), false, log);
                self.persist_partial(&data);
                info!(%run_id, samples = data.samples.len(), "acquisition run aborted");
                self.set_state(AcqState::Aborted);
                Ok(data)
            }
            Err(e) => {
                let data = assemble(run_id, started, targets.len(), false, log);
                self.persist_partial(&data);
                warn!(%run_id, error = %e, samples = data.samples.len(), "acquisition run failed");
                self.set_state(AcqState::Failed);
                Err(e)
            }
        }
    }

    /// Validate the request against the hardware ranges and apply the
    /// per-run settings (dwell, focus).
    fn prepare(&self, request: &AcquisitionRequest) -> ScopeResult<()> {
        request.check()?;

        let ((min_x, min_y), (max_x, max_y)) = request.region;
        for corner in [
            (min_x, min_y),
            (min_x, max_y),
            (max_x, min_y),
            (max_x, max_y),
        ] {
            self.scan
                .position
                .constraints()
                .validate("position", &corner)
                .map_err(|e| ScopeError::InvalidRequest(e.to_string()))?;
        }

        self.scan
            .dwell_time
            .set(request.dwell_time)
            .map_err(|e| ScopeError::InvalidRequest(e.to_string()))?;

        if let Some(focus) = request.focus {
            let attr = self.scan.focus.as_ref().ok_or_else(|| {
                ScopeError::InvalidRequest("request sets focus but no focus role is present".into())
            })?;
            attr.set(focus)
                .map_err(|e| ScopeError::InvalidRequest(e.to_string()))?;
        }
        Ok(())
    }

    async fn drive(
        &self,
        request: &AcquisitionRequest,
        targets: &[(f64, f64)],
        estimator: &mut DriftEstimator,
        log: &mut RunLog,
    ) -> ScopeResult<ScanOutcome> {
        self.set_state(AcqState::Acquiring);
        let mut inconclusive_streak: u32 = 0;

        for (idx, target) in targets.iter().enumerate() {
            if idx % request.sub_block == 0 && self.is_aborted() {
                debug!(point = idx, "abort honored at sub-block boundary");
                return Ok(ScanOutcome::Aborted);
            }

            let correction = log.correction;
            let corrected = (target.0 + correction.0, target.1 + correction.1);
            let sample = self.acquire_point(request, corrected).await?;
            log.coordinates.push(corrected);
            log.samples.push(sample);
            log.offsets.push(correction);
            log.timestamps.push(Utc::now());

            let last = idx + 1 == targets.len();
            if !last && (idx + 1) % request.correction_period == 0 {
                self.set_state(AcqState::Correcting);
                let anchor = self.acquire_anchor(request).await?;
                match estimator.estimate(&anchor)? {
                    DriftEstimate::Shift { offset, confidence } => {
                        debug!(?offset, confidence, "drift correction updated");
                        log.correction = offset;
                        inconclusive_streak = 0;
                    }
                    DriftEstimate::Inconclusive { confidence } => {
                        inconclusive_streak += 1;
                        warn!(
                            confidence,
                            streak = inconclusive_streak,
                            "inconclusive drift estimate, keeping previous correction"
                        );
                        if inconclusive_streak > request.max_inconclusive {
                            return Err(ScopeError::DriftLost {
                                consecutive: inconclusive_streak,
                            });
                        }
                    }
                }
                self.set_state(AcqState::Acquiring);
            }
        }
        Ok(ScanOutcome::Completed)
    }

    /// Move the beam and wait for the detector to report a reading.
    async fn acquire_point(
        &self,
        request: &AcquisitionRequest,
        position: (f64, f64),
    ) -> ScopeResult<f64> {
        let mut rx = self.scan.intensity.watch();
        rx.borrow_and_update();

        if self.scan.position.get() == position {
            // Repositioning to the current coordinate produces no change
            // event; take a fresh on-demand reading instead of trusting
            // the standing value, which may predate a drift advance.
            return match tokio::time::timeout(request.point_timeout, self.scan.point.read_point())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ScopeError::Timeout(format!(
                    "no detector reading at ({:e}, {:e})",
                    position.0, position.1
                ))),
            };
        }
        self.scan.position.set(position)?;

        match tokio::time::timeout(request.point_timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(*rx.borrow()),
            Ok(Err(_)) => Err(ScopeError::Hardware("detector intensity channel closed".into())),
            Err(_) => Err(ScopeError::Timeout(format!(
                "no detector reading at ({:e}, {:e})",
                position.0, position.1
            ))),
        }
    }

    async fn acquire_anchor(&self, request: &AcquisitionRequest) -> ScopeResult<DriftSample> {
        match tokio::time::timeout(request.anchor_timeout, self.scan.anchor.acquire_anchor()).await
        {
            Ok(result) => result,
            Err(_) => Err(ScopeError::Timeout("anchor frame acquisition".into())),
        }
    }

    fn persist_partial(&self, data: &AcquiredData) {
        if let Err(e) = data.validate().and_then(|_| self.sink.store(data)) {
            warn!(run_id = %data.run_id, error = %e, "failed to persist partial run data");
        }
    }

    fn is_aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    fn set_state(&self, state: AcqState) {
        debug!(%state, "acquisition state");
        if let Err(e) = self.state.set_forced(state) {
            warn!(error = %e, "failed to publish acquisition state");
        }
    }
}

fn assemble(
    run_id: Uuid,
    started: DateTime<Utc>,
    total_requested: usize,
    complete: bool,
    log: RunLog,
) -> AcquiredData {
    AcquiredData {
        run_id,
        started,
        coordinates: log.coordinates,
        samples: log.samples,
        offsets: log.offsets,
        timestamps: log.timestamps,
        total_requested,
        complete,
        final_offset: log.correction,
    }
}

/// Pixel-center scan targets, row by row from the region's min corner.
fn scan_grid(region: ((f64, f64), (f64, f64)), resolution: (usize, usize)) -> Vec<(f64, f64)> {
    let ((min_x, min_y), (max_x, max_y)) = region;
    let (nx, ny) = resolution;
    let step_x = (max_x - min_x) / nx as f64;
    let step_y = (max_y - min_y) / ny as f64;

    let mut points = Vec::with_capacity(nx * ny);
    for row in 0..ny {
        let y = min_y + (row as f64 + 0.5) * step_y;
        for col in 0..nx {
            points.push((min_x + (col as f64 + 0.5) * step_x, y));
        }
    }
    points
}
