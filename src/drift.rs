//! Drift estimation from anchor-region reference frames.
//!
//! Long acquisitions drift: the specimen slowly moves relative to the scan
//! coordinate frame. The estimator keeps a baseline frame of a small anchor
//! region and, on each correction cycle, compares a freshly acquired frame
//! against it by FFT cross-correlation. The location of the correlation
//! peak yields the shift between the two frames; normalising the peak by
//! the frames' energy yields a confidence score.
//!
//! Offsets are returned in scan-space units (meters): the anchor frame
//! carries its pixel pitch so pixel shifts convert inside the estimator,
//! and the result can be added directly to target positions. Estimation is
//! fully deterministic for identical sample pairs.

use crate::error::{ScopeError, ScopeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Supplies anchor-region reference frames on demand.
///
/// Implemented by detector components that can scan the anchor region and
/// hand back an intensity frame. Acquisition is bounded by the caller.
#[async_trait]
pub trait AnchorSource: Send + Sync {
    async fn acquire_anchor(&self) -> ScopeResult<DriftSample>;
}

/// A row-major intensity frame of the anchor region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorImage {
    pub width: usize,
    pub height: usize,
    /// Row-major pixel intensities, `width * height` values.
    pub pixels: Vec<f64>,
    /// Physical size of one pixel, in meters.
    pub pixel_pitch: f64,
}

impl AnchorImage {
    pub fn new(width: usize, height: usize, pixels: Vec<f64>, pixel_pitch: f64) -> ScopeResult<Self> {
        if pixels.len() != width * height {
            return Err(ScopeError::Validation(format!(
                "anchor image: {} pixels for {}x{} frame",
                pixels.len(),
                width,
                height
            )));
        }
        if pixel_pitch <= 0.0 {
            return Err(ScopeError::Validation(
                "anchor image: pixel pitch must be positive".into(),
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
            pixel_pitch,
        })
    }

    fn energy_zero_mean(&self) -> (Vec<f64>, f64) {
        let mean = self.pixels.iter().sum::<f64>() / self.pixels.len() as f64;
        let centered: Vec<f64> = self.pixels.iter().map(|p| p - mean).collect();
        let energy = centered.iter().map(|p| p * p).sum::<f64>();
        (centered, energy)
    }
}

/// One reference measurement used for drift comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSample {
    pub timestamp: DateTime<Utc>,
    pub signature: AnchorImage,
}

impl DriftSample {
    pub fn new(timestamp: DateTime<Utc>, signature: AnchorImage) -> Self {
        Self {
            timestamp,
            signature,
        }
    }
}

/// Result of comparing a sample against the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriftEstimate {
    /// A usable estimate. `offset` is the correction, in meters, to add to
    /// subsequent scan target positions so the scan stays registered with
    /// the baseline.
    Shift { offset: (f64, f64), confidence: f64 },

    /// Correlation confidence fell below the configured threshold; the
    /// caller decides whether to keep the previous correction or abort.
    Inconclusive { confidence: f64 },
}

/// Computes positional corrections from anchor-region reference frames.
pub struct DriftEstimator {
    confidence_threshold: f64,
    baseline: Option<AnchorImage>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl DriftEstimator {
    /// `confidence_threshold` is the minimum normalised correlation peak
    /// (0..=1) below which estimates are reported as inconclusive.
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            baseline: None,
            last_timestamp: None,
        }
    }

    /// Record the initial reference sample for a run. Resets the timestamp
    /// monotonicity tracking.
    pub fn baseline(&mut self, sample: DriftSample) {
        self.last_timestamp = Some(sample.timestamp);
        self.baseline = Some(sample.signature);
    }

    /// Compare a new sample against the baseline.
    ///
    /// Consecutive samples within one run must be monotonically increasing
    /// in timestamp; an out-of-order sample is rejected.
    pub fn estimate(&mut self, sample: &DriftSample) -> ScopeResult<DriftEstimate> {
        let baseline = self.baseline.as_ref().ok_or_else(|| {
            ScopeError::Validation("drift estimator: no baseline recorded".into())
        })?;

        if let Some(last) = self.last_timestamp {
            if sample.timestamp < last {
                return Err(ScopeError::Validation(format!(
                    "drift sample timestamp {} precedes previous sample {last}",
                    sample.timestamp
                )));
            }
        }

        let current = &sample.signature;
        if current.width != baseline.width || current.height != baseline.height {
            return Err(ScopeError::Validation(format!(
                "drift sample is {}x{}, baseline is {}x{}",
                current.width, current.height, baseline.width, baseline.height
            )));
        }

        self.last_timestamp = Some(sample.timestamp);

        let (shift_x, shift_y, confidence) = correlate(baseline, current);
        if confidence < self.confidence_threshold {
            return Ok(DriftEstimate::Inconclusive { confidence });
        }

        let pitch = current.pixel_pitch;
        Ok(DriftEstimate::Shift {
            offset: (shift_x * pitch, shift_y * pitch),
            confidence,
        })
    }
}

/// Cross-correlate `current` against `baseline` and locate the peak.
///
/// Returns `(shift_x, shift_y, confidence)` in pixels, where the shift is
/// the displacement of the current frame's content relative to the
/// baseline (equal to the correction that re-registers the scan).
fn correlate(baseline: &AnchorImage, current: &AnchorImage) -> (f64, f64, f64) {
    let width = baseline.width;
    let height = baseline.height;
    let n = (width * height) as f64;

    let (base_centered, base_energy) = baseline.energy_zero_mean();
    let (cur_centered, cur_energy) = current.energy_zero_mean();
    if base_energy <= f64::EPSILON || cur_energy <= f64::EPSILON {
        // A flat frame correlates with nothing.
        return (0.0, 0.0, 0.0);
    }

    let mut planner = FftPlanner::new();

    let mut base_fft: Vec<Complex<f64>> = base_centered
        .iter()
        .map(|&p| Complex::new(p, 0.0))
        .collect();
    let mut cur_fft: Vec<Complex<f64>> =
        cur_centered.iter().map(|&p| Complex::new(p, 0.0)).collect();

    fft_2d(&mut base_fft, width, height, &mut planner, false);
    fft_2d(&mut cur_fft, width, height, &mut planner, false);

    // Cross-power spectrum: peak of its inverse transform sits at the
    // content displacement of `current` relative to `baseline`.
    let mut cross: Vec<Complex<f64>> = cur_fft
        .iter()
        .zip(base_fft.iter())
        .map(|(c, b)| c * b.conj())
        .collect();
    fft_2d(&mut cross, width, height, &mut planner, true);

    // Locate the correlation peak (inverse transform is unnormalised).
    let mut peak = 0.0;
    let mut peak_idx = 0;
    for (idx, value) in cross.iter().enumerate() {
        let magnitude = value.norm();
        if magnitude > peak {
            peak = magnitude;
            peak_idx = idx;
        }
    }

    let row = peak_idx / width;
    let col = peak_idx % width;

    // Map wrap-around peak locations to signed shifts.
    let shift_y = if row > height / 2 {
        row as f64 - height as f64
    } else {
        row as f64
    };
    let shift_x = if col > width / 2 {
        col as f64 - width as f64
    } else {
        col as f64
    };

    // Cauchy-Schwarz bounds the true correlation peak by the geometric
    // mean of the energies, so this lands in 0..=1 (up to float error).
    let confidence = (peak / n / (base_energy * cur_energy).sqrt()).min(1.0);

    (shift_x, shift_y, confidence)
}

/// In-place 2-D FFT: rows first, then columns.
fn fft_2d(
    buf: &mut [Complex<f64>],
    width: usize,
    height: usize,
    planner: &mut FftPlanner<f64>,
    inverse: bool,
) {
    let row_fft = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    for row in buf.chunks_exact_mut(width) {
        row_fft.process(row);
    }

    let col_fft = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };
    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for (y, slot) in column.iter_mut().enumerate() {
            *slot = buf[y * width + x];
        }
        col_fft.process(&mut column);
        for (y, value) in column.iter().enumerate() {
            buf[y * width + x] = *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PITCH: f64 = 2.0e-8;

    /// Deterministic structured test frame.
    fn test_frame(width: usize, height: usize) -> AnchorImage {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let fx = x as f64 / width as f64;
                let fy = y as f64 / height as f64;
                let value = (fx * 12.6).sin() * (fy * 9.4).cos()
                    + 0.5 * (fx * 31.0 + fy * 17.0).sin();
                pixels.push(value);
            }
        }
        AnchorImage::new(width, height, pixels, PITCH).unwrap()
    }

    /// Shift a frame's content by whole pixels with wrap-around.
    fn shifted(frame: &AnchorImage, dx: i64, dy: i64) -> AnchorImage {
        let (w, h) = (frame.width as i64, frame.height as i64);
        let mut pixels = vec![0.0; frame.pixels.len()];
        for y in 0..h {
            for x in 0..w {
                let sx = (x - dx).rem_euclid(w);
                let sy = (y - dy).rem_euclid(h);
                pixels[(y * w + x) as usize] = frame.pixels[(sy * w + sx) as usize];
            }
        }
        AnchorImage::new(frame.width, frame.height, pixels, frame.pixel_pitch).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn self_alignment_identity() {
        let frame = test_frame(32, 32);
        let mut estimator = DriftEstimator::new(0.5);
        estimator.baseline(DriftSample::new(at(0), frame.clone()));

        let estimate = estimator
            .estimate(&DriftSample::new(at(1), frame))
            .unwrap();
        match estimate {
            DriftEstimate::Shift { offset, confidence } => {
                assert_eq!(offset, (0.0, 0.0));
                assert!(confidence > 0.99, "confidence = {confidence}");
            }
            other => panic!("expected shift, got {other:?}"),
        }
    }

    #[test]
    fn recovers_known_shift() {
        let frame = test_frame(32, 32);
        let mut estimator = DriftEstimator::new(0.5);
        estimator.baseline(DriftSample::new(at(0), frame.clone()));

        // Content displaced by (+3, -2) pixels: the correction equals the
        // displacement, converted to meters.
        let moved = shifted(&frame, 3, -2);
        let estimate = estimator
            .estimate(&DriftSample::new(at(1), moved))
            .unwrap();
        match estimate {
            DriftEstimate::Shift { offset, confidence } => {
                assert!((offset.0 - 3.0 * PITCH).abs() < 1e-12);
                assert!((offset.1 - -2.0 * PITCH).abs() < 1e-12);
                assert!(confidence > 0.9);
            }
            other => panic!("expected shift, got {other:?}"),
        }
    }

    #[test]
    fn estimation_is_deterministic() {
        let frame = test_frame(16, 16);
        let moved = shifted(&frame, 1, 1);

        let run = || {
            let mut estimator = DriftEstimator::new(0.1);
            estimator.baseline(DriftSample::new(at(0), frame.clone()));
            estimator
                .estimate(&DriftSample::new(at(1), moved.clone()))
                .unwrap()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn uncorrelated_frames_are_inconclusive() {
        let frame = test_frame(32, 32);
        let mut estimator = DriftEstimator::new(0.8);
        estimator.baseline(DriftSample::new(at(0), frame));

        // A different structured pattern, not a shifted copy.
        let mut pixels = Vec::with_capacity(32 * 32);
        for y in 0..32 {
            for x in 0..32 {
                pixels.push(((x * 7 + y * 13) % 5) as f64 - 2.0);
            }
        }
        let other = AnchorImage::new(32, 32, pixels, PITCH).unwrap();
        let estimate = estimator
            .estimate(&DriftSample::new(at(1), other))
            .unwrap();
        assert!(matches!(estimate, DriftEstimate::Inconclusive { .. }));
    }

    #[test]
    fn flat_frame_has_zero_confidence() {
        let frame = test_frame(16, 16);
        let mut estimator = DriftEstimator::new(0.1);
        estimator.baseline(DriftSample::new(at(0), frame));

        let flat = AnchorImage::new(16, 16, vec![1.0; 256], PITCH).unwrap();
        let estimate = estimator.estimate(&DriftSample::new(at(1), flat)).unwrap();
        assert_eq!(estimate, DriftEstimate::Inconclusive { confidence: 0.0 });
    }

    #[test]
    fn out_of_order_sample_rejected() {
        let frame = test_frame(16, 16);
        let mut estimator = DriftEstimator::new(0.1);
        estimator.baseline(DriftSample::new(at(10), frame.clone()));

        let err = estimator
            .estimate(&DriftSample::new(at(5), frame))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
    }

    #[test]
    fn estimate_without_baseline_rejected() {
        let mut estimator = DriftEstimator::new(0.1);
        let err = estimator
            .estimate(&DriftSample::new(at(0), test_frame(8, 8)))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
    }

    #[test]
    fn mismatched_dimensions_rejected() {
        let mut estimator = DriftEstimator::new(0.1);
        estimator.baseline(DriftSample::new(at(0), test_frame(16, 16)));
        let err = estimator
            .estimate(&DriftSample::new(at(1), test_frame(8, 8)))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
    }
}
