//! Full drift-corrected acquisition runs over the simulated instrument.

use rust_scope::acquisition::{
    AcqState, AcquisitionLoop, AcquisitionRequest, MemorySink, ScanInterface,
};
use rust_scope::sim::register_sim_classes;
use rust_scope::tree::{ComponentRegistry, ComponentTree, MicroscopeConfig, TreeBuilder};
use rust_scope::ScopeError;
use std::sync::{Arc, Mutex};

const FOV: f64 = 1.0e-5;
const ANCHOR_PITCH: f64 = FOV / 256.0;

fn build_tree(drift_step_x: f64, drift_step_y: f64) -> ComponentTree {
    let config = format!(
        r#"
        root = "orsaymic"

        [components.orsaymic]
        class = "sim.Microscope"
        role = "microscope"
        children = {{ detector = "Detector", focus = "Focus" }}

        [components.Detector]
        class = "sim.Detector"
        role = "detector"
        init = {{ rng = 11, drift_step_x = {drift_step_x}, drift_step_y = {drift_step_y} }}
        children = {{ scanner = "Scanner" }}

        [components.Scanner]
        class = "sim.Scanner"
        role = "scanner"
        init = {{ field_of_view = {FOV} }}

        [components.Focus]
        class = "sim.Focus"
        role = "focus"
        "#
    );

    let mut registry = ComponentRegistry::new();
    register_sim_classes(&mut registry);
    let config = MicroscopeConfig::from_toml_str(&config).unwrap();
    TreeBuilder::new(&registry).build(&config).unwrap()
}

fn request_10x10() -> AcquisitionRequest {
    AcquisitionRequest::new(((-2.0e-6, -2.0e-6), (2.0e-6, 2.0e-6)), (10, 10), 1.0e-6)
        .with_correction_period(25)
        .with_sub_block(10)
}

#[tokio::test]
async fn zero_drift_run_completes_with_zero_offsets() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    let states = Arc::new(Mutex::new(vec![acq.state().get()]));
    let states_cb = states.clone();
    acq.state().subscribe(move |_old, new| {
        states_cb.lock().unwrap().push(*new);
        Ok(())
    });

    let data = acq.run(request_10x10()).await.unwrap();

    assert!(data.complete);
    assert_eq!(data.samples.len(), 100);
    assert_eq!(data.coordinates.len(), 100);
    assert!(data.offsets.iter().all(|o| *o == (0.0, 0.0)));
    assert_eq!(data.final_offset, (0.0, 0.0));
    assert!(data.samples.iter().all(|s| *s > 0.0));

    // Persisted through the sink exactly once.
    let stored = sink.runs();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run_id, data.run_id);

    let trace = states.lock().unwrap().clone();
    assert_eq!(trace.first(), Some(&AcqState::Idle));
    assert_eq!(trace.last(), Some(&AcqState::Done));
    assert!(trace.contains(&AcqState::Preparing));
    assert!(trace.contains(&AcqState::Acquiring));
    assert!(trace.contains(&AcqState::Correcting));
    assert!(trace.contains(&AcqState::Finalizing));
    assert_eq!(acq.state().get(), AcqState::Done);
}

#[tokio::test]
async fn abort_is_honored_at_sub_block_boundaries() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let position = scan.position.clone();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    // Pull the plug partway through point 35; the loop must still finish
    // the running sub-block and stop at the next boundary.
    let abort = acq.abort_handle();
    let moves = Arc::new(Mutex::new(0_usize));
    position.subscribe(move |_old, _new| {
        let mut moves = moves.lock().unwrap();
        *moves += 1;
        if *moves == 35 {
            abort.abort();
        }
        Ok(())
    });

    let data = acq.run(request_10x10()).await.unwrap();

    assert!(!data.complete);
    assert_eq!(data.samples.len(), 40);
    assert_eq!(data.samples.len() % 10, 0);
    assert_eq!(data.total_requested, 100);
    assert_eq!(acq.state().get(), AcqState::Aborted);

    // Partial data still reaches the sink.
    let stored = sink.runs();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].complete);
}

#[tokio::test]
async fn repeated_inconclusive_estimates_fail_the_run() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    // An unattainable confidence threshold makes every estimate
    // inconclusive.
    let acq = AcquisitionLoop::new(scan, sink.clone()).with_confidence_threshold(1.1);

    let request = request_10x10()
        .with_correction_period(10)
        .with_max_inconclusive(2);
    let err = acq.run(request).await.unwrap_err();

    match err {
        ScopeError::DriftLost { consecutive } => assert_eq!(consecutive, 3),
        other => panic!("expected DriftLost, got {other}"),
    }
    assert_eq!(acq.state().get(), AcqState::Failed);

    // Three correction attempts at points 10, 20 and 30.
    let stored = sink.runs();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].complete);
    assert_eq!(stored[0].samples.len(), 30);
}

#[tokio::test]
async fn out_of_range_request_is_rejected_in_preparing() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    // The scanner's field of view is ±5e-6; this region reaches past it.
    let request =
        AcquisitionRequest::new(((-1.0e-5, -1.0e-5), (1.0e-5, 1.0e-5)), (10, 10), 1.0e-6);
    let err = acq.run(request).await.unwrap_err();

    assert!(matches!(err, ScopeError::InvalidRequest(_)));
    assert_eq!(acq.state().get(), AcqState::Failed);
    assert!(sink.runs().is_empty());

    // A dwell outside the scanner's range is rejected the same way.
    let request = AcquisitionRequest::new(((-2.0e-6, -2.0e-6), (2.0e-6, 2.0e-6)), (4, 4), 10.0);
    assert!(matches!(
        acq.run(request).await.unwrap_err(),
        ScopeError::InvalidRequest(_)
    ));
}

#[tokio::test]
async fn estimated_drift_shifts_subsequent_coordinates() {
    // The specimen drifts two anchor pixels in x after every anchor
    // acquisition (including the baseline).
    let step = 2.0 * ANCHOR_PITCH;
    let tree = build_tree(step, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    let request = request_10x10().with_correction_period(50);
    let data = acq.run(request).await.unwrap();

    assert!(data.complete);
    assert_eq!(data.samples.len(), 100);

    // Points before the first correction carry no offset.
    assert!(data.offsets[..50].iter().all(|o| *o == (0.0, 0.0)));

    // After the correction the recovered drift is applied to every
    // remaining point.
    for offset in &data.offsets[50..] {
        assert!((offset.0 - step).abs() < ANCHOR_PITCH / 2.0, "dx = {}", offset.0);
        assert!(offset.1.abs() < ANCHOR_PITCH / 2.0, "dy = {}", offset.1);
    }
    assert!((data.final_offset.0 - step).abs() < ANCHOR_PITCH / 2.0);

    // Written coordinates equal the requested grid plus the correction.
    let first_corrected = data.coordinates[50];
    let uncorrected = data.coordinates[0];
    assert!((first_corrected.1 - (uncorrected.1 + 5.0 * 4.0e-7)).abs() < 1.0e-12);
    assert!((first_corrected.0 - (uncorrected.0 + data.offsets[50].0)).abs() < 1.0e-12);
}

#[tokio::test]
async fn single_point_scan_at_the_parked_position_measures_the_specimen() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    // A 1x1 grid targets the field center, exactly where the scanner is
    // parked at startup, so the scan never moves the beam.
    let request =
        AcquisitionRequest::new(((-1.0e-6, -1.0e-6), (1.0e-6, 1.0e-6)), (1, 1), 1.0e-6);
    let data = acq.run(request).await.unwrap();

    assert!(data.complete);
    assert_eq!(data.samples.len(), 1);
    // The specimen carries a flat baseline, so a real measurement is
    // never zero.
    assert!(data.samples[0] >= 0.05, "sample = {}", data.samples[0]);
}

#[tokio::test]
async fn a_second_run_can_start_after_the_first_finishes() {
    let tree = build_tree(0.0, 0.0);
    let sink = MemorySink::new();
    let scan = ScanInterface::from_tree(&tree).unwrap();
    let acq = AcquisitionLoop::new(scan, sink.clone());

    let small = AcquisitionRequest::new(((-1.0e-6, -1.0e-6), (1.0e-6, 1.0e-6)), (4, 4), 1.0e-6);
    acq.run(small.clone()).await.unwrap();
    acq.run(small).await.unwrap();
    assert_eq!(sink.runs().len(), 2);
}
