//! Simulated microscope components.
//!
//! Provides scanner, focus, detector and microscope classes that behave
//! like a small scanning instrument without hardware: the detector images
//! a synthetic specimen made of seeded gaussian blobs, and can apply a
//! configurable positional drift so the correction machinery is exercised
//! end to end. The daemon uses these classes when no hardware is attached;
//! the test suite uses them for deterministic full-stack runs.
//!
//! Registered class tags: `sim.Scanner`, `sim.Focus`, `sim.Detector`,
//! `sim.Microscope`.

use crate::attribute::{Attribute, AttributeSet, SubscriptionId};
use crate::component::{Component, HwComponent, PointSource};
use crate::drift::{AnchorImage, AnchorSource, DriftSample};
use crate::error::{ScopeError, ScopeResult};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::tree::{BuildContext, ComponentRegistry};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register all simulated classes on a registry.
pub fn register_sim_classes(registry: &mut ComponentRegistry) {
    registry.register("sim.Scanner", |ctx| {
        Ok(SimScanner::build(ctx)? as Arc<dyn Component>)
    });
    registry.register("sim.Focus", |ctx| {
        Ok(SimFocus::build(ctx)? as Arc<dyn Component>)
    });
    registry.register("sim.Detector", |ctx| {
        Ok(SimDetector::build(ctx)? as Arc<dyn Component>)
    });
    registry.register("sim.Microscope", |ctx| {
        Ok(SimMicroscope::build(ctx)? as Arc<dyn Component>)
    });
}

// =============================================================================
// Scanner
// =============================================================================

/// Beam scanner: a writable `position` restricted to the field of view,
/// a `dwell_time` and a read-only `field_of_view`.
pub struct SimScanner {
    base: HwComponent,
}

impl SimScanner {
    /// Init parameters: `field_of_view` (m, default 1.0e-5),
    /// `dwell_time` (s, default 1.0e-6).
    fn build(ctx: BuildContext<'_>) -> ScopeResult<Arc<Self>> {
        let fov = ctx.init_f64("field_of_view", 1.0e-5)?;
        if fov <= 0.0 {
            return Err(ScopeError::Config(format!(
                "component '{}': field_of_view must be positive",
                ctx.name
            )));
        }
        let dwell = ctx.init_f64("dwell_time", 1.0e-6)?;

        let half = fov / 2.0;
        let position = Attribute::new("position", (0.0, 0.0))
            .with_unit("m")
            .with_description("beam position relative to the field center")
            .with_validator(move |p: &(f64, f64)| {
                if p.0.abs() > half || p.1.abs() > half {
                    anyhow::bail!("position ({:e}, {:e}) outside field of view", p.0, p.1);
                }
                Ok(())
            });
        let dwell_time = Attribute::new("dwell_time", dwell)
            .with_unit("s")
            .with_range(1.0e-9, 1.0);
        let field_of_view = Attribute::new("field_of_view", fov)
            .with_unit("m")
            .read_only();

        let mut base = HwComponent::new(ctx.name, ctx.role)
            .with_children(ctx.children)
            .with_metadata(ctx.metadata.clone());
        base.attributes_mut().register(Arc::new(position));
        base.attributes_mut().register(Arc::new(dwell_time));
        base.attributes_mut().register(Arc::new(field_of_view));

        Ok(Arc::new(Self { base }))
    }
}

impl Component for SimScanner {
    fn name(&self) -> &str {
        self.base.name()
    }
    fn role(&self) -> &str {
        self.base.role()
    }
    fn attributes(&self) -> &AttributeSet {
        self.base.attributes()
    }
    fn children(&self) -> &HashMap<String, Arc<dyn Component>> {
        self.base.children()
    }
    fn metadata(&self) -> &HashMap<String, f64> {
        self.base.metadata()
    }
}

// =============================================================================
// Focus
// =============================================================================

/// Focus actuator: one writable `position` along the optical axis.
pub struct SimFocus {
    base: HwComponent,
}

impl SimFocus {
    /// Init parameters: `min_position` / `max_position` (m, default ±1.0e-3).
    fn build(ctx: BuildContext<'_>) -> ScopeResult<Arc<Self>> {
        let min = ctx.init_f64("min_position", -1.0e-3)?;
        let max = ctx.init_f64("max_position", 1.0e-3)?;
        if min >= max {
            return Err(ScopeError::Config(format!(
                "component '{}': min_position must be below max_position",
                ctx.name
            )));
        }

        let position = Attribute::new("position", 0.0)
            .with_unit("m")
            .with_range(min, max);

        let mut base = HwComponent::new(ctx.name, ctx.role)
            .with_children(ctx.children)
            .with_metadata(ctx.metadata.clone());
        base.attributes_mut().register(Arc::new(position));

        Ok(Arc::new(Self { base }))
    }
}

impl Component for SimFocus {
    fn name(&self) -> &str {
        self.base.name()
    }
    fn role(&self) -> &str {
        self.base.role()
    }
    fn attributes(&self) -> &AttributeSet {
        self.base.attributes()
    }
    fn children(&self) -> &HashMap<String, Arc<dyn Component>> {
        self.base.children()
    }
    fn metadata(&self) -> &HashMap<String, f64> {
        self.base.metadata()
    }
}

// =============================================================================
// Specimen model
// =============================================================================

struct Blob {
    center: (f64, f64),
    amplitude: f64,
    sigma: f64,
}

/// Synthetic specimen: a fixed set of gaussian blobs over a flat baseline,
/// generated once from an explicit seed so every run is reproducible.
struct Specimen {
    blobs: Vec<Blob>,
    baseline: f64,
}

impl Specimen {
    fn generate(seed: u64, count: usize, extent: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let half = extent / 2.0;
        let blobs = (0..count)
            .map(|_| Blob {
                center: (rng.gen_range(-half..half), rng.gen_range(-half..half)),
                amplitude: rng.gen_range(0.5..1.0),
                sigma: extent * rng.gen_range(0.01..0.03),
            })
            .collect();
        Self {
            blobs,
            baseline: 0.05,
        }
    }

    fn sample(&self, x: f64, y: f64) -> f64 {
        let mut value = self.baseline;
        for blob in &self.blobs {
            let dx = x - blob.center.0;
            let dy = y - blob.center.1;
            value += blob.amplitude * (-(dx * dx + dy * dy) / (2.0 * blob.sigma * blob.sigma)).exp();
        }
        value
    }
}

// =============================================================================
// Detector
// =============================================================================

struct AnchorGeometry {
    size: usize,
    pitch: f64,
    center: (f64, f64),
}

/// Point detector tied to a scanner.
///
/// Owns the scanner as its `scanner` child, follows its `position`
/// attribute and reports the specimen intensity at the (drifted) beam
/// position into the read-only `intensity` attribute. Also serves anchor
/// frames for drift estimation; each anchor acquisition advances the
/// simulated drift by the configured step.
pub struct SimDetector {
    base: HwComponent,
    intensity: Arc<Attribute<f64>>,
    scanner_position: Arc<Attribute<(f64, f64)>>,
    subscription: SubscriptionId,
    specimen: Arc<Specimen>,
    drift: Arc<Mutex<(f64, f64)>>,
    drift_step: (f64, f64),
    anchor: AnchorGeometry,
}

impl SimDetector {
    /// Init parameters: `rng` (seed, default 0), `blobs` (default 24),
    /// `drift_step_x` / `drift_step_y` (m per anchor acquisition, default
    /// 0), `anchor_size` (pixels, default 32), `anchor_pitch` (m, default
    /// field_of_view / 256), `anchor_center_x` / `anchor_center_y` (m,
    /// default 0). Requires a `scanner` child.
    fn build(ctx: BuildContext<'_>) -> ScopeResult<Arc<Self>> {
        let scanner = ctx.children.get("scanner").cloned().ok_or_else(|| {
            ScopeError::Config(format!(
                "component '{}': requires a 'scanner' child",
                ctx.name
            ))
        })?;
        let scanner_position = scanner
            .attributes()
            .get_typed::<(f64, f64)>("position")
            .ok_or_else(|| {
                ScopeError::Config(format!(
                    "component '{}': scanner child has no position attribute",
                    ctx.name
                ))
            })?;
        let fov = scanner
            .attributes()
            .get_typed::<f64>("field_of_view")
            .map(|a| a.get())
            .unwrap_or(1.0e-5);

        let seed = ctx.init_i64("rng", 0)? as u64;
        let blob_count = ctx.init_i64("blobs", 24)? as usize;
        let drift_step = (
            ctx.init_f64("drift_step_x", 0.0)?,
            ctx.init_f64("drift_step_y", 0.0)?,
        );
        let anchor = AnchorGeometry {
            size: ctx.init_i64("anchor_size", 32)? as usize,
            pitch: ctx.init_f64("anchor_pitch", fov / 256.0)?,
            center: (
                ctx.init_f64("anchor_center_x", 0.0)?,
                ctx.init_f64("anchor_center_y", 0.0)?,
            ),
        };
        if anchor.size == 0 || anchor.pitch <= 0.0 {
            return Err(ScopeError::Config(format!(
                "component '{}': anchor geometry must be non-degenerate",
                ctx.name
            )));
        }

        let specimen = Arc::new(Specimen::generate(seed, blob_count, fov));
        let drift = Arc::new(Mutex::new((0.0, 0.0)));
        let intensity = Arc::new(
            Attribute::new("intensity", 0.0)
                .with_unit("a.u.")
                .with_description("specimen intensity at the current beam position")
                .read_only(),
        );

        // Follow the beam: every scanner position change produces a fresh
        // intensity reading, pushed through the owner-side write path.
        let specimen_cb = specimen.clone();
        let drift_cb = drift.clone();
        let intensity_cb = intensity.clone();
        let subscription = scanner_position.subscribe(move |_old, new: &(f64, f64)| {
            let d = *lock(&drift_cb);
            let value = specimen_cb.sample(new.0 - d.0, new.1 - d.1);
            intensity_cb.set_forced(value)?;
            Ok(())
        });

        let mut base = HwComponent::new(ctx.name, ctx.role)
            .with_children(ctx.children)
            .with_metadata(ctx.metadata.clone());
        base.attributes_mut().register(intensity.clone());

        Ok(Arc::new(Self {
            base,
            intensity,
            scanner_position,
            subscription,
            specimen,
            drift,
            drift_step,
            anchor,
        }))
    }

    /// Current intensity attribute (read-only for external writers).
    pub fn intensity(&self) -> &Arc<Attribute<f64>> {
        &self.intensity
    }

    /// Current simulated drift offset, in meters.
    pub fn current_drift(&self) -> (f64, f64) {
        *lock(&self.drift)
    }

    fn scan_anchor(&self) -> AnchorImage {
        let d = *lock(&self.drift);
        let size = self.anchor.size;
        let pitch = self.anchor.pitch;
        let origin = (size as f64 - 1.0) / 2.0;

        let mut pixels = Vec::with_capacity(size * size);
        for row in 0..size {
            for col in 0..size {
                let x = self.anchor.center.0 + (col as f64 - origin) * pitch;
                let y = self.anchor.center.1 + (row as f64 - origin) * pitch;
                pixels.push(self.specimen.sample(x - d.0, y - d.1));
            }
        }
        // Geometry is checked at construction.
        AnchorImage {
            width: size,
            height: size,
            pixels,
            pixel_pitch: pitch,
        }
    }
}

#[async_trait]
impl PointSource for SimDetector {
    async fn read_point(&self) -> ScopeResult<f64> {
        let p = self.scanner_position.get();
        let d = *lock(&self.drift);
        let value = self.specimen.sample(p.0 - d.0, p.1 - d.1);
        self.intensity.set_forced(value)?;
        Ok(value)
    }
}

#[async_trait]
impl AnchorSource for SimDetector {
    async fn acquire_anchor(&self) -> ScopeResult<DriftSample> {
        let frame = self.scan_anchor();
        // The specimen drifts a little further after each anchor visit.
        {
            let mut d = lock(&self.drift);
            d.0 += self.drift_step.0;
            d.1 += self.drift_step.1;
        }
        debug!(drift = ?self.current_drift(), "anchor frame acquired");
        Ok(DriftSample::new(Utc::now(), frame))
    }
}

impl Component for SimDetector {
    fn name(&self) -> &str {
        self.base.name()
    }
    fn role(&self) -> &str {
        self.base.role()
    }
    fn attributes(&self) -> &AttributeSet {
        self.base.attributes()
    }
    fn children(&self) -> &HashMap<String, Arc<dyn Component>> {
        self.base.children()
    }
    fn metadata(&self) -> &HashMap<String, f64> {
        self.base.metadata()
    }
    fn shutdown(&self) -> ScopeResult<()> {
        self.scanner_position.unsubscribe(self.subscription);
        Ok(())
    }
    fn anchor_source(self: Arc<Self>) -> Option<Arc<dyn AnchorSource>> {
        Some(self)
    }
    fn point_source(self: Arc<Self>) -> Option<Arc<dyn PointSource>> {
        Some(self)
    }
}

// =============================================================================
// Microscope (container)
// =============================================================================

/// Root container: no attributes of its own, just the device children.
pub struct SimMicroscope {
    base: HwComponent,
}

impl SimMicroscope {
    fn build(ctx: BuildContext<'_>) -> ScopeResult<Arc<Self>> {
        let base = HwComponent::new(ctx.name, ctx.role)
            .with_children(ctx.children)
            .with_metadata(ctx.metadata.clone());
        Ok(Arc::new(Self { base }))
    }
}

impl Component for SimMicroscope {
    fn name(&self) -> &str {
        self.base.name()
    }
    fn role(&self) -> &str {
        self.base.role()
    }
    fn attributes(&self) -> &AttributeSet {
        self.base.attributes()
    }
    fn children(&self) -> &HashMap<String, Arc<dyn Component>> {
        self.base.children()
    }
    fn metadata(&self) -> &HashMap<String, f64> {
        self.base.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::{DriftEstimate, DriftEstimator};
    use crate::tree::{MicroscopeConfig, TreeBuilder};

    pub(crate) const SIM_CONFIG: &str = r#"
        root = "orsaymic"

        [components.orsaymic]
        class = "sim.Microscope"
        role = "microscope"
        children = { detector = "Detector", focus = "Focus" }

        [components.Detector]
        class = "sim.Detector"
        role = "detector"
        init = { rng = 7, drift_step_x = 0.0, drift_step_y = 0.0 }
        children = { scanner = "Scanner" }

        [components.Scanner]
        class = "sim.Scanner"
        role = "scanner"
        init = { field_of_view = 1.0e-5 }

        [components.Focus]
        class = "sim.Focus"
        role = "focus"
    "#;

    fn build_tree(config: &str) -> crate::tree::ComponentTree {
        let mut registry = ComponentRegistry::new();
        register_sim_classes(&mut registry);
        let config = MicroscopeConfig::from_toml_str(config).unwrap();
        TreeBuilder::new(&registry).build(&config).unwrap()
    }

    #[test]
    fn tree_exposes_expected_roles_and_attributes() {
        let tree = build_tree(SIM_CONFIG);

        let scanner = tree.resolve(&["detector", "scanner"]).unwrap();
        assert_eq!(scanner.attributes().names(), vec![
            "position",
            "dwell_time",
            "field_of_view"
        ]);
        assert!(tree.find_by_role("focus").is_some());
        assert!(tree.find_by_role("detector").is_some());
    }

    #[test]
    fn scanner_rejects_position_outside_field_of_view() {
        let tree = build_tree(SIM_CONFIG);
        let scanner = tree.find_by_role("scanner").unwrap();
        let position = scanner
            .attributes()
            .get_typed::<(f64, f64)>("position")
            .unwrap();

        assert!(position.set((2.0e-6, -2.0e-6)).is_ok());
        let err = position.set((6.0e-6, 0.0)).unwrap_err();
        assert!(matches!(err, ScopeError::Validation(_)));
        assert_eq!(position.get(), (2.0e-6, -2.0e-6));
    }

    #[test]
    fn detector_follows_scanner_position() {
        let tree = build_tree(SIM_CONFIG);
        let scanner = tree.find_by_role("scanner").unwrap();
        let detector = tree.find_by_role("detector").unwrap();
        let position = scanner
            .attributes()
            .get_typed::<(f64, f64)>("position")
            .unwrap();
        let intensity = detector.attributes().get_typed::<f64>("intensity").unwrap();

        position.set((1.0e-6, 1.0e-6)).unwrap();
        let a = intensity.get();
        position.set((-4.0e-6, -4.0e-6)).unwrap();
        let b = intensity.get();

        // Both readings carry at least the baseline; the specimen is not
        // uniform, so two distant positions disagree.
        assert!(a > 0.0 && b > 0.0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn parked_detector_reads_on_demand() {
        let tree = build_tree(SIM_CONFIG);
        let detector = tree.find_by_role("detector").unwrap();
        let intensity = detector.attributes().get_typed::<f64>("intensity").unwrap();
        // No scanner move yet, so the standing intensity is untouched.
        assert_eq!(intensity.get(), 0.0);

        let point = detector.point_source().unwrap();
        let value = point.read_point().await.unwrap();
        // The specimen carries a flat baseline, so a genuine reading is
        // never zero, and it lands in the intensity attribute.
        assert!(value >= 0.05, "value = {value}");
        assert_eq!(intensity.get(), value);
    }

    #[test]
    fn detector_intensity_is_read_only_externally() {
        let tree = build_tree(SIM_CONFIG);
        let detector = tree.find_by_role("detector").unwrap();
        let intensity = detector.attributes().get_typed::<f64>("intensity").unwrap();
        assert!(matches!(intensity.set(1.0), Err(ScopeError::ReadOnly(_))));
    }

    #[test]
    fn detector_without_scanner_child_fails_build() {
        let mut registry = ComponentRegistry::new();
        register_sim_classes(&mut registry);
        let config = MicroscopeConfig::from_toml_str(
            r#"
            root = "Detector"
            [components.Detector]
            class = "sim.Detector"
            role = "detector"
            "#,
        )
        .unwrap();

        let err = TreeBuilder::new(&registry).build(&config).unwrap_err();
        assert!(matches!(err, ScopeError::Config(_)));
        assert!(err.to_string().contains("scanner"));
    }

    #[tokio::test]
    async fn anchor_frames_are_deterministic_per_seed() {
        let tree_a = build_tree(SIM_CONFIG);
        let tree_b = build_tree(SIM_CONFIG);

        let anchor = |tree: &crate::tree::ComponentTree| {
            tree.find_by_role("detector").unwrap().anchor_source().unwrap()
        };
        let frame_a = anchor(&tree_a).acquire_anchor().await.unwrap();
        let frame_b = anchor(&tree_b).acquire_anchor().await.unwrap();
        assert_eq!(frame_a.signature.pixels, frame_b.signature.pixels);
    }

    #[tokio::test]
    async fn drift_step_is_recovered_by_the_estimator() {
        // Step the drift by exactly two anchor pixels per acquisition.
        let pitch = 1.0e-5 / 256.0;
        let config = format!(
            r#"
            root = "Detector"

            [components.Detector]
            class = "sim.Detector"
            role = "detector"
            init = {{ rng = 11, drift_step_x = {step_x}, drift_step_y = {step_y} }}
            children = {{ scanner = "Scanner" }}

            [components.Scanner]
            class = "sim.Scanner"
            role = "scanner"
            "#,
            step_x = 2.0 * pitch,
            step_y = -pitch,
        );
        let tree = build_tree(&config);
        let source = tree
            .find_by_role("detector")
            .unwrap()
            .anchor_source()
            .unwrap();

        let mut estimator = DriftEstimator::new(0.3);
        estimator.baseline(source.acquire_anchor().await.unwrap());
        let sample = source.acquire_anchor().await.unwrap();

        match estimator.estimate(&sample).unwrap() {
            DriftEstimate::Shift { offset, confidence } => {
                assert!((offset.0 - 2.0 * pitch).abs() < pitch / 2.0, "dx = {}", offset.0);
                assert!((offset.1 - -pitch).abs() < pitch / 2.0, "dy = {}", offset.1);
                assert!(confidence > 0.3);
            }
            other => panic!("expected shift, got {other:?}"),
        }
    }
}
