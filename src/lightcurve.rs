use rand::rngs::SmallRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::settings::ModelSettings;

/// Conversion between calendar days and grid days. Sampling cadences repeat
/// on the sidereal day, so the internal time grid ticks slightly faster than
/// 24 hours.
pub const SIDEREAL_SCALE: f64 = 86400.0 / 86164.0905;

/// Floor applied to estimated flux scales so degenerate all-zero objects
/// stay finite downstream.
const MIN_SCALE: f64 = 1e-8;

/// Convert an absolute time to grid days relative to a reference time.
pub fn time_to_grid(time: f64, reference_time: f64) -> f64 {
    (time - reference_time) * SIDEREAL_SCALE
}

/// Invert `time_to_grid`.
pub fn grid_to_time(grid_time: f64, reference_time: f64) -> f64 {
    grid_time / SIDEREAL_SCALE + reference_time
}

/// A single photometric observation.
///
/// `grid_time` and `time_index` are derived during preprocessing and are
/// meaningless before it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub time: f64,
    pub band_index: usize,
    pub flux: f64,
    pub flux_error: f64,
    pub grid_time: f64,
    pub time_index: i64,
}

impl Observation {
    pub fn new(time: f64, band_index: usize, flux: f64, flux_error: f64) -> Self {
        Self {
            time,
            band_index,
            flux,
            flux_error,
            grid_time: 0.0,
            time_index: -1,
        }
    }
}

/// Per-object metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: String,
    pub redshift: f64,
    /// Estimated time of the event, filled by preprocessing.
    pub reference_time: f64,
    /// Per-object flux normalization, filled by preprocessing.
    pub scale: f64,
    pub preprocessed: bool,
}

/// One object's light curve: ordered observations plus metadata. Owned by
/// the caller; preprocessing and augmentation both return derived copies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LightCurve {
    pub observations: Vec<Observation>,
    pub meta: ObjectMeta,
}

impl LightCurve {
    pub fn new(object_id: impl Into<String>, redshift: f64, observations: Vec<Observation>) -> Self {
        Self {
            observations,
            meta: ObjectMeta {
                object_id: object_id.into(),
                redshift,
                reference_time: 0.0,
                scale: 1.0,
                preprocessed: false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Estimate the event reference time: the time of the highest-significance
/// observation. Invariant under the flux rescaling applied later.
fn estimate_reference_time(observations: &[Observation]) -> f64 {
    let mut best_time = 0.0;
    let mut best_s2n = f64::NEG_INFINITY;
    for obs in observations {
        let s2n = obs.flux.abs() / obs.flux_error.abs().max(1e-30);
        if s2n > best_s2n {
            best_s2n = s2n;
            best_time = obs.time;
        }
    }
    best_time
}

/// Preprocess a single light curve: estimate the reference time, map times
/// onto the integer grid, and fix the per-object flux scale. Idempotent.
pub fn preprocess(light_curve: &LightCurve, settings: &ModelSettings) -> LightCurve {
    if light_curve.meta.preprocessed {
        return light_curve.clone();
    }

    let mut out = light_curve.clone();
    let reference_time = estimate_reference_time(&out.observations);
    let half_window = (settings.time_window / 2) as i64;

    let mut scale: f64 = 0.0;
    for obs in &mut out.observations {
        obs.grid_time = time_to_grid(obs.time, reference_time);
        obs.time_index = obs.grid_time.round() as i64 + half_window;
        if (0..settings.time_window as i64).contains(&obs.time_index) {
            scale = scale.max(obs.flux.abs());
        }
    }

    out.meta.reference_time = reference_time;
    out.meta.scale = scale.max(MIN_SCALE);
    out.meta.preprocessed = true;
    out
}

/// Preprocess a batch of light curves in parallel. Objects are independent,
/// so ordering of the work is irrelevant; results keep the input order.
pub fn preprocess_batch(light_curves: &[LightCurve], settings: &ModelSettings) -> Vec<LightCurve> {
    light_curves
        .par_iter()
        .map(|lc| preprocess(lc, settings))
        .collect()
}

// ---------------------------------------------------------------------------
// Augmentation
// ---------------------------------------------------------------------------

/// Box-Muller standard normal deviate.
pub(crate) fn normal(rng: &mut SmallRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-10);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Produce a randomly degraded copy of a preprocessed light curve: dropped
/// observations, a shifted time grid, optional extra noise, and a rescaled
/// amplitude. The input is never mutated.
pub fn augment(light_curve: &LightCurve, settings: &ModelSettings, rng: &mut SmallRng) -> LightCurve {
    let mut out = light_curve.clone();

    // Randomly drop observations.
    let drop_frac = 0.5 * rng.random::<f64>();
    out.observations.retain(|_| rng.random::<f64>() > drop_frac);

    // Shift the time grid by a whole number of bins.
    let time_shift = (settings.time_sigma * normal(rng)).round() as i64;
    out.meta.reference_time += time_shift as f64 / SIDEREAL_SCALE;
    for obs in &mut out.observations {
        obs.grid_time -= time_shift as f64;
        obs.time_index -= time_shift;
    }

    // Half of the time, degrade the photometry with extra noise drawn from a
    // lognormal scale hierarchy.
    if rng.random::<f64>() < 0.5 && !out.observations.is_empty() {
        let noise_scale = (-4.0 + normal(rng)).exp() * out.meta.scale;
        for obs in &mut out.observations {
            let sigma = (noise_scale.ln() + normal(rng)).exp();
            obs.flux += sigma * normal(rng);
            obs.flux_error = (obs.flux_error * obs.flux_error + sigma * sigma).sqrt();
        }
    }

    // Rescale the amplitude seen by the model.
    out.meta.scale *= (0.5 * normal(rng)).exp();

    out
}
