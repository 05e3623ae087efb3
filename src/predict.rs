//! Per-object prediction records: posterior means and uncertainties of the
//! latent variables plus data-quality statistics derived from the
//! observations themselves.

use serde::{Deserialize, Serialize};

use crate::lightcurve::LightCurve;
use crate::model::ForwardResult;
use crate::settings::ModelSettings;

/// Half-width in days of the rise/fall phase windows around the inferred
/// reference time.
const PHASE_WINDOW: f64 = 50.0;

/// Source of distance moduli, normally backed by a cosmology. Injected so
/// the model crate does not pick a cosmology for its callers.
pub trait DistanceModulus {
    fn distance_modulus(&self, redshift: f64) -> f64;
}

/// Symmetrized magnitude difference equivalent to a fractional flux
/// difference.
fn frac_to_mag(frac: f64) -> f64 {
    0.5 * (2.5 * (1.0 + frac).log10() - 2.5 * (1.0 - frac).log10())
}

fn finite_or_none(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Summary of a single light curve under the trained model.
///
/// `reference_time` is the inferred offset from the preprocessing reference
/// time, in grid days; the amplitude is in the flux units of the input
/// observations. Latent entries are ordered as configured.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prediction {
    pub object_id: String,
    pub redshift: f64,

    pub reference_time: f64,
    pub reference_time_error: f64,
    pub color: f64,
    pub color_error: f64,
    pub amplitude: f64,
    pub amplitude_error: f64,
    pub latents: Vec<f64>,
    pub latent_errors: Vec<f64>,

    /// Quadrature sum of per-observation signal-to-noise.
    pub total_s2n: f64,
    /// Number of in-window observations.
    pub count: usize,
    pub count_s2n_3: usize,
    pub count_s2n_5: usize,
    /// S/N > 3 counts per phase window relative to the reference time.
    pub count_s2n_3_pre: usize,
    pub count_s2n_3_rise: usize,
    pub count_s2n_3_fall: usize,
    pub count_s2n_3_post: usize,

    /// Absolute luminosity assuming a zeropoint of 25, None when the
    /// amplitude is non-positive.
    pub luminosity: Option<f64>,
    pub luminosity_error: Option<f64>,
}

impl Prediction {
    /// Build the record for object `index` of a (non-sampling) forward
    /// result.
    pub fn from_forward(
        light_curve: &LightCurve,
        settings: &ModelSettings,
        result: &ForwardResult,
        index: usize,
        distance: &dyn DistanceModulus,
    ) -> Self {
        let mu = &result.encoding_mu.data;
        let err: Vec<f64> = (0..settings.latent_size + 2)
            .map(|k| (0.5 * result.encoding_logvar.data[[index, k]]).exp())
            .collect();

        let reference_time = mu[[index, 0]] * settings.time_sigma;
        let reference_time_error = err[0] * settings.time_sigma;
        let color = mu[[index, 1]] * settings.color_sigma;
        let color_error = err[1] * settings.color_sigma;
        let latents: Vec<f64> = (0..settings.latent_size)
            .map(|k| mu[[index, 2 + k]])
            .collect();
        let latent_errors: Vec<f64> = err[2..].to_vec();

        // The fit works on fluxes normalized by the per-object scale, so the
        // physical amplitude carries that scale back in.
        let scale = light_curve.meta.scale;
        let amplitude = result.amplitude_mu.data[[index]] * scale;
        let amplitude_error = (0.5 * result.amplitude_logvar.data[[index]]).exp() * scale;

        // Data-quality statistics. Padded comparison columns carry a zero
        // flux error and are excluded everywhere.
        let n_obs = result.obs_flux.shape()[1];
        let mut total_s2n_sq = 0.0;
        let mut count = 0;
        let mut count_s2n_3 = 0;
        let mut count_s2n_5 = 0;
        let mut windows = [0usize; 4];
        for j in 0..n_obs {
            let fluxerr = result.obs_fluxerr[[index, j]];
            if fluxerr == 0.0 {
                continue;
            }
            count += 1;
            let s2n = result.obs_flux[[index, j]] / fluxerr;
            total_s2n_sq += s2n * s2n;
            if s2n > 3.0 {
                count_s2n_3 += 1;
                let time = result.obs_time[[index, j]];
                let slot = if time < reference_time - PHASE_WINDOW {
                    0
                } else if time < reference_time {
                    1
                } else if time < reference_time + PHASE_WINDOW {
                    2
                } else {
                    3
                };
                windows[slot] += 1;
            }
            if s2n > 5.0 {
                count_s2n_5 += 1;
            }
        }

        let redshift = light_curve.meta.redshift;
        let (luminosity, luminosity_error) = if amplitude > 0.0 {
            let lum = -2.5 * amplitude.log10() + 25.0 - distance.distance_modulus(redshift);
            let frac = (amplitude_error / amplitude).min(0.5);
            (finite_or_none(lum), finite_or_none(frac_to_mag(frac)))
        } else {
            (None, None)
        };

        Self {
            object_id: light_curve.meta.object_id.clone(),
            redshift,
            reference_time,
            reference_time_error,
            color,
            color_error,
            amplitude,
            amplitude_error,
            latents,
            latent_errors,
            total_s2n: total_s2n_sq.sqrt(),
            count,
            count_s2n_3,
            count_s2n_5,
            count_s2n_3_pre: windows[0],
            count_s2n_3_rise: windows[1],
            count_s2n_3_fall: windows[2],
            count_s2n_3_post: windows[3],
            luminosity,
            luminosity_error,
        }
    }
}
