//! The full light-curve variational autoencoder: encoder, reparameterized
//! sampling, spectral decoder, the analytic amplitude posterior, the loss,
//! and the Adam training step.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::debug;

use crate::autograd::{Tape, Var};
use crate::bandpass::{color_law, Bandpass};
use crate::bands::BandWeightTable;
use crate::decoder::Decoder;
use crate::encoder::{Encoder, Encoding};
use crate::error::Error;
use crate::grid::{to_grid, GridBatch};
use crate::layers::{Adam, Param};
use crate::lightcurve::{normal, LightCurve};
use crate::predict::{DistanceModulus, Prediction};
use crate::settings::{Device, ModelSettings};

/// Floor applied to a degenerate amplitude denominator so that objects with
/// no usable observations get amplitude 0 with a very large variance.
const AMPLITUDE_DENOM_FLOOR: f64 = 1e-5;

/// Everything produced by one forward pass. The tape is carried along so
/// the loss terms can be appended to the same graph.
pub struct ForwardResult {
    pub tape: Tape,
    /// Sampled reference-time offsets in grid days, shape (batch,).
    pub ref_times: Var,
    /// Sampled color coefficients, shape (batch,).
    pub color: Var,
    /// Sampled intrinsic latents, shape (batch, latent_size).
    pub encoding: Var,
    pub encoding_mu: Var,
    pub encoding_logvar: Var,
    /// Sampled amplitude, shape (batch,).
    pub amplitude: Var,
    pub amplitude_mu: Var,
    pub amplitude_logvar: Var,
    /// Amplitude-scaled model fluxes, shape (batch, max_obs).
    pub model_flux: Var,
    /// Amplitude-scaled model spectra, shape (batch, spectrum_bins, max_obs).
    pub model_spectra: Var,
    pub obs_time: ArrayD<f64>,
    pub obs_flux: ArrayD<f64>,
    pub obs_fluxerr: ArrayD<f64>,
    pub obs_weight: ArrayD<f64>,
}

/// The four additive loss terms, each already sum-reduced over the batch.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LossComponents {
    pub reconstruction: f64,
    pub kl: f64,
    pub smoothness: f64,
    pub amplitude: f64,
}

impl LossComponents {
    pub fn total(&self) -> f64 {
        self.reconstruction + self.kl + self.smoothness + self.amplitude
    }
}

fn reparameterize(tape: &mut Tape, mu: &Var, logvar: &Var, rng: &mut SmallRng, sample: bool) -> Var {
    if !sample {
        return mu.clone();
    }
    let half = tape.mul_scalar(logvar, 0.5);
    let std = tape.exp(&half);
    let shape = mu.data.raw_dim();
    let eps = ArrayD::from_shape_fn(shape, |_| normal(rng));
    let noise = tape.mul_fixed(&std, &eps);
    tape.add(mu, &noise)
}

#[derive(Debug)]
pub struct LightCurveVae {
    settings: ModelSettings,
    device: Device,
    band_table: BandWeightTable,
    encoder: Encoder,
    decoder: Decoder,
    optimizer: Adam,
    rng: SmallRng,
}

impl LightCurveVae {
    /// Build a model from its configuration and the available bandpass
    /// definitions. `available_bands` must contain every band named in
    /// `settings.bands`.
    pub fn new(
        available_bands: &[Bandpass],
        settings: ModelSettings,
        device: Device,
        seed: u64,
    ) -> Result<Self, Error> {
        settings.validate()?;
        let device = device.resolve();
        let band_table = BandWeightTable::build(available_bands, &settings)?;
        let law = color_law(band_table.model_wave());
        let mut rng = SmallRng::seed_from_u64(seed);
        let encoder = Encoder::new(&settings, &mut rng);
        let decoder = Decoder::new(&settings, law, &mut rng);
        let optimizer = Adam::new(settings.learning_rate);
        Ok(Self {
            settings,
            device,
            band_table,
            encoder,
            decoder,
            optimizer,
            rng,
        })
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn band_table(&self) -> &BandWeightTable {
        &self.band_table
    }

    /// Grid a batch of preprocessed light curves and run the forward pass.
    pub fn forward(&mut self, light_curves: &[LightCurve], sample: bool) -> Result<ForwardResult, Error> {
        let batch = to_grid(light_curves, &self.settings)?;
        self.forward_batch(&batch, sample)
    }

    /// Forward pass over already-gridded tensors.
    pub fn forward_batch(&mut self, batch: &GridBatch, sample: bool) -> Result<ForwardResult, Error> {
        let batch_size = batch.batch_size();
        let n_obs = batch.max_observations();
        let bins = self.band_table.spectrum_bins();

        let mut tape = Tape::new();
        let input = tape.leaf(batch.input.clone().into_dyn());
        let Encoding { mu, logvar } = self.encoder.forward(&mut tape, &input);
        let sampled = reparameterize(&mut tape, &mu, &logvar, &mut self.rng, sample);

        // Split the sample into reference time, color, and intrinsic
        // latents, rescaling the first two by their prior widths. The
        // clamps keep an untrained model from running away numerically.
        let time_sigma = self.settings.time_sigma;
        let color_sigma = self.settings.color_sigma;
        let t = tape.slice_axis1(&sampled, 0, 1);
        let t = tape.reshape(&t, &[batch_size]);
        let t = tape.mul_scalar(&t, time_sigma);
        let ref_times = tape.clamp(&t, Some(-10.0 * time_sigma), Some(10.0 * time_sigma));
        let c = tape.slice_axis1(&sampled, 1, 1);
        let c = tape.reshape(&c, &[batch_size]);
        let c = tape.mul_scalar(&c, color_sigma);
        let color = tape.clamp(&c, Some(-10.0 * color_sigma), Some(10.0 * color_sigma));
        let encoding = tape.slice_axis1(&sampled, 2, self.settings.latent_size);

        // Fixed per-observation data.
        let mut obs_time = ArrayD::zeros(IxDyn(&[batch_size, n_obs]));
        let mut obs_flux = ArrayD::zeros(IxDyn(&[batch_size, n_obs]));
        let mut obs_fluxerr = ArrayD::zeros(IxDyn(&[batch_size, n_obs]));
        let mut obs_weight = ArrayD::zeros(IxDyn(&[batch_size, n_obs]));
        for n in 0..batch_size {
            for j in 0..n_obs {
                obs_time[[n, j]] = batch.compare[[n, 0, j]];
                obs_flux[[n, j]] = batch.compare[[n, 1, j]];
                obs_fluxerr[[n, j]] = batch.compare[[n, 2, j]];
                obs_weight[[n, j]] = batch.compare[[n, 3, j]];
            }
        }

        // Band weights gathered per observation.
        let redshifts = batch.redshifts.to_vec();
        let band_weights = self.band_table.weights(&redshifts)?;
        let mut obs_band_weights = ArrayD::zeros(IxDyn(&[batch_size, bins, n_obs]));
        for n in 0..batch_size {
            for j in 0..n_obs {
                let band = batch.band_indices[[n, j]];
                for k in 0..bins {
                    obs_band_weights[[n, k, j]] = band_weights[[n, k, band]];
                }
            }
        }

        let (spectra, flux) = self.decoder.decode(
            &mut tape,
            &encoding,
            &ref_times,
            &color,
            &obs_time,
            &redshifts,
            &obs_band_weights,
            None,
        );

        // Closed-form weighted-least-squares posterior for the amplitude.
        let weighted_flux = &obs_weight * &obs_flux;
        let num = tape.weighted_sum_obs(&flux, &weighted_flux);
        let flux_sq = tape.square(&flux);
        let denom = tape.weighted_sum_obs(&flux_sq, &obs_weight);
        let degenerate = denom.data.iter().filter(|&&v| v == 0.0).count();
        if degenerate > 0 {
            debug!(objects = degenerate, "floored degenerate amplitude denominators");
        }
        let denom = tape.floor_zero(&denom, AMPLITUDE_DENOM_FLOOR);
        let amplitude_mu = tape.div(&num, &denom);
        let log_denom = tape.log(&denom);
        let amplitude_logvar = tape.neg(&log_denom);
        let amplitude = reparameterize(
            &mut tape,
            &amplitude_mu,
            &amplitude_logvar,
            &mut self.rng,
            sample,
        );

        let model_flux = tape.row_scale2(&flux, &amplitude);
        let model_spectra = tape.row_scale3(&spectra, &amplitude);

        Ok(ForwardResult {
            tape,
            ref_times,
            color,
            encoding,
            encoding_mu: mu,
            encoding_logvar: logvar,
            amplitude,
            amplitude_mu,
            amplitude_logvar,
            model_flux,
            model_spectra,
            obs_time,
            obs_flux,
            obs_fluxerr,
            obs_weight,
        })
    }

    /// Append the loss terms to the forward graph. Returns the scalar total
    /// as a tape variable along with the individual component values.
    pub fn loss(&self, result: &mut ForwardResult) -> (Var, LossComponents) {
        let tape = &mut result.tape;
        let nll = tape.gaussian_nll(&result.model_flux, &result.obs_flux, &result.obs_weight);
        let kld = tape.kl_divergence(&result.encoding_mu, &result.encoding_logvar);
        let smooth = tape.smoothness_penalty(&result.model_spectra, self.settings.penalty);
        let amp = tape.amplitude_importance(
            &result.amplitude,
            &result.amplitude_mu,
            &result.amplitude_logvar,
        );
        let components = LossComponents {
            reconstruction: nll.data[[0]],
            kl: kld.data[[0]],
            smoothness: smooth.data[[0]],
            amplitude: amp.data[[0]],
        };
        let total = tape.add(&nll, &kld);
        let total = tape.add(&total, &smooth);
        let total = tape.add(&total, &amp);
        (total, components)
    }

    /// One atomic optimization step: forward, loss, backward, Adam update.
    pub fn train_step(&mut self, light_curves: &[LightCurve]) -> Result<LossComponents, Error> {
        let batch = to_grid(light_curves, &self.settings)?;
        self.train_step_batch(&batch)
    }

    pub fn train_step_batch(&mut self, batch: &GridBatch) -> Result<LossComponents, Error> {
        let mut result = self.forward_batch(batch, true)?;
        let (total, components) = self.loss(&mut result);
        let grads = result.tape.backward(&total);
        let mut params: Vec<&mut Param> = self.encoder.params_mut();
        params.extend(self.decoder.params_mut());
        self.optimizer.step(params, &grads);
        Ok(components)
    }

    /// Mean loss per light curve over a dataset. The model is stochastic,
    /// so averaging over several rounds reduces the noise of the estimate.
    pub fn score(&mut self, light_curves: &[LightCurve], rounds: usize) -> Result<f64, Error> {
        let mut total_loss = 0.0;
        let mut total_count = 0usize;
        for _ in 0..rounds.max(1) {
            for chunk in light_curves.chunks(self.settings.batch_size.max(1)) {
                let mut result = self.forward(chunk, true)?;
                let (_, components) = self.loss(&mut result);
                total_loss += components.total();
                total_count += chunk.len();
            }
        }
        Ok(total_loss / total_count.max(1) as f64)
    }

    /// Summarize each light curve with the posterior means of the latent
    /// variables plus data-quality statistics. Runs without sampling.
    pub fn predict(
        &mut self,
        light_curves: &[LightCurve],
        distance: &dyn DistanceModulus,
    ) -> Result<Vec<Prediction>, Error> {
        let mut predictions = Vec::with_capacity(light_curves.len());
        for chunk in light_curves.chunks(self.settings.batch_size.max(1)) {
            let result = self.forward(chunk, false)?;
            for (n, light_curve) in chunk.iter().enumerate() {
                predictions.push(Prediction::from_forward(
                    light_curve,
                    &self.settings,
                    &result,
                    n,
                    distance,
                ));
            }
        }
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightcurve::{preprocess, Observation};
    use crate::settings::BlockKind;

    fn box_band(name: &str, center: f64, width: f64) -> Bandpass {
        Bandpass::new(
            name,
            vec![center - width, center - 0.9 * width, center + 0.9 * width, center + width],
            vec![0.0, 0.5, 0.5, 0.0],
        )
    }

    fn tiny_settings() -> ModelSettings {
        ModelSettings {
            bands: vec!["tb::a".into(), "tb::b".into()],
            spectrum_bins: 16,
            band_oversampling: 3,
            time_window: 31,
            encode_conv_architecture: vec![4],
            encode_conv_dilations: vec![1],
            encode_block: BlockKind::Residual,
            encode_fc_architecture: vec![6],
            encode_time_architecture: vec![6],
            encode_latent_prepool_architecture: vec![6],
            encode_latent_postpool_architecture: vec![6],
            decode_architecture: vec![6],
            latent_size: 2,
            ..ModelSettings::default()
        }
    }

    fn tiny_bands() -> Vec<Bandpass> {
        vec![box_band("tb::a", 4500.0, 500.0), box_band("tb::b", 6500.0, 500.0)]
    }

    fn tiny_model() -> LightCurveVae {
        LightCurveVae::new(&tiny_bands(), tiny_settings(), Device::Cpu, 11).unwrap()
    }

    fn sample_light_curve(settings: &ModelSettings) -> LightCurve {
        let observations = (0..8)
            .map(|i| Observation::new(59000.0 + i as f64 * 3.0, i % 2, 10.0 + i as f64, 1.0))
            .collect();
        preprocess(&LightCurve::new("obj1", 0.1, observations), settings)
    }

    #[test]
    fn unknown_band_rejected_at_build() {
        let settings = ModelSettings {
            bands: vec!["missing".into()],
            ..tiny_settings()
        };
        let err = LightCurveVae::new(&tiny_bands(), settings, Device::Cpu, 0).unwrap_err();
        assert!(matches!(err, Error::UnknownBandpass(_)));
    }

    #[test]
    fn invalid_settings_rejected_at_build() {
        let settings = ModelSettings {
            band_oversampling: 4,
            ..tiny_settings()
        };
        assert!(LightCurveVae::new(&tiny_bands(), settings, Device::Cpu, 0).is_err());
    }

    #[test]
    fn narrowing_residual_stack_rejected_at_build() {
        let settings = ModelSettings {
            encode_conv_architecture: vec![8, 4],
            encode_conv_dilations: vec![1, 2],
            ..tiny_settings()
        };
        let err = LightCurveVae::new(&tiny_bands(), settings, Device::Cpu, 0).unwrap_err();
        assert!(matches!(err, Error::NarrowingConvStack { from: 8, to: 4 }));
    }

    #[test]
    fn forward_shapes_are_consistent() {
        let mut model = tiny_model();
        let lc = sample_light_curve(model.settings());
        let result = model.forward(&[lc], true).unwrap();
        let n_obs = result.obs_flux.shape()[1];
        assert_eq!(result.model_flux.data.shape(), &[1, n_obs]);
        assert_eq!(result.model_spectra.data.shape(), &[1, 16, n_obs]);
        assert_eq!(result.encoding.data.shape(), &[1, 2]);
        assert_eq!(result.amplitude.data.shape(), &[1]);
    }

    #[test]
    fn loss_components_sum_to_total() {
        let mut model = tiny_model();
        let lc = sample_light_curve(model.settings());
        let mut result = model.forward(&[lc], true).unwrap();
        let (total, components) = model.loss(&mut result);
        assert!((total.data[[0]] - components.total()).abs() < 1e-9);
    }

    #[test]
    fn sampled_time_and_color_respect_clamps() {
        let mut model = tiny_model();
        let lc = sample_light_curve(model.settings());
        let result = model.forward(&[lc], true).unwrap();
        let ts = model.settings().time_sigma;
        let cs = model.settings().color_sigma;
        assert!(result.ref_times.data[[0]].abs() <= 10.0 * ts);
        assert!(result.color.data[[0]].abs() <= 10.0 * cs);
    }
}
