//! Spectral decoder: maps a latent encoding and rest-frame phases to
//! non-negative model spectra, then projects them through the band weights
//! to predict observed fluxes.

use ndarray::ArrayD;
use rand::rngs::SmallRng;

use crate::autograd::{Tape, Var};
use crate::layers::{Conv1d, Param};
use crate::settings::ModelSettings;

#[derive(Debug)]
pub struct Decoder {
    hidden: Vec<Conv1d>,
    output: Conv1d,
    color_law: Vec<f64>,
    half_window: f64,
}

impl Decoder {
    /// `color_law` is the extinction curve sampled on the model wavelength
    /// grid, so it must have `spectrum_bins` entries.
    pub fn new(settings: &ModelSettings, color_law: Vec<f64>, rng: &mut SmallRng) -> Self {
        let mut channels = settings.latent_size + 1;
        let mut hidden = Vec::new();
        for &width in &settings.decode_architecture {
            hidden.push(Conv1d::new(channels, width, 1, 1, 0, rng));
            channels = width;
        }
        let output = Conv1d::new(channels, settings.spectrum_bins, 1, 1, 0, rng);
        Self {
            hidden,
            output,
            color_law,
            half_window: (settings.time_window / 2) as f64,
        }
    }

    /// Produce rest-frame spectra (batch, spectrum_bins, n_phases) from the
    /// intrinsic encoding (batch, latent_size) and phases (batch, n_phases).
    /// Color and amplitude scalings are optional so that callers can sample
    /// the intrinsic spectra directly.
    pub fn decode_spectra(
        &mut self,
        tape: &mut Tape,
        encoding: &Var,
        phases: &Var,
        color: Option<&Var>,
        amplitude: Option<&Var>,
    ) -> Var {
        let n_phases = phases.data.shape()[1];
        let batch = phases.data.shape()[0];

        let scaled = tape.mul_scalar(phases, 1.0 / self.half_window);
        let phase_channel = tape.reshape(&scaled, &[batch, 1, n_phases]);
        let repeated = tape.repeat_phase(encoding, n_phases);
        let mut features = tape.concat_axis1(&repeated, &phase_channel);

        for layer in &mut self.hidden {
            let y = layer.forward(tape, &features);
            features = tape.tanh(&y);
        }
        let y = self.output.forward(tape, &features);
        let mut spectra = tape.softplus(&y);

        if let Some(color) = color {
            spectra = tape.color_scale(&spectra, color, &self.color_law);
        }
        if let Some(amplitude) = amplitude {
            spectra = tape.row_scale3(&spectra, amplitude);
        }
        spectra
    }

    /// Predict model fluxes for a batch of observations. `times` holds the
    /// grid-scale observation times, `obs_band_weights` the band weights
    /// already gathered per observation (batch, spectrum_bins, n_obs).
    /// Returns the model spectra and the projected fluxes (batch, n_obs).
    #[allow(clippy::too_many_arguments)]
    pub fn decode(
        &mut self,
        tape: &mut Tape,
        encoding: &Var,
        ref_times: &Var,
        color: &Var,
        times: &ArrayD<f64>,
        redshifts: &[f64],
        obs_band_weights: &ArrayD<f64>,
        amplitude: Option<&Var>,
    ) -> (Var, Var) {
        let phases = tape.observation_phases(ref_times, times, redshifts);
        let spectra = self.decode_spectra(tape, encoding, &phases, Some(color), amplitude);
        let flux = tape.project_bands(&spectra, obs_band_weights);
        (spectra, flux)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = Vec::new();
        for layer in &mut self.hidden {
            params.extend(layer.params_mut());
        }
        params.extend(self.output.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use rand::SeedableRng;

    fn tiny_settings() -> ModelSettings {
        ModelSettings {
            bands: vec!["testband".into()],
            spectrum_bins: 10,
            latent_size: 2,
            decode_architecture: vec![6, 6],
            ..ModelSettings::default()
        }
    }

    fn tiny_decoder(seed: u64) -> Decoder {
        let settings = tiny_settings();
        let mut rng = SmallRng::seed_from_u64(seed);
        Decoder::new(&settings, vec![1.0; settings.spectrum_bins], &mut rng)
    }

    #[test]
    fn spectra_are_non_negative() {
        let mut decoder = tiny_decoder(1);
        let mut tape = Tape::new();
        let encoding = tape.leaf(ArrayD::from_elem(IxDyn(&[2, 2]), 0.3));
        let phases = tape.leaf(ArrayD::from_elem(IxDyn(&[2, 5]), -20.0));
        let spectra = decoder.decode_spectra(&mut tape, &encoding, &phases, None, None);
        assert_eq!(spectra.data.shape(), &[2, 10, 5]);
        assert!(spectra.data.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn amplitude_scales_spectra_linearly() {
        let mut decoder = tiny_decoder(2);
        let mut tape = Tape::new();
        let encoding = tape.leaf(ArrayD::from_elem(IxDyn(&[1, 2]), 0.1));
        let phases = tape.leaf(ArrayD::from_elem(IxDyn(&[1, 3]), 5.0));
        let one = tape.leaf(ArrayD::from_elem(IxDyn(&[1]), 1.0));
        let two = tape.leaf(ArrayD::from_elem(IxDyn(&[1]), 2.0));
        let base = decoder.decode_spectra(&mut tape, &encoding, &phases, None, Some(&one));
        let doubled = decoder.decode_spectra(&mut tape, &encoding, &phases, None, Some(&two));
        for (a, b) in base.data.iter().zip(doubled.data.iter()) {
            assert!((2.0 * a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn flux_projection_sums_over_wavelength() {
        let mut decoder = tiny_decoder(3);
        let mut tape = Tape::new();
        let encoding = tape.leaf(ArrayD::from_elem(IxDyn(&[1, 2]), 0.0));
        let ref_times = tape.leaf(ArrayD::from_elem(IxDyn(&[1]), 0.0));
        let color = tape.leaf(ArrayD::from_elem(IxDyn(&[1]), 0.0));
        let times = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![-10.0, 0.0, 10.0, 20.0]).unwrap();
        let weights = ArrayD::from_elem(IxDyn(&[1, 10, 4]), 1.0);
        let (spectra, flux) = decoder.decode(
            &mut tape,
            &encoding,
            &ref_times,
            &color,
            &times,
            &[0.0],
            &weights,
            None,
        );
        for j in 0..4 {
            let mut total = 0.0;
            for k in 0..10 {
                total += spectra.data[[0, k, j]];
            }
            assert!((flux.data[[0, j]] - total).abs() < 1e-10);
        }
    }
}
