use ndarray::{Array2, Array3};

use crate::bandpass::{find_band, Bandpass, HC_ERG_AA};
use crate::error::Error;
use crate::settings::ModelSettings;

/// Internal magnitude offset applied to the stored weights so they come out
/// O(1) for typical transient fluxes.
const WEIGHT_MAG_OFFSET: f64 = -20.0;

/// Precomputed per-band photometric sampling kernels over a padded
/// log-wavelength grid, plus everything needed to interpolate them to an
/// arbitrary redshift.
///
/// Working in log wavelength means a redshift is a pure index shift: a
/// spectrum redshifted by z samples the band kernel `log10(1+z)/spacing`
/// fine-grid steps redward of its rest-frame location. The table is built
/// once per model configuration and is immutable afterwards.
#[derive(Clone, Debug)]
pub struct BandWeightTable {
    /// Band kernels on the padded fine grid, shape (n_bands, n_grid).
    weights: Array2<f64>,
    /// Fine-grid index of each spectrum bin at redshift zero.
    base_locations: Vec<usize>,
    /// Log-wavelength spacing of the fine grid.
    spacing: f64,
    max_redshift: f64,
    /// Rest-frame model wavelength grid in Angstroms.
    model_wave: Vec<f64>,
}

impl BandWeightTable {
    /// Build the table for the configured band list.
    ///
    /// The padded grid is sized so that every redshift up to
    /// `settings.max_redshift` stays in range; larger redshifts are rejected
    /// at interpolation time rather than wrapping silently.
    pub fn build(available: &[Bandpass], settings: &ModelSettings) -> Result<Self, Error> {
        if settings.band_oversampling % 2 == 0 {
            return Err(Error::EvenOversampling(settings.band_oversampling));
        }

        let n_bins = settings.spectrum_bins;
        let log_min = settings.min_wave.log10();
        let log_max = settings.max_wave.log10();
        let model_spacing = (log_max - log_min) / (n_bins - 1) as f64;
        let model_wave: Vec<f64> = (0..n_bins)
            .map(|i| 10f64.powf(log_min + i as f64 * model_spacing))
            .collect();

        let oversampling = settings.band_oversampling;
        let band_spacing = model_spacing / oversampling as f64;
        let pad = (oversampling - 1) / 2;

        // Fine grid reaching past the reddest observer-frame wavelength.
        let band_max_log_wave =
            (settings.max_wave * (1.0 + settings.max_redshift)).log10() + band_spacing;
        let n_grid = ((band_max_log_wave - log_min) / band_spacing).ceil() as usize + 1;
        let n_padded = n_grid + 2 * pad;

        // Transmission sample points and bin widths on the padded grid.
        let pad_log_wave: Vec<f64> = (0..n_padded)
            .map(|i| log_min + (i as f64 - pad as f64) * band_spacing)
            .collect();
        let pad_dwave: Vec<f64> = pad_log_wave
            .iter()
            .map(|&lw| 10f64.powf(lw + band_spacing / 2.0) - 10f64.powf(lw - band_spacing / 2.0))
            .collect();

        let mut weights = Array2::<f64>::zeros((settings.bands.len(), n_grid));
        for (b, band_name) in settings.bands.iter().enumerate() {
            let band = find_band(available, band_name)?;
            let zp = band.ab_zeropoint_flux();

            let integrand: Vec<f64> = pad_log_wave
                .iter()
                .zip(&pad_dwave)
                .map(|(&lw, &dw)| band.at(10f64.powf(lw)) * dw)
                .collect();

            // Boxcar of width `oversampling` in valid mode downsamples the
            // transmission integral back to fine-grid centers; the
            // half-kernel padding keeps the convolution centered.
            for j in 0..n_grid {
                let conv: f64 = integrand[j..j + oversampling].iter().sum();
                let wave = 10f64.powf(log_min + j as f64 * band_spacing);
                weights[[b, j]] =
                    wave * conv / HC_ERG_AA / zp * 10f64.powf(0.4 * WEIGHT_MAG_OFFSET);
            }
        }

        let base_locations: Vec<usize> = (0..n_bins).map(|i| i * oversampling).collect();

        Ok(Self {
            weights,
            base_locations,
            spacing: band_spacing,
            max_redshift: settings.max_redshift,
            model_wave,
        })
    }

    pub fn n_bands(&self) -> usize {
        self.weights.nrows()
    }

    pub fn spectrum_bins(&self) -> usize {
        self.base_locations.len()
    }

    /// Rest-frame model wavelength grid in Angstroms.
    pub fn model_wave(&self) -> &[f64] {
        &self.model_wave
    }

    /// Interpolate the band weights to the given redshifts.
    ///
    /// Returns an array of shape (n_objects, spectrum_bins, n_bands). Each
    /// redshift shifts the sampling location by `log10(1+z)/spacing` fine
    /// grid indices; weights are linearly interpolated between the two
    /// bracketing table entries and corrected by `1/(1+z)` for the
    /// observer-frame contraction of the bandpass.
    pub fn weights(&self, redshifts: &[f64]) -> Result<Array3<f64>, Error> {
        let n_grid = self.weights.ncols();
        let mut out = Array3::<f64>::zeros((
            redshifts.len(),
            self.spectrum_bins(),
            self.n_bands(),
        ));

        for (n, &z) in redshifts.iter().enumerate() {
            if !(0.0..=self.max_redshift).contains(&z) {
                return Err(Error::RedshiftOutOfRange {
                    redshift: z,
                    max_redshift: self.max_redshift,
                });
            }
            let offset = (1.0 + z).log10() / self.spacing;
            let contraction = 1.0 / (1.0 + z);

            for (s, &base) in self.base_locations.iter().enumerate() {
                let loc = base as f64 + offset;
                let idx = loc.floor() as usize;
                if idx + 1 >= n_grid {
                    return Err(Error::RedshiftOutOfRange {
                        redshift: z,
                        max_redshift: self.max_redshift,
                    });
                }
                let frac = loc - idx as f64;
                for b in 0..self.n_bands() {
                    let lo = self.weights[[b, idx]];
                    let hi = self.weights[[b, idx + 1]];
                    out[[n, s, b]] = ((1.0 - frac) * lo + frac * hi) * contraction;
                }
            }
        }

        Ok(out)
    }
}
