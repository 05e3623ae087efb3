use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Kind of convolutional block used in the encoder stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Plain dilated convolution (kernel 5) followed by ReLU.
    Conv1d,
    /// Pair of dilated convolutions (kernel 3) with a residual connection.
    #[default]
    Residual,
}

/// Compute device for a model instance.
///
/// Only the CPU backend is implemented; the accelerator variant exists so
/// that configurations naming one degrade gracefully instead of failing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl Device {
    /// Resolve the requested device to one that is actually available.
    ///
    /// An unavailable accelerator downgrades to a warning and the CPU.
    pub fn resolve(self) -> Device {
        match self {
            Device::Cpu => Device::Cpu,
            Device::Accelerator => {
                warn!("accelerator device not available, falling back to cpu");
                Device::Cpu
            }
        }
    }
}

/// Hyperparameters of the light-curve VAE.
///
/// Defaults match the published model configuration. The settings struct is
/// serializable so that callers can persist it alongside learned parameters;
/// loading must rebuild the band-weight table from `bands` rather than
/// deserializing it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Names of the photometric bands, in channel order.
    pub bands: Vec<String>,

    /// Minimum rest-frame model wavelength in Angstroms.
    pub min_wave: f64,
    /// Maximum rest-frame model wavelength in Angstroms.
    pub max_wave: f64,
    /// Number of bins of the rest-frame spectrum.
    pub spectrum_bins: usize,
    /// Oversampling factor of the band kernels. Must be odd.
    pub band_oversampling: usize,
    /// Largest redshift the band-weight table must support.
    pub max_redshift: f64,

    /// Width of the input time grid in days.
    pub time_window: usize,
    /// Prior scale of the reference-time offset in days.
    pub time_sigma: f64,
    /// Prior scale of the color coefficient.
    pub color_sigma: f64,
    /// Error floor applied to flux uncertainties.
    pub error_floor: f64,

    /// Size of the intrinsic latent space.
    pub latent_size: usize,
    /// Whether the redshift is provided to the encoder as an input channel.
    pub input_redshift: bool,
    /// Output channels of each encoder conv block.
    pub encode_conv_architecture: Vec<usize>,
    /// Dilation of each encoder conv block. Same length as the architecture.
    pub encode_conv_dilations: Vec<usize>,
    /// Block kind used in the encoder conv stack.
    pub encode_block: BlockKind,
    /// 1x1-conv layers shared by both encoder heads.
    pub encode_fc_architecture: Vec<usize>,
    /// 1x1-conv layers of the time-indexing head.
    pub encode_time_architecture: Vec<usize>,
    /// 1x1-conv layers of the latent head before the time max-pool.
    pub encode_latent_prepool_architecture: Vec<usize>,
    /// Fully-connected layers of the latent head after the max-pool.
    pub encode_latent_postpool_architecture: Vec<usize>,
    /// Hidden layers of the spectral decoder MLP.
    pub decode_architecture: Vec<usize>,

    /// Scale of the spectral smoothness penalty.
    pub penalty: f64,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Number of light curves per training batch.
    pub batch_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            bands: Vec::new(),
            min_wave: 1000.0,
            max_wave: 11000.0,
            spectrum_bins: 300,
            band_oversampling: 51,
            max_redshift: 4.0,
            time_window: 300,
            time_sigma: 20.0,
            color_sigma: 0.3,
            error_floor: 0.01,
            latent_size: 3,
            input_redshift: false,
            encode_conv_architecture: vec![40, 80, 120, 160, 200, 200, 200],
            encode_conv_dilations: vec![1, 2, 4, 8, 16, 32, 64],
            encode_block: BlockKind::Residual,
            encode_fc_architecture: vec![200],
            encode_time_architecture: vec![200],
            encode_latent_prepool_architecture: vec![200],
            encode_latent_postpool_architecture: vec![200],
            decode_architecture: vec![40, 80, 160],
            penalty: 1e-3,
            learning_rate: 1e-3,
            batch_size: 128,
        }
    }
}

impl ModelSettings {
    /// Validate the configuration. Fatal problems are reported here once
    /// rather than surfacing as panics deep inside model construction.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bands.is_empty() {
            return Err(Error::NoBands);
        }
        if self.band_oversampling % 2 == 0 {
            return Err(Error::EvenOversampling(self.band_oversampling));
        }
        if self.encode_conv_architecture.len() != self.encode_conv_dilations.len() {
            return Err(Error::MismatchedArchitecture {
                layers: self.encode_conv_architecture.len(),
                dilations: self.encode_conv_dilations.len(),
            });
        }
        // Residual skips are zero-padded when a stage widens; a narrowing
        // stage has no counterpart and must be rejected up front.
        if self.encode_block == BlockKind::Residual {
            let mut channels = self.input_channels();
            for &width in &self.encode_conv_architecture {
                if width < channels {
                    return Err(Error::NarrowingConvStack {
                        from: channels,
                        to: width,
                    });
                }
                channels = width;
            }
        }
        if !(self.min_wave > 0.0 && self.max_wave > self.min_wave) {
            return Err(Error::InvalidWaveRange {
                min_wave: self.min_wave,
                max_wave: self.max_wave,
            });
        }
        for (value, name) in [
            (self.time_window as f64, "time_window"),
            (self.spectrum_bins as f64, "spectrum_bins"),
            (self.time_sigma, "time_sigma"),
            (self.color_sigma, "color_sigma"),
            (self.error_floor, "error_floor"),
            (self.max_redshift, "max_redshift"),
            (self.learning_rate, "learning_rate"),
        ] {
            if value <= 0.0 {
                return Err(Error::NonPositiveSetting(name));
            }
        }
        Ok(())
    }

    /// Number of encoder input channels: flux and weight per band, plus an
    /// optional redshift channel.
    pub fn input_channels(&self) -> usize {
        self.bands.len() * 2 + usize::from(self.input_redshift)
    }
}
