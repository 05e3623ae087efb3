use thiserror::Error;

/// Errors raised when building or running a model.
///
/// Configuration problems are fatal at construction time. Runtime numeric
/// degeneracies (zero-weight amplitude denominators, extreme latent samples)
/// are recovered locally and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("band oversampling factor must be odd, got {0}")]
    EvenOversampling(usize),

    #[error("encoder conv architecture has {layers} layers but {dilations} dilations")]
    MismatchedArchitecture { layers: usize, dilations: usize },

    #[error("residual conv stage narrows from {from} to {to} channels")]
    NarrowingConvStack { from: usize, to: usize },

    #[error("wavelength range [{min_wave}, {max_wave}] is invalid")]
    InvalidWaveRange { min_wave: f64, max_wave: f64 },

    #[error("model requires at least one band")]
    NoBands,

    #[error("unknown bandpass '{0}'")]
    UnknownBandpass(String),

    #[error("redshift {redshift} exceeds the configured maximum {max_redshift}")]
    RedshiftOutOfRange { redshift: f64, max_redshift: f64 },

    #[error("light curve '{0}' has not been preprocessed")]
    NotPreprocessed(String),

    #[error("{0} must be positive")]
    NonPositiveSetting(&'static str),
}
