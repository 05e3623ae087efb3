pub mod autograd;
pub mod bandpass;
pub mod bands;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod grid;
pub mod layers;
pub mod lightcurve;
pub mod model;
pub mod predict;
pub mod settings;

pub use bandpass::{color_law, find_band, Bandpass};
pub use bands::BandWeightTable;
pub use error::Error;
pub use grid::{to_grid, GridBatch};
pub use lightcurve::{augment, preprocess, preprocess_batch, LightCurve, ObjectMeta, Observation};
pub use model::{ForwardResult, LightCurveVae, LossComponents};
pub use predict::{DistanceModulus, Prediction};
pub use settings::{BlockKind, Device, ModelSettings};
