//! Encoder network: a dilated convolution stack over the gridded input
//! followed by a soft-argmax time head and a max-pooled latent head.

use rand::rngs::SmallRng;

use crate::autograd::{Tape, Var};
use crate::layers::{Conv1d, ConvBlock, Linear, Param};
use crate::settings::ModelSettings;

pub const LOGVAR_CLAMP: f64 = 5.0;

/// Variational posterior over the per-object encoding. `mu` and `logvar`
/// are both (batch, latent_size + 2): reference-time offset first, then
/// color, then the intrinsic latents.
pub struct Encoding {
    pub mu: Var,
    pub logvar: Var,
}

#[derive(Debug)]
pub struct Encoder {
    conv_blocks: Vec<ConvBlock>,
    fc_layers: Vec<Conv1d>,
    time_layers: Vec<Conv1d>,
    time_final: Conv1d,
    prepool_layers: Vec<Conv1d>,
    postpool_layers: Vec<Linear>,
    mu_layer: Linear,
    logvar_layer: Linear,
    input_times: Vec<f64>,
    time_sigma: f64,
}

fn conv1x1(in_channels: usize, out_channels: usize, rng: &mut SmallRng) -> Conv1d {
    Conv1d::new(in_channels, out_channels, 1, 1, 0, rng)
}

impl Encoder {
    pub fn new(settings: &ModelSettings, rng: &mut SmallRng) -> Self {
        let mut channels = settings.input_channels();
        let mut conv_blocks = Vec::new();
        for (&width, &dilation) in settings
            .encode_conv_architecture
            .iter()
            .zip(&settings.encode_conv_dilations)
        {
            conv_blocks.push(ConvBlock::new(
                settings.encode_block,
                channels,
                width,
                dilation,
                rng,
            ));
            channels = width;
        }

        let mut fc_layers = Vec::new();
        for &width in &settings.encode_fc_architecture {
            fc_layers.push(conv1x1(channels, width, rng));
            channels = width;
        }

        let mut time_channels = channels;
        let mut time_layers = Vec::new();
        for &width in &settings.encode_time_architecture {
            time_layers.push(conv1x1(time_channels, width, rng));
            time_channels = width;
        }
        let time_final = conv1x1(time_channels, 1, rng);

        let mut pool_channels = channels;
        let mut prepool_layers = Vec::new();
        for &width in &settings.encode_latent_prepool_architecture {
            prepool_layers.push(conv1x1(pool_channels, width, rng));
            pool_channels = width;
        }

        let mut post_features = pool_channels;
        let mut postpool_layers = Vec::new();
        for &width in &settings.encode_latent_postpool_architecture {
            postpool_layers.push(Linear::new(post_features, width, rng));
            post_features = width;
        }

        let mu_layer = Linear::new(post_features, settings.latent_size + 1, rng);
        let logvar_layer = Linear::new(post_features, settings.latent_size + 2, rng);

        let half_window = (settings.time_window / 2) as f64;
        let input_times: Vec<f64> = (0..settings.time_window)
            .map(|i| i as f64 - half_window)
            .collect();

        Self {
            conv_blocks,
            fc_layers,
            time_layers,
            time_final,
            prepool_layers,
            postpool_layers,
            mu_layer,
            logvar_layer,
            input_times,
            time_sigma: settings.time_sigma,
        }
    }

    /// Encode a gridded batch (batch, input_channels, time_window) into the
    /// posterior parameters.
    pub fn forward(&mut self, tape: &mut Tape, input: &Var) -> Encoding {
        let mut features = input.clone();
        for block in &mut self.conv_blocks {
            features = block.forward(tape, &features);
        }
        for layer in &mut self.fc_layers {
            let y = layer.forward(tape, &features);
            features = tape.relu(&y);
        }

        // Soft-argmax over the time axis gives the reference-time offset.
        let mut time = features.clone();
        for layer in &mut self.time_layers {
            let y = layer.forward(tape, &time);
            time = tape.relu(&y);
        }
        let logits = self.time_final.forward(tape, &time);
        let batch = logits.data.shape()[0];
        let window = logits.data.shape()[2];
        let logits = tape.reshape(&logits, &[batch, window]);
        let attention = tape.softmax(&logits);
        let time_offset = tape.dot_fixed(&attention, &self.input_times);
        let time_mu = tape.mul_scalar(&time_offset, 1.0 / self.time_sigma);
        let time_mu = tape.reshape(&time_mu, &[batch, 1]);

        let mut latent = features;
        for layer in &mut self.prepool_layers {
            let y = layer.forward(tape, &latent);
            latent = tape.relu(&y);
        }
        let mut pooled = tape.max_pool_time(&latent);
        for layer in &mut self.postpool_layers {
            let y = layer.forward(tape, &pooled);
            pooled = tape.relu(&y);
        }

        let latent_mu = self.mu_layer.forward(tape, &pooled);
        let logvar = self.logvar_layer.forward(tape, &pooled);
        let logvar = tape.clamp(&logvar, None, Some(LOGVAR_CLAMP));

        let mu = tape.concat_axis1(&time_mu, &latent_mu);
        Encoding { mu, logvar }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = Vec::new();
        for block in &mut self.conv_blocks {
            params.extend(block.params_mut());
        }
        for layer in &mut self.fc_layers {
            params.extend(layer.params_mut());
        }
        for layer in &mut self.time_layers {
            params.extend(layer.params_mut());
        }
        params.extend(self.time_final.params_mut());
        for layer in &mut self.prepool_layers {
            params.extend(layer.params_mut());
        }
        for layer in &mut self.postpool_layers {
            params.extend(layer.params_mut());
        }
        params.extend(self.mu_layer.params_mut());
        params.extend(self.logvar_layer.params_mut());
        params
    }
}
