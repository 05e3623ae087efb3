//! Network building blocks: parameter binding, 1-d convolution and linear
//! layers, dilated convolution blocks, and the Adam optimizer that drives
//! training.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::SmallRng;

use crate::autograd::{Gradients, Tape, Var, VarId};
use crate::lightcurve::normal;
use crate::settings::BlockKind;

/// A trainable parameter array plus the tape id it was bound to during the
/// most recent forward pass.
#[derive(Clone, Debug)]
pub struct Param {
    pub value: ArrayD<f64>,
    pub id: Option<VarId>,
}

impl Param {
    pub fn new(value: ArrayD<f64>) -> Self {
        Self { value, id: None }
    }

    /// Register this parameter as a leaf on the tape, remembering the id so
    /// the optimizer can find its gradient after the backward pass.
    pub fn bind(&mut self, tape: &mut Tape) -> Var {
        let var = tape.leaf(self.value.clone());
        self.id = Some(var.id);
        var
    }
}

fn he_init(shape: &[usize], fan_in: usize, rng: &mut SmallRng) -> ArrayD<f64> {
    let std = (2.0 / fan_in as f64).sqrt();
    let n: usize = shape.iter().product();
    let data: Vec<f64> = (0..n).map(|_| std * normal(rng)).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
}

/// Dilated 1-d convolution layer.
#[derive(Clone, Debug)]
pub struct Conv1d {
    pub weight: Param,
    pub bias: Param,
    pub dilation: usize,
    pub padding: usize,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        dilation: usize,
        padding: usize,
        rng: &mut SmallRng,
    ) -> Self {
        Self {
            weight: Param::new(he_init(
                &[out_channels, in_channels, kernel],
                in_channels * kernel,
                rng,
            )),
            bias: Param::new(ArrayD::zeros(IxDyn(&[out_channels]))),
            dilation,
            padding,
        }
    }

    pub fn forward(&mut self, tape: &mut Tape, x: &Var) -> Var {
        let w = self.weight.bind(tape);
        let b = self.bias.bind(tape);
        tape.conv1d(x, &w, &b, self.dilation, self.padding)
    }

    pub fn out_channels(&self) -> usize {
        self.weight.value.shape()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.value.shape()[1]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Fully-connected layer.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut SmallRng) -> Self {
        Self {
            weight: Param::new(he_init(&[out_features, in_features], in_features, rng)),
            bias: Param::new(ArrayD::zeros(IxDyn(&[out_features]))),
        }
    }

    pub fn forward(&mut self, tape: &mut Tape, x: &Var) -> Var {
        let w = self.weight.bind(tape);
        let b = self.bias.bind(tape);
        tape.linear(x, &w, &b)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// One stage of the dilated convolution stack. The residual variant pairs
/// two kernel-3 convolutions with a skip connection, zero-padding the skip
/// channels when the stage widens; the plain variant is a single kernel-5
/// convolution.
#[derive(Clone, Debug)]
pub enum ConvBlock {
    Plain(Conv1d),
    Residual { conv1: Conv1d, conv2: Conv1d },
}

impl ConvBlock {
    pub fn new(
        kind: BlockKind,
        in_channels: usize,
        out_channels: usize,
        dilation: usize,
        rng: &mut SmallRng,
    ) -> Self {
        match kind {
            BlockKind::Conv1d => Self::Plain(Conv1d::new(
                in_channels,
                out_channels,
                5,
                dilation,
                2 * dilation,
                rng,
            )),
            BlockKind::Residual => Self::Residual {
                conv1: Conv1d::new(in_channels, out_channels, 3, dilation, dilation, rng),
                conv2: Conv1d::new(out_channels, out_channels, 3, dilation, dilation, rng),
            },
        }
    }

    pub fn forward(&mut self, tape: &mut Tape, x: &Var) -> Var {
        match self {
            Self::Plain(conv) => {
                let y = conv.forward(tape, x);
                tape.relu(&y)
            }
            Self::Residual { conv1, conv2 } => {
                let in_channels = conv1.in_channels();
                let out_channels = conv1.out_channels();
                let h = conv1.forward(tape, x);
                let h = tape.relu(&h);
                let h = conv2.forward(tape, &h);
                let skip = if in_channels == out_channels {
                    x.clone()
                } else {
                    let shape = x.data.shape();
                    let zeros = tape.leaf(ArrayD::zeros(IxDyn(&[
                        shape[0],
                        out_channels - in_channels,
                        shape[2],
                    ])));
                    tape.concat_axis1(x, &zeros)
                };
                let sum = tape.add(&h, &skip);
                tape.relu(&sum)
            }
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            Self::Plain(conv) => conv.params_mut(),
            Self::Residual { conv1, conv2 } => {
                let mut params = conv1.params_mut();
                params.extend(conv2.params_mut());
                params
            }
        }
    }
}

/// Adam with per-element first and second moment estimates. State is
/// allocated lazily on the first step from the parameter shapes; gradient
/// entries that are not finite are skipped rather than poisoning the
/// moments.
#[derive(Clone, Debug)]
pub struct Adam {
    pub learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: usize,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Apply one update to `params`, looking each parameter's gradient up
    /// by the tape id recorded during the forward pass. The parameter order
    /// must be stable across calls.
    pub fn step(&mut self, params: Vec<&mut Param>, grads: &Gradients) {
        if self.m.is_empty() {
            for p in &params {
                self.m.push(ArrayD::zeros(p.value.raw_dim()));
                self.v.push(ArrayD::zeros(p.value.raw_dim()));
            }
        }
        assert_eq!(params.len(), self.m.len());

        self.t += 1;
        let (beta1, beta2) = (self.beta1, self.beta2);
        let (learning_rate, epsilon) = (self.learning_rate, self.epsilon);
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        for (slot, param) in params.into_iter().enumerate() {
            let grad = match param.id.and_then(|id| grads.get(id)) {
                Some(g) => g,
                None => continue,
            };
            let m = &mut self.m[slot];
            let v = &mut self.v[slot];
            ndarray::Zip::from(&mut param.value)
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|value, m, v, &g| {
                    if !g.is_finite() {
                        return;
                    }
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *value -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn residual_block_pads_skip_channels() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut block = ConvBlock::new(BlockKind::Residual, 2, 5, 4, &mut rng);
        let mut tape = Tape::new();
        let x = tape.leaf(ArrayD::zeros(IxDyn(&[3, 2, 11])));
        let y = block.forward(&mut tape, &x);
        assert_eq!(y.data.shape(), &[3, 5, 11]);
    }

    #[test]
    fn plain_block_preserves_length() {
        let mut rng = SmallRng::seed_from_u64(8);
        let mut block = ConvBlock::new(BlockKind::Conv1d, 4, 4, 16, &mut rng);
        let mut tape = Tape::new();
        let x = tape.leaf(ArrayD::zeros(IxDyn(&[2, 4, 33])));
        let y = block.forward(&mut tape, &x);
        assert_eq!(y.data.shape(), &[2, 4, 33]);
        // ReLU output is non-negative.
        assert!(y.data.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn adam_converges_on_quadratic() {
        // Minimize (x - 3)^2 elementwise.
        let mut param = Param::new(ArrayD::zeros(IxDyn(&[4])));
        let mut adam = Adam::new(0.1);
        for _ in 0..500 {
            let mut tape = Tape::new();
            let x = param.bind(&mut tape);
            let target = ArrayD::from_elem(IxDyn(&[4]), 3.0);
            let diff = tape.mul_fixed(&x, &ArrayD::ones(IxDyn(&[4])));
            let flat = tape.reshape(&diff, &[1, 4]);
            let loss = tape.gaussian_nll(&flat, &target.clone().into_shape_with_order(IxDyn(&[1, 4])).unwrap(), &ArrayD::ones(IxDyn(&[1, 4])));
            let grads = tape.backward(&loss);
            adam.step(vec![&mut param], &grads);
        }
        for &v in param.value.iter() {
            assert!((v - 3.0).abs() < 1e-3, "got {v}");
        }
    }

    #[test]
    fn init_is_deterministic_per_seed() {
        let mut a = SmallRng::seed_from_u64(42);
        let mut b = SmallRng::seed_from_u64(42);
        let la = Linear::new(6, 3, &mut a);
        let lb = Linear::new(6, 3, &mut b);
        assert_eq!(la.weight.value, lb.weight.value);
    }

    #[test]
    fn adam_skips_non_finite_gradients() {
        let mut param = Param::new(ArrayD::from_elem(IxDyn(&[2]), 1.0));
        let mut adam = Adam::new(0.1);
        let mut tape = Tape::new();
        let x = param.bind(&mut tape);
        // Build a gradient with a NaN in one slot by dividing by zero.
        let denom = tape.leaf(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0, 1.0]).unwrap());
        let y = tape.div(&x, &denom);
        let flat = tape.reshape(&y, &[1, 2]);
        let total = tape.weighted_sum_obs(&flat, &ArrayD::ones(IxDyn(&[1, 2])));
        let loss = tape.reshape(&total, &[1]);
        let grads = tape.backward(&loss);
        adam.step(vec![&mut param], &grads);
        // First slot had an infinite gradient and must be untouched.
        assert_eq!(param.value[[0]], 1.0);
        assert!(param.value[[1]] != 1.0);
    }
}
