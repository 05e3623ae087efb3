//! Explicit-tape reverse-mode automatic differentiation over `ndarray` data.
//!
//! A [`Tape`] is created per forward pass and records one node per
//! operation; [`Tape::backward`] walks the tape in reverse, accumulating
//! gradients per variable id. There is no global or thread-local graph
//! state: the tape is threaded explicitly through the code that builds
//! the computation.
//!
//! The op set is exactly what the light-curve model needs. Fixed inputs
//! (observation data, band weights, the time axis) enter ops as plain
//! arrays captured by the backward closures, so no gradients are ever
//! computed for them.

use ndarray::{ArrayD, IxDyn};

pub type VarId = usize;

/// A value in the computation graph: an id on the tape plus owned data.
#[derive(Clone, Debug)]
pub struct Var {
    pub id: VarId,
    pub data: ArrayD<f64>,
}

type BackwardFn = Box<dyn Fn(&ArrayD<f64>) -> Vec<(VarId, ArrayD<f64>)>>;

struct Node {
    output: VarId,
    backward: BackwardFn,
}

/// Gradients of every tape variable after a backward pass, indexed by id.
pub struct Gradients {
    slots: Vec<Option<ArrayD<f64>>>,
}

impl Gradients {
    pub fn get(&self, id: VarId) -> Option<&ArrayD<f64>> {
        self.slots.get(id).and_then(|g| g.as_ref())
    }
}

/// Records operations during a forward pass.
pub struct Tape {
    nodes: Vec<Node>,
    n_vars: usize,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

fn reshaped(data: &ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    let flat: Vec<f64> = data.iter().copied().collect();
    assert_eq!(flat.len(), shape.iter().product::<usize>());
    ArrayD::from_shape_vec(IxDyn(shape), flat).unwrap()
}

impl Tape {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            n_vars: 0,
        }
    }

    fn fresh_id(&mut self) -> VarId {
        let id = self.n_vars;
        self.n_vars += 1;
        id
    }

    fn push(&mut self, data: ArrayD<f64>, backward: BackwardFn) -> Var {
        let id = self.fresh_id();
        self.nodes.push(Node {
            output: id,
            backward,
        });
        Var { id, data }
    }

    /// Register a leaf variable (parameter or differentiable input).
    pub fn leaf(&mut self, data: ArrayD<f64>) -> Var {
        let id = self.fresh_id();
        Var { id, data }
    }

    /// Run the backward pass from a variable (normally the scalar loss).
    pub fn backward(&self, output: &Var) -> Gradients {
        let mut slots: Vec<Option<ArrayD<f64>>> = vec![None; self.n_vars];
        slots[output.id] = Some(ArrayD::ones(output.data.raw_dim()));

        for node in self.nodes.iter().rev() {
            let grad_out = match &slots[node.output] {
                Some(g) => g.clone(),
                None => continue,
            };
            for (id, grad) in (node.backward)(&grad_out) {
                match &mut slots[id] {
                    Some(existing) => *existing += &grad,
                    slot => *slot = Some(grad),
                }
            }
        }

        Gradients { slots }
    }

    // -----------------------------------------------------------------------
    // Elementwise ops
    // -----------------------------------------------------------------------

    pub fn add(&mut self, a: &Var, b: &Var) -> Var {
        assert_eq!(a.data.shape(), b.data.shape());
        let (ida, idb) = (a.id, b.id);
        self.push(
            &a.data + &b.data,
            Box::new(move |g| vec![(ida, g.clone()), (idb, g.clone())]),
        )
    }

    pub fn div(&mut self, a: &Var, b: &Var) -> Var {
        assert_eq!(a.data.shape(), b.data.shape());
        let (ida, idb) = (a.id, b.id);
        let (da, db) = (a.data.clone(), b.data.clone());
        self.push(
            &a.data / &b.data,
            Box::new(move |g| {
                let ga = g / &db;
                let gb = -(g * &da) / (&db * &db);
                vec![(ida, ga), (idb, gb)]
            }),
        )
    }

    pub fn mul_scalar(&mut self, a: &Var, c: f64) -> Var {
        let ida = a.id;
        self.push(a.data.mapv(|v| v * c), Box::new(move |g| vec![(ida, g * c)]))
    }

    /// Elementwise product with a fixed (non-differentiated) array.
    pub fn mul_fixed(&mut self, a: &Var, fixed: &ArrayD<f64>) -> Var {
        assert_eq!(a.data.shape(), fixed.shape());
        let ida = a.id;
        let f = fixed.clone();
        self.push(&a.data * fixed, Box::new(move |g| vec![(ida, g * &f)]))
    }

    pub fn relu(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let mask = a.data.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        self.push(
            a.data.mapv(|v| v.max(0.0)),
            Box::new(move |g| vec![(ida, g * &mask)]),
        )
    }

    pub fn tanh(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let y = a.data.mapv(f64::tanh);
        let saved = y.clone();
        self.push(
            y,
            Box::new(move |g| vec![(ida, g * &saved.mapv(|v| 1.0 - v * v))]),
        )
    }

    pub fn softplus(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let y = a.data.mapv(|v| {
            if v > 30.0 {
                v
            } else if v < -30.0 {
                v.exp()
            } else {
                v.exp().ln_1p()
            }
        });
        let sigmoid = a.data.mapv(|v| 1.0 / (1.0 + (-v).exp()));
        self.push(y, Box::new(move |g| vec![(ida, g * &sigmoid)]))
    }

    pub fn exp(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let y = a.data.mapv(f64::exp);
        let saved = y.clone();
        self.push(y, Box::new(move |g| vec![(ida, g * &saved)]))
    }

    pub fn log(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let da = a.data.clone();
        self.push(
            a.data.mapv(f64::ln),
            Box::new(move |g| vec![(ida, g / &da)]),
        )
    }

    pub fn square(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let da = a.data.clone();
        self.push(
            a.data.mapv(|v| v * v),
            Box::new(move |g| vec![(ida, g * &da.mapv(|v| 2.0 * v))]),
        )
    }

    pub fn neg(&mut self, a: &Var) -> Var {
        let ida = a.id;
        self.push(a.data.mapv(|v| -v), Box::new(move |g| vec![(ida, -g)]))
    }

    /// Clamp with straight-through gradients inside the bounds and zero
    /// gradient where the value was clamped.
    pub fn clamp(&mut self, a: &Var, min: Option<f64>, max: Option<f64>) -> Var {
        let ida = a.id;
        let lo = min.unwrap_or(f64::NEG_INFINITY);
        let hi = max.unwrap_or(f64::INFINITY);
        let mask = a
            .data
            .mapv(|v| if (lo..=hi).contains(&v) { 1.0 } else { 0.0 });
        self.push(
            a.data.mapv(|v| v.clamp(lo, hi)),
            Box::new(move |g| vec![(ida, g * &mask)]),
        )
    }

    /// Replace exact zeros with `eps`, cutting the gradient on replaced
    /// entries. Used to floor degenerate amplitude denominators.
    pub fn floor_zero(&mut self, a: &Var, eps: f64) -> Var {
        let ida = a.id;
        let mask = a.data.mapv(|v| if v == 0.0 { 0.0 } else { 1.0 });
        self.push(
            a.data.mapv(|v| if v == 0.0 { eps } else { v }),
            Box::new(move |g| vec![(ida, g * &mask)]),
        )
    }

    // -----------------------------------------------------------------------
    // Shape ops
    // -----------------------------------------------------------------------

    pub fn reshape(&mut self, a: &Var, shape: &[usize]) -> Var {
        let ida = a.id;
        let original: Vec<usize> = a.data.shape().to_vec();
        self.push(
            reshaped(&a.data, shape),
            Box::new(move |g| vec![(ida, reshaped(g, &original))]),
        )
    }

    /// Concatenate along axis 1. Works for both 2-d and 3-d inputs.
    pub fn concat_axis1(&mut self, a: &Var, b: &Var) -> Var {
        let (ida, idb) = (a.id, b.id);
        let na = a.data.shape()[1];
        let nb = b.data.shape()[1];
        let out = ndarray::concatenate(
            ndarray::Axis(1),
            &[a.data.view(), b.data.view()],
        )
        .unwrap();
        self.push(
            out,
            Box::new(move |g| {
                let ga = g
                    .slice_axis(ndarray::Axis(1), ndarray::Slice::from(0..na))
                    .to_owned();
                let gb = g
                    .slice_axis(ndarray::Axis(1), ndarray::Slice::from(na..na + nb))
                    .to_owned();
                vec![(ida, ga), (idb, gb)]
            }),
        )
    }

    /// Slice `len` entries starting at `start` along axis 1.
    pub fn slice_axis1(&mut self, a: &Var, start: usize, len: usize) -> Var {
        let ida = a.id;
        let full_shape: Vec<usize> = a.data.shape().to_vec();
        let out = a
            .data
            .slice_axis(ndarray::Axis(1), ndarray::Slice::from(start..start + len))
            .to_owned();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::zeros(IxDyn(&full_shape));
                grad.slice_axis_mut(
                    ndarray::Axis(1),
                    ndarray::Slice::from(start..start + len),
                )
                .assign(g);
                vec![(ida, grad)]
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Network ops
    // -----------------------------------------------------------------------

    /// Dilated 1-d convolution with symmetric zero padding.
    ///
    /// `x` is (batch, in_channels, t), `weight` is (out_channels,
    /// in_channels, kernel), `bias` is (out_channels,). The output length is
    /// `t + 2*padding - dilation*(kernel-1)`.
    pub fn conv1d(
        &mut self,
        x: &Var,
        weight: &Var,
        bias: &Var,
        dilation: usize,
        padding: usize,
    ) -> Var {
        let (idx, idw, idb) = (x.id, weight.id, bias.id);
        let xs = x.data.shape().to_vec();
        let ws = weight.data.shape().to_vec();
        let (batch, c_in, t_in) = (xs[0], xs[1], xs[2]);
        let (c_out, kernel) = (ws[0], ws[2]);
        assert_eq!(ws[1], c_in);
        let t_pad = t_in + 2 * padding;
        let span = dilation * (kernel - 1);
        assert!(t_pad >= span, "kernel span exceeds padded input length");
        let t_out = t_pad - span;

        let mut xpad = ArrayD::<f64>::zeros(IxDyn(&[batch, c_in, t_pad]));
        for n in 0..batch {
            for c in 0..c_in {
                for t in 0..t_in {
                    xpad[[n, c, t + padding]] = x.data[[n, c, t]];
                }
            }
        }

        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, c_out, t_out]));
        for n in 0..batch {
            for o in 0..c_out {
                for i in 0..t_out {
                    let mut acc = bias.data[[o]];
                    for c in 0..c_in {
                        for j in 0..kernel {
                            acc += weight.data[[o, c, j]] * xpad[[n, c, i + j * dilation]];
                        }
                    }
                    out[[n, o, i]] = acc;
                }
            }
        }

        let w_saved = weight.data.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad_w = ArrayD::<f64>::zeros(IxDyn(&[c_out, c_in, kernel]));
                let mut grad_b = ArrayD::<f64>::zeros(IxDyn(&[c_out]));
                let mut grad_xpad = ArrayD::<f64>::zeros(IxDyn(&[batch, c_in, t_pad]));

                for n in 0..batch {
                    for o in 0..c_out {
                        for i in 0..t_out {
                            let go = g[[n, o, i]];
                            grad_b[[o]] += go;
                            for c in 0..c_in {
                                for j in 0..kernel {
                                    grad_w[[o, c, j]] += go * xpad[[n, c, i + j * dilation]];
                                    grad_xpad[[n, c, i + j * dilation]] +=
                                        go * w_saved[[o, c, j]];
                                }
                            }
                        }
                    }
                }

                let mut grad_x = ArrayD::<f64>::zeros(IxDyn(&[batch, c_in, t_in]));
                for n in 0..batch {
                    for c in 0..c_in {
                        for t in 0..t_in {
                            grad_x[[n, c, t]] = grad_xpad[[n, c, t + padding]];
                        }
                    }
                }
                vec![(idx, grad_x), (idw, grad_w), (idb, grad_b)]
            }),
        )
    }

    /// Fully-connected layer: `x` (batch, in) times `weight` (out, in) plus
    /// `bias` (out,).
    pub fn linear(&mut self, x: &Var, weight: &Var, bias: &Var) -> Var {
        let (idx, idw, idb) = (x.id, weight.id, bias.id);
        let (batch, n_in) = (x.data.shape()[0], x.data.shape()[1]);
        let n_out = weight.data.shape()[0];
        assert_eq!(weight.data.shape()[1], n_in);

        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, n_out]));
        for n in 0..batch {
            for o in 0..n_out {
                let mut acc = bias.data[[o]];
                for i in 0..n_in {
                    acc += weight.data[[o, i]] * x.data[[n, i]];
                }
                out[[n, o]] = acc;
            }
        }

        let x_saved = x.data.clone();
        let w_saved = weight.data.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad_x = ArrayD::<f64>::zeros(IxDyn(&[batch, n_in]));
                let mut grad_w = ArrayD::<f64>::zeros(IxDyn(&[n_out, n_in]));
                let mut grad_b = ArrayD::<f64>::zeros(IxDyn(&[n_out]));
                for n in 0..batch {
                    for o in 0..n_out {
                        let go = g[[n, o]];
                        grad_b[[o]] += go;
                        for i in 0..n_in {
                            grad_x[[n, i]] += go * w_saved[[o, i]];
                            grad_w[[o, i]] += go * x_saved[[n, i]];
                        }
                    }
                }
                vec![(idx, grad_x), (idw, grad_w), (idb, grad_b)]
            }),
        )
    }

    /// Softmax along the last axis of a (batch, t) input.
    pub fn softmax(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let (batch, t) = (a.data.shape()[0], a.data.shape()[1]);
        let mut y = ArrayD::<f64>::zeros(IxDyn(&[batch, t]));
        for n in 0..batch {
            let mut max = f64::NEG_INFINITY;
            for i in 0..t {
                max = max.max(a.data[[n, i]]);
            }
            let mut total = 0.0;
            for i in 0..t {
                let e = (a.data[[n, i]] - max).exp();
                y[[n, i]] = e;
                total += e;
            }
            for i in 0..t {
                y[[n, i]] /= total;
            }
        }
        let saved = y.clone();
        self.push(
            y,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, t]));
                for n in 0..batch {
                    let mut dot = 0.0;
                    for i in 0..t {
                        dot += g[[n, i]] * saved[[n, i]];
                    }
                    for i in 0..t {
                        grad[[n, i]] = saved[[n, i]] * (g[[n, i]] - dot);
                    }
                }
                vec![(ida, grad)]
            }),
        )
    }

    /// Global max-pool over the last axis of a (batch, c, t) input.
    pub fn max_pool_time(&mut self, a: &Var) -> Var {
        let ida = a.id;
        let (batch, c, t) = (
            a.data.shape()[0],
            a.data.shape()[1],
            a.data.shape()[2],
        );
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, c]));
        let mut argmax = vec![0usize; batch * c];
        for n in 0..batch {
            for ch in 0..c {
                let mut best = f64::NEG_INFINITY;
                let mut best_i = 0;
                for i in 0..t {
                    let v = a.data[[n, ch, i]];
                    if v > best {
                        best = v;
                        best_i = i;
                    }
                }
                out[[n, ch]] = best;
                argmax[n * c + ch] = best_i;
            }
        }
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, c, t]));
                for n in 0..batch {
                    for ch in 0..c {
                        grad[[n, ch, argmax[n * c + ch]]] = g[[n, ch]];
                    }
                }
                vec![(ida, grad)]
            }),
        )
    }

    /// Weighted average of a fixed axis: `sum_t x[n, t] * axis[t]`, the
    /// contraction behind the soft-argmax time estimate.
    pub fn dot_fixed(&mut self, a: &Var, axis: &[f64]) -> Var {
        let ida = a.id;
        let (batch, t) = (a.data.shape()[0], a.data.shape()[1]);
        assert_eq!(t, axis.len());
        let axis: Vec<f64> = axis.to_vec();
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch]));
        for n in 0..batch {
            for i in 0..t {
                out[[n]] += a.data[[n, i]] * axis[i];
            }
        }
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, t]));
                for n in 0..batch {
                    for i in 0..t {
                        grad[[n, i]] = g[[n]] * axis[i];
                    }
                }
                vec![(ida, grad)]
            }),
        )
    }

    /// Broadcast a (batch, d) encoding across `n` phases: output
    /// (batch, d, n).
    pub fn repeat_phase(&mut self, a: &Var, n_phases: usize) -> Var {
        let ida = a.id;
        let (batch, d) = (a.data.shape()[0], a.data.shape()[1]);
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, d, n_phases]));
        for n in 0..batch {
            for k in 0..d {
                for p in 0..n_phases {
                    out[[n, k, p]] = a.data[[n, k]];
                }
            }
        }
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, d]));
                for n in 0..batch {
                    for k in 0..d {
                        for p in 0..n_phases {
                            grad[[n, k]] += g[[n, k, p]];
                        }
                    }
                }
                vec![(ida, grad)]
            }),
        )
    }

    /// Rest-frame phases of fixed observation times given per-object
    /// reference times: `(times[n, j] - ref[n]) / (1 + z[n])`. Only the
    /// reference times are differentiated.
    pub fn observation_phases(
        &mut self,
        ref_times: &Var,
        times: &ArrayD<f64>,
        redshifts: &[f64],
    ) -> Var {
        let idr = ref_times.id;
        let (batch, n_obs) = (times.shape()[0], times.shape()[1]);
        assert_eq!(ref_times.data.shape(), &[batch]);
        let dilation: Vec<f64> = redshifts.iter().map(|&z| 1.0 + z).collect();
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, n_obs]));
        for n in 0..batch {
            for j in 0..n_obs {
                out[[n, j]] = (times[[n, j]] - ref_times.data[[n]]) / dilation[n];
            }
        }
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                for n in 0..batch {
                    for j in 0..n_obs {
                        grad[[n]] -= g[[n, j]] / dilation[n];
                    }
                }
                vec![(idr, grad)]
            }),
        )
    }

    /// Apply the fixed extinction law: spectra (batch, w, n) scaled by
    /// `10^(-0.4 * color[n] * law[w])`.
    pub fn color_scale(&mut self, spectra: &Var, color: &Var, law: &[f64]) -> Var {
        let (ids, idc) = (spectra.id, color.id);
        let (batch, w, n_p) = (
            spectra.data.shape()[0],
            spectra.data.shape()[1],
            spectra.data.shape()[2],
        );
        assert_eq!(w, law.len());
        let ln10_scale = -0.4 * std::f64::consts::LN_10;
        let law: Vec<f64> = law.to_vec();

        let mut factor = ArrayD::<f64>::zeros(IxDyn(&[batch, w]));
        for n in 0..batch {
            for k in 0..w {
                factor[[n, k]] = (ln10_scale * color.data[[n]] * law[k]).exp();
            }
        }
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, w, n_p]));
        for n in 0..batch {
            for k in 0..w {
                for p in 0..n_p {
                    out[[n, k, p]] = spectra.data[[n, k, p]] * factor[[n, k]];
                }
            }
        }

        let s_saved = spectra.data.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad_s = ArrayD::<f64>::zeros(IxDyn(&[batch, w, n_p]));
                let mut grad_c = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                for n in 0..batch {
                    for k in 0..w {
                        let dfactor_dcolor = factor[[n, k]] * ln10_scale * law[k];
                        for p in 0..n_p {
                            grad_s[[n, k, p]] = g[[n, k, p]] * factor[[n, k]];
                            grad_c[[n]] += g[[n, k, p]] * s_saved[[n, k, p]] * dfactor_dcolor;
                        }
                    }
                }
                vec![(ids, grad_s), (idc, grad_c)]
            }),
        )
    }

    /// Scale a (batch, n) tensor by a per-object scalar.
    pub fn row_scale2(&mut self, a: &Var, scale: &Var) -> Var {
        let (ida, ids) = (a.id, scale.id);
        let (batch, n_obs) = (a.data.shape()[0], a.data.shape()[1]);
        assert_eq!(scale.data.shape(), &[batch]);
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, n_obs]));
        for n in 0..batch {
            for j in 0..n_obs {
                out[[n, j]] = a.data[[n, j]] * scale.data[[n]];
            }
        }
        let a_saved = a.data.clone();
        let s_saved = scale.data.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad_a = ArrayD::<f64>::zeros(IxDyn(&[batch, n_obs]));
                let mut grad_s = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                for n in 0..batch {
                    for j in 0..n_obs {
                        grad_a[[n, j]] = g[[n, j]] * s_saved[[n]];
                        grad_s[[n]] += g[[n, j]] * a_saved[[n, j]];
                    }
                }
                vec![(ida, grad_a), (ids, grad_s)]
            }),
        )
    }

    /// Scale a (batch, w, n) tensor by a per-object scalar.
    pub fn row_scale3(&mut self, a: &Var, scale: &Var) -> Var {
        let (ida, ids) = (a.id, scale.id);
        let shape = a.data.shape().to_vec();
        let (batch, w, n_p) = (shape[0], shape[1], shape[2]);
        assert_eq!(scale.data.shape(), &[batch]);
        let mut out = ArrayD::<f64>::zeros(IxDyn(&shape));
        for n in 0..batch {
            for k in 0..w {
                for p in 0..n_p {
                    out[[n, k, p]] = a.data[[n, k, p]] * scale.data[[n]];
                }
            }
        }
        let a_saved = a.data.clone();
        let s_saved = scale.data.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad_a = ArrayD::<f64>::zeros(IxDyn(&[batch, w, n_p]));
                let mut grad_s = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                for n in 0..batch {
                    for k in 0..w {
                        for p in 0..n_p {
                            grad_a[[n, k, p]] = g[[n, k, p]] * s_saved[[n]];
                            grad_s[[n]] += g[[n, k, p]] * a_saved[[n, k, p]];
                        }
                    }
                }
                vec![(ida, grad_a), (ids, grad_s)]
            }),
        )
    }

    /// Contract spectra (batch, w, n) against fixed per-observation band
    /// weights (batch, w, n) over the wavelength axis, producing flux
    /// (batch, n).
    pub fn project_bands(&mut self, spectra: &Var, weights: &ArrayD<f64>) -> Var {
        let ids = spectra.id;
        let (batch, w, n_obs) = (
            spectra.data.shape()[0],
            spectra.data.shape()[1],
            spectra.data.shape()[2],
        );
        assert_eq!(weights.shape(), &[batch, w, n_obs]);
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, n_obs]));
        for n in 0..batch {
            for j in 0..n_obs {
                let mut acc = 0.0;
                for k in 0..w {
                    acc += spectra.data[[n, k, j]] * weights[[n, k, j]];
                }
                out[[n, j]] = acc;
            }
        }
        let wt = weights.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, w, n_obs]));
                for n in 0..batch {
                    for k in 0..w {
                        for j in 0..n_obs {
                            grad[[n, k, j]] = g[[n, j]] * wt[[n, k, j]];
                        }
                    }
                }
                vec![(ids, grad)]
            }),
        )
    }

    /// `sum_j x[n, j] * f[n, j]` with a fixed factor — the building block of
    /// the analytic amplitude posterior.
    pub fn weighted_sum_obs(&mut self, a: &Var, fixed: &ArrayD<f64>) -> Var {
        let ida = a.id;
        let (batch, n_obs) = (a.data.shape()[0], a.data.shape()[1]);
        assert_eq!(fixed.shape(), &[batch, n_obs]);
        let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch]));
        for n in 0..batch {
            for j in 0..n_obs {
                out[[n]] += a.data[[n, j]] * fixed[[n, j]];
            }
        }
        let f = fixed.clone();
        self.push(
            out,
            Box::new(move |g| {
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, n_obs]));
                for n in 0..batch {
                    for j in 0..n_obs {
                        grad[[n, j]] = g[[n]] * f[[n, j]];
                    }
                }
                vec![(ida, grad)]
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Loss terms
    // -----------------------------------------------------------------------

    /// Weighted Gaussian reconstruction term:
    /// `0.5 * sum w[n, j] * (obs[n, j] - model[n, j])^2`.
    pub fn gaussian_nll(
        &mut self,
        model: &Var,
        observed: &ArrayD<f64>,
        weight: &ArrayD<f64>,
    ) -> Var {
        let idm = model.id;
        assert_eq!(model.data.shape(), observed.shape());
        assert_eq!(model.data.shape(), weight.shape());
        let residual = observed - &model.data;
        let value = 0.5 * (&residual * &residual * weight).sum();
        let grad_base = -(&residual * weight);
        self.push(
            ArrayD::from_elem(IxDyn(&[1]), value),
            Box::new(move |g| vec![(idm, &grad_base * g[[0]])]),
        )
    }

    /// KL divergence of a diagonal Gaussian against the standard normal:
    /// `-0.5 * sum(1 + logvar - mu^2 - exp(logvar))`.
    pub fn kl_divergence(&mut self, mu: &Var, logvar: &Var) -> Var {
        let (idm, idl) = (mu.id, logvar.id);
        assert_eq!(mu.data.shape(), logvar.data.shape());
        let exp_lv = logvar.data.mapv(f64::exp);
        let value = -0.5
            * (1.0 + &logvar.data - &mu.data.mapv(|v| v * v) - &exp_lv)
                .sum();
        let grad_mu = mu.data.clone();
        let grad_lv = exp_lv.mapv(|v| 0.5 * (v - 1.0));
        self.push(
            ArrayD::from_elem(IxDyn(&[1]), value),
            Box::new(move |g| vec![(idm, &grad_mu * g[[0]]), (idl, &grad_lv * g[[0]])]),
        )
    }

    /// Spectral smoothness penalty: `scale * sum u^2` with
    /// `u = (s[k+1] - s[k]) / (s[k+1] + s[k])` over adjacent wavelength
    /// bins. Pairs whose sum underflows to zero contribute nothing.
    pub fn smoothness_penalty(&mut self, spectra: &Var, scale: f64) -> Var {
        let ids = spectra.id;
        let (batch, w, n_p) = (
            spectra.data.shape()[0],
            spectra.data.shape()[1],
            spectra.data.shape()[2],
        );
        let s = spectra.data.clone();
        let mut value = 0.0;
        for n in 0..batch {
            for k in 0..w.saturating_sub(1) {
                for p in 0..n_p {
                    let hi = s[[n, k + 1, p]];
                    let lo = s[[n, k, p]];
                    let total = hi + lo;
                    if total != 0.0 {
                        let u = (hi - lo) / total;
                        value += u * u;
                    }
                }
            }
        }
        value *= scale;

        self.push(
            ArrayD::from_elem(IxDyn(&[1]), value),
            Box::new(move |g| {
                let g0 = g[[0]] * scale;
                let mut grad = ArrayD::<f64>::zeros(IxDyn(&[batch, w, n_p]));
                for n in 0..batch {
                    for k in 0..w.saturating_sub(1) {
                        for p in 0..n_p {
                            let hi = s[[n, k + 1, p]];
                            let lo = s[[n, k, p]];
                            let total = hi + lo;
                            if total != 0.0 {
                                let u = (hi - lo) / total;
                                let common = 2.0 * g0 * u * 2.0 / (total * total);
                                grad[[n, k + 1, p]] += common * lo;
                                grad[[n, k, p]] -= common * hi;
                            }
                        }
                    }
                }
                vec![(ids, grad)]
            }),
        )
    }

    /// Importance-sampling correction for the analytically marginalized
    /// amplitude: `-0.5 * sum (a - mu)^2 / exp(logvar)`.
    pub fn amplitude_importance(&mut self, amplitude: &Var, mu: &Var, logvar: &Var) -> Var {
        let (ida, idm, idl) = (amplitude.id, mu.id, logvar.id);
        let batch = amplitude.data.shape()[0];
        let diff = &amplitude.data - &mu.data;
        let inv_var = logvar.data.mapv(|v| (-v).exp());
        let value = -0.5 * (&diff * &diff * &inv_var).sum();

        let d = diff.clone();
        let iv = inv_var.clone();
        self.push(
            ArrayD::from_elem(IxDyn(&[1]), value),
            Box::new(move |g| {
                let g0 = g[[0]];
                let mut grad_a = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                let mut grad_m = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                let mut grad_l = ArrayD::<f64>::zeros(IxDyn(&[batch]));
                for n in 0..batch {
                    grad_a[[n]] = -g0 * d[[n]] * iv[[n]];
                    grad_m[[n]] = g0 * d[[n]] * iv[[n]];
                    grad_l[[n]] = 0.5 * g0 * d[[n]] * d[[n]] * iv[[n]];
                }
                vec![(ida, grad_a), (idm, grad_m), (idl, grad_l)]
            }),
        )
    }
}
