
use lightcurve_vae::autograd::Tape;
use lightcurve_vae::decoder::Decoder;
use lightcurve_vae::encoder::Encoder;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::SmallRng;
use rand::SeedableRng;

const EPS: f64 = 1e-6;

/// Loss of a freshly built decoder whose parameter `param` has its
/// `element`-th entry shifted by `delta`, together with the analytic
/// gradient of that same entry.
fn decoder_loss(param: usize, element: usize, delta: f64) -> (f64, f64) {
    let settings = synthetic::test_settings();
    let mut rng = SmallRng::seed_from_u64(99);
    let mut decoder = Decoder::new(&settings, vec![1.0; settings.spectrum_bins], &mut rng);
    {
        let mut params = decoder.params_mut();
        let values = params[param].value.as_slice_mut().unwrap();
        values[element] += delta;
    }

    let mut tape = Tape::new();
    let encoding = tape.leaf(ArrayD::from_shape_fn(
        IxDyn(&[2, settings.latent_size]),
        |idx| 0.1 * (idx[0] as f64 + 1.0) - 0.05 * idx[1] as f64,
    ));
    let phases = tape.leaf(
        ArrayD::from_shape_vec(
            IxDyn(&[2, 3]),
            vec![-12.0, 0.0, 9.0, -5.0, 3.0, 20.0],
        )
        .unwrap(),
    );
    let color = tape.leaf(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.1, -0.2]).unwrap());

    let spectra = decoder.decode_spectra(&mut tape, &encoding, &phases, Some(&color), None);
    let weights = ArrayD::from_elem(IxDyn(&[2, settings.spectrum_bins, 3]), 0.5);
    let flux = tape.project_bands(&spectra, &weights);
    let target = ArrayD::from_elem(IxDyn(&[2, 3]), 2.0);
    let obs_weight = ArrayD::from_elem(IxDyn(&[2, 3]), 1.0);
    let loss = tape.gaussian_nll(&flux, &target, &obs_weight);

    let grads = tape.backward(&loss);
    let params = decoder.params_mut();
    let id = params[param].id.unwrap();
    let grad = grads.get(id).unwrap().as_slice().unwrap()[element];
    (loss.data[[0]], grad)
}

#[test]
fn decoder_parameter_gradients_match_finite_differences() {
    let settings = synthetic::test_settings();
    let mut rng = SmallRng::seed_from_u64(99);
    let mut decoder = Decoder::new(&settings, vec![1.0; settings.spectrum_bins], &mut rng);
    let n_params = decoder.params_mut().len();

    // Probe the first hidden weight, a mid-stack weight, and the output
    // bias.
    for &param in &[0usize, 2, n_params - 1] {
        for element in 0..3.min(decoder.params_mut()[param].value.len()) {
            let (_, analytic) = decoder_loss(param, element, 0.0);
            let (plus, _) = decoder_loss(param, element, EPS);
            let (minus, _) = decoder_loss(param, element, -EPS);
            let numeric = (plus - minus) / (2.0 * EPS);
            let scale = 1.0_f64.max(analytic.abs());
            assert!(
                (analytic - numeric).abs() / scale < 1e-4,
                "param {param} element {element}: analytic {analytic} numeric {numeric}"
            );
        }
    }
}

/// KL loss of a freshly built encoder with one conv weight entry shifted.
fn encoder_loss(element: usize, delta: f64) -> (f64, f64) {
    let settings = synthetic::test_settings();
    let mut rng = SmallRng::seed_from_u64(7);
    let mut encoder = Encoder::new(&settings, &mut rng);
    {
        let mut params = encoder.params_mut();
        let values = params[0].value.as_slice_mut().unwrap();
        values[element] += delta;
    }

    let mut tape = Tape::new();
    let input = tape.leaf(ArrayD::from_shape_fn(
        IxDyn(&[1, settings.input_channels(), settings.time_window]),
        |idx| ((idx[1] * 17 + idx[2] * 5) % 13) as f64 / 13.0,
    ));
    let encoding = encoder.forward(&mut tape, &input);
    let loss = tape.kl_divergence(&encoding.mu, &encoding.logvar);

    let grads = tape.backward(&loss);
    let params = encoder.params_mut();
    let id = params[0].id.unwrap();
    let grad = grads.get(id).unwrap().as_slice().unwrap()[element];
    (loss.data[[0]], grad)
}

#[test]
fn encoder_parameter_gradients_match_finite_differences() {
    for element in 0..4 {
        let (_, analytic) = encoder_loss(element, 0.0);
        let (plus, _) = encoder_loss(element, EPS);
        let (minus, _) = encoder_loss(element, -EPS);
        let numeric = (plus - minus) / (2.0 * EPS);
        let scale = 1.0_f64.max(analytic.abs());
        assert!(
            (analytic - numeric).abs() / scale < 1e-4,
            "element {element}: analytic {analytic} numeric {numeric}"
        );
    }
}

#[test]
fn clamp_cuts_gradients_outside_the_bounds() {
    let mut tape = Tape::new();
    let x = tape.leaf(ArrayD::from_shape_vec(IxDyn(&[3]), vec![-2.0, 0.5, 2.0]).unwrap());
    let clamped = tape.clamp(&x, Some(-1.0), Some(1.0));
    let flat = tape.reshape(&clamped, &[1, 3]);
    let total = tape.weighted_sum_obs(&flat, &ArrayD::ones(IxDyn(&[1, 3])));
    let loss = tape.reshape(&total, &[1]);
    let grads = tape.backward(&loss);
    let g = grads.get(x.id).unwrap();
    assert_eq!(g[[0]], 0.0);
    assert_eq!(g[[1]], 1.0);
    assert_eq!(g[[2]], 0.0);
}
