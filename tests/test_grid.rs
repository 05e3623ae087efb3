
use lightcurve_vae::{preprocess, to_grid, Error, LightCurve, Observation};

#[test]
fn gridded_batch_has_expected_shapes() {
    let settings = synthetic::test_settings();
    let dataset = synthetic::generate_dataset(3, 12, &settings);
    let batch = to_grid(&dataset, &settings).unwrap();

    assert_eq!(batch.batch_size(), 3);
    assert_eq!(
        batch.input.shape(),
        &[3, 2 * settings.bands.len(), settings.time_window]
    );
    assert_eq!(batch.compare.shape()[1], 4);
    assert_eq!(batch.compare.shape()[2], batch.max_observations());
    assert_eq!(batch.redshifts.len(), 3);
}

#[test]
fn unpreprocessed_light_curve_is_rejected() {
    let settings = synthetic::test_settings();
    let raw = synthetic::generate_transient(8, 0.1, 7);
    let err = to_grid(&[raw], &settings).unwrap_err();
    assert!(matches!(err, Error::NotPreprocessed(_)));
}

#[test]
fn comparison_weights_follow_the_error_floor_formula() {
    let settings = synthetic::test_settings();
    let lc = preprocess(&synthetic::generate_transient(10, 0.1, 21), &settings);
    let batch = to_grid(std::slice::from_ref(&lc), &settings).unwrap();

    let floor = settings.error_floor;
    let scale = lc.meta.scale;
    let mut matched = 0;
    for obs in &lc.observations {
        if !(0..settings.time_window as i64).contains(&obs.time_index) {
            continue;
        }
        let err = obs.flux_error / scale;
        let expected = 1.0 / (err * err + floor * floor);
        let found = (0..batch.max_observations()).any(|j| {
            (batch.compare[[0, 3, j]] - expected).abs() < 1e-12
                && (batch.compare[[0, 1, j]] - obs.flux / scale).abs() < 1e-12
        });
        assert!(found, "missing comparison row for observation");
        matched += 1;
    }
    assert!(matched > 0);
}

#[test]
fn grid_weights_are_bounded_by_one() {
    let settings = synthetic::test_settings();
    let dataset = synthetic::generate_dataset(2, 20, &settings);
    let batch = to_grid(&dataset, &settings).unwrap();

    let n_bands = settings.bands.len();
    for n in 0..batch.batch_size() {
        for band in 0..n_bands {
            for t in 0..settings.time_window {
                let w = batch.input[[n, n_bands + band, t]];
                assert!((0.0..=1.0).contains(&w), "grid weight {w} out of range");
            }
        }
    }
}

#[test]
fn padding_columns_carry_zero_weight() {
    let settings = synthetic::test_settings();
    // One rich object and one sparse object force padding on the second.
    let rich = preprocess(&synthetic::generate_transient(20, 0.1, 31), &settings);
    let sparse = preprocess(&synthetic::generate_transient(3, 0.1, 32), &settings);
    let batch = to_grid(&[rich, sparse.clone()], &settings).unwrap();

    let real = sparse
        .observations
        .iter()
        .filter(|o| (0..settings.time_window as i64).contains(&o.time_index))
        .count();
    for j in real..batch.max_observations() {
        assert_eq!(batch.compare[[1, 3, j]], 0.0, "padding weight must be zero");
    }
}

#[test]
fn empty_object_produces_all_zero_tensors() {
    let settings = synthetic::test_settings();
    let empty = preprocess(&LightCurve::new("empty", 0.2, Vec::new()), &settings);
    let full = preprocess(&synthetic::generate_transient(6, 0.1, 41), &settings);
    let batch = to_grid(&[empty, full], &settings).unwrap();

    for c in 0..batch.input.shape()[1] {
        for t in 0..settings.time_window {
            assert_eq!(batch.input[[0, c, t]], 0.0);
        }
    }
    for k in 0..4 {
        for j in 0..batch.max_observations() {
            assert_eq!(batch.compare[[0, k, j]], 0.0);
        }
    }
}

#[test]
fn out_of_window_observations_are_dropped() {
    let settings = synthetic::test_settings();
    let mut observations = vec![
        Observation::new(59000.0, 0, 50.0, 1.0),
        Observation::new(59001.0, 1, 40.0, 1.0),
    ];
    // Five years later, far outside any window.
    observations.push(Observation::new(60800.0, 0, 30.0, 1.0));
    let lc = preprocess(&LightCurve::new("windowed", 0.1, observations), &settings);
    let batch = to_grid(std::slice::from_ref(&lc), &settings).unwrap();

    assert_eq!(batch.max_observations(), 2);
}
