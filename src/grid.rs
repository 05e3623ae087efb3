use ndarray::{Array1, Array2, Array3};

use crate::error::Error;
use crate::lightcurve::LightCurve;
use crate::settings::ModelSettings;

/// Fixed-shape tensors for one batch of light curves.
///
/// `input` feeds the encoder; `compare` carries the per-observation data the
/// likelihood is evaluated against, right-padded to the batch's maximum
/// observation count with rows whose weight is exactly zero.
#[derive(Clone, Debug)]
pub struct GridBatch {
    /// Encoder input, shape (batch, 2*n_bands [+1 redshift], time_window).
    pub input: Array3<f64>,
    /// Comparison data, shape (batch, 4, max_obs); the channel axis is
    /// (grid_time, flux, fluxerr, weight).
    pub compare: Array3<f64>,
    /// Band index of every comparison column, shape (batch, max_obs).
    pub band_indices: Array2<usize>,
    /// Object redshifts, shape (batch,).
    pub redshifts: Array1<f64>,
}

impl GridBatch {
    pub fn batch_size(&self) -> usize {
        self.input.shape()[0]
    }

    pub fn max_observations(&self) -> usize {
        self.compare.shape()[2]
    }
}

/// Turn a batch of preprocessed light curves into dense tensors.
///
/// Observations outside the time window are dropped; two observations
/// falling into the same (band, bin) cell keep the later one (last writer
/// wins). Objects with zero in-window observations are valid and produce an
/// all-zero grid row plus all-padding comparison columns.
pub fn to_grid(light_curves: &[LightCurve], settings: &ModelSettings) -> Result<GridBatch, Error> {
    let n_bands = settings.bands.len();
    let window = settings.time_window;
    let floor_sq = settings.error_floor * settings.error_floor;

    struct WindowedCurve {
        redshift: f64,
        // (grid_time, flux, fluxerr, band_index, time_index)
        rows: Vec<(f64, f64, f64, usize, usize)>,
    }

    let mut windowed = Vec::with_capacity(light_curves.len());
    for lc in light_curves {
        if !lc.meta.preprocessed {
            return Err(Error::NotPreprocessed(lc.meta.object_id.clone()));
        }
        let scale = lc.meta.scale;
        let rows = lc
            .observations
            .iter()
            .filter(|obs| (0..window as i64).contains(&obs.time_index))
            .map(|obs| {
                (
                    obs.grid_time,
                    obs.flux / scale,
                    obs.flux_error / scale,
                    obs.band_index,
                    obs.time_index as usize,
                )
            })
            .collect();
        windowed.push(WindowedCurve {
            redshift: lc.meta.redshift,
            rows,
        });
    }

    let max_obs = windowed.iter().map(|w| w.rows.len()).max().unwrap_or(0);
    let n_channels = settings.input_channels();
    let band_offset = usize::from(settings.input_redshift);

    let mut input = Array3::<f64>::zeros((windowed.len(), n_channels, window));
    let mut compare = Array3::<f64>::zeros((windowed.len(), 4, max_obs));
    let mut band_indices = Array2::<usize>::zeros((windowed.len(), max_obs));
    let mut redshifts = Array1::<f64>::zeros(windowed.len());

    for (n, curve) in windowed.iter().enumerate() {
        redshifts[n] = curve.redshift;
        if settings.input_redshift {
            for t in 0..window {
                input[[n, 0, t]] = curve.redshift;
            }
        }

        for (j, &(grid_time, flux, fluxerr, band, time_index)) in curve.rows.iter().enumerate() {
            let err_sq = fluxerr * fluxerr;

            // Grid weight is bounded to (0, 1]: ~1 for a well-measured
            // observation, ~0 for a poorly measured one.
            input[[n, band_offset + band, time_index]] = flux;
            input[[n, band_offset + n_bands + band, time_index]] = floor_sq / (err_sq + floor_sq);

            compare[[n, 0, j]] = grid_time;
            compare[[n, 1, j]] = flux;
            compare[[n, 2, j]] = fluxerr;
            compare[[n, 3, j]] = 1.0 / (err_sq + floor_sq);
            band_indices[[n, j]] = band;
        }
    }

    Ok(GridBatch {
        input,
        compare,
        band_indices,
        redshifts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightcurve::{preprocess, Observation};

    fn settings() -> ModelSettings {
        ModelSettings {
            bands: vec!["g".to_string(), "r".to_string()],
            time_window: 50,
            error_floor: 0.01,
            ..ModelSettings::default()
        }
    }

    fn curve(n_obs: usize, id: &str) -> LightCurve {
        let observations = (0..n_obs)
            .map(|i| {
                let t = 100.0 + i as f64 * 2.0;
                Observation::new(t, i % 2, 1.0 + i as f64 * 0.1, 0.05)
            })
            .collect();
        preprocess(&LightCurve::new(id, 0.1, observations), &settings())
    }

    #[test]
    fn unpreprocessed_input_rejected() {
        let raw = LightCurve::new("raw", 0.1, vec![Observation::new(0.0, 0, 1.0, 0.1)]);
        assert!(matches!(
            to_grid(&[raw], &settings()),
            Err(Error::NotPreprocessed(_))
        ));
    }

    #[test]
    fn padding_rows_have_zero_weight() {
        let batch = to_grid(&[curve(3, "a"), curve(10, "b")], &settings()).unwrap();
        assert_eq!(batch.max_observations(), 10);
        for j in 3..10 {
            assert_eq!(batch.compare[[0, 3, j]], 0.0);
        }
    }

    #[test]
    fn unpadded_weights_match_source() {
        let s = settings();
        let lc = curve(5, "a");
        let batch = to_grid(&[lc.clone()], &s).unwrap();
        for (j, obs) in lc.observations.iter().enumerate() {
            let err = obs.flux_error / lc.meta.scale;
            let expected = 1.0 / (err * err + s.error_floor * s.error_floor);
            assert!((batch.compare[[0, 3, j]] - expected).abs() < 1e-12 * expected);
            assert!((batch.compare[[0, 1, j]] - obs.flux / lc.meta.scale).abs() < 1e-12);
        }
    }

    #[test]
    fn grid_scatter_and_bounded_weights() {
        let s = settings();
        let batch = to_grid(&[curve(5, "a")], &s).unwrap();
        let mut populated = 0;
        for c in 0..s.input_channels() {
            for t in 0..s.time_window {
                let v = batch.input[[0, c, t]];
                if c >= 2 {
                    // weight channels
                    assert!((0.0..=1.0).contains(&v));
                }
                if v != 0.0 {
                    populated += 1;
                }
            }
        }
        // 5 observations -> 5 flux cells + 5 weight cells.
        assert_eq!(populated, 10);
    }

    #[test]
    fn same_cell_collision_keeps_last() {
        let s = settings();
        let mut lc = LightCurve::new(
            "c",
            0.0,
            vec![
                Observation::new(100.0, 0, 2.0, 0.1),
                Observation::new(100.2, 0, 4.0, 0.1),
            ],
        );
        lc = preprocess(&lc, &s);
        assert_eq!(lc.observations[0].time_index, lc.observations[1].time_index);
        let batch = to_grid(&[lc.clone()], &s).unwrap();
        let idx = lc.observations[1].time_index as usize;
        let expected = 4.0 / lc.meta.scale;
        assert!((batch.input[[0, 0, idx]] - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_object_propagates() {
        let batch = to_grid(&[curve(0, "empty"), curve(4, "full")], &settings()).unwrap();
        assert_eq!(batch.batch_size(), 2);
        for c in 0..4 {
            for t in 0..50 {
                assert_eq!(batch.input[[0, c, t]], 0.0);
            }
        }
        for j in 0..batch.max_observations() {
            assert_eq!(batch.compare[[0, 3, j]], 0.0);
        }
    }

    #[test]
    fn redshift_channel_prepended() {
        let s = ModelSettings {
            input_redshift: true,
            ..settings()
        };
        let lc = preprocess(
            &LightCurve::new("z", 0.25, vec![Observation::new(0.0, 0, 1.0, 0.1)]),
            &s,
        );
        let batch = to_grid(&[lc], &s).unwrap();
        assert_eq!(batch.input.shape()[1], 5);
        for t in 0..50 {
            assert_eq!(batch.input[[0, 0, t]], 0.25);
        }
    }
}
