use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Physical constants (CGS)
// ---------------------------------------------------------------------------

/// h*c in erg*Angstrom.
pub const HC_ERG_AA: f64 = 1.986_445_857_148_928_4e-8;

/// Planck constant in erg*s.
const PLANCK_H: f64 = 6.626_070_15e-27;

/// AB reference spectral flux density, erg/s/cm^2/Hz (3631 Jy).
const AB_REF_FNU: f64 = 3.631e-20;

/// A photometric filter's transmission curve, sampled on its native
/// wavelength grid (Angstroms). Transmission is in fractional throughput.
///
/// Bandpasses are injected by the caller; the crate does not ship a filter
/// registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bandpass {
    pub name: String,
    pub wave: Vec<f64>,
    pub transmission: Vec<f64>,
}

impl Bandpass {
    pub fn new(name: impl Into<String>, wave: Vec<f64>, transmission: Vec<f64>) -> Self {
        assert_eq!(wave.len(), transmission.len());
        Self {
            name: name.into(),
            wave,
            transmission,
        }
    }

    /// Transmission at the given wavelength, linearly interpolated.
    /// Zero outside the sampled range.
    pub fn at(&self, wave: f64) -> f64 {
        let n = self.wave.len();
        if n == 0 || wave < self.wave[0] || wave > self.wave[n - 1] {
            return 0.0;
        }
        let idx = match self
            .wave
            .binary_search_by(|w| w.partial_cmp(&wave).unwrap())
        {
            Ok(i) => return self.transmission[i],
            Err(i) => i,
        };
        let (w0, w1) = (self.wave[idx - 1], self.wave[idx]);
        let (t0, t1) = (self.transmission[idx - 1], self.transmission[idx]);
        let frac = (wave - w0) / (w1 - w0);
        t0 + frac * (t1 - t0)
    }

    /// Photon-counting zeropoint flux in the AB magnitude system:
    /// the photon rate of an AB zero-magnitude source through this band,
    /// (f_nu / h) * integral T(lambda)/lambda dlambda, by trapezoid on the
    /// band's native grid.
    pub fn ab_zeropoint_flux(&self) -> f64 {
        let mut integral = 0.0;
        for i in 1..self.wave.len() {
            let f0 = self.transmission[i - 1] / self.wave[i - 1];
            let f1 = self.transmission[i] / self.wave[i];
            integral += 0.5 * (f0 + f1) * (self.wave[i] - self.wave[i - 1]);
        }
        AB_REF_FNU / PLANCK_H * integral
    }
}

/// Look up a band by name in a caller-provided list.
pub fn find_band<'a>(bands: &'a [Bandpass], name: &str) -> Result<&'a Bandpass, Error> {
    bands
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| Error::UnknownBandpass(name.to_string()))
}

// ---------------------------------------------------------------------------
// Color law
// ---------------------------------------------------------------------------

/// CCM89 A(lambda)/A_V at inverse wavelength x (inverse microns), R_V = 3.1.
fn ccm89_alav(x: f64) -> f64 {
    const RV: f64 = 3.1;
    let (a, b) = if x < 1.1 {
        let t = x.powf(1.61);
        (0.574 * t, -0.527 * t)
    } else if x < 3.3 {
        let y = x - 1.82;
        let a = 1.0
            + y * (0.17699
                + y * (-0.50447
                    + y * (-0.02427
                        + y * (0.72085 + y * (0.01979 + y * (-0.77530 + y * 0.32999))))));
        let b = y * (1.41338
            + y * (2.28305
                + y * (1.07233 + y * (-5.38434 + y * (-0.62251 + y * (5.30260 - y * 2.09002))))));
        (a, b)
    } else if x < 8.0 {
        let (fa, fb) = if x >= 5.9 {
            let d = x - 5.9;
            (
                -0.04473 * d * d - 0.009779 * d * d * d,
                0.2130 * d * d + 0.1207 * d * d * d,
            )
        } else {
            (0.0, 0.0)
        };
        let a = 1.752 - 0.316 * x - 0.104 / ((x - 4.67) * (x - 4.67) + 0.341) + fa;
        let b = -3.090 + 1.825 * x + 1.206 / ((x - 4.62) * (x - 4.62) + 0.263) + fb;
        (a, b)
    } else {
        let d = x - 8.0;
        let a = -1.073 + d * (-0.628 + d * (0.137 - d * 0.070));
        let b = 13.670 + d * (4.257 + d * (-0.420 + d * 0.374));
        (a, b)
    };
    a + b / RV
}

/// Fixed extinction color law evaluated on a wavelength grid (Angstroms),
/// scaled so that a unit color coefficient corresponds to a B-V color of 1.
pub fn color_law(wave: &[f64]) -> Vec<f64> {
    // B and V effective wavelengths.
    let b_band = ccm89_alav(1e4 / 4400.0);
    let v_band = ccm89_alav(1e4 / 5500.0);
    let norm = b_band - v_band;
    wave.iter()
        .map(|&w| ccm89_alav(1e4 / w.clamp(1000.0, 33333.0)) / norm)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_band() -> Bandpass {
        Bandpass::new(
            "box",
            vec![4000.0, 4500.0, 5000.0, 5500.0, 6000.0],
            vec![0.0, 1.0, 1.0, 1.0, 0.0],
        )
    }

    #[test]
    fn transmission_interpolates() {
        let band = box_band();
        assert_eq!(band.at(4500.0), 1.0);
        assert!((band.at(4250.0) - 0.5).abs() < 1e-12);
        assert_eq!(band.at(3000.0), 0.0);
        assert_eq!(band.at(7000.0), 0.0);
    }

    #[test]
    fn zeropoint_flux_positive() {
        let zp = box_band().ab_zeropoint_flux();
        assert!(zp > 0.0 && zp.is_finite());
    }

    #[test]
    fn color_law_unit_bv() {
        let law = color_law(&[4400.0, 5500.0]);
        assert!((law[0] - law[1] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn color_law_rises_blueward() {
        let law = color_law(&[2000.0, 4000.0, 8000.0]);
        assert!(law[0] > law[1] && law[1] > law[2]);
    }

    #[test]
    fn unknown_band_reported() {
        let bands = [box_band()];
        assert!(find_band(&bands, "box").is_ok());
        assert!(matches!(
            find_band(&bands, "missing"),
            Err(Error::UnknownBandpass(_))
        ));
    }
}
