//! Iteratively re-weighted least-squares profile fitting.
#![allow(clippy::cast_precision_loss)]

use ndarray::{ArrayView3, Zip};
use reflex_core::{Error, Result};

/// Outcome of fitting one observed profile to a reference.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProfileFit {
    /// Fitted intensity.
    pub intensity: f64,
    /// Sum of the per-voxel variance estimates of the last iteration.
    pub variance: f64,
    /// Pearson correlation of reference and background-subtracted data.
    pub correlation: f64,
    /// Iterations performed.
    pub niter: usize,
    /// Change in intensity over the last iteration.
    pub error: f64,
    /// Whether `error` fell below the requested tolerance.
    pub converged: bool,
}

impl ProfileFit {
    /// Converts a non-converged fit into [`Error::NotConverged`].
    pub fn require_converged(self) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(Error::NotConverged {
                iterations: self.niter,
                error: self.error,
            })
        }
    }
}

fn check_shape<T>(name: &str, array: &ArrayView3<'_, T>, expected: [usize; 3]) -> Result<()> {
    let (z, y, x) = array.dim();
    if [z, y, x] == expected {
        Ok(())
    } else {
        log::debug!("fit_profile: {name} has shape {:?}", [z, y, x]);
        Err(Error::ShapeMismatch {
            expected,
            found: [z, y, x],
        })
    }
}

/// Fits `c ≈ I·p + b` over the voxels selected by `mask`.
///
/// Starting from `I = Σ(c − b)`, each iteration sets the voxel variance
/// to `v = |b| + |I·p|` and updates `I` to `Σ(c−b)p/v ÷ Σp²/v`. Iteration
/// stops once the update is smaller than `eps` or after `max_iter`
/// iterations; in the latter case the fit is returned with
/// `converged = false`.
pub fn fit_profile(
    p: &ArrayView3<'_, f64>,
    mask: &ArrayView3<'_, bool>,
    c: &ArrayView3<'_, f64>,
    b: &ArrayView3<'_, f64>,
    eps: f64,
    max_iter: usize,
) -> Result<ProfileFit> {
    let (z, y, x) = p.dim();
    let shape = [z, y, x];
    check_shape("mask", mask, shape)?;
    check_shape("data", c, shape)?;
    check_shape("background", b, shape)?;
    if eps.is_nan() || eps <= 0.0 {
        return Err(Error::ConfigError(format!("eps must be positive, got {eps}")));
    }
    if max_iter < 1 {
        return Err(Error::ConfigError("max_iter must be at least 1".into()));
    }

    let mut count = 0usize;
    let mut intensity = 0.0;
    Zip::from(mask).and(c).and(b).for_each(|&m, &c, &b| {
        if m {
            intensity += c - b;
            count += 1;
        }
    });
    if count == 0 {
        return Err(Error::NoForegroundPixels);
    }

    let mut variance = 0.0;
    let mut error = f64::INFINITY;
    let mut niter = 0;
    while niter < max_iter {
        let previous = intensity;
        let mut sum_num = 0.0;
        let mut sum_den = 0.0;
        let mut sum_var = 0.0;
        Zip::from(p).and(mask).and(c).and(b).for_each(|&p, &m, &c, &b| {
            if m {
                let v = b.abs() + (previous * p).abs();
                if v > 0.0 {
                    sum_var += v;
                    sum_num += (c - b) * p / v;
                    sum_den += p * p / v;
                }
            }
        });
        if sum_den <= 0.0 {
            return Err(Error::ZeroVariance);
        }
        intensity = sum_num / sum_den;
        variance = sum_var;
        niter += 1;
        error = (intensity - previous).abs();
        if error < eps {
            break;
        }
    }

    Ok(ProfileFit {
        intensity,
        variance,
        correlation: correlation(p, mask, c, b)?,
        niter,
        error,
        converged: error < eps,
    })
}

/// Pearson correlation of `p` and `c − b` over `mask`.
fn correlation(
    p: &ArrayView3<'_, f64>,
    mask: &ArrayView3<'_, bool>,
    c: &ArrayView3<'_, f64>,
    b: &ArrayView3<'_, f64>,
) -> Result<f64> {
    let mut n = 0usize;
    let (mut sx, mut sy) = (0.0, 0.0);
    Zip::from(p).and(mask).and(c).and(b).for_each(|&p, &m, &c, &b| {
        if m {
            n += 1;
            sx += p;
            sy += c - b;
        }
    });
    let (mx, my) = (sx / n as f64, sy / n as f64);

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    let (mut qx, mut qy) = (0.0, 0.0);
    Zip::from(p).and(mask).and(c).and(b).for_each(|&p, &m, &c, &b| {
        if m {
            let dx = p - mx;
            let dy = c - b - my;
            sxy += dx * dy;
            sxx += dx * dx;
            syy += dy * dy;
            qx += p * p;
            qy += (c - b) * (c - b);
        }
    });
    // A spread at round-off level of the raw second moment is no spread.
    if is_degenerate(sxx, qx) || is_degenerate(syy, qy) {
        return Err(Error::ZeroVariance);
    }
    Ok(sxy / (sxx * syy).sqrt())
}

fn is_degenerate(spread: f64, moment: f64) -> bool {
    spread.is_nan() || spread <= 4.0 * f64::EPSILON * moment
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn reference() -> Array3<f64> {
        let mut p = Array3::from_shape_fn((5, 5, 5), |(k, j, i)| {
            let d2 = (k as f64 - 2.0).powi(2) + (j as f64 - 2.0).powi(2) + (i as f64 - 2.0).powi(2);
            (-d2 / 2.0).exp()
        });
        let total = p.sum();
        p.mapv_inplace(|v| v / total);
        p
    }

    #[test]
    fn test_recovers_scale() {
        let p = reference();
        let mask = Array3::from_elem(p.raw_dim(), true);
        let b = Array3::zeros(p.raw_dim());
        for k in [1.0, 37.5, 1.0e4] {
            let c = p.mapv(|v| v * k);
            let fit = fit_profile(&p.view(), &mask.view(), &c.view(), &b.view(), 1e-3, 100).unwrap();
            assert!(fit.converged);
            assert_abs_diff_eq!(fit.intensity, k, epsilon = 1e-3);
            assert_abs_diff_eq!(fit.correlation, 1.0, epsilon = 1e-9);
            assert!(fit.niter <= 3);
        }
    }

    #[test]
    fn test_with_background() {
        let p = reference();
        let mask = Array3::from_elem(p.raw_dim(), true);
        let b = Array3::from_elem(p.raw_dim(), 2.0);
        let c = p.mapv(|v| 500.0 * v + 2.0);
        let fit = fit_profile(&p.view(), &mask.view(), &c.view(), &b.view(), 1e-6, 100).unwrap();
        assert!(fit.converged);
        assert_abs_diff_eq!(fit.intensity, 500.0, epsilon = 1e-6);
        // Σ(|b| + |I p|) with Σp = 1.
        assert_abs_diff_eq!(fit.variance, 2.0 * 125.0 + 500.0, epsilon = 1e-3);
    }

    #[test]
    fn test_masked_voxels_ignored() {
        let p = reference();
        let mut mask = Array3::from_elem(p.raw_dim(), true);
        let b = Array3::zeros(p.raw_dim());
        let mut c = p.mapv(|v| v * 100.0);
        c[[0, 0, 0]] = 1.0e6;
        mask[[0, 0, 0]] = false;
        let fit = fit_profile(&p.view(), &mask.view(), &c.view(), &b.view(), 1e-6, 100).unwrap();
        assert_abs_diff_eq!(fit.intensity, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_budget() {
        let p = reference();
        let mask = Array3::from_elem(p.raw_dim(), true);
        let b = Array3::from_elem(p.raw_dim(), 1.0);
        let c = p.mapv(|v| 300.0 * v + 1.0) + &p.mapv(|v| (v * 1.0e3).sin());
        let fit = fit_profile(&p.view(), &mask.view(), &c.view(), &b.view(), 1e-12, 1).unwrap();
        assert_eq!(fit.niter, 1);
        assert!(!fit.converged);
        assert!(matches!(
            fit.require_converged(),
            Err(Error::NotConverged { iterations: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        let p = reference();
        let mask = Array3::from_elem(p.raw_dim(), true);
        let zeros = Array3::<f64>::zeros(p.raw_dim());
        let c = p.mapv(|v| v * 10.0);

        let small = Array3::<f64>::zeros((5, 5, 4));
        assert!(matches!(
            fit_profile(&p.view(), &mask.view(), &small.view(), &zeros.view(), 1e-3, 10),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(fit_profile(&p.view(), &mask.view(), &c.view(), &zeros.view(), 0.0, 10).is_err());
        assert!(fit_profile(&p.view(), &mask.view(), &c.view(), &zeros.view(), 1e-3, 0).is_err());

        let empty = Array3::from_elem(p.raw_dim(), false);
        assert_eq!(
            fit_profile(&p.view(), &empty.view(), &c.view(), &zeros.view(), 1e-3, 10),
            Err(Error::NoForegroundPixels)
        );

        // Flat reference: zero variance in the correlation.
        let flat = Array3::from_elem(p.raw_dim(), 1.0 / 125.0);
        let c = flat.mapv(|v| v * 10.0);
        assert_eq!(
            fit_profile(&flat.view(), &mask.view(), &c.view(), &zeros.view(), 1e-3, 10),
            Err(Error::ZeroVariance)
        );
    }

    #[test]
    fn test_flat_inputs_have_no_correlation() {
        let p = reference();
        let mask = Array3::from_elem(p.raw_dim(), true);
        let zeros = Array3::<f64>::zeros(p.raw_dim());

        // Round-off leaves a tiny spread in an otherwise flat profile.
        for level in [1.0 / 125.0, 0.1, 1.0 / 3.0] {
            let flat = Array3::from_elem(p.raw_dim(), level);
            let c = flat.mapv(|v| v * 10.0);
            assert_eq!(
                fit_profile(&flat.view(), &mask.view(), &c.view(), &zeros.view(), 1e-3, 10),
                Err(Error::ZeroVariance)
            );
        }

        // Flat observations against a peaked reference.
        let c = Array3::from_elem(p.raw_dim(), 0.7);
        assert_eq!(
            fit_profile(&p.view(), &mask.view(), &c.view(), &zeros.view(), 1e-3, 10),
            Err(Error::ZeroVariance)
        );
    }
}
