//! Background outlier rejection.
//!
//! A rejector decides which background candidates (`VALID | BACKGROUND`)
//! receive [`MaskCode::BACKGROUND_USED`]. Stray signal from neighbouring
//! peaks, zingers and hot pixels are left out of the background fit.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use super::model::{fit_plane, Sample};
use ndarray::{ArrayView3, ArrayViewMut3};
use reflex_core::{Error, MaskCode, Pixel, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Outlier rejection policy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OutlierRejector {
    /// Keep every candidate.
    Null,
    /// Drop the lowest `lower` and highest `upper` fractions of candidates.
    Truncated {
        /// Fraction dropped from the low end.
        lower: f64,
        /// Fraction dropped from the high end.
        upper: f64,
    },
    /// Drop candidates more than `lower`/`upper` standard deviations from
    /// the mean.
    NSigma {
        /// Deviations allowed below the mean.
        lower: f64,
        /// Deviations allowed above the mean.
        upper: f64,
    },
    /// Per-frame plane fit, removing the worst positive residual beyond
    /// `n_sigma` until none remain or only `fraction` of candidates are left.
    Mosflm {
        /// Smallest fraction of candidates kept per frame.
        fraction: f64,
        /// Residual cutoff in standard deviations.
        n_sigma: f64,
    },
}

impl Default for OutlierRejector {
    fn default() -> Self {
        Self::nsigma()
    }
}

impl OutlierRejector {
    /// Default truncation: 1% at each end.
    #[must_use]
    pub fn truncated() -> Self {
        OutlierRejector::Truncated {
            lower: 0.01,
            upper: 0.01,
        }
    }

    /// Default symmetric 3σ clipping.
    #[must_use]
    pub fn nsigma() -> Self {
        OutlierRejector::NSigma {
            lower: 3.0,
            upper: 3.0,
        }
    }

    /// Default plane clipping at 4σ keeping at least half the pixels.
    #[must_use]
    pub fn mosflm() -> Self {
        OutlierRejector::Mosflm {
            fraction: 0.5,
            n_sigma: 4.0,
        }
    }

    /// Rewrites [`MaskCode::BACKGROUND_USED`] for every pixel.
    pub fn mark<T: Pixel>(
        &self,
        data: &ArrayView3<'_, T>,
        mask: &mut ArrayViewMut3<'_, MaskCode>,
    ) -> Result<()> {
        let mut candidates: Vec<(usize, usize, usize, f64)> = Vec::new();
        for (((k, j, i), &v), m) in data.indexed_iter().zip(mask.iter_mut()) {
            m.remove(MaskCode::BACKGROUND_USED);
            if m.has(MaskCode::BACKGROUND_CANDIDATE) {
                candidates.push((k, j, i, v.widen()));
            }
        }
        if candidates.is_empty() {
            return Err(Error::NoBackgroundPixels);
        }

        let keep = match *self {
            OutlierRejector::Null => vec![true; candidates.len()],
            OutlierRejector::Truncated { lower, upper } => truncate(&candidates, lower, upper)?,
            OutlierRejector::NSigma { lower, upper } => nsigma(&candidates, lower, upper),
            OutlierRejector::Mosflm { fraction, n_sigma } => {
                mosflm(&candidates, fraction, n_sigma)?
            }
        };

        for (&(k, j, i, _), kept) in candidates.iter().zip(keep) {
            if kept {
                mask[[k, j, i]].insert(MaskCode::BACKGROUND_USED);
            }
        }
        Ok(())
    }
}

fn truncate(candidates: &[(usize, usize, usize, f64)], lower: f64, upper: f64) -> Result<Vec<bool>> {
    if !(0.0..1.0).contains(&lower) || !(0.0..1.0).contains(&upper) {
        return Err(Error::ConfigError(format!(
            "truncation fractions must be in [0, 1), got {lower} and {upper}"
        )));
    }
    let n = candidates.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| candidates[a].3.total_cmp(&candidates[b].3));

    let i0 = (lower * n as f64).floor() as usize;
    let i1 = n.saturating_sub((upper * n as f64).floor() as usize);
    let mut keep = vec![false; n];
    for &index in order.get(i0..i1).unwrap_or(&[]) {
        keep[index] = true;
    }
    Ok(keep)
}

fn nsigma(candidates: &[(usize, usize, usize, f64)], lower: f64, upper: f64) -> Vec<bool> {
    let n = candidates.len() as f64;
    let mean = candidates.iter().map(|c| c.3).sum::<f64>() / n;
    let var = candidates.iter().map(|c| (c.3 - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    let (lo, hi) = (mean - lower * sd, mean + upper * sd);
    candidates
        .iter()
        .map(|c| c.3 >= lo && c.3 <= hi)
        .collect()
}

fn mosflm(candidates: &[(usize, usize, usize, f64)], fraction: f64, n_sigma: f64) -> Result<Vec<bool>> {
    if !(0.0..=1.0).contains(&fraction) || n_sigma <= 0.0 {
        return Err(Error::ConfigError(format!(
            "invalid mosflm rejection parameters: fraction {fraction}, n_sigma {n_sigma}"
        )));
    }
    let mut keep = vec![true; candidates.len()];
    let nframes = candidates.iter().map(|c| c.0).max().map_or(0, |k| k + 1);

    for frame in 0..nframes {
        let members: Vec<usize> = (0..candidates.len())
            .filter(|&idx| candidates[idx].0 == frame)
            .collect();
        let min_kept = ((fraction * members.len() as f64).ceil() as usize).max(3);
        let mut active = members.len();

        while active > min_kept {
            let samples: Vec<Sample> = members
                .iter()
                .filter(|&&idx| keep[idx])
                .map(|&idx| {
                    let (k, j, i, value) = candidates[idx];
                    Sample {
                        k,
                        x: i as f64 + 0.5,
                        y: j as f64 + 0.5,
                        value,
                    }
                })
                .collect();
            let Ok([a, b, c]) = fit_plane(samples.iter()) else {
                break;
            };

            let worst = members
                .iter()
                .filter(|&&m| keep[m])
                .map(|&m| {
                    let (_, j, i, value) = candidates[m];
                    let plane = a + b * (i as f64 + 0.5) + c * (j as f64 + 0.5);
                    (m, (value - plane) / plane.max(1.0).sqrt())
                })
                .max_by(|x, y| x.1.total_cmp(&y.1));

            match worst {
                Some((m, residual)) if residual > n_sigma => {
                    keep[m] = false;
                    active -= 1;
                }
                _ => break,
            }
        }
    }
    Ok(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn flat_with_spike() -> (Array3<f64>, Array3<MaskCode>) {
        let mut data = Array3::from_shape_fn((1, 6, 6), |(_, j, i)| {
            10.0 + if (i + j) % 2 == 0 { 0.5 } else { -0.5 }
        });
        data[[0, 3, 3]] = 500.0;
        let mut mask = Array3::from_elem((1, 6, 6), MaskCode::VALID | MaskCode::BACKGROUND);
        mask[[0, 0, 0]] = MaskCode::VALID | MaskCode::FOREGROUND;
        (data, mask)
    }

    fn used(mask: &Array3<MaskCode>) -> usize {
        mask.iter()
            .filter(|m| m.has(MaskCode::BACKGROUND_USED))
            .count()
    }

    #[test]
    fn test_null_keeps_all_candidates() {
        let (data, mut mask) = flat_with_spike();
        OutlierRejector::Null
            .mark(&data.view(), &mut mask.view_mut())
            .unwrap();
        assert_eq!(used(&mask), 35);
        assert!(!mask[[0, 0, 0]].has(MaskCode::BACKGROUND_USED));
    }

    #[test]
    fn test_nsigma_rejects_spike() {
        let (data, mut mask) = flat_with_spike();
        OutlierRejector::nsigma()
            .mark(&data.view(), &mut mask.view_mut())
            .unwrap();
        assert!(!mask[[0, 3, 3]].has(MaskCode::BACKGROUND_USED));
        assert_eq!(used(&mask), 34);
    }

    #[test]
    fn test_truncated_drops_extremes() {
        let (data, mut mask) = flat_with_spike();
        OutlierRejector::Truncated {
            lower: 0.1,
            upper: 0.1,
        }
        .mark(&data.view(), &mut mask.view_mut())
        .unwrap();
        // 35 candidates, 3 dropped at each end.
        assert_eq!(used(&mask), 29);
        assert!(!mask[[0, 3, 3]].has(MaskCode::BACKGROUND_USED));
    }

    #[test]
    fn test_mosflm_rejects_spike() {
        let (data, mut mask) = flat_with_spike();
        OutlierRejector::mosflm()
            .mark(&data.view(), &mut mask.view_mut())
            .unwrap();
        assert!(!mask[[0, 3, 3]].has(MaskCode::BACKGROUND_USED));
        assert_eq!(used(&mask), 34);
    }

    #[test]
    fn test_no_candidates() {
        let data = Array3::<f32>::zeros((1, 2, 2));
        let mut mask = Array3::from_elem((1, 2, 2), MaskCode::VALID);
        assert_eq!(
            OutlierRejector::Null.mark(&data.view(), &mut mask.view_mut()),
            Err(Error::NoBackgroundPixels)
        );
    }

    #[test]
    fn test_default_is_nsigma() {
        assert_eq!(OutlierRejector::default(), OutlierRejector::nsigma());
    }
}
