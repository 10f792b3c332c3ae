//! Background surface models.
//!
//! Every model is fitted to the pixels whose mask carries
//! [`MaskCode::BACKGROUND_FIT`] and evaluated at pixel centres
//! `(k + 0.5, j + 0.5, i + 0.5)` in shoebox-local `(z, y, x)` coordinates.
#![allow(clippy::cast_precision_loss)]

use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView3;
use reflex_core::{Error, MaskCode, Pixel, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tuning constant of the Huber estimator (95% efficiency under normal noise).
const HUBER_K: f64 = 1.345;
/// Scale factor turning a median absolute deviation into a standard deviation.
const MAD_SCALE: f64 = 1.4826;
const ROBUST_MAX_ITER: usize = 100;
/// Smallest singular value of the position scatter, relative to the
/// largest, for a plane fit to be determined.
const RANK_TOLERANCE: f64 = 1e-10;

/// Choice of background model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BackgroundModel {
    /// Mean level per frame.
    Constant2d,
    /// Mean level over the whole shoebox.
    Constant3d,
    /// Plane `a + b·x + c·y` per frame.
    #[default]
    Linear2d,
    /// Hyperplane `a + b·x + c·y + d·z`.
    Linear3d,
    /// Huber M-estimate of a constant level, insensitive to stray peaks.
    Robust,
}

/// A fitted background surface.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundSurface {
    /// One level for the whole shoebox.
    Constant3d(f64),
    /// One level per frame.
    Constant2d(Vec<f64>),
    /// `[a, b, c]` of `a + b·x + c·y` per frame.
    Linear2d(Vec<[f64; 3]>),
    /// `[a, b, c, d]` of `a + b·x + c·y + d·z`.
    Linear3d([f64; 4]),
}

impl BackgroundSurface {
    /// Model value at the centre of pixel `(k, j, i)`.
    #[must_use]
    pub fn value(&self, k: usize, j: usize, i: usize) -> f64 {
        let (z, y, x) = (k as f64 + 0.5, j as f64 + 0.5, i as f64 + 0.5);
        match self {
            BackgroundSurface::Constant3d(c) => *c,
            BackgroundSurface::Constant2d(levels) => levels[k],
            BackgroundSurface::Linear2d(planes) => {
                let [a, b, c] = planes[k];
                a + b * x + c * y
            }
            BackgroundSurface::Linear3d([a, b, c, d]) => a + b * x + c * y + d * z,
        }
    }
}

/// One background pixel: frame, pixel centre and value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
    pub k: usize,
    pub x: f64,
    pub y: f64,
    pub value: f64,
}

/// Pixels of `data` whose mask carries every bit of `code`.
pub(crate) fn collect_samples<T: Pixel>(
    data: &ArrayView3<'_, T>,
    mask: &ArrayView3<'_, MaskCode>,
    code: MaskCode,
) -> Vec<Sample> {
    data.indexed_iter()
        .zip(mask.iter())
        .filter(|(_, m)| m.has(code))
        .map(|(((k, j, i), &v), _)| Sample {
            k,
            x: i as f64 + 0.5,
            y: j as f64 + 0.5,
            value: v.widen(),
        })
        .collect()
}

/// Least-squares plane `a + b·x + c·y` through `samples`.
pub(crate) fn fit_plane<'a>(samples: impl Iterator<Item = &'a Sample>) -> Result<[f64; 3]> {
    let points: Vec<([f64; 2], f64)> = samples.map(|s| ([s.x, s.y], s.value)).collect();
    let (a, [b, c]) = fit_hyperplane(&points)?;
    Ok([a, b, c])
}

/// Least-squares `a + Σ βᵢ·xᵢ` solved in centred coordinates.
///
/// Fails with [`Error::SingularBackground`] unless the sample positions
/// span all `N` directions, e.g. when every sample lies on one row.
fn fit_hyperplane<const N: usize>(points: &[([f64; N], f64)]) -> Result<(f64, [f64; N])> {
    if points.is_empty() {
        return Err(Error::NoBackgroundPixels);
    }
    if points.len() <= N {
        return Err(Error::SingularBackground);
    }
    let n = points.len() as f64;
    let mut centre = DVector::<f64>::zeros(N);
    let mut mean_value = 0.0;
    for (x, v) in points {
        centre += DVector::from_row_slice(x);
        mean_value += v;
    }
    centre /= n;
    mean_value /= n;

    let mut scatter = DMatrix::<f64>::zeros(N, N);
    let mut rhs = DVector::<f64>::zeros(N);
    for (x, v) in points {
        let dx = DVector::from_row_slice(x) - &centre;
        scatter += &dx * dx.transpose();
        rhs += &dx * (v - mean_value);
    }

    let svd = scatter.svd(true, true);
    let largest = svd.singular_values.max();
    if largest <= 0.0 || svd.singular_values.min() <= RANK_TOLERANCE * largest {
        return Err(Error::SingularBackground);
    }
    let beta = svd
        .solve(&rhs, 0.0)
        .map_err(|_| Error::SingularBackground)?;

    let mut coefficients = [0.0; N];
    for (c, b) in coefficients.iter_mut().zip(beta.iter()) {
        *c = *b;
    }
    Ok((mean_value - beta.dot(&centre), coefficients))
}

fn mean<'a>(samples: impl Iterator<Item = &'a Sample>) -> Result<f64> {
    let (sum, count) = samples.fold((0.0, 0usize), |(s, n), p| (s + p.value, n + 1));
    if count == 0 {
        return Err(Error::NoBackgroundPixels);
    }
    Ok(sum / count as f64)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn huber_location(values: &[f64]) -> Result<f64> {
    if values.is_empty() {
        return Err(Error::NoBackgroundPixels);
    }
    let mut sorted = values.to_vec();
    let mut mu = median(&mut sorted);
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - mu).abs()).collect();
    let scale = MAD_SCALE * median(&mut deviations);
    if scale <= 0.0 {
        return Ok(mu);
    }
    let cutoff = HUBER_K * scale;
    for _ in 0..ROBUST_MAX_ITER {
        let (mut sum_w, mut sum_wv) = (0.0, 0.0);
        for &v in values {
            let r = (v - mu).abs();
            let w = if r <= cutoff { 1.0 } else { cutoff / r };
            sum_w += w;
            sum_wv += w * v;
        }
        let next = sum_wv / sum_w;
        let done = (next - mu).abs() < 1e-8 * mu.abs().max(1.0);
        mu = next;
        if done {
            break;
        }
    }
    Ok(mu)
}

impl BackgroundModel {
    /// Fits the model to the background pixels of a shoebox.
    pub fn fit<T: Pixel>(
        self,
        data: &ArrayView3<'_, T>,
        mask: &ArrayView3<'_, MaskCode>,
    ) -> Result<BackgroundSurface> {
        let samples = collect_samples(data, mask, MaskCode::BACKGROUND_FIT);
        if samples.is_empty() {
            return Err(Error::NoBackgroundPixels);
        }
        let nframes = data.dim().0;
        match self {
            BackgroundModel::Constant3d => Ok(BackgroundSurface::Constant3d(mean(samples.iter())?)),
            BackgroundModel::Constant2d => (0..nframes)
                .map(|k| mean(samples.iter().filter(|s| s.k == k)))
                .collect::<Result<Vec<_>>>()
                .map(BackgroundSurface::Constant2d),
            BackgroundModel::Linear2d => (0..nframes)
                .map(|k| fit_plane(samples.iter().filter(|s| s.k == k)))
                .collect::<Result<Vec<_>>>()
                .map(BackgroundSurface::Linear2d),
            BackgroundModel::Linear3d => {
                let points: Vec<([f64; 3], f64)> = samples
                    .iter()
                    .map(|s| ([s.x, s.y, s.k as f64 + 0.5], s.value))
                    .collect();
                let (a, [b, c, d]) = fit_hyperplane(&points)?;
                Ok(BackgroundSurface::Linear3d([a, b, c, d]))
            }
            BackgroundModel::Robust => {
                let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
                Ok(BackgroundSurface::Constant3d(huber_location(&values)?))
            }
        }
    }
}
