//! Background creation.
//!
//! [`BackgroundCreator`] runs outlier rejection, fits a
//! [`BackgroundModel`] to the surviving background pixels and writes the
//! fitted surface into the shoebox. Failures are isolated per shoebox.

mod model;
mod outlier;

pub use model::{BackgroundModel, BackgroundSurface};
pub use outlier::OutlierRejector;

use ndarray::Zip;
use rayon::prelude::*;
use reflex_core::{Error, MaskCode, Pixel, ReflectionFlags, ReflectionTable, Result, Shoebox};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Background modelling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BackgroundConfig {
    /// Surface fitted to the background pixels.
    pub model: BackgroundModel,
    /// `None` uses every background candidate.
    pub rejector: Option<OutlierRejector>,
}

impl BackgroundConfig {
    /// Configuration fitting `model` to every background candidate.
    #[must_use]
    pub fn new(model: BackgroundModel) -> Self {
        Self {
            model,
            rejector: None,
        }
    }

    /// Applies `rejector` before fitting.
    #[must_use]
    pub fn with_rejector(mut self, rejector: OutlierRejector) -> Self {
        self.rejector = Some(rejector);
        self
    }
}

/// Per-shoebox outcome of a batch background run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackgroundBatch {
    /// Whether each shoebox was modelled.
    pub success: Vec<bool>,
    /// Mean squared error of each fit; 0 for failures.
    pub mse: Vec<f64>,
}

impl BackgroundBatch {
    /// Number of shoeboxes modelled.
    #[must_use]
    pub fn num_success(&self) -> usize {
        self.success.iter().filter(|&&s| s).count()
    }
}

/// Fits background surfaces to shoeboxes.
#[derive(Debug, Clone, Default)]
pub struct BackgroundCreator {
    config: BackgroundConfig,
}

impl BackgroundCreator {
    /// Creator applying `config`.
    #[must_use]
    pub fn new(config: BackgroundConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    /// Models the background of one shoebox and returns the fit's mean
    /// squared error over the pixels it used.
    pub fn create<T: Pixel>(&self, shoebox: &mut Shoebox<T>) -> Result<f64> {
        shoebox.check_consistent()?;

        match &self.config.rejector {
            Some(rejector) => rejector.mark(&shoebox.data.view(), &mut shoebox.mask.view_mut())?,
            None => shoebox.mask.mapv_inplace(|m| {
                if m.has(MaskCode::BACKGROUND_CANDIDATE) {
                    m | MaskCode::BACKGROUND_USED
                } else {
                    m - MaskCode::BACKGROUND_USED
                }
            }),
        }

        let surface = self
            .config
            .model
            .fit(&shoebox.data.view(), &shoebox.mask.view())?;

        for ((k, j, i), b) in shoebox.background.indexed_iter_mut() {
            *b = T::narrow(surface.value(k, j, i));
        }

        let mut sum_sq = 0.0;
        let mut count = 0usize;
        Zip::from(&shoebox.data)
            .and(&shoebox.background)
            .and(&shoebox.mask)
            .for_each(|&d, &b, &m| {
                if m.has(MaskCode::BACKGROUND_FIT) {
                    sum_sq += (d.widen() - b.widen()).powi(2);
                    count += 1;
                }
            });
        if count == 0 {
            return Err(Error::NoBackgroundPixels);
        }
        #[allow(clippy::cast_precision_loss)]
        let mse = sum_sq / count as f64;
        Ok(mse)
    }

    /// Models every shoebox in parallel. A failed shoebox is reported
    /// with `success = false` and `mse = 0` and does not stop the batch.
    pub fn create_batch<T: Pixel>(&self, shoeboxes: &mut [Shoebox<T>]) -> BackgroundBatch {
        let results: Vec<Result<f64>> = shoeboxes
            .par_iter_mut()
            .map(|shoebox| self.create(shoebox))
            .collect();

        let mut batch = BackgroundBatch {
            success: Vec::with_capacity(results.len()),
            mse: Vec::with_capacity(results.len()),
        };
        for result in results {
            match result {
                Ok(mse) => {
                    batch.success.push(true);
                    batch.mse.push(mse);
                }
                Err(err) => {
                    log::debug!("background fit failed: {err}");
                    batch.success.push(false);
                    batch.mse.push(0.0);
                }
            }
        }
        batch
    }

    /// Models the background of every reflection in the table.
    ///
    /// Writes `background_mse` and `background_mean`; sets
    /// `BACKGROUND_FITTED` on success and `DONT_INTEGRATE` on failure.
    /// Returns the number of reflections modelled.
    pub fn compute_background<T: Pixel>(&self, table: &mut ReflectionTable<T>) -> Result<usize> {
        table.check_consistent()?;
        let batch = self.create_batch(&mut table.shoebox);

        for (index, (&ok, &mse)) in batch.success.iter().zip(&batch.mse).enumerate() {
            table.background_mse[index] = mse;
            if ok {
                table.background_mean[index] = table.shoebox[index].mean_background().unwrap_or(0.0);
                table.flags[index].insert(ReflectionFlags::BACKGROUND_FITTED);
            } else {
                table.background_mean[index] = 0.0;
                table.flags[index].remove(ReflectionFlags::BACKGROUND_FITTED);
                table.flags[index].insert(ReflectionFlags::DONT_INTEGRATE);
            }
        }

        let num_success = batch.num_success();
        log::info!(
            "background: successfully processed {num_success} of {} shoeboxes",
            table.len()
        );
        Ok(num_success)
    }
}
