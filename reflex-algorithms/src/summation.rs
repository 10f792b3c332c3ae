//! Summation integration.

use ndarray::Zip;
use rayon::prelude::*;
use reflex_core::{
    Error, Intensity, MaskCode, Pixel, ReflectionFlags, ReflectionTable, Result, Shoebox,
    FAILED_VARIANCE,
};

/// Background-subtracted sum over the signal pixels of one shoebox.
///
/// The variance is `Σc + (n_fg / n_bg)·Σb`, the background term being
/// dropped when no background pixels were used.
#[allow(clippy::cast_precision_loss)]
pub fn integrate_sum<T: Pixel>(shoebox: &Shoebox<T>) -> Result<Intensity> {
    shoebox.check_consistent()?;
    if shoebox.has_invalid_foreground() {
        return Err(Error::InvalidForegroundPixels);
    }

    let mut sum_c = 0.0;
    let mut sum_b = 0.0;
    let mut n_fg = 0usize;
    let mut n_bg = 0usize;
    Zip::from(&shoebox.data)
        .and(&shoebox.background)
        .and(&shoebox.mask)
        .for_each(|&c, &b, &m| {
            if m.has(MaskCode::SIGNAL) {
                sum_c += c.widen();
                sum_b += b.widen();
                n_fg += 1;
            } else if m.has(MaskCode::BACKGROUND_FIT) {
                n_bg += 1;
            }
        });
    if n_fg == 0 {
        return Err(Error::NoForegroundPixels);
    }

    let mut variance = sum_c.abs();
    if n_bg > 0 {
        variance += (n_fg as f64 / n_bg as f64) * sum_b.abs();
    }
    Ok(Intensity::new(sum_c - sum_b, variance))
}

/// Sums every reflection not marked `DONT_INTEGRATE`.
///
/// Writes `intensity_sum_*` and sets `INTEGRATED_SUM` on success; failed
/// rows keep the failure sentinels. Returns the number of successes.
pub fn integrate_sum_table<T: Pixel>(table: &mut ReflectionTable<T>) -> Result<usize> {
    table.check_consistent()?;
    let results: Vec<Option<Result<Intensity>>> = table
        .shoebox
        .par_iter()
        .zip(&table.flags)
        .map(|(shoebox, flags)| {
            (!flags.contains(ReflectionFlags::DONT_INTEGRATE)).then(|| integrate_sum(shoebox))
        })
        .collect();

    let mut num_success = 0;
    for (index, result) in results.into_iter().enumerate() {
        table.flags[index].remove(ReflectionFlags::INTEGRATED_SUM);
        table.intensity_sum_value[index] = 0.0;
        table.intensity_sum_variance[index] = FAILED_VARIANCE;
        match result {
            Some(Ok(intensity)) => {
                table.intensity_sum_value[index] = intensity.value;
                table.intensity_sum_variance[index] = intensity.variance;
                table.flags[index].insert(ReflectionFlags::INTEGRATED_SUM);
                num_success += 1;
            }
            Some(Err(err)) => log::debug!("summation: reflection {index} failed: {err}"),
            None => {}
        }
    }
    log::info!(
        "summation: integrated {num_success} of {} reflections",
        table.len()
    );
    Ok(num_success)
}
