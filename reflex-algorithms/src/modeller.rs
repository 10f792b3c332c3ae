//! Reference profile modelling and profile fitting over a reflection table.

use crate::coordinate_system::CoordinateSystem;
use crate::fitting::{fit_profile, ProfileFit};
use crate::reference::{ReferenceAccumulator, ReferenceProfiles};
use crate::sampler::Sampler;
use crate::transform::{TransformForward, TransformSpec};
use nalgebra::Vector3;
use ndarray::Zip;
use rayon::prelude::*;
use reflex_core::{
    Error, Experiment, MaskCode, Pixel, ProfileConfig, ReflectionFlags, ReflectionTable, Result,
    FAILED_VARIANCE,
};

/// Builds reference profiles from strong reflections and fits them to
/// every reflection.
#[derive(Debug, Clone)]
pub struct ProfileModeller {
    config: ProfileConfig,
    spec: TransformSpec,
    sampler: Sampler,
}

impl ProfileModeller {
    /// Validates `config` and builds the transform grid and sampler.
    pub fn new(experiment: &Experiment, config: ProfileConfig) -> Result<Self> {
        config.validate()?;
        let spec = TransformSpec::from_config(experiment, &config)?;
        let sampler = Sampler::from_config(experiment, &config)?;
        log::debug!(
            "modeller: grid {:?}, {} sampler cells",
            spec.grid_size(),
            sampler.size()
        );
        Ok(Self {
            config,
            spec,
            sampler,
        })
    }

    /// Profile configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }

    /// Reference grid description.
    #[must_use]
    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    /// Sampler mapping positions to reference cells.
    #[must_use]
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Empty accumulator matching this modeller's sampler and grid.
    #[must_use]
    pub fn accumulator(&self) -> ReferenceAccumulator {
        ReferenceAccumulator::new(self.sampler.size(), self.spec.grid_size())
    }

    fn coordinate_system(&self, s1: Vector3<f64>, phi: f64) -> Result<CoordinateSystem> {
        let experiment = self.spec.experiment();
        CoordinateSystem::new(
            experiment.goniometer.rotation_axis,
            experiment.beam.s0,
            s1,
            phi,
        )
    }

    fn in_volume<T: Pixel>(&self, table: &ReflectionTable<T>, index: usize) -> bool {
        let experiment = self.spec.experiment();
        let shoebox = &table.shoebox[index];
        experiment
            .detector
            .panel(shoebox.panel)
            .is_ok_and(|panel| {
                shoebox.is_bbox_within_image_volume(
                    panel.image_size(),
                    experiment.scan.array_range,
                )
            })
    }

    fn is_trainable<T: Pixel>(&self, table: &ReflectionTable<T>, index: usize) -> bool {
        let flags = table.flags[index];
        table.partiality[index] > self.config.min_partiality
            && flags.contains(ReflectionFlags::INTEGRATED_SUM)
            && !flags.contains(ReflectionFlags::DONT_INTEGRATE)
            && self.in_volume(table, index)
            && !table.shoebox[index].has_invalid_foreground()
    }

    fn is_fittable<T: Pixel>(&self, table: &ReflectionTable<T>, index: usize) -> bool {
        !table.flags[index].contains(ReflectionFlags::DONT_INTEGRATE)
            && self.in_volume(table, index)
            && !table.shoebox[index].has_invalid_foreground()
    }

    fn train_one<T: Pixel>(
        &self,
        table: &ReflectionTable<T>,
        index: usize,
        accumulator: &mut ReferenceAccumulator,
    ) -> Result<()> {
        let shoebox = &table.shoebox[index];
        let cs = self.coordinate_system(table.s1[index], table.xyzcal_mm[index].z)?;
        let mask = shoebox.mask_matching(MaskCode::SIGNAL);
        let data = shoebox.data_minus_background();
        let transformed = TransformForward::new(
            &self.spec,
            &cs,
            shoebox.bbox,
            shoebox.panel,
            data.view(),
            mask.view(),
        )?;
        let profile = transformed.profile().view();
        for (cell, weight) in self.sampler.nearest_n(&table.xyzcal_px[index])? {
            accumulator.add(cell, weight, &profile)?;
        }
        Ok(())
    }

    /// Training pass.
    ///
    /// Every eligible reflection adds its transformed, background
    /// subtracted profile to the cells around its predicted position.
    /// Workers accumulate independently and are merged at the end.
    /// Reflections that contributed get `USED_IN_MODELLING` and
    /// `TRANSFORMED`.
    pub fn model<T: Pixel>(&self, table: &mut ReflectionTable<T>) -> Result<ReferenceAccumulator> {
        table.check_consistent()?;
        let eligible: Vec<usize> = (0..table.len())
            .filter(|&index| self.is_trainable(table, index))
            .collect();

        let shared: &ReflectionTable<T> = table;
        let (accumulator, used) = eligible
            .par_iter()
            .fold(
                || (self.accumulator(), Vec::new()),
                |(mut accumulator, mut used), &index| {
                    match self.train_one(shared, index, &mut accumulator) {
                        Ok(()) => used.push(index),
                        Err(err) => log::debug!("modeller: reflection {index} skipped: {err}"),
                    }
                    (accumulator, used)
                },
            )
            .map(Ok::<_, Error>)
            .try_reduce(
                || (self.accumulator(), Vec::new()),
                |(mut a, mut used_a), (b, used_b)| {
                    a.merge(&b)?;
                    used_a.extend(used_b);
                    Ok((a, used_a))
                },
            )?;

        for flags in &mut table.flags {
            flags.remove(ReflectionFlags::USED_IN_MODELLING);
        }
        for &index in &used {
            table.flags[index].insert(ReflectionFlags::USED_IN_MODELLING | ReflectionFlags::TRANSFORMED);
        }

        log::info!(
            "modeller: {} of {} eligible reflections used in {} reference profiles",
            used.len(),
            eligible.len(),
            accumulator.num_cells()
        );
        Ok(accumulator)
    }

    /// Normalises an accumulator with the configured weight and voxel
    /// thresholds.
    #[must_use]
    pub fn finalize(&self, accumulator: ReferenceAccumulator) -> ReferenceProfiles {
        let profiles = accumulator.finalize(self.config.min_weight, self.config.threshold);
        let empty = profiles.num_cells() - profiles.num_usable();
        if empty > 0 {
            log::warn!(
                "modeller: {empty} of {} reference profiles have insufficient data",
                profiles.num_cells()
            );
        }
        profiles
    }

    fn fit_one<T: Pixel>(
        &self,
        table: &ReflectionTable<T>,
        index: usize,
        reference: &ReferenceProfiles,
    ) -> Result<ProfileFit> {
        let shoebox = &table.shoebox[index];
        let cell = self.sampler.nearest(&table.xyzcal_px[index])?;
        let (profile, usable) = reference.usable(cell)?;

        let cs = self.coordinate_system(table.s1[index], table.xyzcal_mm[index].z)?;
        let mask = shoebox.mask_matching(MaskCode::SIGNAL);
        let data = shoebox.data.mapv(T::widen);
        let background = shoebox.background.mapv(T::widen);
        let transformed = TransformForward::with_background(
            &self.spec,
            &cs,
            shoebox.bbox,
            shoebox.panel,
            data.view(),
            background.view(),
            mask.view(),
        )?;
        let (c, b) = transformed.into_parts();
        let b = b.ok_or_else(|| Error::degenerate("background was not transformed"))?;

        let fit_mask = Zip::from(usable)
            .and(profile)
            .map_collect(|&u, &p| u && p > 0.0);
        let fit = fit_profile(
            &profile.view(),
            &fit_mask.view(),
            &c.view(),
            &b.view(),
            self.config.fit_eps,
            self.config.fit_max_iter,
        )?;
        if self.config.strict_convergence {
            fit.require_converged()
        } else {
            if !fit.converged {
                log::debug!(
                    "fitting: reflection {index} accepted after {} iterations (error {})",
                    fit.niter,
                    fit.error
                );
            }
            Ok(fit)
        }
    }

    /// Fitting pass.
    ///
    /// Resets the profile-fitted columns to their failure sentinels, then
    /// fits every eligible reflection against the reference of its nearest
    /// cell. Returns the number of successful fits.
    pub fn fit<T: Pixel>(
        &self,
        table: &mut ReflectionTable<T>,
        reference: &ReferenceProfiles,
    ) -> Result<usize> {
        table.check_consistent()?;
        if reference.num_cells() != self.sampler.size()
            || reference.grid_size() != self.spec.grid_size()
        {
            return Err(Error::ConfigError(format!(
                "reference has {} cells of {:?}, expected {} of {:?}",
                reference.num_cells(),
                reference.grid_size(),
                self.sampler.size(),
                self.spec.grid_size()
            )));
        }

        let shared: &ReflectionTable<T> = table;
        let results: Vec<Option<Result<ProfileFit>>> = (0..shared.len())
            .into_par_iter()
            .map(|index| {
                self.is_fittable(shared, index)
                    .then(|| self.fit_one(shared, index, reference))
            })
            .collect();

        let mut num_success = 0;
        let mut num_attempted = 0;
        for (index, result) in results.into_iter().enumerate() {
            table.intensity_prf_value[index] = 0.0;
            table.intensity_prf_variance[index] = FAILED_VARIANCE;
            table.profile_correlation[index] = 0.0;
            table.flags[index].remove(ReflectionFlags::INTEGRATED_PRF);

            let Some(result) = result else { continue };
            num_attempted += 1;
            match result {
                Ok(fit) => {
                    table.intensity_prf_value[index] = fit.intensity;
                    table.intensity_prf_variance[index] = fit.variance;
                    table.profile_correlation[index] = fit.correlation;
                    table.flags[index]
                        .insert(ReflectionFlags::INTEGRATED_PRF | ReflectionFlags::TRANSFORMED);
                    num_success += 1;
                }
                Err(err) => log::debug!("fitting: reflection {index} failed: {err}"),
            }
        }

        log::info!(
            "fitting: successfully fitted {num_success} of {num_attempted} reflections ({} in table)",
            table.len()
        );
        Ok(num_success)
    }
}
