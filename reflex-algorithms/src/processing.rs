//! High-level integration pipeline combining every stage.

use crate::background::{BackgroundConfig, BackgroundCreator};
use crate::masking::mask_overlapping;
use crate::modeller::ProfileModeller;
use crate::overlap::OverlapFinder;
use crate::reference::ReferenceProfiles;
use crate::summation::integrate_sum_table;
use reflex_core::{Experiment, Pixel, ProfileConfig, ReflectionTable, Result};
use std::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters for [`Integrator`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegrationParams {
    /// Reference profile and fitting settings.
    pub profile: ProfileConfig,
    /// Background model and outlier rejection.
    pub background: BackgroundConfig,
    /// Experiment id ranges `[start, end)` whose reflections may overlap;
    /// empty places every experiment in one group.
    pub experiment_groups: Vec<(usize, usize)>,
    /// Mask pixels shared between overlapping shoeboxes.
    pub mask_overlaps: bool,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        Self::new(ProfileConfig::default(), BackgroundConfig::default())
    }
}

impl IntegrationParams {
    /// Parameters with overlap masking enabled and a single experiment
    /// group.
    #[must_use]
    pub fn new(profile: ProfileConfig, background: BackgroundConfig) -> Self {
        Self {
            profile,
            background,
            experiment_groups: Vec::new(),
            mask_overlaps: true,
        }
    }

    /// Restricts overlap detection to reflections of the same group.
    #[must_use]
    pub fn with_experiment_groups(mut self, groups: Vec<(usize, usize)>) -> Self {
        self.experiment_groups = groups;
        self
    }

    /// Enables or disables overlap masking.
    #[must_use]
    pub fn with_mask_overlaps(mut self, mask_overlaps: bool) -> Self {
        self.mask_overlaps = mask_overlaps;
        self
    }
}

/// Per-stage counts from one [`Integrator::integrate`] run.
#[derive(Clone, Debug)]
pub struct IntegrationReport {
    /// Rows in the table.
    pub num_reflections: usize,
    /// Edges in the overlap graph.
    pub num_overlaps: usize,
    /// Reflections that lost pixels to a neighbour.
    pub num_overlap_masked: usize,
    /// Reflections with a fitted background.
    pub num_background: usize,
    /// Reflections with a summation intensity.
    pub num_summed: usize,
    /// Reflections that contributed to a reference profile.
    pub num_modelled: usize,
    /// Reflections with a profile fitted intensity.
    pub num_fitted: usize,
    /// Finalized reference profiles used for fitting.
    pub reference: ReferenceProfiles,
}

/// Runs overlap masking, background modelling, summation, reference
/// profile modelling and profile fitting over a reflection table.
#[derive(Clone, Debug)]
pub struct Integrator {
    params: IntegrationParams,
    overlaps: OverlapFinder,
    background: BackgroundCreator,
    modeller: ProfileModeller,
}

impl Integrator {
    /// Builds every stage for `experiment`, validating `params`.
    pub fn new(experiment: &Experiment, params: IntegrationParams) -> Result<Self> {
        let overlaps = OverlapFinder::new(params.experiment_groups.clone())?;
        let background = BackgroundCreator::new(params.background);
        let modeller = ProfileModeller::new(experiment, params.profile.clone())?;
        Ok(Self {
            params,
            overlaps,
            background,
            modeller,
        })
    }

    /// Parameters this integrator was built with.
    #[must_use]
    pub fn params(&self) -> &IntegrationParams {
        &self.params
    }

    /// Reference profile modeller.
    #[must_use]
    pub fn modeller(&self) -> &ProfileModeller {
        &self.modeller
    }

    /// Integrates every reflection in `table` in place.
    ///
    /// Per-reflection failures are recorded in the table's flags and
    /// result columns; an error is returned only for malformed input such
    /// as an inconsistent table.
    pub fn integrate<T: Pixel>(&self, table: &mut ReflectionTable<T>) -> Result<IntegrationReport> {
        table.check_consistent()?;
        let start = Instant::now();
        log::info!("integrate: {} reflections", table.len());

        let mut num_overlaps = 0;
        let mut num_overlap_masked = 0;
        if self.params.mask_overlaps {
            let graph = self
                .overlaps
                .find(&table.id, &table.panels(), &table.bboxes())?;
            num_overlaps = graph.num_edges();
            num_overlap_masked = mask_overlapping(table, &graph)?;
        }

        let num_background = self.background.compute_background(table)?;
        let num_summed = integrate_sum_table(table)?;

        let accumulator = self.modeller.model(table)?;
        let num_modelled = table.count_flags(reflex_core::ReflectionFlags::USED_IN_MODELLING);
        let reference = self.modeller.finalize(accumulator);
        let num_fitted = self.modeller.fit(table, &reference)?;

        log::info!(
            "integrate: {num_summed} summed, {num_fitted} profile fitted of {} in {:.2?}",
            table.len(),
            start.elapsed()
        );
        Ok(IntegrationReport {
            num_reflections: table.len(),
            num_overlaps,
            num_overlap_masked,
            num_background,
            num_summed,
            num_modelled,
            num_fitted,
            reference,
        })
    }
}
