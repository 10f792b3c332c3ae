//! Masking of pixels shared by overlapping shoeboxes.
//!
//! A pixel inside two shoeboxes belongs to the reflection whose predicted
//! centroid is closest to the pixel centre. The other shoebox loses it:
//! `VALID` is cleared and the pixel is marked as an overlapped foreground
//! or background pixel.
#![allow(clippy::cast_sign_loss)]

use nalgebra::Vector3;
use rayon::prelude::*;
use reflex_core::{
    AdjacencyList, BoundingBox, Error, MaskCode, Pixel, ReflectionFlags, ReflectionTable, Result,
    Shoebox,
};

/// Pixels taken from one shoebox by its neighbours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskedPixels {
    /// Foreground pixels lost.
    pub foreground: usize,
    /// Background pixels lost.
    pub background: usize,
}

impl MaskedPixels {
    /// All pixels lost.
    #[must_use]
    pub fn total(&self) -> usize {
        self.foreground + self.background
    }
}

/// Masks pixels of `shoebox` (predicted at `own`) that lie closer to any
/// of `neighbours`.
pub fn mask_neighbours<T: Pixel>(
    shoebox: &mut Shoebox<T>,
    own: &Vector3<f64>,
    neighbours: &[(BoundingBox, Vector3<f64>)],
) -> MaskedPixels {
    let mut masked = MaskedPixels::default();
    let bbox = shoebox.bbox;
    for (other_bbox, other) in neighbours {
        let Some(region) = bbox.intersection(other_bbox) else {
            continue;
        };
        for z in region.z0..region.z1 {
            for y in region.y0..region.y1 {
                for x in region.x0..region.x1 {
                    let centre = Vector3::new(
                        f64::from(x) + 0.5,
                        f64::from(y) + 0.5,
                        f64::from(z) + 0.5,
                    );
                    if (centre - other).norm_squared() >= (centre - own).norm_squared() {
                        continue;
                    }
                    let index = [
                        (z - bbox.z0) as usize,
                        (y - bbox.y0) as usize,
                        (x - bbox.x0) as usize,
                    ];
                    let code = &mut shoebox.mask[index];
                    if !code.has(MaskCode::VALID) {
                        continue;
                    }
                    code.remove(MaskCode::VALID);
                    if code.has(MaskCode::FOREGROUND) {
                        code.insert(MaskCode::OVERLAPPED_FOREGROUND);
                        masked.foreground += 1;
                    } else {
                        code.insert(MaskCode::OVERLAPPED_BACKGROUND);
                        masked.background += 1;
                    }
                }
            }
        }
    }
    masked
}

/// Masks every overlap recorded in `graph`.
///
/// Every reflection gets `OVERLAP_CHECKED`; those that lost pixels also
/// get `OVERLAPPED_FG` and/or `OVERLAPPED_BG`. Returns the number of
/// reflections that lost pixels.
pub fn mask_overlapping<T: Pixel>(
    table: &mut ReflectionTable<T>,
    graph: &AdjacencyList,
) -> Result<usize> {
    table.check_consistent()?;
    if graph.num_vertices() != table.len() {
        return Err(Error::ConfigError(format!(
            "adjacency list has {} vertices for {} reflections",
            graph.num_vertices(),
            table.len()
        )));
    }

    let bboxes = table.bboxes();
    let centres = table.xyzcal_px.clone();
    let masked: Vec<MaskedPixels> = table
        .shoebox
        .par_iter_mut()
        .enumerate()
        .map(|(index, shoebox)| {
            let neighbours: Vec<(BoundingBox, Vector3<f64>)> = graph
                .adjacent_vertices(index)
                .iter()
                .map(|&other| (bboxes[other], centres[other]))
                .collect();
            mask_neighbours(shoebox, &centres[index], &neighbours)
        })
        .collect();

    let mut num_masked = 0;
    for (flags, m) in table.flags.iter_mut().zip(&masked) {
        flags.insert(ReflectionFlags::OVERLAP_CHECKED);
        if m.foreground > 0 {
            flags.insert(ReflectionFlags::OVERLAPPED_FG);
        }
        if m.background > 0 {
            flags.insert(ReflectionFlags::OVERLAPPED_BG);
        }
        if m.total() > 0 {
            num_masked += 1;
        }
    }
    log::info!(
        "masking: {num_masked} of {} shoeboxes lost pixels to {} overlaps",
        table.len(),
        graph.num_edges()
    );
    Ok(num_masked)
}
