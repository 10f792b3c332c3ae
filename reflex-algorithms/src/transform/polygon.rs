//! Area overlap of a quadrilateral with a unit grid.
//!
//! Each quadrilateral is clipped against every grid cell its bounding
//! rectangle touches (Sutherland–Hodgman against the four cell edges).
//! The clipped areas, divided by the quadrilateral's area, give the
//! fraction of the source pixel landing in each cell.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

use nalgebra::Vector2;

/// Quads with less area than this are treated as empty.
const MIN_AREA: f64 = 1e-15;

/// Fraction of a source quad falling in grid cell `(row, col)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMatch {
    /// Grid row.
    pub row: usize,
    /// Grid column.
    pub col: usize,
    /// Share of the source quad's area.
    pub fraction: f64,
}

/// Signed shoelace area.
fn signed_area(poly: &[Vector2<f64>]) -> f64 {
    let n = poly.len();
    (0..n)
        .map(|a| {
            let (p, q) = (poly[a], poly[(a + 1) % n]);
            p.x * q.y - q.x * p.y
        })
        .sum::<f64>()
        * 0.5
}

/// Clips `poly` to the half-plane `coord(axis) >= bound` (or `<=` when
/// `keep_below`).
fn clip(poly: &[Vector2<f64>], axis: usize, bound: f64, keep_below: bool) -> Vec<Vector2<f64>> {
    let inside = |p: &Vector2<f64>| {
        if keep_below {
            p[axis] <= bound
        } else {
            p[axis] >= bound
        }
    };
    let mut out = Vec::with_capacity(poly.len() + 2);
    for a in 0..poly.len() {
        let current = poly[a];
        let previous = poly[(a + poly.len() - 1) % poly.len()];
        let (cin, pin) = (inside(&current), inside(&previous));
        if cin != pin {
            let t = (bound - previous[axis]) / (current[axis] - previous[axis]);
            out.push(previous + (current - previous) * t);
        }
        if cin {
            out.push(current);
        }
    }
    out
}

/// Splits `quad` over the cells of a `rows × cols` unit grid whose cell
/// `(r, c)` spans `[c, c+1) × [r, r+1)` in `(x, y)`.
///
/// Fractions sum to 1 when the quad lies inside the grid and to less when
/// part of it falls outside.
#[must_use]
pub fn quad_to_grid(quad: &[Vector2<f64>; 4], rows: usize, cols: usize) -> Vec<GridMatch> {
    let area = signed_area(quad).abs();
    if area < MIN_AREA {
        return Vec::new();
    }

    let (mut xmin, mut xmax, mut ymin, mut ymax) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for p in quad {
        xmin = xmin.min(p.x);
        xmax = xmax.max(p.x);
        ymin = ymin.min(p.y);
        ymax = ymax.max(p.y);
    }
    if xmax <= 0.0 || ymax <= 0.0 || xmin >= cols as f64 || ymin >= rows as f64 {
        return Vec::new();
    }
    let c0 = xmin.floor().max(0.0) as usize;
    let c1 = (xmax.ceil() as usize).min(cols);
    let r0 = ymin.floor().max(0.0) as usize;
    let r1 = (ymax.ceil() as usize).min(rows);

    let mut matches = Vec::new();
    for row in r0..r1 {
        let (y0, y1) = (row as f64, row as f64 + 1.0);
        let band = clip(&clip(quad, 1, y0, false), 1, y1, true);
        if band.len() < 3 {
            continue;
        }
        for col in c0..c1 {
            let (x0, x1) = (col as f64, col as f64 + 1.0);
            let cell = clip(&clip(&band, 0, x0, false), 0, x1, true);
            if cell.len() < 3 {
                continue;
            }
            let overlap = signed_area(&cell).abs();
            if overlap > 0.0 {
                matches.push(GridMatch {
                    row,
                    col,
                    fraction: overlap / area,
                });
            }
        }
    }
    matches
}
