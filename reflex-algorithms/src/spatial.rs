//! Sort-and-sweep collision detection for axis-aligned boxes.
//!
//! Boxes are sorted by their lower x bound and swept left to right. An
//! active list holds the boxes whose x range still covers the sweep
//! position; each new box is tested against the active list on y and z.

use reflex_core::BoundingBox;

/// All pairs `(a, b)`, `a < b`, of boxes overlapping on all three axes.
///
/// Ranges are half-open, so boxes that only touch do not collide. Pairs
/// are returned sorted.
#[must_use]
pub fn detect_collisions3d(boxes: &[BoundingBox]) -> Vec<(usize, usize)> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by_key(|&i| (boxes[i].x0, i));

    let mut active: Vec<usize> = Vec::new();
    let mut pairs = Vec::new();
    for &current in &order {
        let b = &boxes[current];
        active.retain(|&other| boxes[other].x1 > b.x0);
        for &other in &active {
            let o = &boxes[other];
            if o.y0 < b.y1 && b.y0 < o.y1 && o.z0 < b.z1 && b.z0 < o.z1 {
                pairs.push((other.min(current), other.max(current)));
            }
        }
        active.push(current);
    }
    pairs.sort_unstable();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(lo: i32, hi: i32) -> BoundingBox {
        BoundingBox::new(lo, hi, lo, hi, lo, hi).unwrap()
    }

    #[test]
    fn test_overlap_and_disjoint() {
        let boxes = [cube(0, 2), cube(1, 3), cube(10, 12)];
        assert_eq!(detect_collisions3d(&boxes), vec![(0, 1)]);
    }

    #[test]
    fn test_touching_boxes_do_not_collide() {
        let boxes = [cube(0, 2), cube(2, 4)];
        assert!(detect_collisions3d(&boxes).is_empty());
    }

    #[test]
    fn test_separated_on_one_axis() {
        let a = BoundingBox::new(0, 10, 0, 10, 0, 5).unwrap();
        let b = BoundingBox::new(2, 8, 2, 8, 5, 9).unwrap();
        let c = BoundingBox::new(2, 8, 12, 14, 0, 5).unwrap();
        assert!(detect_collisions3d(&[a, b, c]).is_empty());
    }

    #[test]
    fn test_matches_brute_force() {
        let mut boxes = Vec::new();
        for n in 0..60_i32 {
            let x = (n * 37) % 50;
            let y = (n * 11) % 40;
            let z = (n * 7) % 20;
            boxes.push(BoundingBox::new(x, x + 4 + n % 3, y, y + 3, z, z + 2 + n % 4).unwrap());
        }
        let mut expected = Vec::new();
        for a in 0..boxes.len() {
            for b in a + 1..boxes.len() {
                if boxes[a].intersects(&boxes[b]) {
                    expected.push((a, b));
                }
            }
        }
        assert_eq!(detect_collisions3d(&boxes), expected);
    }

    #[test]
    fn test_empty() {
        assert!(detect_collisions3d(&[]).is_empty());
    }
}
