//! 2-D grid geometry shared by every connection set.
//!
//! Units live in row-major arenas (`index = x + y * width`); connections refer
//! to peers by index only.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};
use crate::prng::WeightRng;

pub type UnitId = usize;

/// Width and height of a unit grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GridSize {
    pub width: usize,
    pub height: usize,
}

impl GridSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize) -> UnitId {
        debug_assert!(x < self.width && y < self.height);
        x + y * self.width
    }

    #[inline]
    pub fn coords(&self, index: UnitId) -> (usize, usize) {
        (index % self.width, index / self.width)
    }

    pub(crate) fn validate(&self, what: &'static str) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(HierarchyError::InvalidDimensions {
                what,
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    /// Map a cell of `self` onto the proportional cell of `target`.
    ///
    /// Corners map to corners; a single-cell axis maps everything to 0.
    pub fn project(&self, x: usize, y: usize, target: GridSize) -> (usize, usize) {
        (
            project_axis(x, self.width, target.width),
            project_axis(y, self.height, target.height),
        )
    }
}

fn project_axis(pos: usize, from: usize, to: usize) -> usize {
    if from <= 1 {
        return 0;
    }
    let ratio = (to as f32 - 1.0) / (from as f32 - 1.0);
    let mapped = (pos as f32 * ratio).round() as usize;
    mapped.min(to.saturating_sub(1))
}

/// One weighted, index-addressed connection.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Connection {
    pub index: UnitId,
    pub weight: f32,
    /// Distance scaling in `[0, 1]`, fixed at construction.
    pub falloff: f32,
}

/// Linear distance falloff: 1 at the centre, reaching 0 just past `radius`.
#[inline]
pub fn falloff(dx: isize, dy: isize, radius: usize) -> f32 {
    let dist = ((dx * dx + dy * dy) as f32).sqrt();
    (1.0 - dist / (radius as f32 + 1.0)).max(0.0)
}

/// Enumerate the cells of `grid` within a square `radius` of `(cx, cy)`.
///
/// Rows are visited top to bottom and cells left to right, so weight draws
/// are reproducible for a given generator.
pub fn neighborhood(
    grid: GridSize,
    cx: usize,
    cy: usize,
    radius: usize,
    include_center: bool,
) -> impl Iterator<Item = (UnitId, f32)> {
    let r = radius as isize;
    let (cx, cy) = (cx as isize, cy as isize);
    let (w, h) = (grid.width as isize, grid.height as isize);

    (-r..=r).flat_map(move |dy| {
        (-r..=r).filter_map(move |dx| {
            if !include_center && dx == 0 && dy == 0 {
                return None;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x < 0 || x >= w || y < 0 || y >= h {
                return None;
            }
            Some(((x + y * w) as UnitId, falloff(dx, dy, radius)))
        })
    })
}

/// Build connections over a neighbourhood with weights drawn from `[low, high)`.
pub fn connect<R: WeightRng>(
    cells: impl Iterator<Item = (UnitId, f32)>,
    low: f32,
    high: f32,
    rng: &mut R,
) -> Vec<Connection> {
    cells
        .map(|(index, falloff)| Connection {
            index,
            weight: rng.gen_range_f32(low, high),
            falloff,
        })
        .collect()
}

/// Rescale several connection sets so their combined weight vector has unit norm.
pub fn normalize_jointly(sets: &mut [&mut [Connection]]) {
    let norm2: f32 = sets
        .iter()
        .flat_map(|set| set.iter())
        .map(|c| c.weight * c.weight)
        .sum();
    if norm2 <= 0.0 {
        return;
    }
    let scale = 1.0 / norm2.sqrt();
    for set in sets.iter_mut() {
        for c in set.iter_mut() {
            c.weight *= scale;
        }
    }
}

/// Weighted sum `Σ falloff · weight · values[index]`.
#[inline]
pub fn weighted_sum(connections: &[Connection], values: impl Fn(UnitId) -> f32) -> f32 {
    connections
        .iter()
        .map(|c| c.falloff * c.weight * values(c.index))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    #[test]
    fn neighborhood_clips_at_edges() {
        let grid = GridSize::new(4, 4);
        let corner: Vec<_> = neighborhood(grid, 0, 0, 1, true).collect();
        assert_eq!(corner.len(), 4);
        let center: Vec<_> = neighborhood(grid, 1, 1, 1, true).collect();
        assert_eq!(center.len(), 9);
        let no_self: Vec<_> = neighborhood(grid, 1, 1, 1, false).collect();
        assert_eq!(no_self.len(), 8);
        assert!(no_self.iter().all(|&(i, _)| i != grid.index(1, 1)));
    }

    #[test]
    fn falloff_decreases_with_distance() {
        assert_eq!(falloff(0, 0, 2), 1.0);
        assert!(falloff(1, 0, 2) > falloff(2, 0, 2));
        assert!(falloff(2, 2, 2) >= 0.0);
        assert_eq!(falloff(5, 5, 1), 0.0);
    }

    #[test]
    fn projection_maps_corners_to_corners() {
        let hidden = GridSize::new(4, 3);
        let visible = GridSize::new(16, 9);
        assert_eq!(hidden.project(0, 0, visible), (0, 0));
        assert_eq!(hidden.project(3, 2, visible), (15, 8));

        let single = GridSize::new(1, 1);
        assert_eq!(hidden.project(3, 2, single), (0, 0));
        assert_eq!(single.project(0, 0, visible), (0, 0));
    }

    #[test]
    fn joint_normalization_gives_unit_norm() {
        let grid = GridSize::new(5, 5);
        let mut rng = Prng::new(3);
        let mut a = connect(neighborhood(grid, 2, 2, 1, true), -1.0, 1.0, &mut rng);
        let mut b = connect(neighborhood(grid, 0, 0, 2, true), -1.0, 1.0, &mut rng);
        normalize_jointly(&mut [a.as_mut_slice(), b.as_mut_slice()]);
        let norm2: f32 = a.iter().chain(b.iter()).map(|c| c.weight * c.weight).sum();
        assert!((norm2 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(GridSize::new(0, 3).validate("hidden").is_err());
        assert!(GridSize::new(3, 3).validate("hidden").is_ok());
    }
}
