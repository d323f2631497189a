use std::collections::{BTreeSet, HashMap};

use glam::Vec2;
use meetup_common::EntityId;

/// A cell coordinate in the partition grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Uniform grid over entity positions, rebuilt once per tick.
///
/// Entities are bucketed by `floor(position / cell_size)`. Queries return
/// candidates only; callers filter by exact distance.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f32,
    cells: HashMap<CellCoord, Vec<EntityId>>,
}

impl SpatialGrid {
    /// `cell_size` values that are not positive fall back to one tile.
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 {
            cell_size
        } else {
            meetup_common::TILE_SIZE
        };
        Self {
            cell_size,
            cells: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn rebuild(&mut self, entries: impl IntoIterator<Item = (EntityId, Vec2)>) {
        self.cells.clear();
        for (id, position) in entries {
            self.insert(id, position);
        }
    }

    pub fn insert(&mut self, id: EntityId, position: Vec2) {
        let coord = self.position_to_cell(position);
        self.cells.entry(coord).or_default().push(id);
    }

    pub fn remove(&mut self, id: EntityId) {
        self.cells.retain(|_, ids| {
            ids.retain(|candidate| *candidate != id);
            !ids.is_empty()
        });
    }

    pub fn position_to_cell(&self, position: Vec2) -> CellCoord {
        CellCoord {
            x: (position.x / self.cell_size).floor() as i32,
            y: (position.y / self.cell_size).floor() as i32,
        }
    }

    /// Candidate ids in every cell touched by the square around `center`,
    /// in id order.
    pub fn candidates(&self, center: Vec2, radius: f32) -> BTreeSet<EntityId> {
        let radius = radius.max(0.0);
        let min = self.position_to_cell(center - Vec2::splat(radius));
        let max = self.position_to_cell(center + Vec2::splat(radius));
        let mut result = BTreeSet::new();
        let span = (i64::from(max.x) - i64::from(min.x) + 1)
            .saturating_mul(i64::from(max.y) - i64::from(min.y) + 1);
        if span > self.cells.len() as i64 {
            // Fewer occupied cells than cells in the square: scan those instead.
            for (coord, ids) in &self.cells {
                if (min.x..=max.x).contains(&coord.x) && (min.y..=max.y).contains(&coord.y) {
                    result.extend(ids.iter().copied());
                }
            }
            return result;
        }
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                if let Some(ids) = self.cells.get(&CellCoord::new(x, y)) {
                    result.extend(ids.iter().copied());
                }
            }
        }
        result
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn total_placements(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_to_cell_floors() {
        let grid = SpatialGrid::new(64.0);
        assert_eq!(grid.position_to_cell(Vec2::new(10.0, 10.0)), CellCoord::new(0, 0));
        assert_eq!(grid.position_to_cell(Vec2::new(70.0, -5.0)), CellCoord::new(1, -1));
    }

    #[test]
    fn candidates_cover_touched_cells() {
        let mut grid = SpatialGrid::new(64.0);
        let near = EntityId::new();
        let edge = EntityId::new();
        let far = EntityId::new();
        grid.rebuild([
            (near, Vec2::new(5.0, 5.0)),
            (edge, Vec2::new(100.0, 0.0)),
            (far, Vec2::new(1000.0, 1000.0)),
        ]);

        let found = grid.candidates(Vec2::new(30.0, 30.0), 40.0);
        assert!(found.contains(&near));
        assert!(found.contains(&edge));
        assert!(!found.contains(&far));
        assert_eq!(grid.cell_count(), 3);
    }

    #[test]
    fn huge_radius_scans_occupied_cells_only() {
        let mut grid = SpatialGrid::new(32.0);
        let a = EntityId::new();
        let b = EntityId::new();
        grid.rebuild([(a, Vec2::new(-5000.0, 12.0)), (b, Vec2::new(3.0e6, -3.0e6))]);

        for radius in [1.0e9, f32::MAX, f32::INFINITY] {
            let found = grid.candidates(Vec2::ZERO, radius);
            assert_eq!(found, BTreeSet::from([a, b]));
        }
        assert!(grid.candidates(Vec2::new(-5000.0, 12.0), 1.0).contains(&a));
        assert!(!grid.candidates(Vec2::new(-5000.0, 12.0), 1.0).contains(&b));
    }

    #[test]
    fn remove_drops_empty_cells() {
        let mut grid = SpatialGrid::new(32.0);
        let id = EntityId::new();
        grid.insert(id, Vec2::ZERO);
        grid.remove(id);
        assert_eq!(grid.total_placements(), 0);
        assert_eq!(grid.cell_count(), 0);
    }

    #[test]
    fn bad_cell_size_falls_back_to_tile() {
        assert_eq!(SpatialGrid::new(0.0).cell_size(), meetup_common::TILE_SIZE);
    }
}
