use std::collections::BTreeSet;
use std::sync::RwLock;

use glam::Vec2;

/// Read-only view of world terrain in tile coordinates.
pub trait TerrainOracle: Send + Sync {
    fn is_passable(&self, tile_x: i32, tile_y: i32) -> bool;
}

/// Terrain where every tile is walkable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenTerrain;

impl TerrainOracle for OpenTerrain {
    fn is_passable(&self, _tile_x: i32, _tile_y: i32) -> bool {
        true
    }
}

/// Open terrain with an explicit set of blocked tiles.
#[derive(Debug, Default)]
pub struct BlockedTiles {
    blocked: RwLock<BTreeSet<(i32, i32)>>,
}

impl BlockedTiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tiles(tiles: impl IntoIterator<Item = (i32, i32)>) -> Self {
        Self {
            blocked: RwLock::new(tiles.into_iter().collect()),
        }
    }

    pub fn block(&self, tile_x: i32, tile_y: i32) {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((tile_x, tile_y));
    }

    pub fn clear(&self, tile_x: i32, tile_y: i32) {
        self.blocked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(tile_x, tile_y));
    }

    /// Block every tile on the border of a `width` x `height` rectangle at the origin.
    pub fn walled(width: i32, height: i32) -> Self {
        let mut tiles = BTreeSet::new();
        for x in -1..=width {
            tiles.insert((x, -1));
            tiles.insert((x, height));
        }
        for y in -1..=height {
            tiles.insert((-1, y));
            tiles.insert((width, y));
        }
        Self {
            blocked: RwLock::new(tiles),
        }
    }
}

impl TerrainOracle for BlockedTiles {
    fn is_passable(&self, tile_x: i32, tile_y: i32) -> bool {
        !self
            .blocked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(tile_x, tile_y))
    }
}

/// Supplies the position creatures flee from.
pub trait PlayerPositionSource: Send + Sync {
    fn tracked_position(&self) -> Option<Vec2>;
}

/// Settable tracked position, shared between the session layer and the tick thread.
#[derive(Debug, Default)]
pub struct TrackedPlayer {
    position: RwLock<Option<Vec2>>,
}

impl TrackedPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(position: Vec2) -> Self {
        Self {
            position: RwLock::new(Some(position)),
        }
    }

    pub fn set(&self, position: Option<Vec2>) {
        *self
            .position
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = position;
    }
}

impl PlayerPositionSource for TrackedPlayer {
    fn tracked_position(&self) -> Option<Vec2> {
        *self
            .position
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walled_area_blocks_border_only() {
        let terrain = BlockedTiles::walled(4, 3);
        assert!(terrain.is_passable(0, 0));
        assert!(terrain.is_passable(3, 2));
        assert!(!terrain.is_passable(-1, 0));
        assert!(!terrain.is_passable(4, 1));
        assert!(!terrain.is_passable(2, 3));
        assert!(!terrain.is_passable(-1, -1));
    }

    #[test]
    fn blocked_tiles_can_be_toggled() {
        let terrain = BlockedTiles::new();
        terrain.block(2, 2);
        assert!(!terrain.is_passable(2, 2));
        terrain.clear(2, 2);
        assert!(terrain.is_passable(2, 2));
    }

    #[test]
    fn tracked_player_updates() {
        let player = TrackedPlayer::new();
        assert_eq!(player.tracked_position(), None);
        player.set(Some(Vec2::new(3.0, 4.0)));
        assert_eq!(player.tracked_position(), Some(Vec2::new(3.0, 4.0)));
    }
}
