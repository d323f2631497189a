//! Shared types for the meetup world server: identifiers, entity kinds,
//! bounding boxes and the clock abstraction.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, now_unix_ms};
pub use types::{Bounds, EntityId, EntityKind, EntitySnapshot, PlayerId};

/// Side length of one terrain tile in world units (pixels).
pub const TILE_SIZE: f32 = 32.0;

/// Convert a world position component to its tile coordinate.
pub fn to_tile(v: f32) -> i32 {
    (v / TILE_SIZE).floor() as i32
}

/// Pixel position of a tile's top-left corner.
pub fn tile_origin(tile: i32) -> f32 {
    tile as f32 * TILE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_conversion_floors_negative_positions() {
        assert_eq!(to_tile(0.0), 0);
        assert_eq!(to_tile(31.9), 0);
        assert_eq!(to_tile(32.0), 1);
        assert_eq!(to_tile(-0.5), -1);
        assert_eq!(tile_origin(-2), -64.0);
    }
}
