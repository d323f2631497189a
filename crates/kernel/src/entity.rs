use glam::Vec2;
use meetup_common::{Bounds, EntityId, EntityKind, EntitySnapshot, to_tile};

use crate::ai::AiController;

/// A live simulated entity. Owned by the simulation registry.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Top-left corner in pixels.
    pub position: Vec2,
    pub velocity: Vec2,
    pub size: Vec2,
    /// Scale applied to `velocity` by kinds that move in unit directions.
    pub speed: f32,
    /// Tombstone; dead entities are evicted at the end of the tick.
    pub dead: bool,
    /// Present exactly for AI-driven kinds.
    pub ai: Option<AiController>,
}

impl Entity {
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.position, self.size)
    }

    /// Tile holding the entity's anchor corner.
    pub fn tile(&self) -> (i32, i32) {
        (to_tile(self.position.x), to_tile(self.position.y))
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            id: self.id,
            kind: self.kind,
            position: self.position,
            velocity: self.velocity,
            bounds: self.bounds(),
            dead: self.dead,
        }
    }

    pub fn is_ai_driven(&self) -> bool {
        self.ai.is_some()
    }
}
