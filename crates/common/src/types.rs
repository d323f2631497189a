use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an entity in the simulation. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identity of a player account (not a display name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The closed set of entity variants the simulation knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Autonomous wild creature driven by an AI controller.
    Creature,
    /// Thrown capture device travelling in a straight line.
    CaptureDevice,
    /// Avatar of a connected player, driven externally.
    Player,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creature => "creature",
            Self::CaptureDevice => "capture_device",
            Self::Player => "player",
        };
        f.write_str(name)
    }
}

/// Axis-aligned bounding box anchored at its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub origin: Vec2,
    pub size: Vec2,
}

impl Bounds {
    pub fn new(origin: Vec2, size: Vec2) -> Self {
        Self { origin, size }
    }

    /// Strict overlap test: boxes that only touch along an edge do not overlap.
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.origin.x < other.origin.x + other.size.x
            && self.origin.x + self.size.x > other.origin.x
            && self.origin.y < other.origin.y + other.size.y
            && self.origin.y + self.size.y > other.origin.y
    }
}

/// Immutable copy of an entity's observable state, carried by events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub kind: EntityKind,
    pub position: Vec2,
    pub velocity: Vec2,
    pub bounds: Bounds,
    pub dead: bool,
}
