//! Per-kind behavior table.
//!
//! Each [`EntityKind`] maps to plain function pointers for its update step
//! and its two collision responses. Kinds can be re-registered to change how
//! the simulation treats them.

use std::collections::BTreeMap;

use glam::Vec2;
use meetup_common::{EntityKind, EntitySnapshot};

use crate::ai::{AiContext, Body};
use crate::entity::Entity;

pub type UpdateFn = fn(&mut Entity, &AiContext<'_>, f32);
pub type WallFn = fn(&mut Entity);
pub type ContactFn = fn(&mut Entity, &EntitySnapshot);

#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    pub size: Vec2,
    pub speed: f32,
    /// Entities of this kind get an [`AiController`](crate::AiController) at spawn.
    pub ai_driven: bool,
    pub update: UpdateFn,
    pub on_wall: WallFn,
    pub on_entity: ContactFn,
}

impl Behavior {
    /// Wild creature: AI steering, bounces off walls, separates from other creatures.
    pub fn creature() -> Self {
        Self {
            size: Vec2::splat(32.0),
            speed: 100.0,
            ai_driven: true,
            update: creature_update,
            on_wall: bounce,
            on_entity: creature_contact,
        }
    }

    /// Thrown capture device: straight-line flight, velocity in pixels per second.
    pub fn capture_device() -> Self {
        Self {
            size: Vec2::splat(16.0),
            speed: 1.0,
            ai_driven: false,
            update: integrate,
            on_wall: stop,
            on_entity: capture_contact,
        }
    }

    /// Remote player avatar, positioned externally.
    pub fn player() -> Self {
        Self {
            size: Vec2::splat(32.0),
            speed: 0.0,
            ai_driven: false,
            update: |_, _, _| {},
            on_wall: |_| {},
            on_entity: |_, _| {},
        }
    }
}

fn creature_update(entity: &mut Entity, ctx: &AiContext<'_>, dt: f32) {
    if let Some(ai) = entity.ai.as_mut() {
        let body = Body {
            id: entity.id,
            position: &mut entity.position,
            velocity: &mut entity.velocity,
            speed: entity.speed,
        };
        ai.update(body, ctx, dt);
    }
    integrate(entity, ctx, dt);
}

fn integrate(entity: &mut Entity, _ctx: &AiContext<'_>, dt: f32) {
    entity.position += entity.velocity * entity.speed * dt;
}

fn bounce(entity: &mut Entity) {
    entity.velocity = -entity.velocity;
}

fn stop(entity: &mut Entity) {
    entity.velocity = Vec2::ZERO;
}

fn creature_contact(entity: &mut Entity, other: &EntitySnapshot) {
    if other.kind == EntityKind::Creature {
        entity.velocity = (entity.position - other.position).normalize_or_zero();
    }
}

fn capture_contact(entity: &mut Entity, other: &EntitySnapshot) {
    if other.kind != EntityKind::Player {
        entity.dead = true;
    }
}

/// Registered behaviors, one per kind.
#[derive(Debug, Clone)]
pub struct BehaviorTable {
    entries: BTreeMap<EntityKind, Behavior>,
}

impl BehaviorTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register (or replace) the behavior for `kind`.
    pub fn register(&mut self, kind: EntityKind, behavior: Behavior) {
        if self.entries.insert(kind, behavior).is_some() {
            tracing::debug!(%kind, "replaced entity behavior");
        }
    }

    pub fn get(&self, kind: EntityKind) -> Option<&Behavior> {
        self.entries.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.entries.keys().copied()
    }
}

impl Default for BehaviorTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(EntityKind::Creature, Behavior::creature());
        table.register(EntityKind::CaptureDevice, Behavior::capture_device());
        table.register(EntityKind::Player, Behavior::player());
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::EmptyCrowd;
    use crate::terrain::OpenTerrain;
    use meetup_common::{Bounds, EntityId};

    fn entity(kind: EntityKind, behavior: &Behavior) -> Entity {
        Entity {
            id: EntityId::new(),
            kind,
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            size: behavior.size,
            speed: behavior.speed,
            dead: false,
            ai: None,
        }
    }

    fn other(kind: EntityKind, position: Vec2) -> EntitySnapshot {
        EntitySnapshot {
            id: EntityId::new(),
            kind,
            position,
            velocity: Vec2::ZERO,
            bounds: Bounds::new(position, Vec2::splat(32.0)),
            dead: false,
        }
    }

    #[test]
    fn creature_bounces_and_separates() {
        let behavior = Behavior::creature();
        let mut creature = entity(EntityKind::Creature, &behavior);
        creature.velocity = Vec2::new(1.0, 0.0);
        (behavior.on_wall)(&mut creature);
        assert_eq!(creature.velocity, Vec2::new(-1.0, 0.0));

        (behavior.on_entity)(&mut creature, &other(EntityKind::Creature, Vec2::new(0.0, 10.0)));
        assert_eq!(creature.velocity, Vec2::new(0.0, -1.0));

        // Only other creatures cause a reorientation.
        (behavior.on_entity)(&mut creature, &other(EntityKind::Player, Vec2::new(10.0, 0.0)));
        assert_eq!(creature.velocity, Vec2::new(0.0, -1.0));
    }

    #[test]
    fn capture_device_flies_stops_and_dies() {
        let behavior = Behavior::capture_device();
        let mut device = entity(EntityKind::CaptureDevice, &behavior);
        device.velocity = Vec2::new(200.0, 0.0);
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: None,
            crowd: &EmptyCrowd,
        };
        (behavior.update)(&mut device, &ctx, 0.5);
        assert_eq!(device.position, Vec2::new(100.0, 0.0));

        (behavior.on_entity)(&mut device, &other(EntityKind::Player, Vec2::ZERO));
        assert!(!device.dead);
        (behavior.on_wall)(&mut device);
        assert_eq!(device.velocity, Vec2::ZERO);
        (behavior.on_entity)(&mut device, &other(EntityKind::Creature, Vec2::ZERO));
        assert!(device.dead);
    }

    #[test]
    fn default_table_covers_every_kind() {
        let table = BehaviorTable::default();
        let kinds: Vec<_> = table.kinds().collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Creature, EntityKind::CaptureDevice, EntityKind::Player]
        );
        assert!(table.get(EntityKind::Creature).unwrap().ai_driven);
        assert_eq!(table.get(EntityKind::CaptureDevice).unwrap().size, Vec2::splat(16.0));
    }
}
