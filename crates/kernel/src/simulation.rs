use std::collections::BTreeMap;
use std::sync::Arc;

use glam::Vec2;
use meetup_common::{EntityId, EntityKind, EntitySnapshot};
use meetup_events::{Event, EventBus};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::ai::{AiContext, AiController, AiState, Crowd};
use crate::behavior::{Behavior, BehaviorTable};
use crate::entity::Entity;
use crate::spatial::SpatialGrid;
use crate::terrain::{PlayerPositionSource, TerrainOracle};

/// Errors from simulation operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("no behavior registered for entity kind {0}")]
    UnregisteredKind(EntityKind),
    #[error("entity {0} not found")]
    NotFound(EntityId),
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Pairwise responses in invocation order: (responding entity, other entity).
    pub collisions: Vec<(EntityId, EntityId)>,
    pub wall_hits: Vec<EntityId>,
    /// Dead entities evicted at the end of the tick.
    pub evicted: Vec<EntityId>,
}

/// The authoritative entity simulation.
///
/// Entities live in a `BTreeMap` so every tick visits them in id order. With
/// a fixed seed, entity ids and every AI controller's randomness are derived
/// from the seed, so a seeded run replays identically.
pub struct Simulation {
    entities: BTreeMap<EntityId, Entity>,
    behaviors: BehaviorTable,
    grid: SpatialGrid,
    bus: EventBus,
    terrain: Arc<dyn TerrainOracle>,
    player: Arc<dyn PlayerPositionSource>,
    seed: u64,
    ids: StdRng,
    spawned: u64,
    tick: u64,
}

impl Simulation {
    pub fn new(
        bus: EventBus,
        terrain: Arc<dyn TerrainOracle>,
        player: Arc<dyn PlayerPositionSource>,
    ) -> Self {
        Self::with_seed(rand::random(), bus, terrain, player)
    }

    /// Create a simulation whose ids and AI decisions are derived from `seed`.
    pub fn with_seed(
        seed: u64,
        bus: EventBus,
        terrain: Arc<dyn TerrainOracle>,
        player: Arc<dyn PlayerPositionSource>,
    ) -> Self {
        Self {
            entities: BTreeMap::new(),
            behaviors: BehaviorTable::default(),
            grid: SpatialGrid::new(2.0 * meetup_common::TILE_SIZE),
            bus,
            terrain,
            player,
            seed,
            ids: StdRng::seed_from_u64(splitmix64(seed)),
            spawned: 0,
            tick: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn register_behavior(&mut self, kind: EntityKind, behavior: Behavior) {
        self.behaviors.register(kind, behavior);
    }

    pub fn behaviors(&self) -> &BehaviorTable {
        &self.behaviors
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Live entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.entities.values().map(Entity::snapshot).collect()
    }

    pub fn ai_state(&self, id: EntityId) -> Option<AiState> {
        self.entities.get(&id)?.ai.as_ref().map(AiController::state)
    }

    /// Build an entity of `kind` at pixel position (`x`, `y`) and publish EntitySpawn.
    pub fn spawn(&mut self, kind: EntityKind, x: f32, y: f32) -> Result<EntityId, KernelError> {
        let behavior = *self
            .behaviors
            .get(kind)
            .ok_or(KernelError::UnregisteredKind(kind))?;
        let id = self.next_id();
        self.spawned += 1;
        let ai = behavior
            .ai_driven
            .then(|| AiController::new(splitmix64(self.seed ^ self.spawned)));
        let entity = Entity {
            id,
            kind,
            position: Vec2::new(x, y),
            velocity: Vec2::ZERO,
            size: behavior.size,
            speed: behavior.speed,
            dead: false,
            ai,
        };
        let snapshot = entity.snapshot();
        self.grid.insert(id, entity.position);
        self.entities.insert(id, entity);
        tracing::debug!(entity = %id, %kind, x, y, "spawned entity");
        self.bus.publish(Event::entity_spawn(snapshot));
        Ok(id)
    }

    /// Remove an entity and publish EntityRemove. Absent ids are ignored.
    pub fn remove(&mut self, id: EntityId) -> Option<EntitySnapshot> {
        let entity = self.entities.remove(&id)?;
        self.grid.remove(id);
        let snapshot = entity.snapshot();
        tracing::debug!(entity = %id, kind = %entity.kind, "removed entity");
        self.bus.publish(Event::entity_remove(snapshot));
        Some(snapshot)
    }

    pub fn set_velocity(&mut self, id: EntityId, velocity: Vec2) -> Result<(), KernelError> {
        let entity = self.entities.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        entity.velocity = velocity;
        Ok(())
    }

    /// Move an externally driven entity, such as a player avatar.
    pub fn set_position(&mut self, id: EntityId, position: Vec2) -> Result<(), KernelError> {
        let entity = self.entities.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        entity.position = position;
        // Teleports can jump many cells; the grid must not wait for the next tick.
        self.grid.remove(id);
        self.grid.insert(id, position);
        Ok(())
    }

    pub fn set_paused(&mut self, id: EntityId, paused: bool) -> Result<(), KernelError> {
        let entity = self.entities.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        if let Some(ai) = entity.ai.as_mut() {
            ai.set_paused(paused);
        }
        Ok(())
    }

    /// Ids of live entities whose anchor lies within `radius` of `center`, in id order.
    pub fn entities_in_range(&self, center: Vec2, radius: f32) -> Vec<EntityId> {
        in_range(&self.grid, &self.entities, center, radius)
            .map(|entity| entity.id)
            .collect()
    }

    /// Advance every entity by `dt` seconds.
    pub fn tick(&mut self, dt: f32) -> TickReport {
        self.tick += 1;
        let _span = tracing::debug_span!("tick", tick = self.tick).entered();
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        self.grid
            .rebuild(self.entities.values().map(|entity| (entity.id, entity.position)));
        let player = self.player.tracked_position();
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();

        for id in ids {
            let Some(mut entity) = self.entities.remove(&id) else {
                continue;
            };
            let behavior = match self.behaviors.get(entity.kind) {
                Some(behavior) if !entity.dead => *behavior,
                _ => {
                    self.entities.insert(id, entity);
                    continue;
                }
            };

            {
                let crowd = RegistryCrowd {
                    grid: &self.grid,
                    entities: &self.entities,
                };
                let ctx = AiContext {
                    terrain: self.terrain.as_ref(),
                    player,
                    crowd: &crowd,
                };
                (behavior.update)(&mut entity, &ctx, dt);
            }

            let (tx, ty) = entity.tile();
            if !self.terrain.is_passable(tx, ty) {
                (behavior.on_wall)(&mut entity);
                report.wall_hits.push(id);
            }

            let bounds = entity.bounds();
            let overlapping: Vec<EntitySnapshot> = self
                .entities
                .values()
                .filter(|other| !other.dead && other.bounds().overlaps(&bounds))
                .map(Entity::snapshot)
                .collect();
            for other in overlapping {
                (behavior.on_entity)(&mut entity, &other);
                report.collisions.push((id, other.id));
                self.bus
                    .publish(Event::entity_collision(entity.snapshot(), other));
            }

            self.entities.insert(id, entity);
        }

        let dead: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| entity.dead)
            .map(|entity| entity.id)
            .collect();
        for id in dead {
            if self.remove(id).is_some() {
                report.evicted.push(id);
            }
        }

        if !report.collisions.is_empty() || !report.evicted.is_empty() {
            tracing::debug!(
                collisions = report.collisions.len(),
                wall_hits = report.wall_hits.len(),
                evicted = report.evicted.len(),
                "tick resolved"
            );
        }
        report
    }

    /// Order-sensitive hash of every entity's kind, position and velocity.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                h ^= u64::from(*b);
                h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        mix(&self.tick.to_le_bytes());
        for entity in self.entities.values() {
            mix(entity.id.0.as_bytes());
            mix(&[entity.kind as u8]);
            mix(&entity.position.x.to_le_bytes());
            mix(&entity.position.y.to_le_bytes());
            mix(&entity.velocity.x.to_le_bytes());
            mix(&entity.velocity.y.to_le_bytes());
        }
        h
    }

    fn next_id(&mut self) -> EntityId {
        let mut bytes = [0u8; 16];
        self.ids.fill_bytes(&mut bytes);
        EntityId(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

fn in_range<'a>(
    grid: &SpatialGrid,
    entities: &'a BTreeMap<EntityId, Entity>,
    center: Vec2,
    radius: f32,
) -> impl Iterator<Item = &'a Entity> {
    // Grid positions may lag a tick behind; widen the candidate search by a cell.
    grid.candidates(center, radius + grid.cell_size())
        .into_iter()
        .filter_map(|id| entities.get(&id))
        .filter(move |entity| !entity.dead && entity.position.distance(center) < radius)
}

/// Separation view over the registry while one entity is checked out of it.
struct RegistryCrowd<'a> {
    grid: &'a SpatialGrid,
    entities: &'a BTreeMap<EntityId, Entity>,
}

impl Crowd for RegistryCrowd<'_> {
    fn ai_entity_within(&self, position: Vec2, radius: f32, exclude: EntityId) -> bool {
        in_range(self.grid, self.entities, position, radius)
            .any(|entity| entity.id != exclude && entity.is_ai_driven())
    }
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::{BlockedTiles, OpenTerrain, TrackedPlayer};
    use meetup_common::tile_origin;
    use meetup_events::{EventKind, ListenerError};
    use std::sync::Mutex;

    fn bus() -> EventBus {
        EventBus::with_defaults().unwrap()
    }

    fn open_sim(seed: u64) -> Simulation {
        Simulation::with_seed(seed, bus(), Arc::new(OpenTerrain), Arc::new(TrackedPlayer::new()))
    }

    fn record(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(kind, move |event: &Event| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn spawn_builds_kind_and_publishes() {
        let bus = bus();
        let spawns = record(&bus, EventKind::EntitySpawn);
        let mut sim =
            Simulation::with_seed(1, bus.clone(), Arc::new(OpenTerrain), Arc::new(TrackedPlayer::new()));

        let creature = sim.spawn(EntityKind::Creature, 0.0, 0.0).unwrap();
        let device = sim.spawn(EntityKind::CaptureDevice, 64.0, 0.0).unwrap();
        assert_ne!(creature, device);
        assert_eq!(sim.get(creature).unwrap().size, Vec2::splat(32.0));
        assert!(sim.get(creature).unwrap().ai.is_some());
        assert!(sim.get(device).unwrap().ai.is_none());

        bus.shutdown();
        assert_eq!(spawns.lock().unwrap().len(), 2);
    }

    #[test]
    fn unregistered_kind_is_an_error() {
        let mut sim = Simulation::with_seed(
            1,
            bus(),
            Arc::new(OpenTerrain),
            Arc::new(TrackedPlayer::new()),
        );
        sim.behaviors = BehaviorTable::empty();
        assert!(matches!(
            sim.spawn(EntityKind::Creature, 0.0, 0.0),
            Err(KernelError::UnregisteredKind(EntityKind::Creature))
        ));
    }

    #[test]
    fn remove_absent_is_noop() {
        let bus = bus();
        let removals = record(&bus, EventKind::EntityRemove);
        let mut sim =
            Simulation::with_seed(2, bus.clone(), Arc::new(OpenTerrain), Arc::new(TrackedPlayer::new()));
        let id = sim.spawn(EntityKind::Player, 0.0, 0.0).unwrap();

        assert!(sim.remove(id).is_some());
        assert!(sim.remove(id).is_none());
        assert!(sim.remove(EntityId::new()).is_none());
        bus.shutdown();
        assert_eq!(removals.lock().unwrap().len(), 1);
    }

    #[test]
    fn overlapping_pair_gets_one_response_each() {
        let bus = bus();
        let collisions = record(&bus, EventKind::EntityCollision);
        let mut sim =
            Simulation::with_seed(3, bus.clone(), Arc::new(OpenTerrain), Arc::new(TrackedPlayer::new()));
        let a = sim.spawn(EntityKind::Creature, 0.0, 0.0).unwrap();
        let b = sim.spawn(EntityKind::Creature, 10.0, 0.0).unwrap();

        let report = sim.tick(0.1);

        assert_eq!(report.collisions.len(), 2);
        assert!(report.collisions.contains(&(a, b)));
        assert!(report.collisions.contains(&(b, a)));

        bus.shutdown();
        let events = collisions.lock().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn creature_flees_nearby_player_on_first_tick() {
        let player = Arc::new(TrackedPlayer::at(Vec2::new(10.0, 0.0)));
        let mut sim = Simulation::with_seed(4, bus(), Arc::new(OpenTerrain), player);
        let id = sim.spawn(EntityKind::Creature, 0.0, 0.0).unwrap();

        sim.tick(1.0 / 60.0);

        assert_eq!(sim.ai_state(id), Some(AiState::Fleeing));
        assert!(sim.get(id).unwrap().position.x > 0.0);
    }

    #[test]
    fn creature_bounces_off_blocked_tile() {
        let terrain = Arc::new(BlockedTiles::from_tiles([(1, 0)]));
        let mut sim =
            Simulation::with_seed(5, bus(), terrain, Arc::new(TrackedPlayer::new()));
        let id = sim.spawn(EntityKind::Creature, tile_origin(1), 0.0).unwrap();
        sim.set_paused(id, true).unwrap();
        sim.set_velocity(id, Vec2::X).unwrap();

        let report = sim.tick(0.1);

        assert_eq!(report.wall_hits, vec![id]);
        assert_eq!(sim.get(id).unwrap().velocity, -Vec2::X);
    }

    #[test]
    fn capture_device_hitting_creature_is_evicted() {
        let bus = bus();
        let removals = record(&bus, EventKind::EntityRemove);
        let mut sim =
            Simulation::with_seed(6, bus.clone(), Arc::new(OpenTerrain), Arc::new(TrackedPlayer::new()));
        let creature = sim.spawn(EntityKind::Creature, 100.0, 0.0).unwrap();
        let device = sim.spawn(EntityKind::CaptureDevice, 60.0, 8.0).unwrap();
        sim.set_velocity(device, Vec2::new(300.0, 0.0)).unwrap();

        let mut evicted = Vec::new();
        for _ in 0..10 {
            evicted.extend(sim.tick(0.05).evicted);
        }

        assert_eq!(evicted, vec![device]);
        assert!(sim.get(device).is_none());
        assert!(sim.get(creature).is_some());
        bus.shutdown();
        assert_eq!(removals.lock().unwrap().len(), 1);
    }

    #[test]
    fn capture_device_passes_players() {
        let mut sim = open_sim(7);
        let avatar = sim.spawn(EntityKind::Player, 100.0, 0.0).unwrap();
        let device = sim.spawn(EntityKind::CaptureDevice, 90.0, 8.0).unwrap();

        let report = sim.tick(0.05);
        assert!(report.collisions.contains(&(device, avatar)));
        assert!(!sim.get(device).unwrap().dead);
    }

    #[test]
    fn range_query_uses_exact_distance() {
        let mut sim = open_sim(8);
        let near = sim.spawn(EntityKind::Player, 10.0, 0.0).unwrap();
        let edge = sim.spawn(EntityKind::Player, 0.0, 99.0).unwrap();
        let far = sim.spawn(EntityKind::Player, 500.0, 0.0).unwrap();

        let found = sim.entities_in_range(Vec2::ZERO, 100.0);
        assert!(found.contains(&near));
        assert!(found.contains(&edge));
        assert!(!found.contains(&far));
    }

    #[test]
    fn moved_entity_is_found_at_its_new_position() {
        let mut sim = open_sim(8);
        let avatar = sim.spawn(EntityKind::Player, 0.0, 0.0).unwrap();
        sim.set_position(avatar, Vec2::new(1000.0, 1000.0)).unwrap();

        assert_eq!(sim.entities_in_range(Vec2::new(1000.0, 1000.0), 10.0), vec![avatar]);
        assert!(sim.entities_in_range(Vec2::ZERO, 10.0).is_empty());
        assert!(matches!(
            sim.set_position(EntityId::new(), Vec2::ZERO),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn seeded_runs_replay_identically() {
        let run = |seed: u64| {
            let mut sim = open_sim(seed);
            for i in 0..6 {
                sim.spawn(EntityKind::Creature, tile_origin(i * 4), 0.0).unwrap();
            }
            for _ in 0..300 {
                sim.tick(0.1);
            }
            sim.state_hash()
        };
        assert_eq!(run(99), run(99));
        assert_ne!(run(99), run(100));
    }
}
