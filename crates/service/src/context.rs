use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use meetup_common::{Clock, EntityKind, SystemClock, tile_origin};
use meetup_events::{BusError, Event, EventBus, EventKind, EventPayload, ListenerError, ShutdownReport};
use meetup_kernel::{BlockedTiles, KernelError, Simulation, TrackedPlayer};
use meetup_persist::{
    FlushReport, FsMedium, PlayerStore, RecordStore, StorageMedium, StoreError, WorldRecord,
    WorldStore,
};

use crate::config::{ConfigError, ServerConfig};
use crate::handlers::PlayerDataHandler;
use crate::lifecycle::LifecycleHooks;
use crate::sessions::{SessionManager, register_persistence_listeners};

/// Errors from building or running the server context.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to open storage root {path}: {source}")]
    StorageRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// What shutting the context down did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub events: ShutdownReport,
    pub players: FlushReport,
    pub worlds: FlushReport,
}

/// Everything a running server shares, built once at startup.
pub struct ServerContext {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    players: Arc<PlayerStore>,
    worlds: Arc<WorldStore>,
    bus: EventBus,
    handler: PlayerDataHandler,
    sessions: SessionManager,
    tracked: Arc<TrackedPlayer>,
    terrain: Arc<BlockedTiles>,
    shutdown_requested: AtomicBool,
    focused: AtomicBool,
}

impl ServerContext {
    /// Open file-backed storage under `config.storage.root` and start the bus.
    pub fn bootstrap(config: ServerConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let root = config.storage.root.clone();
        let medium = FsMedium::open(&root)
            .map_err(|source| ServiceError::StorageRoot { path: root, source })?;
        Self::with_medium(config, Arc::new(medium), Arc::new(SystemClock))
    }

    pub fn with_medium(
        config: ServerConfig,
        medium: Arc<dyn StorageMedium>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        let options = config.storage.store_options();
        let players: Arc<PlayerStore> = Arc::new(RecordStore::open(
            Arc::clone(&medium),
            Arc::clone(&clock),
            options.clone(),
        )?);
        let worlds: Arc<WorldStore> =
            Arc::new(RecordStore::open(medium, Arc::clone(&clock), options)?);

        let bus = EventBus::new(config.events.bus_config())?;
        register_persistence_listeners(&bus, Arc::clone(&players));
        register_logging_listeners(&bus);

        let tracked = Arc::new(TrackedPlayer::new());
        let handler = PlayerDataHandler::new(
            Arc::clone(&players),
            Arc::clone(&clock),
            config.rate_limit.save_cooldown_ms,
        );
        let sessions = SessionManager::new(
            bus.clone(),
            Arc::clone(&players),
            Arc::clone(&tracked),
            Arc::clone(&clock),
        );
        let terrain = Arc::new(BlockedTiles::walled(
            config.simulation.area_width,
            config.simulation.area_height,
        ));

        tracing::info!(
            root = %config.storage.root.display(),
            cooldown_ms = config.rate_limit.save_cooldown_ms,
            "server context ready"
        );
        Ok(Self {
            config,
            clock,
            players,
            worlds,
            bus,
            handler,
            sessions,
            tracked,
            terrain,
            shutdown_requested: AtomicBool::new(false),
            focused: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn players(&self) -> &Arc<PlayerStore> {
        &self.players
    }

    pub fn worlds(&self) -> &Arc<WorldStore> {
        &self.worlds
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn handler(&self) -> &PlayerDataHandler {
        &self.handler
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tracked_player(&self) -> &Arc<TrackedPlayer> {
        &self.tracked
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Load the configured world, creating it on first start.
    pub fn open_world(&self) -> Result<WorldRecord, ServiceError> {
        let name = self.config.storage.world_name.clone();
        if let Some(world) = self.worlds.load(&name)? {
            tracing::info!(world = %name, seed = world.config.seed, "loaded world");
            return Ok(world);
        }
        let seed = self
            .config
            .storage
            .server_seed
            .or(self.config.simulation.seed)
            .unwrap_or_else(rand::random);
        let world = WorldRecord::new(name.clone(), seed, self.clock.now_unix_ms());
        self.worlds.save(&name, world.clone())?;
        tracing::info!(world = %name, seed, "created world");
        Ok(self.worlds.load(&name)?.unwrap_or(world))
    }

    /// Stamp play time onto `world` and save it, taking a backup of the previous version.
    pub fn save_world(&self, mut world: WorldRecord, session_ms: u64) -> Result<(), ServiceError> {
        world.last_played = self.clock.now_unix_ms();
        world.played_time_ms = world.played_time_ms.saturating_add(session_ms);
        let name = world.name.clone();
        self.worlds.save(&name, world)?;
        Ok(())
    }

    /// Build the live simulation and populate it with the configured creatures.
    pub fn build_simulation(&self) -> Result<Simulation, ServiceError> {
        let sim_config = &self.config.simulation;
        let seed = sim_config.seed.unwrap_or_else(rand::random);
        let mut sim = Simulation::with_seed(
            seed,
            self.bus.clone(),
            self.terrain.clone(),
            self.tracked.clone(),
        );

        let spawned = populate_creatures(
            &mut sim,
            sim_config.creatures,
            sim_config.area_width,
            sim_config.area_height,
        )?;
        if spawned < sim_config.creatures {
            tracing::warn!(
                spawned,
                requested = sim_config.creatures,
                "play area full; not spawning more creatures"
            );
        }
        tracing::info!(seed, entities = sim.entity_count(), "simulation built");
        Ok(sim)
    }

    /// Stop the bus (draining queued listener work) and flush both stores.
    pub fn shutdown(&self) -> ShutdownSummary {
        let events = self.bus.shutdown();
        let players = self.players.shutdown();
        let worlds = self.worlds.shutdown();
        tracing::info!(
            events_drained = events.drained,
            players_written = players.written,
            worlds_written = worlds.written,
            "server context shut down"
        );
        ShutdownSummary {
            events,
            players,
            worlds,
        }
    }
}

impl LifecycleHooks for ServerContext {
    fn on_shutdown_requested(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("shutdown requested");
        }
    }

    fn on_focus_change(&self, focused: bool) {
        let previous = self.focused.swap(focused, Ordering::SeqCst);
        if previous != focused {
            tracing::info!(focused, "focus changed");
        }
    }
}

/// Spawn up to `count` creatures three tiles apart, row by row, inside a
/// `width` x `height` tile area. Returns how many fit.
pub fn populate_creatures(
    sim: &mut Simulation,
    count: usize,
    width: i32,
    height: i32,
) -> Result<usize, KernelError> {
    let columns = ((width.max(1) + 2) / 3).max(1) as usize;
    for i in 0..count {
        let ty = (i / columns) as i32 * 3;
        if ty >= height {
            return Ok(i);
        }
        let tx = (i % columns) as i32 * 3;
        sim.spawn(EntityKind::Creature, tile_origin(tx), tile_origin(ty))?;
    }
    Ok(count)
}

/// Gameplay-facing log lines for simulation events.
fn register_logging_listeners(bus: &EventBus) {
    for kind in [EventKind::EntitySpawn, EventKind::EntityRemove, EventKind::EntityCollision] {
        bus.subscribe(kind, |event: &Event| -> Result<(), ListenerError> {
            match &event.payload {
                EventPayload::EntitySpawn { entity } => {
                    tracing::debug!(entity = %entity.id, kind = %entity.kind, "entity spawned");
                }
                EventPayload::EntityRemove { entity } => {
                    tracing::debug!(entity = %entity.id, kind = %entity.kind, "entity removed");
                }
                EventPayload::EntityCollision { first, second } => {
                    tracing::trace!(first = %first.id, second = %second.id, "entities collided");
                }
                _ => {}
            }
            Ok(())
        });
    }
}
