mod runtime;
mod transport;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meetup_common::SystemClock;
use meetup_events::{Event, EventBus, EventKind, ListenerError};
use meetup_kernel::{BlockedTiles, Simulation, TrackedPlayer};
use meetup_persist::{FsMedium, PlayerStore, Record, RecordStore, WorldRecord, WorldStore};
use meetup_service::context::populate_creatures;
use meetup_service::{LifecycleHooks, ServerConfig, ServerContext};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meetup-server", about = "Multiplayer world server")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Run the server until interrupted
    Serve {
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Run a headless simulation twice and compare the results
    Simulate {
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "200")]
        ticks: u64,
        /// RNG seed for deterministic replay
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Creatures to spawn
        #[arg(short, long, default_value = "8")]
        creatures: usize,
    },
    /// List stored players, worlds and world backups
    Inspect,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("meetup-server v{}", env!("CARGO_PKG_VERSION"));
            println!("persist: {}", meetup_persist::crate_info());
            println!("service: {}", meetup_service::crate_info());
            println!("storage root: {}", config.storage.root.display());
            println!("bind: {}", config.network.bind);
        }
        Commands::Serve { bind } => serve(config, bind)?,
        Commands::Simulate {
            ticks,
            seed,
            creatures,
        } => {
            println!("Deterministic replay: seed={seed}, ticks={ticks}, creatures={creatures}");
            let first = simulate(&config, seed, ticks, creatures)?;
            let second = simulate(&config, seed, ticks, creatures)?;
            println!(
                "Run 1: entities={}, collisions={}, hash={:#018x}",
                first.entities, first.collisions, first.hash
            );
            println!(
                "Run 2: entities={}, collisions={}, hash={:#018x}",
                second.entities, second.collisions, second.hash
            );
            println!(
                "Match: {}",
                if first == second { "OK" } else { "MISMATCH" }
            );
        }
        Commands::Inspect => inspect(&config)?,
    }

    Ok(())
}

fn serve(mut config: ServerConfig, bind: Option<String>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.network.bind = bind;
    }
    let started = Instant::now();
    let ctx = Arc::new(ServerContext::bootstrap(config).context("starting server")?);

    let on_signal = Arc::clone(&ctx);
    ctrlc::set_handler(move || on_signal.on_shutdown_requested())
        .context("installing signal handler")?;

    let world = ctx.open_world()?;
    let sim = ctx.build_simulation()?;
    let ticker = runtime::spawn_tick_loop(Arc::clone(&ctx), sim).context("spawning tick loop")?;

    let bind = ctx.config().network.bind.clone();
    let served = TcpListener::bind(&bind)
        .with_context(|| format!("binding {bind}"))
        .and_then(|listener| {
            transport::serve(Arc::clone(&ctx), listener).context("serving connections")
        });
    // Whatever stopped the accept loop, stop the tick loop too.
    ctx.on_shutdown_requested();

    match ticker.join() {
        Ok((_, summary)) => tracing::info!(ticks = summary.ticks, "simulation stopped"),
        Err(_) => tracing::error!("tick loop panicked"),
    }

    let session_ms = started.elapsed().as_millis() as u64;
    if let Err(error) = ctx.save_world(world, session_ms) {
        tracing::error!(%error, "failed to save world");
    }
    let summary = ctx.shutdown();
    if summary.players.failed > 0 || summary.worlds.failed > 0 {
        tracing::error!(
            players_failed = summary.players.failed,
            worlds_failed = summary.worlds.failed,
            "some records were not flushed"
        );
    }
    served
}

#[derive(Debug, PartialEq, Eq)]
struct SimulationOutcome {
    entities: usize,
    collisions: u64,
    hash: u64,
}

fn simulate(
    config: &ServerConfig,
    seed: u64,
    ticks: u64,
    creatures: usize,
) -> anyhow::Result<SimulationOutcome> {
    let bus = EventBus::new(config.events.bus_config())?;
    let collisions = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&collisions);
    bus.subscribe(EventKind::EntityCollision, move |_: &Event| -> Result<(), ListenerError> {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    let width = config.simulation.area_width;
    let height = config.simulation.area_height;
    let mut sim = Simulation::with_seed(
        seed,
        bus.clone(),
        Arc::new(BlockedTiles::walled(width, height)),
        Arc::new(TrackedPlayer::new()),
    );
    populate_creatures(&mut sim, creatures, width, height)?;

    let dt = config.simulation.tick_interval().as_secs_f32();
    for _ in 0..ticks {
        sim.tick(dt);
    }
    let report = bus.shutdown();
    tracing::debug!(drained = report.drained, "simulation bus stopped");

    Ok(SimulationOutcome {
        entities: sim.entity_count(),
        collisions: collisions.load(Ordering::Relaxed),
        hash: sim.state_hash(),
    })
}

fn inspect(config: &ServerConfig) -> anyhow::Result<()> {
    let root = &config.storage.root;
    let medium: Arc<FsMedium> = Arc::new(
        FsMedium::open(root).with_context(|| format!("opening {}", root.display()))?,
    );
    let clock = Arc::new(SystemClock);
    let options = config.storage.store_options();
    let players: PlayerStore = RecordStore::open(medium.clone(), clock.clone(), options.clone())?;
    let worlds: WorldStore = RecordStore::open(medium, clock, options)?;

    let player_keys = players.keys()?;
    println!("players: {}", player_keys.len());
    for id in &player_keys {
        match players.load(id) {
            Ok(Some(record)) => println!("  {id}  {}  ({}, {})", record.username, record.x, record.y),
            Ok(None) => println!("  {id}  <missing>"),
            Err(error) => println!("  {id}  <unreadable: {error}>"),
        }
    }

    let world_keys = worlds.keys()?;
    println!("worlds: {}", world_keys.len());
    for name in &world_keys {
        let backups = match (worlds.backups(), WorldRecord::backup_dir(name)) {
            (Some(manager), Some(dir)) => manager.list(&dir)?,
            _ => Vec::new(),
        };
        match worlds.load(name) {
            Ok(Some(world)) => println!(
                "  {name}  seed={}  played={}s  backups={}",
                world.config.seed,
                world.played_time_ms / 1000,
                backups.len()
            ),
            Ok(None) => println!("  {name}  <missing>"),
            Err(error) => println!("  {name}  <unreadable: {error}>"),
        }
        for backup in backups {
            println!("    {backup}");
        }
    }
    Ok(())
}
