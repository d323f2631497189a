//! World Kernel: authoritative entity simulation, collision resolution and creature AI.
//!
//! # Invariants
//! - A tick visits live entities in id order on a single thread.
//! - Every AI-driven entity owns exactly one [`AiController`]; other kinds own none.
//! - An overlapping pair produces one response and one collision event per
//!   entity per tick (two of each for the pair).
//! - Dead entities are evicted at the end of the tick that killed them; ids are never reused.

pub mod ai;
pub mod behavior;
pub mod entity;
pub mod simulation;
pub mod spatial;
pub mod terrain;

pub use ai::{AiContext, AiController, AiState, Crowd};
pub use behavior::{Behavior, BehaviorTable};
pub use entity::Entity;
pub use simulation::{KernelError, Simulation, TickReport};
pub use spatial::SpatialGrid;
pub use terrain::{BlockedTiles, OpenTerrain, PlayerPositionSource, TerrainOracle, TrackedPlayer};
