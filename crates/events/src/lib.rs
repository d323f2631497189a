//! Event bus: typed publish/subscribe with delivery on a fixed worker pool.
//!
//! # Invariants
//! - Events are immutable once published; listeners only observe.
//! - Publishing never blocks on listener execution.
//! - After shutdown begins, published events are dropped, not queued.

pub mod bus;
pub mod event;

pub use bus::{BusConfig, BusError, BusStats, EventBus, Listener, ListenerError, ShutdownReport};
pub use event::{Event, EventKind, EventPayload};
