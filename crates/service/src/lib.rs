//! Server services: configuration, player data request handlers, save rate
//! limiting, sessions, and the context that wires stores, bus and simulation together.
//!
//! # Invariants
//! - Every request gets exactly one response; no handler error escapes as a panic.
//! - A save inside the cooldown window writes nothing and leaves the ledger untouched.
//! - Shutdown stops the event bus before flushing the stores.

pub mod config;
pub mod context;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod protocol;
pub mod sessions;

pub use config::{ConfigError, ServerConfig};
pub use context::{ServerContext, ServiceError, ShutdownSummary};
pub use handlers::{GetRequest, GetResponse, PlayerDataHandler, SaveRequest, SaveResponse};
pub use ledger::RateLimitLedger;
pub use lifecycle::LifecycleHooks;
pub use protocol::{Request, Response, dispatch, encode, handle_line};
pub use sessions::{SessionManager, SessionResponse, register_persistence_listeners};

pub fn crate_info() -> &'static str {
    "meetup-service v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_info_names_the_crate() {
        assert_eq!(crate_info(), "meetup-service v0.1.0");
    }
}
