//! Save/load request handling for player records.
//!
//! Handlers always answer: validation failures, rate-limit rejections and
//! storage errors all become failure responses with a human-readable message.

use std::sync::Arc;

use meetup_common::{Clock, PlayerId};
use meetup_persist::{PlayerRecord, PlayerStore};
use serde::{Deserialize, Serialize};

use crate::ledger::RateLimitLedger;

pub const MSG_INVALID_REQUEST: &str = "Invalid request data";
pub const MSG_INVALID_IDENTITY: &str = "Invalid UUID";
pub const MSG_IDENTITY_MISMATCH: &str = "Identity mismatch";
pub const MSG_TOO_FREQUENT: &str = "Save request too frequent";
pub const MSG_SAVED: &str = "Player data saved successfully";
pub const MSG_NOT_FOUND: &str = "Player data not found";
pub const MSG_RETRIEVED: &str = "Player data retrieved successfully";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub record: Option<PlayerRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub identity: Option<String>,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    pub identity: Option<String>,
    pub record: Option<PlayerRecord>,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

/// Parse a request identity. Blank or malformed ids are rejected.
pub fn parse_identity(raw: Option<&str>) -> Option<PlayerId> {
    let raw = raw?.trim();
    uuid::Uuid::parse_str(raw).ok().map(PlayerId)
}

pub struct PlayerDataHandler {
    store: Arc<PlayerStore>,
    ledger: RateLimitLedger,
    clock: Arc<dyn Clock>,
}

impl PlayerDataHandler {
    pub fn new(store: Arc<PlayerStore>, clock: Arc<dyn Clock>, cooldown_ms: i64) -> Self {
        Self {
            store,
            ledger: RateLimitLedger::new(cooldown_ms),
            clock,
        }
    }

    pub fn ledger(&self) -> &RateLimitLedger {
        &self.ledger
    }

    pub fn handle_save(&self, request: SaveRequest) -> SaveResponse {
        let now = self.clock.now_unix_ms();
        let respond = |success: bool, message: String| SaveResponse {
            identity: request.identity.clone(),
            success,
            message,
            timestamp: now,
        };

        let (Some(identity), Some(record)) = (
            parse_identity(request.identity.as_deref()),
            request.record.clone(),
        ) else {
            tracing::debug!(identity = ?request.identity, "rejected malformed save request");
            return respond(false, MSG_INVALID_REQUEST.into());
        };
        if record.identity != identity {
            tracing::debug!(%identity, record = %record.identity, "rejected save for another identity");
            return respond(false, MSG_IDENTITY_MISMATCH.into());
        }
        if self.ledger.is_limited(identity, now) {
            tracing::debug!(%identity, "save rate limited");
            return respond(false, MSG_TOO_FREQUENT.into());
        }

        match self.store.save(&identity, record) {
            Ok(()) => {
                self.ledger.record(identity, now);
                tracing::info!(%identity, "player data saved");
                respond(true, MSG_SAVED.into())
            }
            Err(error) => {
                tracing::error!(%identity, %error, "failed to save player data");
                respond(false, format!("Server error: {error}"))
            }
        }
    }

    pub fn handle_load(&self, request: GetRequest) -> GetResponse {
        let now = self.clock.now_unix_ms();
        let respond = |record: Option<PlayerRecord>, success: bool, message: String| GetResponse {
            identity: request.identity.clone(),
            record,
            success,
            message,
            timestamp: now,
        };

        let Some(identity) = parse_identity(request.identity.as_deref()) else {
            tracing::debug!(identity = ?request.identity, "rejected load with invalid identity");
            return respond(None, false, MSG_INVALID_IDENTITY.into());
        };

        match self.store.load(&identity) {
            Ok(Some(record)) => {
                tracing::debug!(%identity, "player data retrieved");
                respond(Some(record), true, MSG_RETRIEVED.into())
            }
            Ok(None) => respond(None, false, MSG_NOT_FOUND.into()),
            Err(error) => {
                tracing::error!(%identity, %error, "failed to load player data");
                respond(None, false, format!("Server error: {error}"))
            }
        }
    }

    /// Drop ledger entries whose cooldown has passed.
    pub fn sweep_ledger(&self) -> usize {
        self.ledger.sweep_expired(self.clock.now_unix_ms())
    }
}
