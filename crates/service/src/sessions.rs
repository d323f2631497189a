use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use glam::Vec2;
use meetup_common::{Clock, PlayerId, TILE_SIZE};
use meetup_events::{Event, EventBus, EventKind, EventPayload, ListenerError};
use meetup_kernel::TrackedPlayer;
use meetup_persist::{PlayerRecord, PlayerStore};
use serde::{Deserialize, Serialize};

use crate::handlers::parse_identity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub identity: Option<String>,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Default)]
struct Online {
    players: HashMap<PlayerId, String>,
    /// Login order, most recent last. The last entry is the player creatures flee.
    order: Vec<PlayerId>,
}

impl Online {
    fn tracked(&self) -> Option<PlayerId> {
        self.order.last().copied()
    }
}

/// Tracks who is online and announces logins and logouts on the bus.
///
/// The most recently logged-in player still online drives the shared
/// [`TrackedPlayer`]; its position follows that player's saved record.
pub struct SessionManager {
    bus: EventBus,
    store: Arc<PlayerStore>,
    tracked: Arc<TrackedPlayer>,
    clock: Arc<dyn Clock>,
    online: Mutex<Online>,
}

impl SessionManager {
    pub fn new(
        bus: EventBus,
        store: Arc<PlayerStore>,
        tracked: Arc<TrackedPlayer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bus,
            store,
            tracked,
            clock,
            online: Mutex::new(Online::default()),
        }
    }

    pub fn handle_login(&self, identity: Option<&str>, username: &str) -> SessionResponse {
        let now = self.clock.now_unix_ms();
        let respond = |success: bool, message: &str| SessionResponse {
            identity: identity.map(str::to_string),
            success,
            message: message.to_string(),
            timestamp: now,
        };
        let Some(player) = parse_identity(identity) else {
            return respond(false, "Invalid UUID");
        };
        let username = username.trim();
        if username.is_empty() {
            return respond(false, "Invalid request data");
        }

        {
            let mut online = self.lock();
            if online.players.insert(player, username.to_string()).is_some() {
                tracing::debug!(%player, "player logged in again");
            }
            online.order.retain(|id| *id != player);
            online.order.push(player);
            // Tracker updates happen under the session lock so they land in login order.
            self.track(player);
        }

        tracing::info!(%player, %username, "player logged in");
        self.bus.publish(Event::player_login(player, username));
        respond(true, "Login successful")
    }

    pub fn handle_logout(&self, identity: Option<&str>) -> SessionResponse {
        let now = self.clock.now_unix_ms();
        let respond = |success: bool, message: &str| SessionResponse {
            identity: identity.map(str::to_string),
            success,
            message: message.to_string(),
            timestamp: now,
        };
        let Some(player) = parse_identity(identity) else {
            return respond(false, "Invalid UUID");
        };
        let username = {
            let mut online = self.lock();
            let Some(username) = online.players.remove(&player) else {
                return respond(false, "Player not logged in");
            };
            let was_tracked = online.tracked() == Some(player);
            online.order.retain(|id| *id != player);
            if was_tracked {
                match online.tracked() {
                    Some(next) => self.track(next),
                    None => self.tracked.set(None),
                }
            }
            username
        };

        tracing::info!(%player, %username, "player logged out");
        self.bus.publish(Event::player_logout(player, username));
        respond(true, "Logout successful")
    }

    /// Follow a freshly saved record when it belongs to the tracked player.
    pub fn player_saved(&self, record: &PlayerRecord) {
        let online = self.lock();
        if online.tracked() == Some(record.identity) {
            self.tracked.set(Some(tile_position(record)));
        }
    }

    pub fn is_online(&self, player: PlayerId) -> bool {
        self.lock().players.contains_key(&player)
    }

    pub fn online_count(&self) -> usize {
        self.lock().players.len()
    }

    /// Identity whose position the tracker currently follows.
    pub fn tracked_player(&self) -> Option<PlayerId> {
        self.lock().tracked()
    }

    /// Point the tracker at `player`'s stored position. A player without a
    /// record yet starts where a fresh record would put them.
    fn track(&self, player: PlayerId) {
        match self.store.load(&player) {
            Ok(Some(record)) => self.tracked.set(Some(tile_position(&record))),
            Ok(None) => self
                .tracked
                .set(Some(tile_position(&PlayerRecord::new(player, "")))),
            Err(error) => {
                tracing::warn!(%player, %error, "could not read tracked player's position");
                self.tracked.set(None);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Online> {
        self.online
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tile coordinates of a record in world units.
fn tile_position(record: &PlayerRecord) -> Vec2 {
    Vec2::new(record.x, record.y) * TILE_SIZE
}

/// Persistence reactions to session events: a login warms the cache (creating
/// a default record for new players) and a logout flushes dirty records.
pub fn register_persistence_listeners(bus: &EventBus, store: Arc<PlayerStore>) {
    let on_login = Arc::clone(&store);
    bus.subscribe(EventKind::PlayerLogin, move |event: &Event| -> Result<(), ListenerError> {
        let EventPayload::PlayerLogin { player, username } = &event.payload else {
            return Ok(());
        };
        if on_login.load(player)?.is_none() {
            on_login.save(player, PlayerRecord::new(*player, username.clone()))?;
            tracing::info!(%player, %username, "created record for new player");
        }
        Ok(())
    });

    bus.subscribe(EventKind::PlayerLogout, move |event: &Event| -> Result<(), ListenerError> {
        let report = store.flush();
        if report.failed > 0 {
            return Err(format!(
                "{} of {} dirty records failed to flush after logout at {}",
                report.failed,
                report.failed + report.written,
                event.timestamp
            )
            .into());
        }
        Ok(())
    });
}
