use meetup_common::{EntitySnapshot, PlayerId, now_unix_ms};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag used to route an event to its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntitySpawn,
    EntityRemove,
    EntityCollision,
    PlayerLogin,
    PlayerLogout,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::EntitySpawn,
        EventKind::EntityRemove,
        EventKind::EntityCollision,
        EventKind::PlayerLogin,
        EventKind::PlayerLogout,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EntitySpawn => "entity_spawn",
            Self::EntityRemove => "entity_remove",
            Self::EntityCollision => "entity_collision",
            Self::PlayerLogin => "player_login",
            Self::PlayerLogout => "player_logout",
        };
        f.write_str(name)
    }
}

/// What happened. Entities are carried as snapshots taken at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    EntitySpawn { entity: EntitySnapshot },
    EntityRemove { entity: EntitySnapshot },
    /// `first` is the entity whose collision pass detected the overlap.
    EntityCollision {
        first: EntitySnapshot,
        second: EntitySnapshot,
    },
    PlayerLogin { player: PlayerId, username: String },
    PlayerLogout { player: PlayerId, username: String },
}

/// An immutable event value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
}

impl Event {
    /// Stamp `payload` with the current wall-clock time.
    pub fn new(payload: EventPayload) -> Self {
        Self::at(payload, now_unix_ms())
    }

    pub fn at(payload: EventPayload, timestamp: i64) -> Self {
        Self { payload, timestamp }
    }

    pub fn entity_spawn(entity: EntitySnapshot) -> Self {
        Self::new(EventPayload::EntitySpawn { entity })
    }

    pub fn entity_remove(entity: EntitySnapshot) -> Self {
        Self::new(EventPayload::EntityRemove { entity })
    }

    pub fn entity_collision(first: EntitySnapshot, second: EntitySnapshot) -> Self {
        Self::new(EventPayload::EntityCollision { first, second })
    }

    pub fn player_login(player: PlayerId, username: impl Into<String>) -> Self {
        Self::new(EventPayload::PlayerLogin {
            player,
            username: username.into(),
        })
    }

    pub fn player_logout(player: PlayerId, username: impl Into<String>) -> Self {
        Self::new(EventPayload::PlayerLogout {
            player,
            username: username.into(),
        })
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::EntitySpawn { .. } => EventKind::EntitySpawn,
            EventPayload::EntityRemove { .. } => EventKind::EntityRemove,
            EventPayload::EntityCollision { .. } => EventKind::EntityCollision,
            EventPayload::PlayerLogin { .. } => EventKind::PlayerLogin,
            EventPayload::PlayerLogout { .. } => EventKind::PlayerLogout,
        }
    }
}
