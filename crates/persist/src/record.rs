//! Player and world records and the [`Record`] trait that tells the store
//! where each kind of record lives.

use std::fmt;
use std::hash::Hash;

use meetup_common::PlayerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Number of main inventory slots a player record carries.
pub const INVENTORY_SLOTS: usize = 27;
/// Number of hotbar slots a player record carries.
pub const HOTBAR_SLOTS: usize = 9;

/// Options applied to every record the store reads or writes.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// When set, every world record's seed is forced to this value.
    pub server_seed: Option<u64>,
    /// Take a timestamped backup before replacing a backed-up record.
    pub backups: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            server_seed: None,
            backups: true,
        }
    }
}

/// A serializable record kept by a [`RecordStore`](crate::RecordStore).
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Name of the record family, used in log lines.
    const KIND: &'static str;
    /// Directory holding this record family.
    const AREA: &'static str;

    /// The key this record must be stored under.
    fn key(&self) -> Self::Key;

    /// Medium path of the live file for `key`.
    fn file_path(key: &Self::Key) -> String;

    /// Recover a key from a directory entry under [`Record::AREA`].
    fn key_from_entry(entry: &str) -> Option<Self::Key>;

    /// Reject keys that could escape the record area.
    fn validate_key(_key: &Self::Key) -> Result<(), StoreError> {
        Ok(())
    }

    /// Directory receiving timestamped backups on save, if this family is backed up.
    fn backup_dir(_key: &Self::Key) -> Option<String> {
        None
    }

    /// Validate and repair in place. Returns `true` when something was repaired.
    fn repair(&mut self, options: &StoreOptions) -> Result<bool, StoreError>;

    /// Mirror the store's dirty bookkeeping onto the record, for families that carry a flag.
    fn set_dirty(&mut self, _dirty: bool) {}
}

/// Facing direction of a player avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

/// A stack of items occupying one inventory slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item_id: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<uuid::Uuid>,
}

impl ItemStack {
    pub fn new(item_id: impl Into<String>, count: u32) -> Self {
        Self {
            item_id: item_id.into(),
            count,
            uuid: None,
        }
    }

    fn is_valid(&self) -> bool {
        !self.item_id.trim().is_empty() && self.count > 0
    }
}

/// Durable per-player state. A save always replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub identity: PlayerId,
    pub username: String,
    /// Position in tile units.
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub is_moving: bool,
    #[serde(default)]
    pub wants_to_run: bool,
    #[serde(default)]
    pub inventory_items: Vec<Option<ItemStack>>,
    #[serde(default)]
    pub hotbar_items: Vec<Option<ItemStack>>,
    /// Set by in-process writers when the cached copy is ahead of storage.
    #[serde(skip)]
    pub dirty: bool,
}

impl PlayerRecord {
    pub fn new(identity: PlayerId, username: impl Into<String>) -> Self {
        Self {
            identity,
            username: username.into(),
            x: 0.0,
            y: 0.0,
            direction: Direction::Down,
            is_moving: false,
            wants_to_run: false,
            inventory_items: Vec::new(),
            hotbar_items: Vec::new(),
            dirty: false,
        }
    }
}

fn repair_slots(slots: &mut Vec<Option<ItemStack>>, capacity: usize) -> bool {
    let mut repaired = false;
    if slots.len() > capacity {
        slots.truncate(capacity);
        repaired = true;
    }
    for slot in slots.iter_mut() {
        if slot.as_ref().is_some_and(|stack| !stack.is_valid()) {
            *slot = None;
            repaired = true;
        }
    }
    repaired
}

impl Record for PlayerRecord {
    type Key = PlayerId;

    const KIND: &'static str = "player";
    const AREA: &'static str = "players";

    fn key(&self) -> PlayerId {
        self.identity
    }

    fn file_path(key: &PlayerId) -> String {
        format!("{}/{}.json", Self::AREA, key)
    }

    fn key_from_entry(entry: &str) -> Option<PlayerId> {
        let stem = entry.strip_suffix(".json")?;
        uuid::Uuid::parse_str(stem).ok().map(PlayerId)
    }

    fn repair(&mut self, _options: &StoreOptions) -> Result<bool, StoreError> {
        if self.username.trim().is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "player {} has an empty username",
                self.identity
            )));
        }
        let mut repaired = false;
        if !self.x.is_finite() {
            self.x = 0.0;
            repaired = true;
        }
        if !self.y.is_finite() {
            self.y = 0.0;
            repaired = true;
        }
        repaired |= repair_slots(&mut self.inventory_items, INVENTORY_SLOTS);
        repaired |= repair_slots(&mut self.hotbar_items, HOTBAR_SLOTS);
        if repaired {
            tracing::info!(player = %self.identity, username = %self.username, "repaired player record");
        }
        Ok(repaired)
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

/// Generation settings shared by every client of a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorldConfig {
    pub seed: u64,
}

/// Durable per-world state. The `state` blob is opaque to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldRecord {
    pub name: String,
    #[serde(default)]
    pub config: WorldConfig,
    #[serde(default)]
    pub state: serde_json::Value,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub last_played: i64,
    #[serde(default)]
    pub played_time_ms: u64,
}

impl WorldRecord {
    pub fn new(name: impl Into<String>, seed: u64, now_ms: i64) -> Self {
        Self {
            name: name.into(),
            config: WorldConfig { seed },
            state: serde_json::Value::Null,
            created_at: now_ms,
            last_played: now_ms,
            played_time_ms: 0,
        }
    }
}

impl Record for WorldRecord {
    type Key = String;

    const KIND: &'static str = "world";
    const AREA: &'static str = "worlds";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn file_path(key: &String) -> String {
        format!("{}/{}/world.json", Self::AREA, key)
    }

    fn key_from_entry(entry: &str) -> Option<String> {
        Some(entry.to_string())
    }

    fn validate_key(key: &String) -> Result<(), StoreError> {
        let bad = key.trim().is_empty()
            || key.trim() != key
            || key.contains('/')
            || key.contains('\\')
            || key.starts_with('.');
        if bad {
            return Err(StoreError::InvalidKey(key.clone()));
        }
        Ok(())
    }

    fn backup_dir(key: &String) -> Option<String> {
        Some(format!("{}/{}/backups", Self::AREA, key))
    }

    fn repair(&mut self, options: &StoreOptions) -> Result<bool, StoreError> {
        Self::validate_key(&self.name)?;
        let mut repaired = false;
        if let Some(seed) = options.server_seed {
            if self.config.seed != seed {
                tracing::debug!(world = %self.name, from = self.config.seed, to = seed, "forcing server seed");
                self.config.seed = seed;
                repaired = true;
            }
        }
        if self.last_played < self.created_at {
            self.last_played = self.created_at;
            repaired = true;
        }
        Ok(repaired)
    }
}
