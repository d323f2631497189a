//! Persistence: durable player and world records behind a write-through cache.
//!
//! # Invariants
//! - A live record file is only ever replaced by moving a fully written
//!   `.temp` sibling over it; a failed save leaves the previous version intact.
//! - After a successful save the cache and storage hold the same record.
//! - A world save copies the previous live file into its backup directory
//!   before replacing it. Backup failure never fails the save.
//! - Shutdown flushes every dirty cached record, then clears the cache.

pub mod backup;
pub mod medium;
pub mod record;
pub mod store;

pub use backup::{BackupManager, backup_stamp};
pub use medium::{FsMedium, MemoryMedium, StorageMedium};
pub use record::{
    Direction, HOTBAR_SLOTS, INVENTORY_SLOTS, ItemStack, PlayerRecord, Record, StoreOptions,
    WorldConfig, WorldRecord,
};
pub use store::{FlushReport, PlayerStore, RecordStore, StoreError, WorldStore};

pub fn crate_info() -> &'static str {
    "meetup-persist v0.1.0"
}
