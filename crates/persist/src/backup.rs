use std::io;
use std::sync::Arc;

use meetup_common::Clock;

use crate::medium::StorageMedium;

const BACKUP_PREFIX: &str = "world_backup_";
const BACKUP_SUFFIX: &str = ".json";

/// Writes timestamped copies of a record's live file before it is replaced.
///
/// Backups are named by wall-clock second, so two backups taken within the
/// same second share a name and the later one overwrites the earlier.
pub struct BackupManager {
    medium: Arc<dyn StorageMedium>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(medium: Arc<dyn StorageMedium>, clock: Arc<dyn Clock>) -> Self {
        Self { medium, clock }
    }

    /// File name a backup taken right now would get.
    pub fn backup_name(&self) -> String {
        format!(
            "{BACKUP_PREFIX}{}{BACKUP_SUFFIX}",
            backup_stamp(self.clock.now_unix_ms())
        )
    }

    /// Copy `source` into `dir`. Returns the backup path, or `None` when there
    /// is no live file yet.
    pub fn create(&self, source: &str, dir: &str) -> io::Result<Option<String>> {
        if !self.medium.exists(source) {
            return Ok(None);
        }
        self.medium.create_dir(dir)?;
        let target = format!("{dir}/{}", self.backup_name());
        self.medium.copy_file(source, &target)?;
        tracing::info!(%source, %target, "created backup");
        Ok(Some(target))
    }

    /// Backup file names in `dir`, oldest first.
    pub fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        Ok(self
            .medium
            .list(dir)?
            .into_iter()
            .filter(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX))
            .collect())
    }
}

/// `yyyyMMdd_HHmmss` in UTC for a unix-millisecond timestamp.
pub fn backup_stamp(unix_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(unix_ms)
        .unwrap_or_default()
        .format("%Y%m%d_%H%M%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use meetup_common::ManualClock;

    // 2024-03-05 06:07:08 UTC
    const T0: i64 = 1_709_618_828_000;

    fn manager(clock: Arc<ManualClock>) -> (Arc<MemoryMedium>, BackupManager) {
        let medium = Arc::new(MemoryMedium::new());
        let backups = BackupManager::new(medium.clone(), clock);
        (medium, backups)
    }

    #[test]
    fn stamp_format() {
        assert_eq!(backup_stamp(T0), "20240305_060708");
        assert_eq!(backup_stamp(T0 + 999), "20240305_060708");
    }

    #[test]
    fn nothing_to_back_up_without_live_file() {
        let (_medium, backups) = manager(Arc::new(ManualClock::new(T0)));
        assert_eq!(backups.create("worlds/a/world.json", "worlds/a/backups").unwrap(), None);
    }

    #[test]
    fn backup_copies_live_file() {
        let clock = Arc::new(ManualClock::new(T0));
        let (medium, backups) = manager(clock.clone());
        medium.write_string("worlds/a/world.json", "v1").unwrap();

        let path = backups
            .create("worlds/a/world.json", "worlds/a/backups")
            .unwrap()
            .unwrap();
        assert_eq!(path, "worlds/a/backups/world_backup_20240305_060708.json");
        assert_eq!(medium.peek(&path).as_deref(), Some("v1"));

        clock.advance(2_000);
        medium.write_string("worlds/a/world.json", "v2").unwrap();
        backups.create("worlds/a/world.json", "worlds/a/backups").unwrap();
        assert_eq!(backups.list("worlds/a/backups").unwrap().len(), 2);
    }

    #[test]
    fn same_second_backups_overwrite() {
        let clock = Arc::new(ManualClock::new(T0));
        let (medium, backups) = manager(clock.clone());
        medium.write_string("w.json", "first").unwrap();
        backups.create("w.json", "bk").unwrap();
        medium.write_string("w.json", "second").unwrap();
        clock.advance(300);
        let path = backups.create("w.json", "bk").unwrap().unwrap();

        assert_eq!(backups.list("bk").unwrap().len(), 1);
        assert_eq!(medium.peek(&path).as_deref(), Some("second"));
    }
}
