//! Project-wide constants and defaults.

use std::path::PathBuf;
use std::time::Duration;

/// How long SQLite waits on a locked database before reporting busy.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Rows fetched per page when scanning reactions for a recount.
pub const SCAN_PAGE_SIZE: i64 = 500;

/// Capacity of the observability broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_SHARDS: usize = 4;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long applied fact ids stay in the dedup ledger after leaving the outbox.
pub const DEFAULT_LEDGER_RETENTION: Duration = Duration::from_secs(600);

/// Types installed by `kudos type add --defaults`.
pub const DEFAULT_TYPES: &[(&str, i64)] = &[("Like", 1), ("Dislike", -1)];

/// Default database path: `~/.kudos/kudos.db`.
/// Single DB for reactions, aggregates, types, dead letters and settings.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kudos").join("kudos.db"))
}
