//! Shared SQLite connection tuning
//!
//! Every connection opened by the record mirror and the metrics store goes
//! through `apply_optimized_pragmas`, so pool workers that each hold their own
//! connection see the same journal and locking behavior.

use rusqlite::Connection;
use std::time::Duration;

/// How long a writer waits on a locked database before giving up.
///
/// Pool workers write concurrently through separate connections, so a short
/// wait is the normal case rather than an error.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Apply the busy timeout, then WAL journaling, relaxed sync, in-memory temp
/// storage, page cache and autocheckpoint settings.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();

        apply_optimized_pragmas(&conn).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i32 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, 1000);
    }
}
