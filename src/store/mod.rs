//! Persistent ban records.
//!
//! A single-table embedded database holding `(group_id, user_id, lift_time)`
//! rows. The notice engine is the only writer; reads happen once at startup
//! and after that the engine works from its in-memory lists.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: u32 = 1;

/// One ban. `user_id == 0` is a whole-group ban; `lift_time == -1` means
/// indefinite (whole-group bans have no timer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanRecord {
    pub group_id: i64,
    pub user_id: i64,
    pub lift_time: i64,
}

impl BanRecord {
    pub const WHOLE_GROUP: i64 = 0;
    pub const INDEFINITE: i64 = -1;

    pub fn whole_group(group_id: i64) -> Self {
        Self {
            group_id,
            user_id: Self::WHOLE_GROUP,
            lift_time: Self::INDEFINITE,
        }
    }

    /// Two records describe the same ban when group and user match;
    /// `lift_time` is the mutable part.
    pub fn same_target(&self, other: &BanRecord) -> bool {
        self.group_id == other.group_id && self.user_id == other.user_id
    }
}

/// SQLite-backed ban set.
pub struct BanStore {
    conn: Mutex<Connection>,
}

impl BanStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or overwrite the record identified by `(group_id, user_id)`.
    pub fn upsert(&self, record: &BanRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO ban_records (group_id, user_id, lift_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, user_id) DO UPDATE SET lift_time = excluded.lift_time",
            (record.group_id, record.user_id, record.lift_time),
        )?;
        Ok(())
    }

    /// Remove the record identified by `(group_id, user_id)`. Removing an
    /// absent record is not an error.
    pub fn delete(&self, record: &BanRecord) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM ban_records WHERE group_id = ?1 AND user_id = ?2",
            (record.group_id, record.user_id),
        )?;
        Ok(())
    }

    /// All persisted records.
    pub fn read_all(&self) -> Result<Vec<BanRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT group_id, user_id, lift_time FROM ban_records ORDER BY group_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(BanRecord {
                group_id: row.get(0)?,
                user_id: row.get(1)?,
                lift_time: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Partition persisted records into (still active, already expired) at
    /// time `now`. Whole-group and indefinite bans never expire on a timer.
    pub fn read_partitioned(&self, now: i64) -> Result<(Vec<BanRecord>, Vec<BanRecord>)> {
        let mut active = Vec::new();
        let mut expired = Vec::new();
        for record in self.read_all()? {
            let timer_done = record.user_id != BanRecord::WHOLE_GROUP
                && record.lift_time != BanRecord::INDEFINITE
                && record.lift_time <= now;
            if timer_done {
                expired.push(record);
            } else {
                active.push(record);
            }
        }
        Ok((active, expired))
    }
}

/// Apply all pending migrations to `conn`.
///
/// Tables are created with `IF NOT EXISTS` and the `meta` table tracks the
/// applied version so only new migrations run.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let current_version = get_schema_version(conn);
    if current_version >= SCHEMA_VERSION {
        debug!(version = current_version, "ban store schema up to date");
        return Ok(());
    }

    if current_version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ban_records (
                group_id  INTEGER NOT NULL,
                user_id   INTEGER NOT NULL,
                lift_time INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );",
        )?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    debug!(version = SCHEMA_VERSION, "ban store schema migrated");
    Ok(())
}

fn get_schema_version(conn: &Connection) -> u32 {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<u32>().unwrap_or(0))
        },
    )
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_lift_time() {
        let store = BanStore::open_in_memory().unwrap();
        let first = BanRecord {
            group_id: 1,
            user_id: 2,
            lift_time: 100,
        };
        store.upsert(&first).unwrap();
        store
            .upsert(&BanRecord {
                lift_time: 200,
                ..first
            })
            .unwrap();
        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].lift_time, 200);
    }

    #[test]
    fn delete_removes_by_target() {
        let store = BanStore::open_in_memory().unwrap();
        let record = BanRecord {
            group_id: 1,
            user_id: 2,
            lift_time: 100,
        };
        store.upsert(&record).unwrap();
        // lift_time mismatch still deletes: identity is (group, user).
        store
            .delete(&BanRecord {
                lift_time: -1,
                ..record
            })
            .unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn partition_splits_expired_timers() {
        let store = BanStore::open_in_memory().unwrap();
        store
            .upsert(&BanRecord {
                group_id: 1,
                user_id: 2,
                lift_time: 50,
            })
            .unwrap();
        store
            .upsert(&BanRecord {
                group_id: 1,
                user_id: 3,
                lift_time: 500,
            })
            .unwrap();
        store.upsert(&BanRecord::whole_group(1)).unwrap();

        let (active, expired) = store.read_partitioned(100).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, 2);
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.db");
        {
            let store = BanStore::open(&path).unwrap();
            store
                .upsert(&BanRecord {
                    group_id: 7,
                    user_id: 8,
                    lift_time: 9,
                })
                .unwrap();
        }
        let store = BanStore::open(&path).unwrap();
        assert_eq!(store.read_all().unwrap().len(), 1);
    }
}
