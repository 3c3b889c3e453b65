// COCO Engine — Episode Store
// Append-only durable log of (user, assistant) exchanges in SQLite.
// Single-writer: the connection is protected by a Mutex and every append is
// one transaction — an episode is either fully written or absent.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Episode, TokenUsage, ToolInvocation};
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

pub struct EpisodeStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need raw access.
    pub conn: Mutex<Connection>,
}

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id      TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            user_text       TEXT NOT NULL,
            assistant_text  TEXT NOT NULL,
            tool_calls_json TEXT NOT NULL DEFAULT '[]',
            input_tokens    INTEGER NOT NULL DEFAULT 0,
            output_tokens   INTEGER NOT NULL DEFAULT 0,
            cancelled       INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_session ON episodes(session_id, id);",
    )
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let created_at: String = row.get(2)?;
    let tool_calls_json: String = row.get(5)?;
    let tool_calls: Vec<ToolInvocation> =
        serde_json::from_str(&tool_calls_json).unwrap_or_default();
    Ok(Episode {
        episode_id: row.get(0)?,
        session_id: row.get(1)?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        user_text: row.get(3)?,
        assistant_text: row.get(4)?,
        tool_calls,
        usage: TokenUsage {
            input_tokens: row.get::<_, i64>(6)? as u64,
            output_tokens: row.get::<_, i64>(7)? as u64,
        },
        cancelled: row.get::<_, i64>(8)? != 0,
    })
}

const SELECT_COLS: &str = "id, session_id, created_at, user_text, assistant_text, \
                           tool_calls_json, input_tokens, output_tokens, cancelled";

impl EpisodeStore {
    /// Open (or create) the episode database and initialize tables.
    pub fn open(path: &Path) -> CoreResult<Self> {
        info!("[episodes] Opening episode store at {:?}", path);
        let conn = Connection::open(path)
            .map_err(|e| CoreError::StorageUnavailable(format!("open episodes.db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        run_migrations(&conn)
            .map_err(|e| CoreError::StorageUnavailable(format!("episodes schema: {}", e)))?;
        Ok(EpisodeStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(EpisodeStore {
            conn: Mutex::new(conn),
        })
    }

    /// Append one episode atomically. Returns the monotonic episode id.
    /// Persistence failure maps to `StorageUnavailable` and writes nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        tool_calls: &[ToolInvocation],
        usage: TokenUsage,
        cancelled: bool,
    ) -> CoreResult<i64> {
        let tool_calls_json = serde_json::to_string(tool_calls)?;
        let created_at = Utc::now().to_rfc3339();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO episodes
                (session_id, created_at, user_text, assistant_text,
                 tool_calls_json, input_tokens, output_tokens, cancelled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                created_at,
                user_text,
                assistant_text,
                tool_calls_json,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                cancelled as i64,
            ],
        )
        .map_err(|e| CoreError::StorageUnavailable(format!("append episode: {}", e)))?;

        Ok(conn.last_insert_rowid())
    }

    /// The most recent `n` episodes, newest first.
    pub fn recent(&self, n: usize) -> CoreResult<Vec<Episode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM episodes ORDER BY id DESC LIMIT ?1",
            SELECT_COLS
        ))?;
        let episodes = stmt
            .query_map(params![n as i64], episode_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(episodes)
    }

    /// All episodes of one session, ascending by id.
    pub fn by_session(&self, session_id: &str) -> CoreResult<Vec<Episode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM episodes WHERE session_id = ?1 ORDER BY id ASC",
            SELECT_COLS
        ))?;
        let episodes = stmt
            .query_map(params![session_id], episode_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(episodes)
    }

    pub fn count(&self) -> CoreResult<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_invocation() -> ToolInvocation {
        ToolInvocation {
            name: "read_file".into(),
            input: json!({"path": "notes.txt"}),
            result: Some("contents".into()),
            error: None,
            started_at: Utc::now(),
            duration_ms: 12,
        }
    }

    #[test]
    fn append_returns_strictly_increasing_ids() {
        let store = EpisodeStore::open_in_memory().unwrap();
        let a = store
            .append("s1", "hello", "hi", &[], TokenUsage::default(), false)
            .unwrap();
        let b = store
            .append("s1", "again", "yes", &[], TokenUsage::default(), false)
            .unwrap();
        assert!(b > a);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn recent_is_newest_first_and_bounded() {
        let store = EpisodeStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .append(
                    "s1",
                    &format!("u{}", i),
                    &format!("a{}", i),
                    &[],
                    TokenUsage::default(),
                    false,
                )
                .unwrap();
        }
        let recent = store.recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_text, "u4");
        assert_eq!(recent[2].user_text, "u2");
    }

    #[test]
    fn by_session_is_ascending_and_isolated() {
        let store = EpisodeStore::open_in_memory().unwrap();
        store
            .append("a", "first", "r", &[], TokenUsage::default(), false)
            .unwrap();
        store
            .append("b", "other", "r", &[], TokenUsage::default(), false)
            .unwrap();
        store
            .append("a", "second", "r", &[], TokenUsage::default(), false)
            .unwrap();

        let a = store.by_session("a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].user_text, "first");
        assert_eq!(a[1].user_text, "second");
        assert!(a[0].episode_id < a[1].episode_id);
    }

    #[test]
    fn tool_invocations_round_trip_through_storage() {
        let store = EpisodeStore::open_in_memory().unwrap();
        let inv = sample_invocation();
        store
            .append("s1", "do it", "done", &[inv], TokenUsage::default(), false)
            .unwrap();

        let episodes = store.recent(1).unwrap();
        assert_eq!(episodes[0].tool_calls.len(), 1);
        assert_eq!(episodes[0].tool_calls[0].name, "read_file");
        assert_eq!(
            episodes[0].tool_calls[0].result.as_deref(),
            Some("contents")
        );
    }

    #[test]
    fn cancelled_marker_persists() {
        let store = EpisodeStore::open_in_memory().unwrap();
        store
            .append("s1", "stop", "…", &[], TokenUsage::default(), true)
            .unwrap();
        assert!(store.recent(1).unwrap()[0].cancelled);
    }
}
