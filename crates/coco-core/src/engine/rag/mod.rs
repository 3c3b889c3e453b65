// COCO Engine — Semantic RAG
// Embedding-indexed long-term memory. Texts are stored with their vector,
// backend name, and access bookkeeping in SQLite; retrieval is a cosine scan
// re-ranked by access frequency and recency.
//
// Module layout:
//   embedding.rs — EmbeddingBackend capability (API + hash fallback)
//   mod.rs       — store, retrieve, capacity eviction, deferred retry queue

pub mod embedding;

pub use embedding::{backend_from_config, EmbeddingBackend, HashEmbeddingBackend};

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{truncate_utf8, SemanticMemory};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use embedding::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

/// Result of an index call: stored now, already present, or queued for
/// background retry after repeated embedding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed(i64),
    AlreadyIndexed(i64),
    Deferred,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RagStats {
    pub total: i64,
    pub recent_count: i64,
    pub top_accessed: Vec<(String, i64)>,
    pub deferred: i64,
}

pub struct SemanticRag {
    /// `pub` for integration tests that need raw access.
    pub conn: Mutex<Connection>,
    backend: Arc<dyn EmbeddingBackend>,
    capacity: usize,
    half_life_days: f64,
}

const EMBED_ATTEMPTS: u32 = 3;

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            text             TEXT NOT NULL,
            embedding        BLOB NOT NULL,
            backend          TEXT NOT NULL,
            dim              INTEGER NOT NULL,
            source           TEXT NOT NULL DEFAULT '',
            created_at       TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            access_count     INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS deferred (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            text     TEXT NOT NULL,
            source   TEXT NOT NULL DEFAULT '',
            attempts INTEGER NOT NULL DEFAULT 0
        );",
    )
}

/// Runtime ranking value: similarity boosted by access frequency, damped by
/// age. Monotonically non-decreasing in access_count for fixed inputs.
pub fn effective_score(similarity: f64, access_count: i64, age_days: f64, half_life: f64) -> f64 {
    let frequency = 1.0 + (1.0 + access_count as f64).ln();
    let recency = (-age_days / half_life.max(f64::EPSILON)).exp();
    similarity * frequency * recency
}

fn age_days(created_at: &str, now: DateTime<Utc>) -> f64 {
    created_at
        .parse::<DateTime<Utc>>()
        .map(|t| (now - t).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0)
}

impl SemanticRag {
    pub fn open(
        path: &Path,
        backend: Arc<dyn EmbeddingBackend>,
        capacity: usize,
        half_life_days: f64,
    ) -> CoreResult<Self> {
        info!(
            "[rag] Opening semantic index at {:?} (backend={}, dim={})",
            path,
            backend.name(),
            backend.dim()
        );
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        run_migrations(&conn)?;
        Ok(SemanticRag {
            conn: Mutex::new(conn),
            backend,
            capacity,
            half_life_days,
        })
    }

    pub fn open_in_memory(
        backend: Arc<dyn EmbeddingBackend>,
        capacity: usize,
        half_life_days: f64,
    ) -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(SemanticRag {
            conn: Mutex::new(conn),
            backend,
            capacity,
            half_life_days,
        })
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Embed and store one text. Embedding failures are retried with
    /// exponential backoff; after the attempts are exhausted the item goes to
    /// the deferred queue and the caller proceeds.
    pub async fn index(&self, text: &str, source: &str) -> CoreResult<IndexOutcome> {
        // Never silently rewrite an existing entry.
        {
            let conn = self.conn.lock();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM memories WHERE text = ?1",
                    params![text],
                    |r| r.get(0),
                )
                .ok();
            if let Some(id) = existing {
                return Ok(IndexOutcome::AlreadyIndexed(id));
            }
        }

        let mut last_err = String::new();
        for attempt in 0..EMBED_ATTEMPTS {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(100 * (1 << attempt));
                warn!(
                    "[rag] Embed retry {}/{} after {}ms",
                    attempt,
                    EMBED_ATTEMPTS - 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            match self.backend.embed(text).await {
                Ok(vec) => {
                    let id = self.insert_memory(text, &vec, source)?;
                    return Ok(IndexOutcome::Indexed(id));
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        warn!(
            "[rag] Embedding failed after {} attempts, deferring: {}",
            EMBED_ATTEMPTS, last_err
        );
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deferred (text, source, attempts) VALUES (?1, ?2, ?3)",
            params![text, source, EMBED_ATTEMPTS as i64],
        )?;
        Ok(IndexOutcome::Deferred)
    }

    fn insert_memory(&self, text: &str, vec: &[f32], source: &str) -> CoreResult<i64> {
        if vec.len() != self.backend.dim() {
            return Err(CoreError::EmbeddingFailed(format!(
                "dimension mismatch: got {}, store expects {}",
                vec.len(),
                self.backend.dim()
            )));
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories
                (text, embedding, backend, dim, source, created_at, last_accessed_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                text,
                f32_vec_to_bytes(vec),
                self.backend.name(),
                vec.len() as i64,
                source,
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Up to `k` memories with similarity ≥ `min_score`, ordered by
    /// descending effective score. Never fails hard: an empty store or a
    /// failed query embedding yields `[]`.
    pub async fn retrieve(&self, query: &str, k: usize, min_score: f64) -> Vec<SemanticMemory> {
        let query_vec = match self.backend.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[rag] Query embedding failed, returning no recalls: {}", e);
                return Vec::new();
            }
        };

        let now = Utc::now();
        let active_backend = self.backend.name().to_string();
        let mut mixed_backends = false;

        let conn = self.conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT id, text, embedding, backend, source, created_at, last_accessed_at, access_count
             FROM memories",
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!("[rag] Retrieval query failed: {}", e);
                return Vec::new();
            }
        };

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map(|iter| iter.filter_map(|r| r.ok()).collect::<Vec<_>>())
            .unwrap_or_default();
        drop(stmt);
        drop(conn);

        let mut scored: Vec<(SemanticMemory, f64)> = rows
            .into_iter()
            .filter_map(
                |(id, text, blob, backend, source, created_at, accessed_at, access_count)| {
                    if backend != active_backend {
                        mixed_backends = true;
                        return None;
                    }
                    let stored = bytes_to_f32_vec(&blob);
                    let sim = cosine_similarity(&query_vec, &stored);
                    if sim < min_score {
                        return None;
                    }
                    let age = age_days(&created_at, now);
                    let score = effective_score(sim, access_count, age, self.half_life_days);
                    Some((
                        SemanticMemory {
                            memory_id: id,
                            text,
                            source,
                            created_at: created_at.parse().unwrap_or(now),
                            last_accessed_at: accessed_at.parse().unwrap_or(now),
                            access_count,
                            score: Some(score),
                        },
                        score,
                    ))
                },
            )
            .collect();

        if mixed_backends {
            warn!(
                "[rag] Index contains vectors from another backend — rebuild required for those entries"
            );
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored.into_iter().map(|(m, _)| m).collect()
    }

    /// Record that these memories were surfaced to the user or model.
    pub fn mark_accessed(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        for id in ids {
            let _ = conn.execute(
                "UPDATE memories
                 SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
                params![id, now],
            );
        }
    }

    pub fn stats(&self) -> CoreResult<RagStats> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        let cutoff = (Utc::now() - ChronoDuration::hours(24)).to_rfc3339();
        let recent_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE created_at >= ?1",
            params![cutoff],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT text, access_count FROM memories
             WHERE access_count > 0
             ORDER BY access_count DESC LIMIT 5",
        )?;
        let top_accessed = stmt
            .query_map([], |row| {
                Ok((
                    truncate_utf8(&row.get::<_, String>(0)?, 80).to_string(),
                    row.get::<_, i64>(1)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        let deferred: i64 = conn.query_row("SELECT COUNT(*) FROM deferred", [], |r| r.get(0))?;
        Ok(RagStats {
            total,
            recent_count,
            top_accessed,
            deferred,
        })
    }

    /// Enforce the soft capacity cap. Evicts the lowest-retention entries
    /// until the store is back at 90% of capacity, never touching anything
    /// accessed within the last 24 hours. Idempotent; logs what it removed.
    pub fn compact(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let grace_cutoff = (now - ChronoDuration::hours(24)).to_rfc3339();

        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        if (total as usize) <= self.capacity {
            return Ok(0);
        }
        let target = (self.capacity * 9) / 10;
        let to_remove = (total as usize).saturating_sub(target);

        // Retention score: similarity term fixed at 1, so frequency × recency.
        let mut stmt = conn.prepare(
            "SELECT id, created_at, access_count FROM memories
             WHERE last_accessed_at < ?1",
        )?;
        let mut candidates: Vec<(i64, f64)> = stmt
            .query_map(params![grace_cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(id, created_at, access_count)| {
                let age = age_days(&created_at, now);
                (
                    id,
                    effective_score(1.0, access_count, age, self.half_life_days),
                )
            })
            .collect();
        drop(stmt);

        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let victims: Vec<i64> = candidates
            .into_iter()
            .take(to_remove)
            .map(|(id, _)| id)
            .collect();

        for id in &victims {
            conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        }
        info!(
            "[rag] Compaction evicted {} of {} entries (cap {})",
            victims.len(),
            total,
            self.capacity
        );
        Ok(victims.len())
    }

    /// Retry embedding for queued items. Stops at the first failure so a
    /// still-broken backend does not spin.
    pub async fn flush_deferred(&self) -> CoreResult<usize> {
        let pending: Vec<(i64, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT id, text, source FROM deferred ORDER BY id ASC LIMIT 100")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut flushed = 0usize;
        for (id, text, source) in pending {
            match self.backend.embed(&text).await {
                Ok(vec) => {
                    self.insert_memory(&text, &vec, &source)?;
                    let conn = self.conn.lock();
                    conn.execute("DELETE FROM deferred WHERE id = ?1", params![id])?;
                    flushed += 1;
                }
                Err(e) => {
                    warn!("[rag] Deferred item {} still failing: {}", id, e);
                    let conn = self.conn.lock();
                    conn.execute(
                        "UPDATE deferred SET attempts = attempts + 1 WHERE id = ?1",
                        params![id],
                    )?;
                    break;
                }
            }
        }
        if flushed > 0 {
            info!("[rag] Flushed {} deferred items into the index", flushed);
        }
        Ok(flushed)
    }
}
