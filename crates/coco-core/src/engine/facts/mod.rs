// COCO Engine — Fact Store
// Typed, durable memory units with importance, decay, and reinforcement.
// Single-writer SQLite store; dedup happens at write time by
// (fact_type, normalized subject, content fingerprint).
//
// Module layout:
//   mod.rs     — store, search, touch, stats, decay sweep
//   extract.rs — the two-stage fact extractor (pure functions)

pub mod extract;

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Fact, FactType, NewFact};
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// A search hit with its runtime-adjusted ranking values.
#[derive(Debug, Clone)]
pub struct FactHit {
    pub fact: Fact,
    pub effective_importance: f64,
    pub rank: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FactStats {
    pub total: i64,
    pub by_type: Vec<(String, i64)>,
    pub avg_importance: f64,
    pub most_accessed: Option<String>,
    pub latest_timestamp: Option<String>,
}

pub struct FactStore {
    /// `pub` for integration tests that need raw access.
    pub conn: Mutex<Connection>,
}

/// Importance sweep threshold: below this effective importance a fact is
/// soft-deleted during the periodic sweep.
const SWEEP_THRESHOLD: f64 = 0.05;

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS facts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            fact_type         TEXT NOT NULL,
            content           TEXT NOT NULL,
            subject           TEXT NOT NULL DEFAULT '',
            subject_key       TEXT NOT NULL DEFAULT '',
            fingerprint       TEXT NOT NULL,
            importance        REAL NOT NULL,
            created_at        TEXT NOT NULL,
            last_accessed_at  TEXT NOT NULL,
            access_count      INTEGER NOT NULL DEFAULT 1,
            source_episode_id INTEGER,
            source_tool       TEXT,
            half_life_days    REAL NOT NULL,
            tags              TEXT NOT NULL DEFAULT '[]',
            deleted           INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_dedup
            ON facts(fact_type, subject_key, fingerprint);",
    )
}

/// Content fingerprint for dedup: lowercased alphanumeric tokens joined.
fn fingerprint(content: &str) -> String {
    content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize a subject: trim and collapse internal whitespace.
fn normalize_subject(subject: &str) -> String {
    subject.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `importance · 2^(-age_days / half_life)` — the decayed ranking value.
pub fn effective_importance(importance: f64, age_days: f64, half_life_days: f64) -> f64 {
    importance * (-age_days / half_life_days.max(f64::EPSILON)).exp2()
}

/// Reinforcement applied on access: closes a fifth of the gap to 1.0,
/// measured against the decayed value.
fn reinforced(importance: f64, effective: f64) -> f64 {
    (importance + (1.0 - effective) * 0.2).min(1.0)
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let fact_type: String = row.get(1)?;
    let subject: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let accessed_at: String = row.get(7)?;
    let tags_json: String = row.get(11)?;
    Ok(Fact {
        fact_id: row.get(0)?,
        fact_type: FactType::parse(&fact_type).unwrap_or(FactType::Generic),
        content: row.get(2)?,
        subject: if subject.is_empty() {
            None
        } else {
            Some(subject)
        },
        importance: row.get(4)?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        last_accessed_at: accessed_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        access_count: row.get(8)?,
        source_episode_id: row.get(9)?,
        source_tool: row.get(10)?,
        half_life_days: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

const SELECT_COLS: &str = "id, fact_type, content, subject, importance, half_life_days, \
                           created_at, last_accessed_at, access_count, source_episode_id, \
                           source_tool, tags";

impl FactStore {
    pub fn open(path: &Path) -> CoreResult<Self> {
        info!("[facts] Opening fact store at {:?}", path);
        let conn = Connection::open(path)
            .map_err(|e| CoreError::StorageUnavailable(format!("open facts.db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        run_migrations(&conn)
            .map_err(|e| CoreError::StorageUnavailable(format!("facts schema: {}", e)))?;
        Ok(FactStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(FactStore {
            conn: Mutex::new(conn),
        })
    }

    /// Store a batch of extracted facts. Duplicates reinforce the existing
    /// row instead of inserting. Returns the number of NEW rows.
    pub fn store(&self, facts: &[NewFact]) -> CoreResult<usize> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let mut inserted = 0usize;

        let conn = self.conn.lock();
        for fact in facts {
            let subject = fact
                .subject
                .as_deref()
                .map(normalize_subject)
                .unwrap_or_default();
            let subject_key = subject.to_lowercase();
            let print = fingerprint(&fact.content);

            let existing: Option<(i64, f64, String, f64)> = conn
                .query_row(
                    "SELECT id, importance, created_at, half_life_days FROM facts
                     WHERE fact_type = ?1 AND subject_key = ?2 AND fingerprint = ?3
                       AND deleted = 0",
                    params![fact.fact_type.as_str(), subject_key, print],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .ok();

            match existing {
                Some((id, importance, created_at, half_life)) => {
                    let age = age_days(&created_at, now);
                    let eff = effective_importance(importance, age, half_life);
                    conn.execute(
                        "UPDATE facts
                         SET importance = ?2, access_count = access_count + 1,
                             last_accessed_at = ?3
                         WHERE id = ?1",
                        params![id, reinforced(importance, eff), now_str],
                    )
                    .map_err(|e| {
                        CoreError::StorageUnavailable(format!("reinforce fact: {}", e))
                    })?;
                }
                None => {
                    let base = fact.fact_type.base_importance();
                    let importance = (base * (0.75 + 0.25 * fact.confidence)).min(1.0);
                    let tags = serde_json::to_string(&fact.tags)?;
                    conn.execute(
                        "INSERT INTO facts
                            (fact_type, content, subject, subject_key, fingerprint,
                             importance, created_at, last_accessed_at, access_count,
                             source_episode_id, source_tool, half_life_days, tags)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, ?8, ?9, ?10, ?11)",
                        params![
                            fact.fact_type.as_str(),
                            fact.content,
                            subject,
                            subject_key,
                            print,
                            importance,
                            now_str,
                            fact.source_episode_id,
                            fact.source_tool,
                            fact.fact_type.default_half_life_days(),
                            tags,
                        ],
                    )
                    .map_err(|e| CoreError::StorageUnavailable(format!("insert fact: {}", e)))?;
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    /// Search facts, ranked by `effective_importance · match_score`.
    /// `fact_types` narrows the candidate set when provided.
    pub fn search(
        &self,
        query: &str,
        fact_types: Option<&[FactType]>,
        limit: usize,
    ) -> CoreResult<Vec<FactHit>> {
        let query_tokens: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_string)
            .collect();
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let candidates = self.load_all(fact_types)?;

        let mut hits: Vec<FactHit> = candidates
            .into_iter()
            .filter_map(|fact| {
                let haystack = format!(
                    "{} {}",
                    fact.content.to_lowercase(),
                    fact.subject.as_deref().unwrap_or("").to_lowercase()
                );
                let matched = query_tokens
                    .iter()
                    .filter(|t| haystack.contains(t.as_str()))
                    .count();
                if matched == 0 {
                    return None;
                }
                let match_score = matched as f64 / query_tokens.len() as f64;
                let age = (now - fact.created_at).num_seconds() as f64 / 86_400.0;
                let eff = effective_importance(fact.importance, age, fact.half_life_days);
                Some(FactHit {
                    rank: eff * match_score,
                    effective_importance: eff,
                    fact,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.rank.partial_cmp(&a.rank).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    fn load_all(&self, fact_types: Option<&[FactType]>) -> CoreResult<Vec<Fact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM facts WHERE deleted = 0",
            SELECT_COLS
        ))?;
        let all: Vec<Fact> = stmt
            .query_map([], fact_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(match fact_types {
            Some(types) if !types.is_empty() => all
                .into_iter()
                .filter(|f| types.contains(&f.fact_type))
                .collect(),
            _ => all,
        })
    }

    /// Record an access: bump the counter, refresh the timestamp, and
    /// reinforce importance against its decayed value.
    pub fn touch(&self, fact_id: i64) -> CoreResult<()> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let (importance, created_at, half_life): (f64, String, f64) = conn.query_row(
            "SELECT importance, created_at, half_life_days FROM facts WHERE id = ?1 AND deleted = 0",
            params![fact_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let eff = effective_importance(importance, age_days(&created_at, now), half_life);
        conn.execute(
            "UPDATE facts
             SET importance = ?2, access_count = access_count + 1, last_accessed_at = ?3
             WHERE id = ?1",
            params![fact_id, reinforced(importance, eff), now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> CoreResult<FactStats> {
        let conn = self.conn.lock();
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM facts WHERE deleted = 0", [], |r| {
                r.get(0)
            })?;
        let avg_importance: f64 = conn
            .query_row(
                "SELECT AVG(importance) FROM facts WHERE deleted = 0",
                [],
                |r| r.get::<_, Option<f64>>(0),
            )?
            .unwrap_or(0.0);
        let mut stmt = conn.prepare(
            "SELECT fact_type, COUNT(*) FROM facts WHERE deleted = 0
             GROUP BY fact_type ORDER BY COUNT(*) DESC",
        )?;
        let by_type = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        let most_accessed: Option<String> = conn
            .query_row(
                "SELECT content FROM facts WHERE deleted = 0
                 ORDER BY access_count DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .ok();
        let latest_timestamp: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM facts WHERE deleted = 0",
                [],
                |r| r.get::<_, Option<String>>(0),
            )
            .unwrap_or(None);
        Ok(FactStats {
            total,
            by_type,
            avg_importance,
            most_accessed,
            latest_timestamp,
        })
    }

    /// Periodic sweep: soft-delete facts whose effective importance has
    /// decayed below the threshold. Returns the number swept.
    pub fn decay_sweep(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, importance, created_at, half_life_days FROM facts WHERE deleted = 0",
        )?;
        let stale: Vec<i64> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter(|(_, importance, created_at, half_life)| {
                effective_importance(*importance, age_days(created_at, now), *half_life)
                    < SWEEP_THRESHOLD
            })
            .map(|(id, _, _, _)| id)
            .collect();
        drop(stmt);

        for id in &stale {
            conn.execute("UPDATE facts SET deleted = 1 WHERE id = ?1", params![id])?;
        }
        if !stale.is_empty() {
            info!("[facts] Decay sweep soft-deleted {} facts", stale.len());
        }
        Ok(stale.len())
    }
}

fn age_days(created_at: &str, now: DateTime<Utc>) -> f64 {
    created_at
        .parse::<DateTime<Utc>>()
        .map(|t| (now - t).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn backdate(store: &FactStore, fact_id: i64, days: i64) {
        let past = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
        let conn = store.conn.lock();
        conn.execute(
            "UPDATE facts SET created_at = ?2, last_accessed_at = ?2 WHERE id = ?1",
            params![fact_id, past],
        )
        .unwrap();
    }

    fn only_fact_id(store: &FactStore) -> i64 {
        let conn = store.conn.lock();
        conn.query_row("SELECT id FROM facts WHERE deleted = 0", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn storing_same_fact_twice_dedups_and_reinforces() {
        let store = FactStore::open_in_memory().unwrap();
        let fact = NewFact::new(FactType::Preference, "User prefers dark roast coffee")
            .with_subject("user");

        assert_eq!(store.store(&[fact.clone()]).unwrap(), 1);
        assert_eq!(store.store(&[fact]).unwrap(), 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 1);

        let conn = store.conn.lock();
        let access_count: i64 = conn
            .query_row("SELECT access_count FROM facts", [], |r| r.get(0))
            .unwrap();
        assert!(access_count >= 2);
    }

    #[test]
    fn importance_derives_from_base_and_confidence() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[
                NewFact::new(FactType::Appointment, "meeting tomorrow").with_confidence(1.0)
            ])
            .unwrap();
        let hits = store.search("meeting tomorrow", None, 5).unwrap();
        assert!((hits[0].fact.importance - 0.9).abs() < 1e-9);
    }

    #[test]
    fn search_filters_by_type_and_requires_overlap() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[
                NewFact::new(FactType::Appointment, "meeting with Sarah at Starbucks")
                    .with_subject("Sarah"),
                NewFact::new(FactType::Topic, "quarterly report draft"),
            ])
            .unwrap();

        let hits = store
            .search("meeting Sarah", Some(&[FactType::Appointment]), 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fact.fact_type, FactType::Appointment);

        let none = store
            .search("kubernetes cluster", None, 5)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn decay_reaches_documented_window_at_one_half_life() {
        // Preference: importance 0.8, half-life 30 days, queried 30 days later.
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[NewFact::new(FactType::Preference, "prefers window seats")])
            .unwrap();
        let id = only_fact_id(&store);
        // Force the documented starting point.
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE facts SET importance = 0.8, half_life_days = 30.0 WHERE id = ?1",
                params![id],
            )
            .unwrap();
        }
        backdate(&store, id, 30);

        let hits = store.search("window seats", None, 5).unwrap();
        let eff = hits[0].effective_importance;
        assert!((0.39..=0.41).contains(&eff), "effective was {}", eff);

        // One recall reinforces: 0.8 + (1 - 0.4) * 0.2 = 0.92, ≤ 1.0.
        store.touch(id).unwrap();
        let conn = store.conn.lock();
        let importance: f64 = conn
            .query_row("SELECT importance FROM facts WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(importance <= 1.0);
        assert!((importance - 0.92).abs() < 0.01, "importance was {}", importance);
    }

    #[test]
    fn touch_is_monotonic_in_access_count() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[NewFact::new(FactType::Note, "remember the deadline")])
            .unwrap();
        let id = only_fact_id(&store);
        store.touch(id).unwrap();
        store.touch(id).unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT access_count FROM facts WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 3); // 1 on insert + 2 touches
    }

    #[test]
    fn decay_sweep_soft_deletes_faded_facts() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[NewFact::new(FactType::Generic, "something ephemeral")])
            .unwrap();
        let id = only_fact_id(&store);
        // Generic: half-life 30d. After 300 days eff ≈ 0.4 · 2^-10 ≈ 0.0004.
        backdate(&store, id, 300);

        assert_eq!(store.decay_sweep().unwrap(), 1);
        assert_eq!(store.stats().unwrap().total, 0);
        // Swept facts no longer surface in search.
        assert!(store.search("ephemeral", None, 5).unwrap().is_empty());
    }

    #[test]
    fn stats_reports_types_and_most_accessed() {
        let store = FactStore::open_in_memory().unwrap();
        store
            .store(&[
                NewFact::new(FactType::Contact, "sarah@example.com").with_subject("Sarah"),
                NewFact::new(FactType::Topic, "roadmap review"),
            ])
            .unwrap();
        let id = only_first(&store);
        store.touch(id).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert!(stats.avg_importance > 0.0);
        assert!(stats.latest_timestamp.is_some());
        assert_eq!(stats.by_type.len(), 2);
    }

    fn only_first(store: &FactStore) -> i64 {
        let conn = store.conn.lock();
        conn.query_row("SELECT MIN(id) FROM facts", [], |r| r.get(0))
            .unwrap()
    }
}
