// COCO Engine — Query Router
// Routes a recall query across the memory layers: typed facts first, then
// semantic retrieval, then a substring scan over the episodic buffer.
// Facts win ties; every successful route updates access bookkeeping on the
// results it returns.

use crate::atoms::error::CoreResult;
use crate::atoms::types::FactType;
use crate::engine::buffer::EpisodicBuffer;
use crate::engine::facts::FactStore;
use crate::engine::rag::SemanticRag;
use log::info;
use serde::Serialize;

/// Facts must clear this effective importance for the fact layer to win.
const FACT_CONFIDENCE_FLOOR: f64 = 0.5;
/// Minimum similarity for semantic fallback hits.
const SEMANTIC_MIN_SCORE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Facts,
    Semantic,
    Episodic,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub source: RouteSource,
    pub count: usize,
    pub results: Vec<String>,
}

impl RouteResult {
    fn empty() -> Self {
        RouteResult {
            source: RouteSource::None,
            count: 0,
            results: Vec::new(),
        }
    }
}

/// Map query cue words to candidate fact types. An empty result means the
/// fact search runs unfiltered.
pub fn classify_fact_types(query: &str) -> Vec<FactType> {
    const CUES: &[(&str, &[FactType])] = &[
        ("meeting", &[FactType::Appointment, FactType::CalendarReference]),
        ("appointment", &[FactType::Appointment, FactType::CalendarReference]),
        ("schedule", &[FactType::Appointment, FactType::CalendarReference]),
        ("calendar", &[FactType::CalendarReference, FactType::Appointment]),
        ("event", &[FactType::CalendarReference, FactType::Appointment]),
        ("email", &[FactType::EmailRecipient, FactType::Topic]),
        ("mail", &[FactType::EmailRecipient]),
        ("sent", &[FactType::EmailRecipient]),
        ("recipient", &[FactType::EmailRecipient]),
        ("file", &[FactType::FileReference, FactType::DocumentReference]),
        ("document", &[FactType::DocumentReference, FactType::FileReference]),
        ("spreadsheet", &[FactType::DocumentReference]),
        ("task", &[FactType::Task]),
        ("todo", &[FactType::Task]),
        ("remind", &[FactType::Task]),
        ("prefer", &[FactType::Preference]),
        ("favorite", &[FactType::Preference]),
        ("contact", &[FactType::Contact, FactType::EmailRecipient]),
        ("phone", &[FactType::Contact]),
        ("command", &[FactType::Command]),
        ("terminal", &[FactType::Command]),
        ("note", &[FactType::Note]),
    ];

    let lowered = query.to_lowercase();
    let mut types: Vec<FactType> = Vec::new();
    for (cue, candidates) in CUES {
        if lowered.contains(cue) {
            for t in *candidates {
                if !types.contains(t) {
                    types.push(*t);
                }
            }
        }
    }
    types
}

pub struct QueryRouter<'a> {
    facts: &'a FactStore,
    rag: &'a SemanticRag,
    buffer: &'a EpisodicBuffer,
}

impl<'a> QueryRouter<'a> {
    pub fn new(facts: &'a FactStore, rag: &'a SemanticRag, buffer: &'a EpisodicBuffer) -> Self {
        QueryRouter { facts, rag, buffer }
    }

    pub async fn route(&self, query: &str, limit: usize) -> CoreResult<RouteResult> {
        if query.trim().is_empty() {
            return Ok(RouteResult::empty());
        }

        // 1. Classify against fact-type cue words.
        let types = classify_fact_types(query);
        let type_filter = if types.is_empty() {
            None
        } else {
            Some(types.as_slice())
        };

        // 2. Typed fact search.
        let hits = self.facts.search(query, type_filter, limit)?;
        if hits
            .iter()
            .any(|h| h.effective_importance >= FACT_CONFIDENCE_FLOOR)
        {
            for hit in &hits {
                self.facts.touch(hit.fact.fact_id)?;
            }
            info!(
                "[router] '{}' → facts ({} hits, types {:?})",
                query,
                hits.len(),
                types
            );
            let results = hits
                .iter()
                .map(|h| {
                    format!(
                        "[{}] {} (importance {:.2})",
                        h.fact.fact_type.as_str(),
                        h.fact.content,
                        h.effective_importance
                    )
                })
                .collect::<Vec<_>>();
            return Ok(RouteResult {
                source: RouteSource::Facts,
                count: results.len(),
                results,
            });
        }

        // 3. Semantic retrieval.
        let recalls = self.rag.retrieve(query, limit, SEMANTIC_MIN_SCORE).await;
        if !recalls.is_empty() {
            let ids: Vec<i64> = recalls.iter().map(|m| m.memory_id).collect();
            self.rag.mark_accessed(&ids);
            info!("[router] '{}' → semantic ({} hits)", query, recalls.len());
            let results = recalls.into_iter().map(|m| m.text).collect::<Vec<_>>();
            return Ok(RouteResult {
                source: RouteSource::Semantic,
                count: results.len(),
                results,
            });
        }

        // 4. Episodic substring fallback.
        let scans = self.buffer.substring_scan(query, limit);
        if scans.is_empty() {
            info!("[router] '{}' → no recall in any layer", query);
            return Ok(RouteResult::empty());
        }
        info!("[router] '{}' → episodic ({} hits)", query, scans.len());
        Ok(RouteResult {
            source: RouteSource::Episodic,
            count: scans.len(),
            results: scans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Episode, NewFact, TokenUsage};
    use crate::engine::rag::HashEmbeddingBackend;
    use chrono::Utc;
    use rusqlite::params;
    use std::sync::Arc;

    fn stores() -> (FactStore, SemanticRag, EpisodicBuffer) {
        let facts = FactStore::open_in_memory().unwrap();
        let rag =
            SemanticRag::open_in_memory(Arc::new(HashEmbeddingBackend::default()), 100, 30.0)
                .unwrap();
        let buffer = EpisodicBuffer::new(10);
        (facts, rag, buffer)
    }

    fn episode(user: &str, assistant: &str) -> Episode {
        Episode {
            episode_id: 1,
            session_id: "s".into(),
            created_at: Utc::now(),
            user_text: user.into(),
            assistant_text: assistant.into(),
            tool_calls: vec![],
            usage: TokenUsage::default(),
            cancelled: false,
        }
    }

    #[test]
    fn cue_words_map_to_types() {
        let types = classify_fact_types("when is my meeting with Sarah");
        assert!(types.contains(&FactType::Appointment));

        let types = classify_fact_types("which email did I send");
        assert!(types.contains(&FactType::EmailRecipient));

        assert!(classify_fact_types("tell me a story").is_empty());
    }

    #[tokio::test]
    async fn facts_win_when_confident_and_get_touched() {
        let (facts, rag, buffer) = stores();
        facts
            .store(&[NewFact::new(
                FactType::Appointment,
                "I have a meeting with Sarah at Starbucks tomorrow at 2pm",
            )
            .with_subject("Sarah")
            .with_confidence(0.9)])
            .unwrap();

        let router = QueryRouter::new(&facts, &rag, &buffer);
        let result = router.route("meeting with Sarah", 5).await.unwrap();

        assert_eq!(result.source, RouteSource::Facts);
        assert!(result.count >= 1);
        assert!(result.results[0].contains("Sarah"));
        assert!(result.results[0].contains("Starbucks"));

        // Exactly one touch per returned fact: 1 (insert) + 1 (route) = 2.
        let conn = facts.conn.lock();
        let access: i64 = conn
            .query_row("SELECT access_count FROM facts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(access, 2);
    }

    #[tokio::test]
    async fn weak_facts_fall_through_to_semantic() {
        let (facts, rag, buffer) = stores();
        // A decayed fact below the confidence floor.
        facts
            .store(&[NewFact::new(FactType::Generic, "old trivia about databases")])
            .unwrap();
        {
            let past = (Utc::now() - chrono::Duration::days(400)).to_rfc3339();
            let conn = facts.conn.lock();
            conn.execute("UPDATE facts SET created_at = ?1", params![past])
                .unwrap();
        }
        rag.index("we discussed database sharding strategies", "ep:1")
            .await
            .unwrap();

        let router = QueryRouter::new(&facts, &rag, &buffer);
        let result = router.route("databases sharding", 5).await.unwrap();
        assert_eq!(result.source, RouteSource::Semantic);
        assert!(result.results[0].contains("sharding"));
    }

    #[tokio::test]
    async fn episodic_scan_is_the_last_resort() {
        let (facts, rag, mut buffer) = stores();
        buffer.push(episode("we talked about zebras", "indeed"));

        let router = QueryRouter::new(&facts, &rag, &buffer);
        // Nothing in facts or the semantic index — the buffer must answer.
        let result = router.route("zebras", 5).await.unwrap();
        assert_eq!(result.source, RouteSource::Episodic);
        assert!(result.results[0].contains("zebras"));

        let miss = router.route("quasar harmonics", 5).await.unwrap();
        assert_eq!(miss.source, RouteSource::None);
        assert_eq!(miss.count, 0);
    }

    #[tokio::test]
    async fn empty_query_routes_nowhere() {
        let (facts, rag, buffer) = stores();
        let router = QueryRouter::new(&facts, &rag, &buffer);
        let result = router.route("   ", 5).await.unwrap();
        assert_eq!(result.source, RouteSource::None);
    }
}
