// ── COCO Engine ────────────────────────────────────────────────────────────
// The memory + planner + tool-registry core. `CocoEngine` wires every
// component explicitly through construction — no module-level singletons —
// and serializes turns: exactly one `converse` runs at a time (&mut self).
//
// Data flow per turn:
//   user input → ContextAssembler (identity, facts, semantic, summaries,
//   episodic, tool catalog) → Planner loop (model ↔ ToolRegistry) →
//   EpisodeStore.append → EpisodicBuffer → FactExtractor → FactStore +
//   SemanticRAG → SummaryBuffer → periodic maintenance.

pub mod buffer;
pub mod config;
pub mod context;
pub mod episodes;
pub mod facts;
pub mod identity;
pub mod planner;
pub mod providers;
pub mod rag;
pub mod reflection;
pub mod registry;
pub mod router;
pub mod summaries;
pub mod tools;
pub mod workspace;

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Episode, FactType, TokenUsage};
use buffer::EpisodicBuffer;
use config::CocoConfig;
use context::ContextAssembler;
use episodes::EpisodeStore;
use facts::{extract, FactStats, FactStore};
use identity::MarkdownIdentity;
use log::{info, warn};
use planner::Planner;
use providers::AnyTransport;
use rag::{backend_from_config, SemanticRag};
use reflection::{run_shutdown_reflection, ReflectionReport};
use registry::ToolRegistry;
use router::{QueryRouter, RouteResult};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use summaries::SummaryBuffer;
use tools::ToolDeps;
use workspace::WorkspacePaths;

pub struct CocoEngine {
    config: CocoConfig,
    session_id: String,
    episodes: Arc<EpisodeStore>,
    buffer: EpisodicBuffer,
    rag: Arc<SemanticRag>,
    facts: Arc<FactStore>,
    summaries: SummaryBuffer,
    identity: MarkdownIdentity,
    registry: Arc<ToolRegistry>,
    transport: AnyTransport,
    planner: Planner,
    turns: u64,
}

/// What a graceful shutdown produced.
pub struct ShutdownReport {
    pub closing_summary: bool,
    pub reflection: ReflectionReport,
}

impl CocoEngine {
    /// Build the engine with the transport resolved from configuration.
    pub fn new(config: CocoConfig) -> CoreResult<Self> {
        let transport = AnyTransport::from_config(&config)?;
        Self::with_transport(config, transport)
    }

    /// Build the engine around an explicit transport (tests inject fakes).
    pub fn with_transport(config: CocoConfig, transport: AnyTransport) -> CoreResult<Self> {
        let paths = WorkspacePaths::new(&config.workspace);
        paths.ensure()?;

        let episodes = Arc::new(EpisodeStore::open(&paths.episodes_db())?);
        let facts = Arc::new(FactStore::open(&paths.facts_db())?);
        let backend = backend_from_config(&config.embedding);
        let rag = Arc::new(SemanticRag::open(
            &paths.semantic_index_db(),
            backend,
            config.memory.semantic_capacity,
            config.memory.semantic_half_life_days,
        )?);
        let summaries = SummaryBuffer::load(
            paths.summaries_json(),
            config.memory.summary_window,
            config.memory.summaries_kept,
        );
        let identity = MarkdownIdentity::new(paths.clone());
        let awakening = identity.awaken()?;

        let registry = Arc::new(ToolRegistry::new());
        let deps = ToolDeps {
            workspace: config.workspace.clone(),
            facts: facts.clone(),
            rag: rag.clone(),
        };
        tools::register_builtin(&registry, &config, &deps);

        let buffer = EpisodicBuffer::hydrate(config.memory.buffer_size, &episodes);
        let planner = Planner::new(
            transport.clone(),
            registry.clone(),
            config.planner.clone(),
            config.model.clone(),
        );

        let session_id = format!("session_{}", uuid::Uuid::new_v4());
        info!(
            "[engine] Awakening #{} — session {} ({} tools available)",
            awakening,
            session_id,
            registry.available_tools().len()
        );

        Ok(CocoEngine {
            config,
            session_id,
            episodes,
            buffer,
            rag,
            facts,
            summaries,
            identity,
            registry,
            transport,
            planner,
            turns: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn fact_stats(&self) -> CoreResult<FactStats> {
        self.facts.stats()
    }

    /// `/facts [type]` — list stored facts by importance, independent of any
    /// relevance ranking.
    pub fn facts_by_type(&self, fact_type: Option<FactType>, limit: usize) -> CoreResult<Vec<String>> {
        let conn = self.facts.conn.lock();
        let type_filter = fact_type.map(|t| t.as_str());
        let mut stmt = conn.prepare(
            "SELECT fact_type, content, importance FROM facts
             WHERE deleted = 0 AND (?2 IS NULL OR fact_type = ?2)
             ORDER BY importance DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64, type_filter], |row| {
                Ok(format!(
                    "[{}] {} (importance {:.2})",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Cooperative-interrupt handle for the surrounding CLI.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.planner.cancel_flag()
    }

    fn assembler(&self) -> ContextAssembler<'_> {
        ContextAssembler {
            identity: &self.identity,
            facts: &self.facts,
            rag: &self.rag,
            summaries: &self.summaries,
            buffer: &self.buffer,
            registry: &self.registry,
            budgets: &self.config.context,
        }
    }

    /// One full conversational turn. Fatal only when durable storage is
    /// gone; model failures record a placeholder episode and return a
    /// friendly message.
    pub async fn converse(&mut self, user_text: &str) -> CoreResult<String> {
        // Assemble the prompt from every memory layer.
        let context = self.assembler().assemble(user_text).await?;

        // Run the planner loop; degrade model failures into placeholders.
        let outcome = match self
            .planner
            .run_turn(&context.system_prompt, user_text)
            .await
        {
            Ok(outcome) => outcome,
            Err(CoreError::ModelTimeout { deadline_secs }) => {
                warn!("[engine] Model deadline ({}s) exceeded", deadline_secs);
                planner::TurnOutcome {
                    assistant_text: format!(
                        "I couldn't reach the model within {}s. Your message is saved in my \
                         memory; please try again in a moment.",
                        deadline_secs
                    ),
                    invocations: Vec::new(),
                    usage: TokenUsage::default(),
                    cancelled: false,
                    rounds: 0,
                }
            }
            Err(CoreError::Model(message)) => {
                warn!("[engine] Model call failed: {}", message);
                planner::TurnOutcome {
                    assistant_text: "Something went wrong talking to the model. Your message \
                                     is saved in my memory; please try again."
                        .to_string(),
                    invocations: Vec::new(),
                    usage: TokenUsage::default(),
                    cancelled: false,
                    rounds: 0,
                }
            }
            Err(other) => return Err(other),
        };

        // Durable episode write — fatal to the turn if it fails.
        let episode_id = self.episodes.append(
            &self.session_id,
            user_text,
            &outcome.assistant_text,
            &outcome.invocations,
            outcome.usage,
            outcome.cancelled,
        )?;

        let episode = Episode {
            episode_id,
            session_id: self.session_id.clone(),
            created_at: chrono::Utc::now(),
            user_text: user_text.to_string(),
            assistant_text: outcome.assistant_text.clone(),
            tool_calls: outcome.invocations,
            usage: outcome.usage,
            cancelled: outcome.cancelled,
        };
        self.buffer.push(episode.clone());

        // Fact extraction feeds both structured and semantic memory.
        let extraction = extract::extract(&episode);
        if !extraction.facts.is_empty() {
            let stored = self.facts.store(&extraction.facts)?;
            info!(
                "[engine] Extracted {} facts ({} new) from episode {}",
                extraction.facts.len(),
                stored,
                episode_id
            );
        }
        for text in &extraction.semantic_texts {
            let _ = self
                .rag
                .index(text, &format!("episode:{}", episode_id))
                .await;
        }

        // Rolling summaries.
        if let Err(e) = self
            .summaries
            .on_exchange(episode, &self.transport, &self.config.model)
            .await
        {
            warn!("[engine] Summary buffer error (continuing): {}", e);
        }

        self.turns += 1;
        if self.turns % self.config.planner.maintenance_every_turns == 0 {
            self.run_maintenance().await;
        }

        Ok(outcome.assistant_text)
    }

    /// Background maintenance: never runs during an active planner loop.
    async fn run_maintenance(&self) {
        info!("[engine] Maintenance pass (turn {})", self.turns);
        if let Err(e) = self.facts.decay_sweep() {
            warn!("[engine] Decay sweep failed: {}", e);
        }
        if let Err(e) = self.rag.compact() {
            warn!("[engine] Semantic compaction failed: {}", e);
        }
        if let Err(e) = self.rag.flush_deferred().await {
            warn!("[engine] Deferred embedding flush failed: {}", e);
        }
    }

    /// `/recall` — route a query across the memory layers.
    pub async fn recall(&self, query: &str, limit: usize) -> CoreResult<RouteResult> {
        QueryRouter::new(&self.facts, &self.rag, &self.buffer)
            .route(query, limit)
            .await
    }

    /// `/memory layers` — the assembler's diagnostic dump.
    pub fn memory_layers(&self) -> String {
        self.assembler().layers_report()
    }

    /// Graceful shutdown: close the summary window, run shutdown reflection,
    /// verify the identity files landed on disk.
    pub async fn shutdown(&mut self) -> CoreResult<ShutdownReport> {
        let closing = self
            .summaries
            .close_session(&self.transport, &self.config.model)
            .await
            .unwrap_or_else(|e| {
                warn!("[engine] Closing summary failed: {}", e);
                None
            });

        let digest = self.session_digest();
        let reflection = run_shutdown_reflection(
            &self.identity,
            &self.transport,
            &self.config.model,
            &digest,
        )
        .await?;

        if !reflection.verify.all_updated() {
            warn!(
                "[engine] Identity verification flagged files — stale: {:?}, missing: {:?}",
                reflection.verify.stale, reflection.verify.missing
            );
        }

        Ok(ShutdownReport {
            closing_summary: closing.is_some(),
            reflection,
        })
    }

    /// A short digest of the session for the reflection prompt.
    fn session_digest(&self) -> String {
        let mut digest = String::new();
        let recent = self.buffer.format_as_context(3_000);
        if !recent.is_empty() {
            digest.push_str("Recent exchanges:\n");
            digest.push_str(&recent);
        }
        if let Ok(stats) = self.facts.stats() {
            digest.push_str(&format!(
                "\n\nFact store: {} facts, latest {}",
                stats.total,
                stats.latest_timestamp.as_deref().unwrap_or("never")
            ));
        }
        let summary_tail = self.summaries.context_for_prompt(2_000);
        if !summary_tail.is_empty() {
            digest.push_str("\n\nSession summaries:\n");
            digest.push_str(&summary_tail);
        }
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ToolCall;
    use crate::engine::providers::{ModelRequest, ModelResponse, ModelTransport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use super::router::RouteSource;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays a scripted sequence, then repeats the final response.
    struct ScriptedTransport {
        script: Mutex<VecDeque<ModelResponse>>,
    }

    #[async_trait]
    impl ModelTransport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _request: &ModelRequest) -> CoreResult<ModelResponse> {
            let mut script = self.script.lock();
            if script.len() > 1 {
                Ok(script.pop_front().unwrap())
            } else {
                Ok(script.front().cloned().unwrap_or(ModelResponse {
                    text: "Understood.".into(),
                    ..Default::default()
                }))
            }
        }
    }

    fn scripted(responses: Vec<ModelResponse>) -> AnyTransport {
        AnyTransport::from_transport(Arc::new(ScriptedTransport {
            script: Mutex::new(responses.into()),
        }))
    }

    fn text(text: &str) -> ModelResponse {
        ModelResponse {
            text: text.into(),
            ..Default::default()
        }
    }

    fn engine_in(dir: &std::path::Path, transport: AnyTransport) -> CocoEngine {
        let config = CocoConfig {
            workspace: dir.to_path_buf(),
            ..CocoConfig::default()
        };
        CocoEngine::with_transport(config, transport).unwrap()
    }

    #[tokio::test]
    async fn appointment_extraction_then_recall_via_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(
            dir.path(),
            scripted(vec![text("Noted — coffee with Sarah at 2pm tomorrow.")]),
        );

        engine
            .converse("I have a meeting with Sarah at Starbucks tomorrow at 2pm.")
            .await
            .unwrap();

        let result = engine.recall("meeting with Sarah", 5).await.unwrap();
        assert_eq!(result.source, RouteSource::Facts);
        assert!(result.count >= 1);
        assert!(result.results[0].contains("Sarah"));
        assert!(result.results[0].contains("Starbucks"));
    }

    #[tokio::test]
    async fn episode_count_tracks_successful_turns() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), scripted(vec![text("ok")]));

        for i in 0..3 {
            engine.converse(&format!("turn {}", i)).await.unwrap();
        }
        assert_eq!(engine.episodes.count().unwrap(), 3);
        assert_eq!(engine.buffer.len(), 3);
    }

    #[tokio::test]
    async fn tool_results_flow_into_facts() {
        let dir = tempfile::tempdir().unwrap();
        // Round 1: the model stores a memory via tool; round 2: final text.
        let transport = scripted(vec![
            ModelResponse {
                tool_calls: vec![ToolCall {
                    id: "toolu_1".into(),
                    name: "memory_store".into(),
                    input: json!({"content": "User ships Rust for a living", "fact_type": "note"}),
                }],
                stop_reason: Some("tool_use".into()),
                ..Default::default()
            },
            text("Stored it."),
        ]);
        let mut engine = engine_in(dir.path(), transport);

        let reply = engine.converse("remember what I do for work").await.unwrap();
        assert_eq!(reply, "Stored it.");
        assert!(engine.fact_stats().unwrap().total >= 1);

        // The invocation is embedded in the recorded episode.
        let recorded = engine.episodes.recent(1).unwrap();
        assert_eq!(recorded[0].tool_calls.len(), 1);
        assert_eq!(recorded[0].tool_calls[0].name, "memory_store");
    }

    #[tokio::test]
    async fn model_failure_records_placeholder_episode() {
        struct FailingTransport;
        #[async_trait]
        impl ModelTransport for FailingTransport {
            fn name(&self) -> &str {
                "failing"
            }
            async fn complete(&self, _request: &ModelRequest) -> CoreResult<ModelResponse> {
                Err(CoreError::Model("api exploded".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(
            dir.path(),
            AnyTransport::from_transport(Arc::new(FailingTransport)),
        );

        let reply = engine.converse("hello?").await.unwrap();
        assert!(reply.contains("went wrong"));
        // The episode is still durable.
        assert_eq!(engine.episodes.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_runs_reflection_and_verification() {
        let dir = tempfile::tempdir().unwrap();
        let reflection_output = "<<<FILE: COCO.md>>>\n---\nawakening_count: 0\ncoherence: 0\nupdated_at: x\n---\n# COCO\n\nGrew today.\n\
             <<<FILE: USER_PROFILE.md>>>\n---\na: b\n---\n# User\n\nKind.\n\
             <<<FILE: previous_conversation.md>>>\n---\na: b\n---\n# Notes\n\nShort chat.\n";
        let mut engine = engine_in(
            dir.path(),
            scripted(vec![text("hi"), text(reflection_output)]),
        );

        engine.converse("hello").await.unwrap();
        let report = engine.shutdown().await.unwrap();
        assert!(report.closing_summary);
        assert!(report.reflection.verify.all_updated());
        assert!(std::fs::read_to_string(dir.path().join("COCO.md"))
            .unwrap()
            .contains("Grew today"));
    }

    #[tokio::test]
    async fn memory_layers_reports_live_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), scripted(vec![text("ok")]));
        engine.converse("I love static typing").await.unwrap();

        let report = engine.memory_layers();
        assert!(report.contains("1 exchanges"));
        assert!(report.contains("Fact store"));
    }

    #[tokio::test]
    async fn facts_listing_filters_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path(), scripted(vec![text("ok")]));
        engine
            .converse("I prefer dark mode. Remind me to water the plants")
            .await
            .unwrap();

        let all = engine.facts_by_type(None, 20).unwrap();
        assert!(all.len() >= 2);
        let prefs = engine
            .facts_by_type(Some(FactType::Preference), 20)
            .unwrap();
        assert!(prefs.iter().all(|l| l.starts_with("[preference]")));
        assert!(!prefs.is_empty());
    }
}
