// COCO Engine — Context Assembler
// Builds the per-turn system prompt from every memory layer, each bounded by
// its own budget. On global overflow, sections drop in a fixed order
// (episodic → semantic → summary → facts → identity); facts and identity are
// never fully dropped, only truncated to a guaranteed floor.

use crate::atoms::error::CoreResult;
use crate::atoms::types::truncate_utf8;
use crate::engine::buffer::EpisodicBuffer;
use crate::engine::config::ContextBudgets;
use crate::engine::facts::FactStore;
use crate::engine::identity::MarkdownIdentity;
use crate::engine::rag::SemanticRag;
use crate::engine::registry::ToolRegistry;
use crate::engine::summaries::SummaryBuffer;
use log::debug;

/// Facts below this effective importance never enter the prompt.
const FACT_IMPORTANCE_FLOOR: f64 = 0.4;
/// Minimum similarity for semantic recalls in the prompt.
const SEMANTIC_MIN_SCORE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Identity,
    Facts,
    Semantic,
    Summary,
    Episodic,
    Tools,
}

impl Section {
    fn header(&self) -> &'static str {
        match self {
            Section::Identity => "# IDENTITY",
            Section::Facts => "# RELEVANT FACTS",
            Section::Semantic => "# SEMANTIC RECALL",
            Section::Summary => "# CONVERSATION SUMMARIES",
            Section::Episodic => "# RECENT EXCHANGES",
            Section::Tools => "# AVAILABLE TOOLS",
        }
    }
}

/// Overflow handling order. Droppable sections disappear entirely;
/// floored sections shrink to the configured floor instead.
const DROP_ORDER: [Section; 3] = [Section::Episodic, Section::Semantic, Section::Summary];
const FLOOR_ORDER: [Section; 2] = [Section::Facts, Section::Identity];

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: String,
    /// (section name, rendered chars) for the layers diagnostic.
    pub section_sizes: Vec<(&'static str, usize)>,
}

pub struct ContextAssembler<'a> {
    pub identity: &'a MarkdownIdentity,
    pub facts: &'a FactStore,
    pub rag: &'a SemanticRag,
    pub summaries: &'a SummaryBuffer,
    pub buffer: &'a EpisodicBuffer,
    pub registry: &'a ToolRegistry,
    pub budgets: &'a ContextBudgets,
}

impl<'a> ContextAssembler<'a> {
    pub async fn assemble(&self, user_text: &str) -> CoreResult<AssembledContext> {
        let mut parts: Vec<(Section, String)> = Vec::new();

        // 1. Identity header.
        let identity = self.identity.render_context(self.budgets.identity_chars);
        parts.push((Section::Identity, identity));

        // 2. Relevant facts.
        let hits = self
            .facts
            .search(user_text, None, self.budgets.fact_limit)?;
        let fact_lines: Vec<String> = hits
            .iter()
            .filter(|h| h.effective_importance >= FACT_IMPORTANCE_FLOOR)
            .map(|h| {
                format!(
                    "- [{}] {}",
                    h.fact.fact_type.as_str(),
                    h.fact.content
                )
            })
            .collect();
        parts.push((Section::Facts, fact_lines.join("\n")));

        // 3. Semantic recalls.
        let recalls = self
            .rag
            .retrieve(user_text, self.budgets.semantic_k, SEMANTIC_MIN_SCORE)
            .await;
        let recall_lines: Vec<String> =
            recalls.into_iter().map(|m| format!("- {}", m.text)).collect();
        parts.push((Section::Semantic, recall_lines.join("\n")));

        // 4. Summary tail.
        parts.push((
            Section::Summary,
            self.summaries.context_for_prompt(self.budgets.summary_chars),
        ));

        // 5. Episodic window.
        parts.push((
            Section::Episodic,
            self.buffer.format_as_context(self.budgets.episodic_chars),
        ));

        // 6. Tool catalog.
        let tool_lines: Vec<String> = self
            .registry
            .get_api_definitions()
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect();
        parts.push((Section::Tools, tool_lines.join("\n")));

        // Overflow handling against the global budget.
        let budget = self.budgets.total_chars;
        let mut total = rendered_len(&parts);
        for victim in DROP_ORDER {
            if total <= budget {
                break;
            }
            if let Some(entry) = parts.iter_mut().find(|(s, body)| *s == victim && !body.is_empty())
            {
                debug!("[context] Over budget — dropping {}", victim.header());
                entry.1.clear();
                total = rendered_len(&parts);
            }
        }
        for victim in FLOOR_ORDER {
            if total <= budget {
                break;
            }
            if let Some(entry) = parts.iter_mut().find(|(s, _)| *s == victim) {
                debug!("[context] Over budget — flooring {}", victim.header());
                entry.1 = truncate_utf8(&entry.1, self.budgets.floor_chars).to_string();
                total = rendered_len(&parts);
            }
        }

        let section_sizes = parts
            .iter()
            .map(|(s, body)| (s.header(), body.len()))
            .collect();

        let mut prompt = String::new();
        for (section, body) in &parts {
            if body.is_empty() {
                continue;
            }
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(section.header());
            prompt.push('\n');
            prompt.push_str(body);
        }
        // Hard cap: the guarantee holds for any input.
        let prompt = truncate_utf8(&prompt, budget).to_string();

        Ok(AssembledContext {
            system_prompt: prompt,
            section_sizes,
        })
    }

    /// The `/memory layers` diagnostic: one line per layer with its live
    /// size, plus where a recall for `query` would land.
    pub fn layers_report(&self) -> String {
        let fact_stats = self.facts.stats().ok();
        let rag_stats = self.rag.stats().ok();
        let identity_set = self.identity.load();
        let coherence = self.identity.measure_coherence(&identity_set);

        let mut lines = vec!["Memory layers:".to_string()];
        lines.push(format!(
            "  1. Episodic buffer   — {} exchanges in memory",
            self.buffer.len()
        ));
        match &rag_stats {
            Some(s) => lines.push(format!(
                "  2. Semantic index    — {} memories ({} indexed today, {} deferred)",
                s.total, s.recent_count, s.deferred
            )),
            None => lines.push("  2. Semantic index    — unavailable".to_string()),
        }
        lines.push(format!(
            "  3. Summary buffer    — {} summaries, {} exchanges pending",
            self.summaries.summaries().len(),
            self.summaries.pending_exchanges()
        ));
        match &fact_stats {
            Some(s) => lines.push(format!(
                "  4. Fact store        — {} facts (avg importance {:.2})",
                s.total, s.avg_importance
            )),
            None => lines.push("  4. Fact store        — unavailable".to_string()),
        }
        lines.push(format!(
            "  5. Identity files    — coherence {:.2}",
            coherence
        ));
        lines.push(format!(
            "  Tools: {} available, {} unavailable",
            self.registry.available_tools().len(),
            self.registry.unavailable_tools().len()
        ));
        lines.join("\n")
    }
}

fn rendered_len(parts: &[(Section, String)]) -> usize {
    parts
        .iter()
        .filter(|(_, body)| !body.is_empty())
        .map(|(s, body)| s.header().len() + body.len() + 3)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Episode, FactType, NewFact, TokenUsage};
    use crate::engine::config::ContextBudgets;
    use crate::engine::rag::HashEmbeddingBackend;
    use crate::engine::registry::Tool;
    use crate::engine::workspace::WorkspacePaths;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        identity: MarkdownIdentity,
        facts: FactStore,
        rag: SemanticRag,
        summaries: SummaryBuffer,
        buffer: EpisodicBuffer,
        registry: ToolRegistry,
        budgets: ContextBudgets,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        paths.ensure().unwrap();
        Fixture {
            identity: MarkdownIdentity::new(paths.clone()),
            facts: FactStore::open_in_memory().unwrap(),
            rag: SemanticRag::open_in_memory(
                Arc::new(HashEmbeddingBackend::default()),
                100,
                30.0,
            )
            .unwrap(),
            summaries: SummaryBuffer::load(paths.summaries_json(), 10, 20),
            buffer: EpisodicBuffer::new(10),
            registry: ToolRegistry::new(),
            budgets: ContextBudgets::default(),
            _dir: dir,
        }
    }

    fn assembler(f: &Fixture) -> ContextAssembler<'_> {
        ContextAssembler {
            identity: &f.identity,
            facts: &f.facts,
            rag: &f.rag,
            summaries: &f.summaries,
            buffer: &f.buffer,
            registry: &f.registry,
            budgets: &f.budgets,
        }
    }

    #[tokio::test]
    async fn assembles_all_sections_in_order() {
        let mut f = fixture();
        f.facts
            .store(&[NewFact::new(
                FactType::Preference,
                "User prefers concise answers",
            )])
            .unwrap();
        f.rag
            .index("the user is rebuilding their home lab", "ep:1")
            .await
            .unwrap();
        f.buffer.push(Episode {
            episode_id: 1,
            session_id: "s".into(),
            created_at: Utc::now(),
            user_text: "hello there".into(),
            assistant_text: "hi".into(),
            tool_calls: vec![],
            usage: TokenUsage::default(),
            cancelled: false,
        });
        f.registry.register(
            Tool::new("read_file", "Read a file", json!({"type": "object"}))
                .handler(|input| async move { Ok(input) }),
        );

        let ctx = assembler(&f)
            .assemble("what do I prefer about answers in my home lab")
            .await
            .unwrap();

        let p = &ctx.system_prompt;
        assert!(p.contains("# IDENTITY"));
        assert!(p.contains("# RELEVANT FACTS"));
        assert!(p.contains("concise answers"));
        assert!(p.contains("# RECENT EXCHANGES"));
        assert!(p.contains("# AVAILABLE TOOLS"));
        assert!(p.contains("read_file"));

        let identity_pos = p.find("# IDENTITY").unwrap();
        let tools_pos = p.find("# AVAILABLE TOOLS").unwrap();
        assert!(identity_pos < tools_pos);
    }

    #[tokio::test]
    async fn output_never_exceeds_total_budget() {
        let mut f = fixture();
        f.budgets.total_chars = 600;
        f.budgets.floor_chars = 100;
        // Stuff every layer well past the budget.
        for i in 0..30 {
            f.buffer.push(Episode {
                episode_id: i,
                session_id: "s".into(),
                created_at: Utc::now(),
                user_text: format!("long user message number {} {}", i, "x".repeat(200)),
                assistant_text: "y".repeat(200),
                tool_calls: vec![],
                usage: TokenUsage::default(),
                cancelled: false,
            });
        }
        f.facts
            .store(&[NewFact::new(
                FactType::Preference,
                format!("preference with padding {}", "z".repeat(300)),
            )])
            .unwrap();

        let ctx = assembler(&f).assemble("preference padding").await.unwrap();
        assert!(
            ctx.system_prompt.len() <= 600,
            "prompt was {} chars",
            ctx.system_prompt.len()
        );
        // Identity survives at its floor.
        assert!(ctx.system_prompt.contains("# IDENTITY"));
    }

    #[tokio::test]
    async fn low_importance_facts_stay_out_of_the_prompt() {
        let mut f = fixture();
        f.facts
            .store(&[NewFact::new(FactType::Generic, "barely relevant trivia")])
            .unwrap();
        // Generic base 0.4 · confidence modulation < 0.4 after any decay;
        // backdate to push it under the floor.
        {
            let past = (Utc::now() - chrono::Duration::days(90)).to_rfc3339();
            let conn = f.facts.conn.lock();
            conn.execute("UPDATE facts SET created_at = ?1", rusqlite::params![past])
                .unwrap();
        }

        let ctx = assembler(&f).assemble("barely relevant trivia").await.unwrap();
        assert!(!ctx.system_prompt.contains("barely relevant trivia"));
    }

    #[test]
    fn layers_report_lists_every_layer() {
        let f = fixture();
        let report = assembler(&f).layers_report();
        assert!(report.contains("Episodic buffer"));
        assert!(report.contains("Semantic index"));
        assert!(report.contains("Summary buffer"));
        assert!(report.contains("Fact store"));
        assert!(report.contains("Identity files"));
    }
}
