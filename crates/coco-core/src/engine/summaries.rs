// COCO Engine — Summary Buffer
// Cross-session continuity: every N exchanges the window is condensed into a
// ConversationSummary via the model, with a deterministic truncation fallback
// when the model's JSON cannot be parsed. All summaries persist to
// summaries.json; key exchanges are copied verbatim from the window so exact
// phrasing survives even when the semantic index cannot locate it.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{
    truncate_utf8, ConversationSummary, Episode, KeyExchange, Message,
};
use crate::engine::providers::{AnyTransport, ModelRequest};
use crate::engine::workspace::atomic_write;
use chrono::Utc;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation summarizer. Read the transcript and respond with ONLY a JSON object of the form:\n\
{\"summary_text\": str, \"key_points\": [str], \"key_exchanges\": [{\"user\": str, \"assistant\": str}], \"tags\": [str], \"importance\": number}\n\
summary_text captures decisions, context, and ongoing tasks in under 300 words. \
key_points are the 3-6 most important takeaways. tags are short lowercase topics. \
importance is 0.0-1.0. No prose outside the JSON.";

/// The shape the summarization prompt contract demands from the model.
#[derive(Debug, Deserialize)]
struct SummaryPayload {
    summary_text: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    importance: Option<f64>,
}

pub struct SummaryBuffer {
    path: PathBuf,
    /// Full persistence image; prompt context uses only the most recent ones.
    summaries: Vec<ConversationSummary>,
    window: Vec<Episode>,
    window_size: usize,
    keep_in_context: usize,
}

impl SummaryBuffer {
    /// Load previously persisted summaries (if any) and start a fresh window.
    pub fn load(path: PathBuf, window_size: usize, keep_in_context: usize) -> Self {
        let summaries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Vec<ConversationSummary>>(&text).ok())
            .unwrap_or_default();
        if !summaries.is_empty() {
            info!(
                "[summaries] Loaded {} summaries from {:?}",
                summaries.len(),
                path
            );
        }
        SummaryBuffer {
            path,
            summaries,
            window: Vec::new(),
            window_size: window_size.max(1),
            keep_in_context,
        }
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn pending_exchanges(&self) -> usize {
        self.window.len()
    }

    /// Record a completed exchange. When the window fills, summarize it.
    /// Returns the new summary when one was produced.
    pub async fn on_exchange(
        &mut self,
        episode: Episode,
        transport: &AnyTransport,
        model: &str,
    ) -> CoreResult<Option<ConversationSummary>> {
        self.window.push(episode);
        if self.window.len() < self.window_size {
            return Ok(None);
        }
        let summary = self.summarize_window(transport, model).await?;
        Ok(Some(summary))
    }

    /// Summarize whatever is in the window right now and persist.
    pub async fn summarize_window(
        &mut self,
        transport: &AnyTransport,
        model: &str,
    ) -> CoreResult<ConversationSummary> {
        let window = std::mem::take(&mut self.window);
        if window.is_empty() {
            return Err(CoreError::Other("summarize_window on empty window".into()));
        }

        let summary = match self.model_summary(&window, transport, model).await {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "[summaries] Model summarization failed, using deterministic fallback: {}",
                    e
                );
                fallback_summary(&window)
            }
        };

        info!(
            "[summaries] New summary over {} exchanges ({} chars, {} tags)",
            summary.exchange_count,
            summary.summary_text.len(),
            summary.tags.len()
        );
        self.summaries.push(summary.clone());
        self.persist()?;
        Ok(summary)
    }

    /// Summarize any residual exchanges at session close.
    pub async fn close_session(
        &mut self,
        transport: &AnyTransport,
        model: &str,
    ) -> CoreResult<Option<ConversationSummary>> {
        if self.window.is_empty() {
            return Ok(None);
        }
        let summary = self.summarize_window(transport, model).await?;
        Ok(Some(summary))
    }

    async fn model_summary(
        &self,
        window: &[Episode],
        transport: &AnyTransport,
        model: &str,
    ) -> CoreResult<ConversationSummary> {
        let mut transcript = String::new();
        for ep in window {
            transcript.push_str(&format!(
                "User: {}\nAssistant: {}\n",
                truncate_utf8(&ep.user_text, 500),
                truncate_utf8(&ep.assistant_text, 500)
            ));
            for inv in &ep.tool_calls {
                transcript.push_str(&format!(
                    "[Tool: {} → {}]\n",
                    inv.name,
                    truncate_utf8(inv.result.as_deref().unwrap_or("(no result)"), 200)
                ));
            }
        }

        let request = ModelRequest {
            model: model.to_string(),
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(format!(
                "Summarize this conversation:\n\n{}",
                transcript
            ))],
            tools: vec![],
            max_tokens: 1024,
            temperature: Some(0.3),
        };

        let response = transport.complete(&request).await?;
        let payload = parse_summary_payload(&response.text)
            .ok_or_else(|| CoreError::SummarizationParse(truncate_utf8(&response.text, 120).to_string()))?;

        Ok(build_summary(
            window,
            payload.summary_text,
            payload.key_points,
            payload.tags,
            payload.importance.unwrap_or(0.5).clamp(0.0, 1.0),
        ))
    }

    /// Case-insensitive substring match over text and key points, plus exact
    /// tag equality.
    pub fn search(&self, query: &str) -> Vec<&ConversationSummary> {
        let needle = query.to_lowercase();
        self.summaries
            .iter()
            .filter(|s| {
                s.summary_text.to_lowercase().contains(&needle)
                    || s.key_points
                        .iter()
                        .any(|p| p.to_lowercase().contains(&needle))
                    || s.tags.iter().any(|t| t.to_lowercase() == needle)
            })
            .collect()
    }

    /// The most recent summaries concatenated, newest last, bounded.
    pub fn context_for_prompt(&self, max_chars: usize) -> String {
        let recent: Vec<&ConversationSummary> = self
            .summaries
            .iter()
            .rev()
            .take(self.keep_in_context)
            .collect();

        let mut sections: Vec<String> = Vec::new();
        let mut used = 0usize;
        for summary in recent {
            let block = format!(
                "[{}] {}",
                summary.timestamp_end.format("%Y-%m-%d"),
                summary.summary_text
            );
            let cost = block.len() + 2;
            if used + cost > max_chars {
                break;
            }
            used += cost;
            sections.push(block);
        }
        sections.reverse();
        sections.join("\n\n")
    }

    fn persist(&self) -> CoreResult<()> {
        let json = serde_json::to_string_pretty(&self.summaries)?;
        atomic_write(&self.path, &json)
    }
}

/// Pull the JSON object out of the model text, tolerating code fences.
fn parse_summary_payload(text: &str) -> Option<SummaryPayload> {
    let trimmed = text.trim();
    let candidate = if let Some(stripped) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        stripped.trim_end_matches("```").trim()
    } else {
        trimmed
    };
    // Fall back to the outermost brace span if extra prose slipped in.
    let candidate = match serde_json::from_str::<SummaryPayload>(candidate) {
        Ok(p) => return Some(p),
        Err(_) => {
            let start = candidate.find('{')?;
            let end = candidate.rfind('}')?;
            &candidate[start..=end]
        }
    };
    serde_json::from_str(candidate).ok()
}

/// Pick up to three verbatim (user, assistant) pairs: first, middle, last.
fn pick_key_exchanges(window: &[Episode]) -> Vec<KeyExchange> {
    let mut indices = vec![0usize];
    if window.len() > 2 {
        indices.push(window.len() / 2);
    }
    if window.len() > 1 {
        indices.push(window.len() - 1);
    }
    indices
        .into_iter()
        .map(|i| KeyExchange {
            user: window[i].user_text.clone(),
            assistant: window[i].assistant_text.clone(),
        })
        .collect()
}

fn build_summary(
    window: &[Episode],
    summary_text: String,
    key_points: Vec<String>,
    tags: Vec<String>,
    importance: f64,
) -> ConversationSummary {
    ConversationSummary {
        summary_id: format!("sum_{}", uuid::Uuid::new_v4()),
        session_id: window[0].session_id.clone(),
        timestamp_start: window[0].created_at,
        timestamp_end: window[window.len() - 1].created_at,
        exchange_count: window.len(),
        summary_text,
        key_points,
        // Always copied verbatim from the window, regardless of what the
        // model returned — exact phrasing must survive.
        key_exchanges: pick_key_exchanges(window),
        tags,
        importance,
    }
}

/// Deterministic truncation summary used when the model output is unusable.
fn fallback_summary(window: &[Episode]) -> ConversationSummary {
    let first = &window[0];
    let last = &window[window.len() - 1];
    let summary_text = format!(
        "Conversation of {} exchanges. Started with: \"{}\". Ended with: \"{}\".",
        window.len(),
        truncate_utf8(&first.user_text, 160),
        truncate_utf8(&last.user_text, 160)
    );
    let key_points = window
        .iter()
        .take(5)
        .map(|ep| truncate_utf8(&ep.user_text, 120).to_string())
        .collect();

    // Naive keyword tags: the most frequent longer words across the window.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for ep in window {
        for word in ep
            .user_text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 5)
        {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let tags = ranked.into_iter().take(3).map(|(w, _)| w).collect();

    build_summary(window, summary_text, key_points, tags, 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::CoreResult;
    use crate::atoms::types::TokenUsage;
    use crate::engine::providers::{ModelResponse, ModelTransport};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Scripted transport: replays a fixed text for every call.
    struct FixedTransport(String);

    #[async_trait]
    impl ModelTransport for FixedTransport {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, _request: &ModelRequest) -> CoreResult<ModelResponse> {
            Ok(ModelResponse {
                text: self.0.clone(),
                ..Default::default()
            })
        }
    }

    fn transport(text: &str) -> AnyTransport {
        AnyTransport::from_transport(Arc::new(FixedTransport(text.to_string())))
    }

    fn episode(id: i64, user: &str, assistant: &str) -> Episode {
        Episode {
            episode_id: id,
            session_id: "s1".into(),
            created_at: Utc::now(),
            user_text: user.into(),
            assistant_text: assistant.into(),
            tool_calls: vec![],
            usage: TokenUsage::default(),
            cancelled: false,
        }
    }

    fn temp_buffer(window_size: usize) -> (tempfile::TempDir, SummaryBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buf = SummaryBuffer::load(dir.path().join("summaries.json"), window_size, 20);
        (dir, buf)
    }

    #[tokio::test]
    async fn window_rollover_produces_exactly_one_summary() {
        let (_dir, mut buf) = temp_buffer(10);
        let t = transport(
            r#"{"summary_text": "We planned the launch.", "key_points": ["launch set"], "key_exchanges": [], "tags": ["launch"], "importance": 0.8}"#,
        );

        for i in 0..9 {
            let result = buf
                .on_exchange(episode(i, &format!("u{}", i), "a"), &t, "m")
                .await
                .unwrap();
            assert!(result.is_none());
        }
        let result = buf
            .on_exchange(episode(9, "u9", "a"), &t, "m")
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(buf.summaries().len(), 1);
        assert_eq!(buf.summaries()[0].exchange_count, 10);
        assert_eq!(buf.summaries()[0].summary_text, "We planned the launch.");
    }

    #[tokio::test]
    async fn twenty_five_turns_yield_two_summaries_with_verbatim_exchanges() {
        let (_dir, mut buf) = temp_buffer(10);
        // Unparseable model output forces the deterministic fallback.
        let t = transport("I'd rather chat than emit JSON.");

        for i in 0..25 {
            buf.on_exchange(
                episode(i, &format!("question number {}", i), &format!("answer {}", i)),
                &t,
                "m",
            )
            .await
            .unwrap();
        }

        assert_eq!(buf.summaries().len(), 2);
        assert_eq!(buf.pending_exchanges(), 5);

        // The second summary covers turns 10–19; its key exchanges are
        // verbatim copies from that window.
        let second = &buf.summaries()[1];
        assert_eq!(second.exchange_count, 10);
        for ke in &second.key_exchanges {
            let n: usize = ke
                .user
                .rsplit(' ')
                .next()
                .unwrap()
                .parse()
                .expect("verbatim user text");
            assert!((10..20).contains(&n));
            assert_eq!(ke.assistant, format!("answer {}", n));
        }
    }

    #[tokio::test]
    async fn parse_failure_falls_back_deterministically() {
        let (_dir, mut buf) = temp_buffer(2);
        let t = transport("no json here at all");
        buf.on_exchange(episode(0, "discussing kubernetes clusters", "ok"), &t, "m")
            .await
            .unwrap();
        buf.on_exchange(episode(1, "more about kubernetes rollouts", "ok"), &t, "m")
            .await
            .unwrap();

        let s = &buf.summaries()[0];
        assert!(s.summary_text.contains("2 exchanges"));
        assert!(s.tags.contains(&"kubernetes".to_string()));
        assert!((s.importance - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn summaries_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.json");
        let t = transport(r#"{"summary_text": "short", "key_points": [], "tags": [], "importance": 0.4}"#);

        {
            let mut buf = SummaryBuffer::load(path.clone(), 1, 20);
            buf.on_exchange(episode(0, "hi", "hello"), &t, "m")
                .await
                .unwrap();
        }
        let reloaded = SummaryBuffer::load(path, 1, 20);
        assert_eq!(reloaded.summaries().len(), 1);
        assert_eq!(reloaded.summaries()[0].summary_text, "short");
    }

    #[tokio::test]
    async fn search_matches_text_and_tags() {
        let (_dir, mut buf) = temp_buffer(1);
        let t = transport(
            r#"{"summary_text": "Planned the quarterly roadmap.", "key_points": ["roadmap locked"], "tags": ["planning"], "importance": 0.7}"#,
        );
        buf.on_exchange(episode(0, "roadmap?", "sure"), &t, "m")
            .await
            .unwrap();

        assert_eq!(buf.search("roadmap").len(), 1);
        assert_eq!(buf.search("planning").len(), 1);
        assert!(buf.search("unrelated").is_empty());
    }

    #[tokio::test]
    async fn close_session_flushes_partial_window() {
        let (_dir, mut buf) = temp_buffer(10);
        let t = transport("not json");
        buf.on_exchange(episode(0, "only one exchange", "yes"), &t, "m")
            .await
            .unwrap();
        let closing = buf.close_session(&t, "m").await.unwrap();
        assert!(closing.is_some());
        assert_eq!(buf.pending_exchanges(), 0);
        // Nothing left → closing again is a no-op.
        assert!(buf.close_session(&t, "m").await.unwrap().is_none());
    }

    #[test]
    fn code_fenced_json_still_parses() {
        let payload = parse_summary_payload(
            "```json\n{\"summary_text\": \"x\", \"key_points\": [], \"tags\": [], \"importance\": 0.2}\n```",
        );
        assert!(payload.is_some());

        let with_prose = parse_summary_payload(
            "Here you go: {\"summary_text\": \"y\", \"key_points\": [], \"tags\": []} hope that helps",
        );
        assert_eq!(with_prose.unwrap().summary_text, "y");
    }

    #[test]
    fn context_for_prompt_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = SummaryBuffer::load(dir.path().join("s.json"), 1, 20);
        for i in 0..5 {
            buf.summaries.push(build_summary(
                &[episode(i, "u", "a")],
                format!("summary body number {} with some padding text", i),
                vec![],
                vec![],
                0.5,
            ));
        }
        let ctx = buf.context_for_prompt(120);
        assert!(ctx.len() <= 120);
        // Newest summaries win under a tight budget.
        assert!(ctx.contains("number 4"));
    }
}
