// COCO Engine — Episodic Buffer
// Bounded in-memory deque of the most recent episodes. Hydrated from the
// episode store on startup; the planner pushes each completed turn.
//
// Works purely in memory — no database I/O here.

use crate::atoms::types::{truncate_utf8, Episode};
use crate::engine::episodes::EpisodeStore;
use log::info;
use std::collections::VecDeque;

pub struct EpisodicBuffer {
    episodes: VecDeque<Episode>,
    capacity: usize,
}

impl EpisodicBuffer {
    pub fn new(capacity: usize) -> Self {
        EpisodicBuffer {
            episodes: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Fill the buffer from the most recent stored episodes.
    pub fn hydrate(capacity: usize, store: &EpisodeStore) -> Self {
        let mut buffer = EpisodicBuffer::new(capacity);
        match store.recent(capacity) {
            Ok(mut recent) => {
                // recent() is newest-first; the buffer holds oldest-first.
                recent.reverse();
                for ep in recent {
                    buffer.push(ep);
                }
                info!(
                    "[buffer] Hydrated episodic buffer with {} episodes",
                    buffer.len()
                );
            }
            Err(e) => {
                log::warn!("[buffer] Hydration failed, starting empty: {}", e);
            }
        }
        buffer
    }

    /// Append an episode, evicting the oldest when over capacity.
    pub fn push(&mut self, episode: Episode) {
        if self.episodes.len() == self.capacity {
            self.episodes.pop_front();
        }
        self.episodes.push_back(episode);
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Oldest-first snapshot of the buffered episodes.
    pub fn snapshot(&self) -> Vec<Episode> {
        self.episodes.iter().cloned().collect()
    }

    /// Render the buffer as prompt context, bounded by `max_chars`.
    ///
    /// Truncation drops oldest exchanges first and keeps the most recent
    /// exchange whole — a user/assistant pair is never split.
    pub fn format_as_context(&self, max_chars: usize) -> String {
        if self.episodes.is_empty() {
            return String::new();
        }

        // Build newest-first, then reverse, so the most recent pairs survive.
        let mut kept: Vec<String> = Vec::new();
        let mut used = 0usize;
        for ep in self.episodes.iter().rev() {
            let pair = format!("User: {}\nAssistant: {}", ep.user_text, ep.assistant_text);
            let cost = pair.len() + 2;
            if used + cost > max_chars {
                if kept.is_empty() {
                    // Even the newest pair alone is over budget: keep it,
                    // truncated, rather than returning nothing.
                    kept.push(truncate_utf8(&pair, max_chars).to_string());
                }
                break;
            }
            used += cost;
            kept.push(pair);
        }
        kept.reverse();
        kept.join("\n\n")
    }

    /// Case-insensitive substring scan over buffered exchanges, newest first.
    /// Fallback recall path when both facts and semantic memory miss.
    pub fn substring_scan(&self, query: &str, limit: usize) -> Vec<String> {
        let needle = query.to_lowercase();
        self.episodes
            .iter()
            .rev()
            .filter(|ep| {
                ep.user_text.to_lowercase().contains(&needle)
                    || ep.assistant_text.to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|ep| format!("User: {}\nAssistant: {}", ep.user_text, ep.assistant_text))
            .collect()
    }
}
