// COCO Engine — Markdown Identity
// Owns the three human-readable identity files in the workspace:
//   COCO.md                   — agent self-description
//   USER_PROFILE.md           — learned user facts
//   previous_conversation.md  — last-session carry-forward
//
// Writers parse-then-render: the frontmatter block is always regenerated
// from typed fields, never blindly appended to. File replacement is atomic
// (temp, fsync, rename).

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{
    truncate_utf8, IdentityDocument, IdentityFileKind, IdentityFrontmatter,
};
use crate::engine::workspace::{atomic_write, WorkspacePaths};
use chrono::Utc;
use log::{info, warn};
use std::time::{Duration, SystemTime};

pub struct MarkdownIdentity {
    paths: WorkspacePaths,
}

/// All three documents, loaded together.
pub struct IdentitySet {
    pub coco: IdentityDocument,
    pub user: IdentityDocument,
    pub previous: IdentityDocument,
}

impl IdentitySet {
    pub fn get(&self, kind: IdentityFileKind) -> &IdentityDocument {
        match kind {
            IdentityFileKind::Coco => &self.coco,
            IdentityFileKind::UserProfile => &self.user,
            IdentityFileKind::PreviousConversation => &self.previous,
        }
    }
}

/// Outcome of the post-write verification pass.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub updated: Vec<String>,
    pub stale: Vec<String>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn all_updated(&self) -> bool {
        self.stale.is_empty() && self.missing.is_empty()
    }
}

// ── Frontmatter codec ──────────────────────────────────────────────────────

fn parse_document(kind: IdentityFileKind, text: &str) -> IdentityDocument {
    let mut frontmatter = IdentityFrontmatter::default();
    let mut body = text;

    if let Some(rest) = text.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            for line in rest[..end].lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "awakening_count" => {
                        frontmatter.awakening_count = value.parse().unwrap_or(0);
                    }
                    "coherence" => {
                        frontmatter.coherence = value.parse().unwrap_or(0.0);
                    }
                    "updated_at" => {
                        frontmatter.updated_at = value.to_string();
                    }
                    _ => {}
                }
            }
            body = &rest[end + 5..];
        }
    }

    IdentityDocument {
        kind,
        frontmatter,
        body: body.to_string(),
    }
}

fn render_document(doc: &IdentityDocument) -> String {
    format!(
        "---\nawakening_count: {}\ncoherence: {:.2}\nupdated_at: {}\n---\n{}",
        doc.frontmatter.awakening_count,
        doc.frontmatter.coherence,
        doc.frontmatter.updated_at,
        doc.body
    )
}

fn seed_body(kind: IdentityFileKind) -> &'static str {
    match kind {
        IdentityFileKind::Coco => {
            "# COCO\n\nI am COCO, a terminal-resident assistant with layered persistent memory. \
             This file describes who I am and how I work; it is rewritten during shutdown \
             reflection.\n"
        }
        IdentityFileKind::UserProfile => {
            "# User Profile\n\nWhat I have learned about the user so far. Updated during \
             shutdown reflection.\n"
        }
        IdentityFileKind::PreviousConversation => {
            "# Previous Conversation\n\nCarry-forward notes from the last session.\n"
        }
    }
}

impl MarkdownIdentity {
    pub fn new(paths: WorkspacePaths) -> Self {
        MarkdownIdentity { paths }
    }

    fn path_for(&self, kind: IdentityFileKind) -> std::path::PathBuf {
        self.paths.identity_file(kind.file_name())
    }

    /// Load one document, seeding a default when the file does not exist.
    pub fn load_one(&self, kind: IdentityFileKind) -> IdentityDocument {
        match std::fs::read_to_string(self.path_for(kind)) {
            Ok(text) => parse_document(kind, &text),
            Err(_) => IdentityDocument {
                kind,
                frontmatter: IdentityFrontmatter::default(),
                body: seed_body(kind).to_string(),
            },
        }
    }

    /// Load all three documents.
    pub fn load(&self) -> IdentitySet {
        IdentitySet {
            coco: self.load_one(IdentityFileKind::Coco),
            user: self.load_one(IdentityFileKind::UserProfile),
            previous: self.load_one(IdentityFileKind::PreviousConversation),
        }
    }

    /// Atomically write one document. The frontmatter timestamp is refreshed.
    pub fn write(&self, doc: &mut IdentityDocument) -> CoreResult<()> {
        doc.frontmatter.updated_at = Utc::now().to_rfc3339();
        let rendered = render_document(doc);
        atomic_write(&self.path_for(doc.kind), &rendered)
            .map_err(|e| CoreError::identity(doc.kind.file_name(), e.to_string()))
    }

    /// Replace the body of one file, preserving its frontmatter counters.
    pub fn update(&self, kind: IdentityFileKind, body: &str) -> CoreResult<()> {
        let mut doc = self.load_one(kind);
        doc.body = body.to_string();
        self.write(&mut doc)
    }

    /// Write all three documents.
    pub fn write_all(&self, set: &mut IdentitySet) -> CoreResult<()> {
        self.write(&mut set.coco)?;
        self.write(&mut set.user)?;
        self.write(&mut set.previous)?;
        Ok(())
    }

    /// Session start: bump the awakening counter on COCO.md and refresh the
    /// coherence measure on every file.
    pub fn awaken(&self) -> CoreResult<u64> {
        let mut set = self.load();
        set.coco.frontmatter.awakening_count += 1;
        let count = set.coco.frontmatter.awakening_count;
        let coherence = self.measure_coherence(&set);
        set.coco.frontmatter.coherence = coherence;
        set.user.frontmatter.coherence = coherence;
        set.previous.frontmatter.coherence = coherence;
        self.write_all(&mut set)?;
        info!(
            "[identity] Awakening #{} (coherence {:.2})",
            count, coherence
        );
        Ok(count)
    }

    /// Identity coherence: the fraction of identity files carrying a
    /// substantive body (more than a bare heading).
    pub fn measure_coherence(&self, set: &IdentitySet) -> f64 {
        let substantive = IdentityFileKind::ALL
            .iter()
            .filter(|kind| set.get(**kind).body.trim().len() > 80)
            .count();
        let raw = substantive as f64 / IdentityFileKind::ALL.len() as f64;
        (raw * 100.0).round() / 100.0
    }

    /// Concatenate the three files with section headers, truncating
    /// lowest-priority sections first (COCO > USER_PROFILE > previous).
    pub fn render_context(&self, budget_chars: usize) -> String {
        let set = self.load();
        let sections = [
            ("## COCO IDENTITY", &set.coco),
            ("## USER PROFILE", &set.user),
            ("## PREVIOUS CONVERSATION", &set.previous),
        ];

        let mut out = String::new();
        for (header, doc) in sections {
            let separator = if out.is_empty() { 0 } else { 1 };
            let overhead = separator + header.len() + 2;
            let remaining = budget_chars.saturating_sub(out.len());
            if remaining <= overhead {
                break;
            }
            let body = truncate_utf8(doc.body.trim(), remaining - overhead);
            if body.is_empty() {
                continue;
            }
            if separator == 1 {
                out.push('\n');
            }
            out.push_str(header);
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }
        out
    }

    /// Check that every identity file was rewritten within the verification
    /// window (60 s after shutdown reflection).
    pub fn verify_recent_writes(&self, window: Duration) -> VerifyReport {
        let now = SystemTime::now();
        let mut report = VerifyReport {
            updated: Vec::new(),
            stale: Vec::new(),
            missing: Vec::new(),
        };

        for kind in IdentityFileKind::ALL {
            let name = kind.file_name().to_string();
            let path = self.path_for(kind);
            match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => match now.duration_since(mtime) {
                    Ok(age) if age <= window => report.updated.push(name),
                    Ok(_) => {
                        warn!("[identity] {} not refreshed within window", name);
                        report.stale.push(name);
                    }
                    // Clock skew puts the mtime in the future — count it fresh.
                    Err(_) => report.updated.push(name),
                },
                Err(_) => {
                    warn!("[identity] {} missing from workspace", name);
                    report.missing.push(name);
                }
            }
        }
        report
    }
}
