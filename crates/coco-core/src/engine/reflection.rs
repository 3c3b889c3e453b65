// COCO Engine — Shutdown Reflection
// On graceful termination the model is invoked once to rewrite the three
// identity files. Each returned section must be a markdown document starting
// with a YAML frontmatter block and staying within the size bound; anything
// malformed leaves the previous file content in place. A post-write verifier
// confirms every file's mtime landed inside the verification window.

use crate::atoms::error::CoreResult;
use crate::atoms::types::{truncate_utf8, IdentityFileKind, Message};
use crate::engine::identity::{MarkdownIdentity, VerifyReport};
use crate::engine::providers::{AnyTransport, ModelRequest};
use log::{info, warn};
use std::time::Duration;

/// Upper bound per reflected section.
const SECTION_MAX_CHARS: usize = 8_000;
/// Files must be rewritten within this window to count as fresh.
const VERIFY_WINDOW: Duration = Duration::from_secs(60);

const REFLECTION_SYSTEM_PROMPT: &str = "You are performing shutdown reflection: rewriting your persistent identity files \
before the session ends. Produce exactly three markdown documents, one per file, \
each introduced by a marker line of the form <<<FILE: name>>>. Each document must \
begin with a YAML frontmatter block delimited by '---' lines, then the markdown body. \
Files: COCO.md (your self-description — who you are, how you work, what changed this \
session), USER_PROFILE.md (everything learned about the user), \
previous_conversation.md (carry-forward notes for the next session). \
Keep each document under 6000 characters. Output nothing outside the three sections.";

#[derive(Debug, Clone)]
pub struct ReflectionReport {
    /// Files rewritten from the model's sections.
    pub written: Vec<String>,
    /// Files whose previous content was retained (missing/invalid section).
    pub retained: Vec<String>,
    pub verify: VerifyReport,
}

/// Pull one `<<<FILE: name>>>` section out of the reflection output.
fn extract_section<'a>(text: &'a str, file_name: &str) -> Option<&'a str> {
    let marker = format!("<<<FILE: {}>>>", file_name);
    let start = text.find(&marker)? + marker.len();
    let rest = &text[start..];
    let end = rest.find("<<<FILE:").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// A valid section is a markdown document that begins with a frontmatter
/// block and respects the size bound. Returns the body with the model's
/// frontmatter stripped — counters and timestamps stay ours.
fn validate_section(section: &str) -> Option<String> {
    if section.len() > SECTION_MAX_CHARS {
        return None;
    }
    let rest = section.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    let body = rest[end + 5..].trim_start();
    if body.is_empty() {
        return None;
    }
    Some(body.to_string())
}

/// Run the reflection call and rewrite the identity files.
///
/// `session_digest` is a short rendering of what happened this session
/// (recent exchanges, new facts, the closing summary) for the model to fold
/// into the files.
pub async fn run_shutdown_reflection(
    identity: &MarkdownIdentity,
    transport: &AnyTransport,
    model: &str,
    session_digest: &str,
) -> CoreResult<ReflectionReport> {
    let set = identity.load();
    let prompt = format!(
        "Current COCO.md:\n{}\n\nCurrent USER_PROFILE.md:\n{}\n\n\
         Current previous_conversation.md:\n{}\n\nThis session:\n{}\n\n\
         Rewrite all three files now.",
        truncate_utf8(&set.coco.body, 4_000),
        truncate_utf8(&set.user.body, 4_000),
        truncate_utf8(&set.previous.body, 4_000),
        truncate_utf8(session_digest, 6_000),
    );

    let request = ModelRequest {
        model: model.to_string(),
        system: REFLECTION_SYSTEM_PROMPT.to_string(),
        messages: vec![Message::user(prompt)],
        tools: vec![],
        max_tokens: 8192,
        temperature: Some(0.5),
    };

    let mut written = Vec::new();
    let mut retained = Vec::new();

    match transport.complete(&request).await {
        Ok(response) => {
            for kind in IdentityFileKind::ALL {
                let name = kind.file_name();
                let body = extract_section(&response.text, name).and_then(validate_section);
                match body {
                    Some(body) => {
                        identity.update(kind, &body)?;
                        written.push(name.to_string());
                    }
                    None => {
                        warn!(
                            "[reflection] Section for {} missing or invalid — retaining previous content",
                            name
                        );
                        // Rewrite the existing content so the file still
                        // carries a fresh timestamp and survives verification.
                        let previous = identity.load_one(kind);
                        identity.update(kind, &previous.body)?;
                        retained.push(name.to_string());
                    }
                }
            }
        }
        Err(e) => {
            warn!(
                "[reflection] Reflection call failed ({}), retaining all identity files",
                e
            );
            for kind in IdentityFileKind::ALL {
                let previous = identity.load_one(kind);
                identity.update(kind, &previous.body)?;
                retained.push(kind.file_name().to_string());
            }
        }
    }

    let verify = identity.verify_recent_writes(VERIFY_WINDOW);
    info!(
        "[reflection] Done: {} written, {} retained, verification {}",
        written.len(),
        retained.len(),
        if verify.all_updated() { "clean" } else { "flagged" }
    );
    Ok(ReflectionReport {
        written,
        retained,
        verify,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::CoreResult;
    use crate::engine::providers::{ModelResponse, ModelTransport};
    use crate::engine::workspace::WorkspacePaths;
    use async_trait::async_trait;
    use std::sync::Arc;

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

    fn temp_identity() -> (tempfile::TempDir, MarkdownIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path());
        paths.ensure().unwrap();
        (dir, MarkdownIdentity::new(paths))
    }

    fn section(name: &str, body: &str) -> String {
        format!(
            "<<<FILE: {}>>>\n---\nawakening_count: 9\ncoherence: 0.10\nupdated_at: x\n---\n{}\n",
            name, body
        )
    }

    #[tokio::test]
    async fn well_formed_reflection_rewrites_all_files() {
        let (_dir, identity) = temp_identity();
        identity.awaken().unwrap();
        let output = format!(
            "{}{}{}",
            section("COCO.md", "# COCO\n\nI learned a lot today."),
            section("USER_PROFILE.md", "# User\n\nThe user ships Rust."),
            section("previous_conversation.md", "# Last time\n\nWe built a parser."),
        );

        let report =
            run_shutdown_reflection(&identity, &transport(&output), "m", "digest").await.unwrap();

        assert_eq!(report.written.len(), 3);
        assert!(report.retained.is_empty());
        assert!(report.verify.all_updated());

        let coco = identity.load_one(IdentityFileKind::Coco);
        assert!(coco.body.contains("learned a lot"));
        // The model's frontmatter is discarded; our counters survive.
        assert_eq!(coco.frontmatter.awakening_count, 1);
    }

    #[tokio::test]
    async fn malformed_sections_retain_previous_content() {
        let (_dir, identity) = temp_identity();
        identity
            .update(IdentityFileKind::UserProfile, "original profile body")
            .unwrap();

        // COCO.md valid; USER_PROFILE.md has no frontmatter; previous_… missing.
        let output = format!(
            "{}<<<FILE: USER_PROFILE.md>>>\njust text, no frontmatter\n",
            section("COCO.md", "# COCO\n\nRewritten."),
        );

        let report =
            run_shutdown_reflection(&identity, &transport(&output), "m", "digest").await.unwrap();

        assert_eq!(report.written, vec!["COCO.md"]);
        assert_eq!(report.retained.len(), 2);

        let user = identity.load_one(IdentityFileKind::UserProfile);
        assert_eq!(user.body, "original profile body");
        // Retained files are still re-stamped, so verification passes.
        assert!(report.verify.all_updated());
    }

    #[tokio::test]
    async fn oversize_sections_are_rejected() {
        let (_dir, identity) = temp_identity();
        let before = identity.load_one(IdentityFileKind::Coco).body;
        let huge = "x".repeat(SECTION_MAX_CHARS + 100);
        let output = section("COCO.md", &huge);

        let report =
            run_shutdown_reflection(&identity, &transport(&output), "m", "digest").await.unwrap();
        assert!(report.retained.contains(&"COCO.md".to_string()));
        assert_eq!(identity.load_one(IdentityFileKind::Coco).body, before);
    }

    #[test]
    fn section_extraction_handles_adjacent_markers() {
        let text = format!(
            "{}{}",
            section("COCO.md", "alpha"),
            section("USER_PROFILE.md", "beta")
        );
        let coco = extract_section(&text, "COCO.md").unwrap();
        assert!(coco.contains("alpha"));
        assert!(!coco.contains("beta"));
    }
}
