// COCO Engine — Fact Extraction
// Pure two-stage pipeline over a completed episode:
//   Stage A — tool-specific extractors keyed by tool name
//   Stage B — conversational regex patterns over (user_text, assistant_text)
//
// No side effects here. Extractors skip any invocation whose result carries
// an error marker. Every emitted fact also yields a one-sentence
// serialization for the semantic index.

use crate::atoms::types::{truncate_utf8, Episode, FactType, NewFact, ToolInvocation};
use regex::Regex;
use std::sync::LazyLock;

/// Confidence floor: Stage-B extractions below this are dropped.
const CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Tools with a Stage-A extractor. Invocations of anything else only feed
/// the episode record, not the fact store.
pub const EXTRACTOR_TOOLS: &[&str] = &[
    "send_email",
    "create_document",
    "write_file",
    "create_spreadsheet",
    "generate_image",
    "generate_video",
    "search_web",
    "add_calendar_event",
    "create_calendar_event",
    "upload_file",
    "download_file",
    "create_folder",
    "read_document",
    "analyze_document",
    "execute_bash",
];

/// Everything one extraction pass produces.
#[derive(Debug, Default)]
pub struct Extraction {
    pub facts: Vec<NewFact>,
    /// One-sentence serializations destined for the semantic index.
    pub semantic_texts: Vec<String>,
}

/// Run both stages over an episode. Pure function of its input.
pub fn extract(episode: &Episode) -> Extraction {
    let mut facts: Vec<NewFact> = Vec::new();

    for invocation in &episode.tool_calls {
        facts.extend(extract_tool_facts(invocation));
    }
    facts.extend(extract_conversational(
        &episode.user_text,
        &episode.assistant_text,
    ));

    for fact in &mut facts {
        fact.source_episode_id = Some(episode.episode_id);
    }

    let semantic_texts = facts.iter().map(serialize_fact).collect();
    Extraction {
        facts,
        semantic_texts,
    }
}

/// One-sentence rendering of a fact for the semantic index.
pub fn serialize_fact(fact: &NewFact) -> String {
    match &fact.subject {
        Some(subject) => format!(
            "{} ({}): {}",
            fact.fact_type.as_str(),
            subject,
            fact.content
        ),
        None => format!("{}: {}", fact.fact_type.as_str(), fact.content),
    }
}

// ── Stage A: tool-specific extractors ──────────────────────────────────────

/// Error markers that suppress extraction for an invocation.
fn is_error_result(invocation: &ToolInvocation) -> bool {
    if invocation.error.is_some() {
        return true;
    }
    let Some(result) = &invocation.result else {
        return true;
    };
    let head = truncate_utf8(result, 200).to_lowercase();
    head.trim_start().starts_with("error:")
        || head.contains("failed")
        || head.contains("exception")
        || head.contains("traceback")
}

fn input_str<'a>(invocation: &'a ToolInvocation, key: &str) -> Option<&'a str> {
    invocation.input.get(key).and_then(|v| v.as_str())
}

/// Dispatch an invocation to its extractor. Returns no facts for errored
/// results or tools outside the documented set.
pub fn extract_tool_facts(invocation: &ToolInvocation) -> Vec<NewFact> {
    if is_error_result(invocation) {
        return Vec::new();
    }
    let facts = match invocation.name.as_str() {
        "send_email" => extract_email(invocation),
        "create_document" | "write_file" => extract_document(invocation),
        "create_spreadsheet" => extract_spreadsheet(invocation),
        "generate_image" | "generate_video" => extract_generation(invocation),
        "search_web" => extract_search(invocation),
        "add_calendar_event" | "create_calendar_event" => extract_calendar(invocation),
        "upload_file" | "download_file" | "create_folder" => extract_file_op(invocation),
        "read_document" | "analyze_document" => extract_document_read(invocation),
        "execute_bash" => extract_bash(invocation),
        _ => Vec::new(),
    };
    facts
        .into_iter()
        .map(|f| f.from_tool(invocation.name.clone()))
        .collect()
}

fn extract_email(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    if let Some(to) = input_str(inv, "to") {
        facts.push(
            NewFact::new(FactType::EmailRecipient, format!("Sent email to {}", to))
                .with_subject(to),
        );
    }
    if let Some(subject) = input_str(inv, "subject") {
        facts.push(NewFact::new(
            FactType::Topic,
            format!("Email topic: {}", subject),
        ));
    }
    facts
}

fn extract_document(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    let title = input_str(inv, "title").or_else(|| input_str(inv, "path"));
    if let Some(title) = title {
        facts.push(
            NewFact::new(FactType::DocumentReference, format!("Created document: {}", title))
                .with_subject(title),
        );
    }
    let body = input_str(inv, "initial_content").or_else(|| input_str(inv, "content"));
    if let Some(body) = body {
        if let Some(first) = first_sentence(body) {
            facts.push(NewFact::new(
                FactType::Topic,
                format!("Document covers: {}", first),
            ));
        }
    }
    facts
}

fn extract_spreadsheet(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    if let Some(title) = input_str(inv, "title") {
        facts.push(
            NewFact::new(
                FactType::DocumentReference,
                format!("Created spreadsheet: {}", title),
            )
            .with_subject(title),
        );
    }
    if let Some(headers) = inv.input.get("headers").and_then(|v| v.as_array()) {
        let cols: Vec<&str> = headers.iter().filter_map(|h| h.as_str()).collect();
        if !cols.is_empty() {
            facts.push(NewFact::new(
                FactType::Topic,
                format!("Spreadsheet columns: {}", cols.join(", ")),
            ));
        }
    }
    facts
}

fn extract_generation(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    if let Some(prompt) = input_str(inv, "prompt") {
        facts.push(NewFact::new(
            FactType::Topic,
            format!("Generated media from prompt: {}", truncate_utf8(prompt, 160)),
        ));
    }
    if let Some(result) = &inv.result {
        if let Some(line) = result.lines().next() {
            facts.push(NewFact::new(
                FactType::FileReference,
                format!("Generated artifact: {}", truncate_utf8(line, 160)),
            ));
        }
    }
    facts
}

fn extract_search(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    if let Some(query) = input_str(inv, "query") {
        facts.push(NewFact::new(
            FactType::Topic,
            format!("Searched the web for: {}", query),
        ));
    }
    if let Some(result) = &inv.result {
        let titles: Vec<&str> = result
            .lines()
            .filter_map(|l| l.trim().strip_prefix("- "))
            .take(3)
            .collect();
        if !titles.is_empty() {
            facts.push(NewFact::new(
                FactType::Topic,
                format!("Top results: {}", titles.join("; ")),
            ));
        }
    }
    facts
}

/// Calendar events fan out into three facts: the event itself, who attends,
/// and when/where it happens.
fn extract_calendar(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    let title = input_str(inv, "summary").or_else(|| input_str(inv, "title"));
    if let Some(title) = title {
        facts.push(
            NewFact::new(
                FactType::CalendarReference,
                format!("Calendar event: {}", title),
            )
            .with_subject(title),
        );
    }
    if let Some(attendees) = inv.input.get("attendees").and_then(|v| v.as_array()) {
        let names: Vec<&str> = attendees.iter().filter_map(|a| a.as_str()).collect();
        if !names.is_empty() {
            facts.push(NewFact::new(
                FactType::Contact,
                format!("Event attendees: {}", names.join(", ")),
            ));
        }
    }
    let time = input_str(inv, "start_time");
    let location = input_str(inv, "location");
    if time.is_some() || location.is_some() {
        let when = time.unwrap_or("unspecified time");
        let whereabouts = location.unwrap_or("unspecified location");
        facts.push(NewFact::new(
            FactType::Appointment,
            format!(
                "{} at {} ({})",
                title.unwrap_or("Event"),
                when,
                whereabouts
            ),
        ));
    }
    facts
}

fn extract_file_op(inv: &ToolInvocation) -> Vec<NewFact> {
    let path = input_str(inv, "path").or_else(|| input_str(inv, "filename"));
    match path {
        Some(path) => vec![
            NewFact::new(
                FactType::FileReference,
                format!("{}: {}", inv.name.replace('_', " "), path),
            )
            .with_subject(path),
        ],
        None => Vec::new(),
    }
}

fn extract_document_read(inv: &ToolInvocation) -> Vec<NewFact> {
    let mut facts = Vec::new();
    let title = input_str(inv, "title").or_else(|| input_str(inv, "doc_id"));
    if let Some(title) = title {
        facts.push(
            NewFact::new(
                FactType::DocumentReference,
                format!("Read document: {}", title),
            )
            .with_subject(title),
        );
    }
    if let Some(result) = &inv.result {
        if let Some(first) = first_sentence(result) {
            facts.push(NewFact::new(
                FactType::Topic,
                format!("Key finding: {}", first),
            ));
        }
    }
    facts
}

fn extract_bash(inv: &ToolInvocation) -> Vec<NewFact> {
    let Some(command) = input_str(inv, "command") else {
        return Vec::new();
    };
    let class = match command.split_whitespace().next().unwrap_or("") {
        "git" => "version control",
        "ls" | "cat" | "cp" | "mv" | "rm" | "mkdir" | "find" | "touch" => "file operation",
        "curl" | "wget" | "ping" | "ssh" => "network",
        "cargo" | "npm" | "pip" | "apt" | "brew" => "package/build",
        _ => "shell",
    };
    vec![
        NewFact::new(FactType::Command, format!("Ran command: {}", command)),
        NewFact::new(FactType::Topic, format!("Performed {} operation", class)),
    ]
}

fn first_sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    Some(truncate_utf8(&trimmed[..end], 200).trim().to_string())
}

// ── Stage B: conversational extractor ──────────────────────────────────────

static APPOINTMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:meeting|appointment|call|lunch|dinner|coffee)\s+with\s+([A-Z][a-zA-Z]+)")
        .unwrap()
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});
static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:remind me to|i need to|i have to|don't forget to)\s+(.{3,120})").unwrap()
});
static PREFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bi\s+(?:really\s+)?(?:like|love|prefer|hate|always\s+use|never\s+use)\b")
        .unwrap()
});
static NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bremember\s+that\s+(.{3,160})").unwrap());

/// The sentence of `text` containing byte offset `pos`.
fn sentence_around(text: &str, pos: usize) -> String {
    let bytes = text.as_bytes();
    let mut start = 0;
    for i in (0..pos).rev() {
        if matches!(bytes[i], b'.' | b'!' | b'?' | b'\n') {
            start = i + 1;
            break;
        }
    }
    let mut end = text.len();
    for (i, b) in bytes.iter().enumerate().skip(pos) {
        if matches!(b, b'.' | b'!' | b'?' | b'\n') {
            end = i + 1;
            break;
        }
    }
    text[start..end].trim().to_string()
}

/// Regex/heuristic pass over the raw exchange. Deterministic; each pattern
/// carries a fixed confidence and anything under the threshold is dropped.
pub fn extract_conversational(user_text: &str, _assistant_text: &str) -> Vec<NewFact> {
    let mut facts = Vec::new();

    if let Some(caps) = APPOINTMENT_RE.captures(user_text) {
        let who = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let sentence = sentence_around(user_text, caps.get(0).unwrap().start());
        facts.push(
            NewFact::new(FactType::Appointment, sentence)
                .with_subject(who)
                .with_confidence(0.9),
        );
    }

    for caps in EMAIL_RE.captures_iter(user_text) {
        let address = caps.get(0).unwrap().as_str();
        facts.push(
            NewFact::new(FactType::Contact, format!("Mentioned contact: {}", address))
                .with_subject(address)
                .with_confidence(0.8),
        );
    }

    if let Some(caps) = TASK_RE.captures(user_text) {
        let what = caps.get(1).unwrap().as_str().trim_end_matches('.');
        facts.push(NewFact::new(FactType::Task, format!("Task: {}", what)).with_confidence(0.7));
    }

    if let Some(m) = PREFERENCE_RE.find(user_text) {
        let sentence = sentence_around(user_text, m.start());
        facts.push(NewFact::new(FactType::Preference, sentence).with_confidence(0.7));
    }

    if let Some(caps) = NOTE_RE.captures(user_text) {
        let what = caps.get(1).unwrap().as_str().trim_end_matches('.');
        facts.push(NewFact::new(FactType::Note, what.to_string()).with_confidence(0.8));
    }

    facts.retain(|f| f.confidence >= CONFIDENCE_THRESHOLD);
    facts
}
