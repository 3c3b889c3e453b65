// ── COCO Atoms: Error Types ────────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Model, Tool, Config…)
//     and carry the behavioral error kinds the memory core distinguishes.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CoreError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A durable store (episodes, facts) cannot persist. Fatal to the turn.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The embedding backend could not produce a vector. Degraded mode only.
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The model call exceeded its deadline.
    #[error("Model call timed out after {deadline_secs}s")]
    ModelTimeout { deadline_secs: u64 },

    /// Model API or transport failure (non-secret detail only).
    #[error("Model error: {0}")]
    Model(String),

    /// A tool handler exceeded its declared per-call timeout.
    #[error("Tool '{tool}' timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    /// A tool handler returned an error; carries the original message.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The model asked for a tool that was never registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// The summarization model produced output the buffer could not parse.
    #[error("Summarization parse error: {0}")]
    SummarizationParse(String),

    /// An identity file could not be written; the previous content is retained.
    #[error("Identity write error for {file}: {message}")]
    IdentityWrite { file: String, message: String },

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl CoreError {
    /// Create a tool execution error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an identity write error with file name and message.
    pub fn identity(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IdentityWrite {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Whether this error must abort the turn (durable storage is gone).
    pub fn is_fatal_to_turn(&self) -> bool {
        matches!(self, CoreError::StorageUnavailable(_))
    }
}

// ── Migration bridge: String → CoreError ───────────────────────────────────
// Allows `?` on helpers still returning `Result<T, String>` inside functions
// that return `CoreResult<T>`.

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<CoreError> for String {
    fn from(e: CoreError) -> Self {
        e.to_string()
    }
}
