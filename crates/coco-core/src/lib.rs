// COCO Core — layered persistent memory, fact extraction, a unified tool
// registry, and the planner loop that ties them to a model.
//
// Layering:
//   atoms/  — pure data and error types, no I/O
//   engine/ — the components and the `CocoEngine` that wires them
//
// The terminal front-end lives in the `coco-cli` crate; everything here is
// UI-agnostic.

pub mod atoms;
pub mod engine;

pub use atoms::error::{CoreError, CoreResult};
pub use atoms::types::{
    Episode, Fact, FactType, IdentityFileKind, Message, NewFact, Role, SemanticMemory,
    TokenUsage, ToolCall, ToolDefinition, ToolInvocation,
};
pub use engine::config::CocoConfig;
pub use engine::router::{RouteResult, RouteSource};
pub use engine::{CocoEngine, ShutdownReport};
