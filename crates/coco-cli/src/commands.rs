// COCO CLI — Slash Command Surface
// A leading `/` routes input here instead of the planner. The core defines
// the contract; this module parses and dispatches it.

use coco_core::{CocoEngine, FactType, RouteSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Recall(String),
    Facts(Option<FactType>),
    FactsStats,
    MemoryLayers,
    Tools,
    Help,
    Exit,
    Unknown(String),
}

/// Parse a line into a command. Returns None for ordinary chat input.
pub fn parse(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    Some(match head {
        "/recall" => Command::Recall(rest.to_string()),
        "/facts" => {
            if rest.is_empty() {
                Command::Facts(None)
            } else {
                match FactType::parse(rest) {
                    Some(t) => Command::Facts(Some(t)),
                    None => Command::Unknown(format!("unknown fact type '{}'", rest)),
                }
            }
        }
        "/facts-stats" => Command::FactsStats,
        "/memory" if rest == "layers" => Command::MemoryLayers,
        "/tools" => Command::Tools,
        "/help" => Command::Help,
        "/exit" | "/quit" => Command::Exit,
        other => Command::Unknown(other.to_string()),
    })
}

const HELP_TEXT: &str = "Commands:
  /recall <query>   search memory across facts, semantic index, and episodes
  /facts [type]     list stored facts, optionally filtered by type
  /facts-stats      fact store statistics
  /memory layers    diagnostic dump of every memory layer
  /tools            list available and unavailable tools
  /help             this help
  /exit             shutdown reflection, then quit
Anything else is sent to COCO.";

/// Execute a command. Returns true when the REPL should exit.
pub async fn dispatch(engine: &mut CocoEngine, command: Command) -> bool {
    match command {
        Command::Recall(query) => {
            if query.is_empty() {
                println!("usage: /recall <query>");
                return false;
            }
            match engine.recall(&query, 5).await {
                Ok(result) => {
                    let source = match result.source {
                        RouteSource::Facts => "facts",
                        RouteSource::Semantic => "semantic",
                        RouteSource::Episodic => "episodic",
                        RouteSource::None => "none",
                    };
                    println!("source: {} ({} results)", source, result.count);
                    for line in result.results {
                        println!("  {}", line);
                    }
                }
                Err(e) => println!("recall failed: {}", e),
            }
        }
        Command::Facts(fact_type) => match engine.facts_by_type(fact_type, 20) {
            Ok(lines) if lines.is_empty() => println!("no facts stored yet"),
            Ok(lines) => {
                for line in lines {
                    println!("  {}", line);
                }
            }
            Err(e) => println!("listing failed: {}", e),
        },
        Command::FactsStats => match engine.fact_stats() {
            Ok(stats) => {
                println!("facts: {} (avg importance {:.2})", stats.total, stats.avg_importance);
                for (fact_type, count) in stats.by_type {
                    println!("  {:<20} {}", fact_type, count);
                }
                if let Some(top) = stats.most_accessed {
                    println!("most accessed: {}", top);
                }
            }
            Err(e) => println!("stats failed: {}", e),
        },
        Command::MemoryLayers => println!("{}", engine.memory_layers()),
        Command::Tools => {
            let registry = engine.registry();
            println!("available:");
            for name in registry.available_tools() {
                println!("  {}", name);
            }
            let unavailable = registry.unavailable_tools();
            if !unavailable.is_empty() {
                println!("unavailable (missing configuration):");
                for name in unavailable {
                    println!("  {}", name);
                }
            }
        }
        Command::Help => println!("{}", HELP_TEXT),
        Command::Unknown(what) => {
            println!("unknown command: {} (try /help)", what);
        }
        Command::Exit => {
            println!("Preserving memory before shutdown…");
            match engine.shutdown().await {
                Ok(report) => {
                    if report.reflection.verify.all_updated() {
                        println!("Identity files preserved. Until next time.");
                    } else {
                        println!(
                            "Shutdown complete; some identity files were not refreshed: {:?} {:?}",
                            report.reflection.verify.stale, report.reflection.verify.missing
                        );
                    }
                }
                Err(e) => println!("shutdown reflection failed: {}", e),
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_lines_are_not_commands() {
        assert_eq!(parse("hello there"), None);
        assert_eq!(parse("  what's up"), None);
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(
            parse("/recall meeting with Sarah"),
            Some(Command::Recall("meeting with Sarah".into()))
        );
        assert_eq!(parse("/facts"), Some(Command::Facts(None)));
        assert_eq!(
            parse("/facts preference"),
            Some(Command::Facts(Some(FactType::Preference)))
        );
        assert_eq!(parse("/facts-stats"), Some(Command::FactsStats));
        assert_eq!(parse("/memory layers"), Some(Command::MemoryLayers));
        assert_eq!(parse("/exit"), Some(Command::Exit));
    }

    #[test]
    fn bad_fact_types_and_unknown_commands_are_flagged() {
        assert!(matches!(
            parse("/facts nonsense"),
            Some(Command::Unknown(_))
        ));
        assert!(matches!(parse("/frobnicate"), Some(Command::Unknown(_))));
        // `/memory` without `layers` is not a recognized diagnostic.
        assert!(matches!(parse("/memory"), Some(Command::Unknown(_))));
    }
}
