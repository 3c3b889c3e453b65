// COCO CLI — Terminal REPL
// Thin front-end over coco-core: reads lines, routes `/` commands, sends
// everything else through the planner, and appends input history to
// `.coco_history` in the workspace.

mod commands;

use clap::Parser;
use coco_core::{CocoConfig, CocoEngine};
use log::debug;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Parser, Debug)]
#[command(
    name = "coco",
    version,
    about = "COCO — a terminal-resident assistant with layered persistent memory"
)]
struct Cli {
    /// Workspace directory for all persisted state.
    #[arg(long, env = "COCO_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Model id for the planner.
    #[arg(long, env = "COCO_MODEL")]
    model: Option<String>,

    /// Verbose engine logging.
    #[arg(long)]
    debug: bool,
}

fn history_append(path: &std::path::Path, line: &str) {
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Failures that escape the engine land in a workspace log so a crash leaves
/// a trace next to the memory it belongs to.
fn log_failure(workspace: &std::path::Path, context: &str, error: &dyn std::fmt::Display) {
    let path = workspace.join("errors.log");
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(
            f,
            "{} [{}] {}",
            chrono::Utc::now().to_rfc3339(),
            context,
            error
        );
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = CocoConfig::from_env();
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    config.debug |= cli.debug;

    let mut engine = match CocoEngine::new(config.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("coco: {}", e);
            std::process::exit(1);
        }
    };

    // Cooperative interrupt: Ctrl-C sets the planner's cancel flag; the
    // current dispatch finishes, pending tool calls are not started.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            eprintln!("\n(interrupt requested — finishing the current step)");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let history_path = config.workspace.join(".coco_history");
    println!(
        "COCO ready (workspace {:?}, model {}). Type /help for commands.",
        config.workspace, config.model
    );

    let stdin = std::io::stdin();
    loop {
        print!("you> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("coco: input error: {}", e);
                break;
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        history_append(&history_path, line);

        if let Some(command) = commands::parse(line) {
            if commands::dispatch(&mut engine, command).await {
                break;
            }
            continue;
        }

        debug!("[cli] Sending turn to planner");
        match engine.converse(line).await {
            Ok(reply) => println!("coco> {}\n", reply),
            Err(e) => {
                // The engine degrades everything it can; what reaches here is
                // fatal to the turn (e.g. storage gone).
                log_failure(&config.workspace, "turn", &e);
                eprintln!("coco: turn failed: {}", e);
            }
        }
    }
}
