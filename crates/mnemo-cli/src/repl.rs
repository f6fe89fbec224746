//! REPL – Read-Eval-Print Loop of the mnemo shell.
//!
//! Lines starting with `/` are commands (see [`cmd_help`]); any other line
//! is treated as a conversation turn and answered with the memory context
//! that would be injected for it.

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

use crate::app::App;
use crate::commands::{self, Command};
use crate::config::{self, Config};
use crate::prompt_line;

/// Entry point for the interactive REPL.
///
/// Commands run to completion on `runtime`; `shutdown` is polled before
/// each prompt.
pub fn run(app: &App, runtime: &Runtime, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let prompt = format!("mnemo[{}]>", app.config().workspace_id);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", prompt.bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "✗".red(), e, "/help".bold());
                continue;
            }
        };

        match command {
            Command::Help => cmd_help(),
            Command::Settings => cmd_settings(app.config()),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            other => match runtime.block_on(app.execute(other)) {
                Ok(out) => println!("{}", out.trim_end()),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "mnemo Commands".bold().underline());
    println!("  {}  – store a memory", "/remember <fact|lesson|pattern|rule> <text>".bold().cyan());
    println!("      [--importance 0..1] [--level 0-3] [--impact N] [--category C] [--tags a,b]");
    println!("  {}  – ranked recall", "/recall <query> [--limit N] [--rerank] [--fresh]".bold().cyan());
    println!("  {}  – memories overdue for reinforcement", "/stale [N]".bold().cyan());
    println!("  {}  – mark memories as recalled", "/ack <id> …".bold().cyan());
    println!("  {}  – check keyword trigger rules", "/trigger <message>".bold().cyan());
    println!("  {}  – full per-turn context (also: any line without '/')", "/context <message>".bold().cyan());
    println!("  {}  – detect patterns and promote repeated lessons", "/patterns".bold().cyan());
    println!("  {}  – list promoted trading rules", "/rules".bold().cyan());
    println!("  {}  – control the extraction daemon", "/daemon start|stop|once|status".bold().cyan());
    println!("  {}  – retry queued remote writes", "/flush".bold().cyan());
    println!("  {}  – edit ~/.mnemo/config.toml", "/settings".bold().cyan());
    println!("  {}  – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_settings(current: &Config) {
    let mut cfg = match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => current.clone(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep a value)");
    cfg.workspace_id = prompt_line(&format!("  Workspace [{}]: ", cfg.workspace_id), &cfg.workspace_id);
    cfg.llm_url = prompt_line(&format!("  Model server URL [{}]: ", cfg.llm_url), &cfg.llm_url);
    cfg.model = prompt_line(&format!("  Chat model [{}]: ", cfg.model), &cfg.model);
    cfg.embedding_model = prompt_line(
        &format!("  Embedding model [{}]: ", cfg.embedding_model),
        &cfg.embedding_model,
    );
    cfg.sessions_dir = prompt_line(&format!("  Sessions directory [{}]: ", cfg.sessions_dir), &cfg.sessions_dir);
    let interval = prompt_line(
        &format!("  Daemon interval seconds [{}]: ", cfg.daemon_interval_secs),
        &cfg.daemon_interval_secs.to_string(),
    );
    match interval.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => cfg.daemon_interval_secs = secs,
        _ => println!("  {} keeping {} s", "Invalid interval;".yellow(), cfg.daemon_interval_secs),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Saved to {}. Restart mnemo to apply.",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}
