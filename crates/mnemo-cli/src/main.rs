//! `mnemo-cli` – interactive shell for the mnemo memory engine.
//!
//! This binary:
//!
//! 1. Checks for `~/.mnemo/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Probes the configured model server and reports the models it serves.
//! 3. Opens the memory store, assembles the engine and warms the recall
//!    cache.
//! 4. Drops the user into a REPL with slash-commands (`/remember`,
//!    `/recall`, `/context`, `/daemon` …, see `/help`).
//! 5. Intercepts **Ctrl-C** to stop the memory daemon before exiting.

mod app;
mod commands;
mod config;
mod probe;
mod repl;
mod sessions;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::app::App;

fn main() {
    // RUST_LOG filters, MNEMO_LOG_FORMAT=json switches to JSON lines and
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.  User-facing output
    // stays on println!.
    let _telemetry = mnemo_engine::init_tracing("mnemo");

    print_banner();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            return;
        }
    };

    // ── Configuration / First-Run Wizard ──────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Model server discovery ────────────────────────────────────────────
    print!("\n  Probing model server at {} … ", cfg.llm_url.dimmed());
    match probe::fetch_models(&cfg.llm_url) {
        Ok(models) => {
            println!("{} ({} model(s) served)", "online".green(), models.len());
            for m in &models {
                println!("    • {}", m.id.bold());
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}",
                "Recall falls back to lexical similarity; extraction and reranking are unavailable.".dimmed()
            );
        }
    }

    // ── Engine ────────────────────────────────────────────────────────────
    let app = match App::open(cfg) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            println!("{}: {}", "Failed to open memory store".red(), e);
            return;
        }
    };
    let warmed = runtime.block_on(app.warm_up());
    println!(
        "  Workspace {} ready ({} warm-up quer{} cached).",
        app.config().workspace_id.bold(),
        warmed,
        if warmed == 1 { "y" } else { "ies" }
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let app_for_ctrlc = Arc::clone(&app);
    let handle = runtime.handle().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        if handle.block_on(app_for_ctrlc.shutdown()) {
            println!("{}", "  ✓ Memory daemon stopped.".green());
        }
        println!("{}", "  ✓ Exiting mnemo.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the daemon will not be stopped on Ctrl-C");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&app, &runtime, shutdown);
    runtime.block_on(app.shutdown());
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        mnemo First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up mnemo.\n");

    let mut cfg = config::load_or_default().unwrap_or_default();

    cfg.workspace_id = prompt_line(&format!("  Workspace [{}]: ", cfg.workspace_id), &cfg.workspace_id);
    cfg.llm_url = prompt_line(
        &format!("  OpenAI-compatible model server [{}]: ", cfg.llm_url),
        &cfg.llm_url,
    );
    cfg.model = prompt_line(&format!("  Chat model [{}]: ", cfg.model), &cfg.model);

    println!("  Mirror memories to a remote database?");
    println!("    Enter a PostgREST URL, or press Enter to stay local-only.");
    cfg.remote_url = prompt_line("  Remote URL []: ", "");
    if !cfg.remote_url.is_empty() {
        cfg.remote_api_key = prompt_line("  Remote API key []: ", "");
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____ ___  ____  ___  ____ ___  ____ "#.bold().cyan());
    println!("{}", r#"  / __ `__ \/ __ \/ _ \/ __ `__ \/ __ \"#.bold().cyan());
    println!("{}", r#" / / / / / / / / /  __/ / / / / / /_/ /"#.bold().cyan());
    println!("{}", r#"/_/ /_/ /_/_/ /_/\___/_/ /_/ /_/\____/ "#.bold().cyan());
    println!();
    println!("  {} {}", "mnemo".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Memory & recall for trading agents");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
