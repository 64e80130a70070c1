//! `svcs-cli` – SpatialVCS Command Line Interface
//!
//! This binary is the operator's entry point to the fusion engine.  It:
//!
//! 1. Loads `~/.spatialvcs/config.toml`, writing the defaults on first run.
//! 2. Opens the persisted semantic index and wires the engine to the replay
//!    collaborators.
//! 3. Either replays a capture and exits (`svcs replay <capture.jsonl>`) or
//!    drops the user into an **interactive REPL** with slash-commands.
//! 4. Intercepts **Ctrl-C** to publish a shutdown alert, save the index and
//!    exit.

mod config;
mod repl;
mod replay;

use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use svcs_memory::{HashingEmbedder, SemanticIndex};
use svcs_middleware::{EventBus, Topic};
use svcs_runtime::FusionEngine;
use svcs_types::EventPayload;

use crate::replay::{ReplayDeck, ReplayDescriber, ReplayDetector};

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"); SVCS_LOG_FORMAT=json switches to
    // JSON lines; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _telemetry = svcs_runtime::init_tracing("svcs-cli");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Engine ────────────────────────────────────────────────────────────
    let index = Arc::new(SemanticIndex::open(
        &cfg.index_path,
        Some(Arc::new(HashingEmbedder::default())),
    ));
    match index.unavailable_reason() {
        None => println!(
            "  Semantic index {} ({} observation(s))",
            "ready".green(),
            index.len()
        ),
        Some(reason) => println!(
            "  Semantic index {} – {}",
            "unavailable".red(),
            reason.dimmed()
        ),
    }

    let deck = ReplayDeck::default();
    let bus = EventBus::new(cfg.bus_capacity);
    let engine = match FusionEngine::new(
        cfg.engine.clone(),
        Arc::new(ReplayDetector::new(deck.clone())),
        index,
        bus,
    ) {
        Ok(engine) => Arc::new(engine.with_describer(Arc::new(ReplayDescriber::new(deck.clone())))),
        Err(e) => {
            error!(error = %e, "engine configuration rejected");
            println!("{}: {}", "Engine error".red(), e);
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let engine_ctrlc = engine.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());

        engine_ctrlc.publish(
            Topic::SystemAlerts,
            "svcs-cli",
            EventPayload::SystemAlert {
                component: "cli".to_string(),
                message: "SHUTDOWN: operator Ctrl-C".to_string(),
            },
        );
        match engine_ctrlc.save_index() {
            Ok(()) => println!("{}", "  ✓ Semantic index saved.".green()),
            Err(e) => println!("  {}: {}", "Index not saved".red(), e),
        }
        println!("{}", "  ✓ Exiting SpatialVCS.".green());

        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the index will not be saved on Ctrl-C");
    }

    // ── One-shot replay ───────────────────────────────────────────────────
    if let Some(capture) = replay_argument(std::env::args().skip(1)) {
        run_replay(&engine, &deck, &rt, &capture);
        return;
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(engine, deck, &rt, shutdown);
}

/// The capture path of `svcs replay <capture.jsonl>`, if given.
fn replay_argument(mut args: impl Iterator<Item = String>) -> Option<PathBuf> {
    match (args.next().as_deref(), args.next()) {
        (Some("replay"), Some(path)) => Some(PathBuf::from(path)),
        _ => None,
    }
}

fn run_replay(engine: &Arc<FusionEngine>, deck: &ReplayDeck, rt: &tokio::runtime::Runtime, capture: &Path) {
    println!("  Replaying {} …", capture.display().to_string().bold());
    match rt.block_on(replay::replay_file(engine, deck, capture)) {
        Ok(report) => {
            println!(
                "  {} {} frame(s) from {} probe(s); {} failed, {} line(s) skipped.",
                "✓".green().bold(),
                report.frames,
                report.probes,
                report.failed,
                report.skipped_lines
            );
            if let Err(e) = engine.save_index() {
                println!("  {}: {}", "Index not saved".red(), e);
            }
        }
        Err(e) => {
            println!("{}: {}", "Replay failed".red(), e);
            std::process::exit(1);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____            __  _       ___    ___________"#.bold().cyan());
    println!("{}", r#"  / ___/____  ___ _/ /_(_)__ _ | | /| / / ___/ __/"#.bold().cyan());
    println!("{}", r#" _\ \/ __ \/ _ `/ __/ / _ `/ | |/ |/ / /___\ \  "#.bold().cyan());
    println!("{}", r#"/___/ .__/\_,_/\__/_/\_,_/  |__/|__/\___/___/  "#.bold().cyan());
    println!("{}", r#"   /_/                                          "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "SpatialVCS".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Spatial Object Fusion & Tracking Engine");
    println!();
}
