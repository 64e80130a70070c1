//! REPL – Read-Eval-Print Loop for the SpatialVCS interactive shell.
//!
//! Supported slash-commands:
//!   /help                                  – show this list
//!   /status                                – engine and search availability
//!   /scans                                 – list every scan
//!   /scan <id>                             – objects and history of one scan
//!   /replay <file>                         – feed a JSON-lines capture through the engine
//!   /prompt                                – prompt and schemas for recording captures
//!   /stop <id>                             – mark a scan completed
//!   /diff <before> <after> [threshold]     – compare two scans
//!   /search <query> [--scan <id>] [--k N]  – semantic search over observations
//!   /save                                  – persist the semantic index
//!   /reset                                 – drop every scan and observation
//!   /quit | /exit                          – save and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

use svcs_runtime::{FusionEngine, ProbeSession};
use svcs_types::DiffEventKind;

use crate::replay::{self, ReplayDeck};

const DEFAULT_K: usize = 5;

/// One parsed REPL command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Scans,
    Scan(String),
    Replay(PathBuf),
    Prompt,
    Stop(String),
    Diff {
        before: String,
        after: String,
        threshold: Option<f64>,
    },
    Search {
        query: String,
        scan: Option<String>,
        k: usize,
    },
    Save,
    Reset,
    Quit,
}

/// Parse one input line.  `Err` carries a usage message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".into());
    };
    let args: Vec<&str> = words.collect();

    let one = |usage: &str| -> Result<String, String> {
        match args.as_slice() {
            [id] => Ok(id.to_string()),
            _ => Err(format!("usage: {usage}")),
        }
    };

    match head {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/scans" => Ok(Command::Scans),
        "/scan" => one("/scan <id>").map(Command::Scan),
        "/replay" => one("/replay <file>").map(|p| Command::Replay(PathBuf::from(p))),
        "/prompt" => Ok(Command::Prompt),
        "/stop" => one("/stop <id>").map(Command::Stop),
        "/diff" => match args.as_slice() {
            [before, after] => Ok(Command::Diff {
                before: before.to_string(),
                after: after.to_string(),
                threshold: None,
            }),
            [before, after, t] => {
                let threshold = t
                    .parse::<f64>()
                    .map_err(|_| format!("'{t}' is not a number"))?;
                Ok(Command::Diff {
                    before: before.to_string(),
                    after: after.to_string(),
                    threshold: Some(threshold),
                })
            }
            _ => Err("usage: /diff <before> <after> [threshold]".into()),
        },
        "/search" => parse_search(&args),
        "/save" => Ok(Command::Save),
        "/reset" => Ok(Command::Reset),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_search(args: &[&str]) -> Result<Command, String> {
    let usage = || "usage: /search <query> [--scan <id>] [--k N]".to_string();
    let mut query = Vec::new();
    let mut scan = None;
    let mut k = DEFAULT_K;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match *arg {
            "--scan" => scan = Some(it.next().ok_or_else(usage)?.to_string()),
            "--k" => {
                let raw = it.next().ok_or_else(usage)?;
                k = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|&k| k > 0)
                    .ok_or_else(|| format!("'{raw}' is not a positive integer"))?;
            }
            word => query.push(word),
        }
    }
    if query.is_empty() {
        return Err(usage());
    }
    Ok(Command::Search {
        query: query.join(" "),
        scan,
        k,
    })
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(engine: Arc<FusionEngine>, deck: ReplayDeck, rt: &Runtime, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let operator = engine.session("svcs-cli");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline(&format!("{} ", "svcs>".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        let cmd = match parse_command(line) {
            Ok(cmd) => cmd,
            Err(msg) => {
                println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    msg.yellow(),
                    "/help".bold()
                );
                continue;
            }
        };

        match cmd {
            Command::Help => cmd_help(),
            Command::Status => cmd_status(&engine),
            Command::Scans => cmd_scans(&engine),
            Command::Scan(id) => cmd_scan(&engine, &id),
            Command::Replay(path) => cmd_replay(&engine, &deck, rt, &path),
            Command::Prompt => match replay::recording_instructions() {
                Ok(text) => println!("{text}"),
                Err(e) => println!("{} {}", "Error:".red(), e),
            },
            Command::Stop(id) => cmd_stop(&operator, &id),
            Command::Diff {
                before,
                after,
                threshold,
            } => cmd_diff(&engine, &before, &after, threshold),
            Command::Search { query, scan, k } => cmd_search(&engine, &query, scan.as_deref(), k),
            Command::Save => cmd_save(&engine),
            Command::Reset => {
                let report = engine.reset();
                println!(
                    "{} {} scan(s) and {} observation(s) cleared.",
                    "✓".green(),
                    report.scans,
                    report.observations
                );
            }
            Command::Quit => {
                cmd_save(&engine);
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    operator.disconnect();
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "SpatialVCS Commands".bold().underline());
    println!("  {}                                 – engine and search availability", "/status".bold().cyan());
    println!("  {}                                  – list every scan", "/scans".bold().cyan());
    println!("  {}                              – objects and history of one scan", "/scan <id>".bold().cyan());
    println!("  {}                          – replay a JSON-lines capture", "/replay <file>".bold().cyan());
    println!("  {}                                 – prompt and schemas for recording captures", "/prompt".bold().cyan());
    println!("  {}                              – mark a scan completed", "/stop <id>".bold().cyan());
    println!("  {}      – compare two scans", "/diff <before> <after> [threshold]".bold().cyan());
    println!("  {} – semantic search", "/search <query> [--scan <id>] [--k N]".bold().cyan());
    println!("  {}                                   – persist the semantic index", "/save".bold().cyan());
    println!("  {}                                  – drop every scan and observation", "/reset".bold().cyan());
    println!("  {}                           – save and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(engine: &FusionEngine) {
    let status = engine.status();
    println!("{}", "Engine Status".bold().underline());
    println!("  Detector        : {}", status.detector.yellow());
    println!(
        "  Describer       : {}",
        if status.describer_configured { "configured".green() } else { "none".dimmed() }
    );
    println!("  Describe mode   : {:?}", status.describe_mode);
    match &status.search_unavailable_reason {
        None => println!(
            "  Semantic search : {} ({} observation(s))",
            "ready".green(),
            status.indexed_observations
        ),
        Some(reason) => println!("  Semantic search : {} – {}", "unavailable".red(), reason.dimmed()),
    }
    println!("  Scans           : {}", status.scans);
    println!("  Frame observers : {}", status.detection_observers);
}

fn cmd_scans(engine: &FusionEngine) {
    let scans = engine.list_scans();
    if scans.is_empty() {
        println!("  {}", "No scans yet.".dimmed());
        return;
    }
    println!(
        "  {:<24} {:<10} {:>7} {:>8}  {}",
        "SCAN".bold(),
        "STATUS".bold(),
        "FRAMES".bold(),
        "OBJECTS".bold(),
        "LAST FRAME".bold()
    );
    for s in scans {
        println!(
            "  {:<24} {:<10} {:>7} {:>8}  {}",
            s.scan_id,
            format!("{:?}", s.status).to_lowercase(),
            s.frame_count,
            s.object_count,
            s.last_frame.dimmed()
        );
    }
}

fn cmd_scan(engine: &FusionEngine, id: &str) {
    let record = match engine.scan(id) {
        Ok(r) => r,
        Err(e) => {
            println!("{} {}", "Error:".red(), e);
            return;
        }
    };
    println!(
        "{} {} ({} frame(s), {} detection(s))",
        "Scan".bold().underline(),
        record.scan_id.bold(),
        record.frame_count,
        record.detections.len()
    );
    if record.objects.is_empty() {
        println!("  {}", "No semantic observations.".dimmed());
    }
    for obj in &record.objects {
        let p = obj.position_3d;
        println!(
            "  • {} at ({:.2}, {:.2}, {:.2}) {}",
            obj.name.bold(),
            p.x,
            p.y,
            p.z,
            obj.details.dimmed()
        );
    }
}

fn cmd_replay(engine: &Arc<FusionEngine>, deck: &ReplayDeck, rt: &Runtime, path: &std::path::Path) {
    match rt.block_on(replay::replay_file(engine, deck, path)) {
        Ok(report) => println!(
            "{} {} frame(s) replayed ({} failed, {} line(s) skipped, {} described, {} scan(s) completed).",
            "✓".green(),
            report.frames,
            report.failed,
            report.skipped_lines,
            report.described,
            report.scans_completed
        ),
        Err(e) => println!("{} {}", "Error:".red(), e),
    }
}

fn cmd_stop(operator: &ProbeSession, id: &str) {
    match operator.stop_scan(id) {
        Ok(s) => println!("{} Scan {} completed ({} frame(s)).", "✓".green(), s.scan_id.bold(), s.frame_count),
        Err(e) => println!("{} {}", "Error:".red(), e),
    }
}

fn cmd_diff(engine: &FusionEngine, before: &str, after: &str, threshold: Option<f64>) {
    let diff = match engine.diff(before, after, threshold) {
        Ok(d) => d,
        Err(e) => {
            println!("{} {}", "Error:".red(), e);
            return;
        }
    };
    println!("  {}", diff.summary.bold());
    for ev in &diff.events {
        let kind = match ev.kind {
            DiffEventKind::Move => ev.kind.to_string().yellow(),
            DiffEventKind::Added => ev.kind.to_string().green(),
            DiffEventKind::Removed => ev.kind.to_string().red(),
        };
        let distance = ev
            .distance
            .map(|d| format!(" {d:.4} m"))
            .unwrap_or_default();
        println!("  {:<8} {}{}", kind, ev.label, distance.dimmed());
    }
}

fn cmd_search(engine: &FusionEngine, query: &str, scan: Option<&str>, k: usize) {
    let hits = match engine.search(query, k, scan) {
        Ok(h) => h,
        Err(e) => {
            println!("{} {}", "Error:".red(), e);
            return;
        }
    };
    if hits.is_empty() {
        if engine.index().is_ready() {
            println!("  {}", "No matches.".dimmed());
        } else {
            println!("  {}", "Semantic search is unavailable.".yellow());
        }
        return;
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "  {}. [{:.3}] {} {}",
            rank + 1,
            hit.score,
            hit.description.bold(),
            format!("({} / {})", hit.metadata.scan_id, hit.metadata.frame_path).dimmed()
        );
    }
}

fn cmd_save(engine: &FusionEngine) {
    match engine.save_index() {
        Ok(()) => println!("{} Semantic index saved.", "✓".green()),
        Err(e) => println!("{} {}", "Error saving index:".red(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("  /scans "), Ok(Command::Scans));
        assert_eq!(parse_command("/exit"), Ok(Command::Quit));
        assert_eq!(parse_command("/prompt"), Ok(Command::Prompt));
        assert_eq!(parse_command("/scan kitchen"), Ok(Command::Scan("kitchen".into())));
        assert_eq!(
            parse_command("/replay data/walk.jsonl"),
            Ok(Command::Replay(PathBuf::from("data/walk.jsonl")))
        );
    }

    #[test]
    fn scan_requires_exactly_one_id() {
        assert!(parse_command("/scan").is_err());
        assert!(parse_command("/stop a b").is_err());
    }

    #[test]
    fn diff_threshold_is_optional() {
        assert_eq!(
            parse_command("/diff monday tuesday"),
            Ok(Command::Diff {
                before: "monday".into(),
                after: "tuesday".into(),
                threshold: None
            })
        );
        assert_eq!(
            parse_command("/diff monday tuesday 0.25"),
            Ok(Command::Diff {
                before: "monday".into(),
                after: "tuesday".into(),
                threshold: Some(0.25)
            })
        );
        assert!(parse_command("/diff monday tuesday far").is_err());
    }

    #[test]
    fn search_flags_anywhere() {
        assert_eq!(
            parse_command("/search --k 3 red mug --scan kitchen"),
            Ok(Command::Search {
                query: "red mug".into(),
                scan: Some("kitchen".into()),
                k: 3
            })
        );
        assert_eq!(
            parse_command("/search keys"),
            Ok(Command::Search {
                query: "keys".into(),
                scan: None,
                k: DEFAULT_K
            })
        );
    }

    #[test]
    fn search_rejects_bad_flags() {
        assert!(parse_command("/search").is_err());
        assert!(parse_command("/search mug --k 0").is_err());
        assert!(parse_command("/search mug --scan").is_err());
    }

    #[test]
    fn unknown_command_reported() {
        let err = parse_command("/launch").unwrap_err();
        assert!(err.contains("/launch"));
    }
}
