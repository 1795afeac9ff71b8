use std::{fmt::Write as _, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    build_reveal_path, build_scan_path,
    domain::SessionId,
    protocol::{DrawSnapshot, Tempo},
    replay, DrawState,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/draws.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Writes a session snapshot as JSON.
    Export {
        session_id: i64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Folds a snapshot file and prints the resulting groups.
    Replay { file: PathBuf },
    Scan {
        #[arg(long)]
        seed: u32,
        #[arg(long)]
        candidates: usize,
        #[arg(long, default_value_t = 3_600)]
        duration_ms: u64,
        #[arg(long)]
        base_hz: Option<f64>,
        #[arg(long)]
        slowdown_ms: Option<u64>,
    },
    Reveal {
        #[arg(long)]
        start: usize,
        #[arg(long)]
        winner: usize,
        #[arg(long)]
        candidates: usize,
        #[arg(long)]
        duration_ms: Option<u64>,
        #[arg(long)]
        near_miss: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Export { session_id, out } => {
            let storage = Storage::new(&cli.database_url).await?;
            let snapshot = storage
                .load_snapshot(SessionId(session_id))
                .await?
                .with_context(|| format!("session {session_id} not found"))?;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!(
                        "exported {} events to {}",
                        snapshot.events.len(),
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
        }
        Command::Replay { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let snapshot: DrawSnapshot = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a draw snapshot", file.display()))?;
            let state = replay(&snapshot.session, &snapshot.events);
            print!("{}", render_state(&state));
            if let Err(violation) = state.verify() {
                println!("invariant violated: {violation}");
            }
        }
        Command::Scan {
            seed,
            candidates,
            duration_ms,
            base_hz,
            slowdown_ms,
        } => {
            let tempo = Tempo {
                base_hz,
                slowdown_ms,
                near_miss: None,
            };
            let path = build_scan_path(seed, candidates, duration_ms, Some(&tempo));
            println!(
                "start={} ticks={} duration_ms={}",
                path.start_index,
                path.path.len(),
                path.duration_ms
            );
            print!("{}", render_timeline(&path.path, &path.timeline_ms));
        }
        Command::Reveal {
            start,
            winner,
            candidates,
            duration_ms,
            near_miss,
        } => {
            let path = build_reveal_path(start, winner, candidates, duration_ms, near_miss);
            println!(
                "start={} winner={} frames={} duration_ms={}",
                path.start_index,
                path.winner_index,
                path.path.len(),
                path.duration_ms
            );
            print!("{}", render_timeline(&path.path, &path.timeline_ms));
        }
    }

    Ok(())
}

fn render_state(state: &DrawState) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "session={} status={} step={} phase={:?}",
        state.session_id,
        state.status.as_str(),
        state.current_step,
        state.phase
    );
    if let Some(player_id) = state.current_pick_player_id {
        let _ = writeln!(out, "pick={player_id}");
    }
    for (group_no, members) in &state.groups {
        let ids: Vec<String> = members.iter().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "group {group_no} [{}/{}]: {}",
            members.len(),
            state.group_size,
            ids.join(", ")
        );
    }
    let _ = writeln!(out, "remaining: {}", state.remaining_player_ids.len());
    out
}

fn render_timeline(path: &[usize], timeline_ms: &[u64]) -> String {
    let mut out = String::new();
    for (index, at) in path.iter().zip(timeline_ms) {
        let _ = writeln!(out, "{at:>6}ms  {index}");
    }
    out
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
