use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use client_core::{ClientEvent, DrawClient};
use shared::{
    domain::SessionId,
    frame::{Frame, FrameStage},
    DrawState,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

mod commands;

use commands::{parse_command, ConsoleCommand, HELP};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    session_id: i64,
    /// Submit the pick automatically when a spin runs out.
    #[arg(long)]
    auto_pick: bool,
    #[arg(long, default_value_t = 50)]
    frame_interval_ms: u64,
}

fn describe_frame(frame: &Frame) -> String {
    let stage = match frame.stage {
        FrameStage::Waiting => "waiting",
        FrameStage::Scanning => "scanning",
        FrameStage::Revealing => "revealing",
        FrameStage::Settled => "settled",
    };
    match (frame.candidate_index, frame.player_id) {
        (Some(index), Some(player_id)) => format!("[{stage}] #{index} player {player_id}"),
        (Some(index), None) => format!("[{stage}] #{index}"),
        _ => format!("[{stage}]"),
    }
}

fn print_status(state: &DrawState) {
    println!(
        "step {} phase {:?} status {} remaining {}",
        state.current_step,
        state.display_phase(Utc::now()),
        state.status.as_str(),
        state.remaining_player_ids.len()
    );
    if let Some(player_id) = state.current_pick_player_id {
        println!("  pick: player {player_id}");
    }
    for (group_no, members) in &state.groups {
        let ids: Vec<String> = members.iter().map(ToString::to_string).collect();
        println!("  group {group_no}: {}", ids.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let client = DrawClient::connect(args.server_url, SessionId(args.session_id)).await?;
    client.set_auto_pick(args.auto_pick).await;
    print_status(&client.state().await);
    println!("{HELP}");

    let mut events = client.subscribe_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.frame_interval_ms.max(10)));
    let mut last_frame: Option<Frame> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = client.frame_at(Utc::now()).await;
                if frame != last_frame {
                    if let Some(frame) = &frame {
                        println!("{}", describe_frame(frame));
                    }
                    last_frame = frame;
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::StateChanged { step, phase, .. }) => {
                    println!("-- step {step} is now {phase:?}");
                }
                Ok(ClientEvent::Resynced { events }) => println!("-- resynced ({events} events)"),
                Ok(ClientEvent::Error(message)) => warn!(%message, "client error"),
                Ok(ClientEvent::Disconnected) => {
                    println!("-- server stream closed");
                    break;
                }
                Ok(ClientEvent::Server(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console fell behind"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Action(action))) => {
                        if let Err(err) = client.submit(action).await {
                            println!("rejected: {err}");
                        }
                    }
                    Ok(Some(ConsoleCommand::AutoPick(enabled))) => {
                        client.set_auto_pick(enabled).await;
                        println!("auto-pick {}", if enabled { "on" } else { "off" });
                    }
                    Ok(Some(ConsoleCommand::Status)) => print_status(&client.state().await),
                    Ok(Some(ConsoleCommand::Resync)) => {
                        if let Err(err) = client.resync().await {
                            println!("resync failed: {err}");
                        }
                    }
                    Ok(Some(ConsoleCommand::Help)) => println!("{HELP}"),
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Err(err) => println!("{err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
    Ok(())
}
