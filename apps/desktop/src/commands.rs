use anyhow::{anyhow, bail, Context, Result};
use shared::{
    domain::{DrawMode, GroupNo, PlayerId},
    protocol::DrawAction,
};

pub const HELP: &str = "\
commands:
  start [duration_ms]            round-robin step
  target <group> [duration_ms]   step aimed at one group
  pick                           resolve the spin now
  assign <group>                 tentative group for the pick
  confirm [group]                commit the pick
  move <player> <group>          relocate a placed player
  undo                           revert the last confirmation
  auto on|off                    toggle auto-pick
  status | resync | help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Action(DrawAction),
    AutoPick(bool),
    Status,
    Resync,
    Help,
    Quit,
}

fn number<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<T> {
    let raw = arg.ok_or_else(|| anyhow!("missing {what}"))?;
    raw.parse()
        .map_err(|_| anyhow!("{what} must be a number, got {raw:?}"))
}

fn optional<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<Option<T>> {
    arg.map(|raw| number(Some(raw), what)).transpose()
}

fn start_step(mode: DrawMode, target_group_no: Option<GroupNo>, duration_ms: Option<u64>) -> DrawAction {
    DrawAction::StartStep {
        mode,
        target_group_no,
        duration_ms,
        pattern: None,
        tempo: None,
    }
}

/// Parses one console line. Blank lines are not commands.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let first = words.next();
    let second = words.next();
    if words.next().is_some() {
        bail!("too many arguments for {verb}");
    }

    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Action(start_step(
            DrawMode::RoundRobin,
            None,
            optional(first, "duration_ms")?,
        )),
        "target" => ConsoleCommand::Action(start_step(
            DrawMode::TargetGroup,
            Some(number(first, "group")?),
            optional(second, "duration_ms")?,
        )),
        "pick" => ConsoleCommand::Action(DrawAction::PickResult),
        "assign" => ConsoleCommand::Action(DrawAction::AssignUpdate {
            group_no: number(first, "group")?,
        }),
        "confirm" => ConsoleCommand::Action(DrawAction::AssignConfirm {
            group_no: optional(first, "group")?,
        }),
        "move" => ConsoleCommand::Action(DrawAction::MoveMember {
            player_id: PlayerId(number(first, "player")?),
            to_group_no: number(second, "group")?,
        }),
        "undo" => ConsoleCommand::Action(DrawAction::UndoLast),
        "auto" => match first.context("auto needs on or off")? {
            "on" => ConsoleCommand::AutoPick(true),
            "off" => ConsoleCommand::AutoPick(false),
            other => bail!("auto needs on or off, got {other:?}"),
        },
        "status" => ConsoleCommand::Status,
        "resync" => ConsoleCommand::Resync,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?}, try help"),
    };
    Ok(Some(command))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
