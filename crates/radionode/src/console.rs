//! Line-oriented console
//!
//! Plain lines are broadcast as text messages; lines starting with `/` are
//! commands.

use meshradio_protocol::{MessageKind, NodeId};

const HELP: &str = "\
Commands:
  <text>              broadcast a text message
  /to <node> <text>   send a text message to one node
  /voice <text>       broadcast a voice note payload
  /peers              list connected peers
  /routes             show the routing table
  /stats              show mesh counters
  /help               show this help
  /quit               shut down";

pub fn help() -> &'static str {
    HELP
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Broadcast { payload: String, kind: MessageKind },
    SendTo { target: NodeId, payload: String },
    Peers,
    Routes,
    Stats,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ConsoleCommand::Broadcast {
            payload: line.to_string(),
            kind: MessageKind::Text,
        };
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match name {
        "to" => {
            let Some((target, payload)) = rest.split_once(char::is_whitespace) else {
                return ConsoleCommand::Invalid("usage: /to <node> <text>".to_string());
            };
            match NodeId::parse(target) {
                Ok(target) => ConsoleCommand::SendTo {
                    target,
                    payload: payload.trim().to_string(),
                },
                Err(e) => ConsoleCommand::Invalid(e.to_string()),
            }
        }
        "voice" if !rest.is_empty() => ConsoleCommand::Broadcast {
            payload: rest.to_string(),
            kind: MessageKind::Voice,
        },
        "voice" => ConsoleCommand::Invalid("usage: /voice <text>".to_string()),
        "peers" => ConsoleCommand::Peers,
        "routes" => ConsoleCommand::Routes,
        "stats" => ConsoleCommand::Stats,
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Invalid(format!("unknown command /{}", other)),
    }
}
