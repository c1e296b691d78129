//! Interactive agent console
//!
//! Line-oriented front end over an [`AgentSession`]: reads commands from
//! stdin and prints connection and call updates as they are broadcast.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::agent::AgentSession;
use crate::calling::session::CallEvent;
use crate::calling::{Call, Direction};
use crate::config::Config;

const HELP: &str = "\
Commands:
  dial <number>          place a call
  answer | reject        handle a ringing inbound call
  hangup                 end or cancel the current call
  mute | hold            toggle mute / hold
  transfer <number>      blind transfer the active call
  dtmf <digits>          send DTMF digits
  ready                  go ready on all queues
  break <name> [id]      take a break
  offqueue               stop taking queue calls
  breaks                 list configured breaks
  status                 show connection, presence and call
  reconnect              reconnect signaling now
  quit                   log out and exit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Dial(String),
    Answer,
    Reject,
    Hangup,
    Mute,
    Hold,
    Transfer(String),
    Dtmf(String),
    Presence(String, Option<u32>),
    Breaks,
    Status,
    Reconnect,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let arg = |what: &str| {
        rest.first()
            .map(|s| s.to_string())
            .ok_or_else(|| format!("{} needs {}", verb, what))
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "dial" | "call" => Command::Dial(rest.join(" ")),
        "answer" => Command::Answer,
        "reject" => Command::Reject,
        "hangup" | "end" => Command::Hangup,
        "mute" => Command::Mute,
        "hold" => Command::Hold,
        "transfer" => Command::Transfer(arg("a target")?),
        "dtmf" => Command::Dtmf(arg("digits")?),
        "ready" => Command::Presence("Ready".into(), None),
        "offqueue" | "off-queue" => Command::Presence("Off-Queue".into(), None),
        "break" => {
            let name = arg("a break name")?;
            let id = match rest.get(1) {
                Some(id) => Some(id.parse().map_err(|_| format!("invalid break id {:?}", id))?),
                None => None,
            };
            Command::Presence(name, id)
        }
        "breaks" => Command::Breaks,
        "status" => Command::Status,
        "reconnect" => Command::Reconnect,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "logout" => Command::Quit,
        other => return Err(format!("unknown command {:?} (try 'help')", other)),
    };
    Ok(Some(command))
}

fn describe(call: &Call) -> String {
    let arrow = match call.direction {
        Direction::Inbound => "<-",
        Direction::Outbound => "->",
    };
    let mut line = format!("[{}] {} {}", call.status, arrow, call.display());
    if call.is_muted {
        line.push_str(" (muted)");
    }
    if call.is_held {
        line.push_str(" (on hold)");
    }
    if let Some(reason) = &call.end_reason {
        line.push_str(&format!(" - {}", reason));
    }
    line
}

/// Log in, run the console until `quit` or end of input, then log out.
pub async fn run(config: &Config) -> Result<()> {
    let agent = AgentSession::login(config).await?;

    agent.connection().status().subscribe(|state| {
        println!("* signaling {}", state);
    });
    agent.calls().session().events().subscribe(|event| match event {
        CallEvent::Updated(call) => println!("* {}", describe(call)),
        CallEvent::Cleared { call_id } => tracing::debug!("Call {} cleared", call_id),
    });

    agent.start().await;
    println!("{}", HELP);

    let mut lines = LinesStream::new(BufReader::new(stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => execute(&agent, command).await,
            Err(e) => println!("! {}", e),
        }
    }

    agent.logout().await;
    println!("Logged out.");
    Ok(())
}

async fn execute(agent: &Arc<AgentSession>, command: Command) {
    let calls = agent.calls();
    let outcome = match command {
        Command::Dial(target) => calls.dial(&target).await.map(|_| ()),
        Command::Answer => calls.answer().await.map(|_| ()),
        Command::Reject => calls.reject().await.map(|_| ()),
        Command::Hangup => calls.end().await.map(|_| ()),
        Command::Mute => calls.toggle_mute().map(|_| ()),
        Command::Hold => calls.toggle_hold().map(|_| ()),
        Command::Transfer(target) => calls.transfer(&target).await.map(|_| ()),
        Command::Dtmf(digits) => calls.send_dtmf(&digits).await,
        Command::Presence(name, id) => {
            match agent.set_presence(&name, id).await {
                Ok(report) => {
                    println!("Presence: {} ({} queue(s) synced)", report.status, report.synced.len());
                    for failure in &report.failures {
                        println!("! {}: {}", failure.queue, failure.error);
                    }
                }
                Err(e) => println!("! {}", e),
            }
            return;
        }
        Command::Breaks => {
            if agent.breaks().is_empty() {
                println!("No breaks configured.");
            }
            for b in agent.breaks() {
                println!("  {:>4}  {}", b.id, b.name);
            }
            return;
        }
        Command::Status => {
            println!("Signaling: {}", agent.connection().state());
            println!("Presence:  {}", agent.presence().presence().status);
            match calls.status() {
                Some(call) => println!("Call:      {}", describe(&call)),
                None => println!("Call:      none"),
            }
            return;
        }
        Command::Reconnect => {
            if let Err(e) = agent.connection().reconnect_now().await {
                println!("! reconnect failed: {}", e);
            }
            return;
        }
        Command::Help => {
            println!("{}", HELP);
            return;
        }
        Command::Quit => return,
    };
    if let Err(e) = outcome {
        println!("! {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("   "), Ok(None));
        assert_eq!(
            parse_command("dial +1 555 0100"),
            Ok(Some(Command::Dial("+1 555 0100".into())))
        );
        assert_eq!(
            parse_command("break Lunch 3"),
            Ok(Some(Command::Presence("Lunch".into(), Some(3))))
        );
        assert_eq!(
            parse_command("OFFQUEUE"),
            Ok(Some(Command::Presence("Off-Queue".into(), None)))
        );
        assert_eq!(parse_command("quit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(parse_command("transfer").is_err());
        assert!(parse_command("break Lunch x").is_err());
        assert!(parse_command("fly").is_err());
    }
}
