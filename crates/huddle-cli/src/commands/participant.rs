use std::sync::Arc;
use std::time::Duration;

use huddle_config::HuddleConfig;
use huddle_core::{HuddleError, Severity};
use huddle_mesh::{Participant, ParticipantSettings, StoreScope, TcpTransport};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// How long `ask` waits for an answer.
const ASK_TIMEOUT: Duration = Duration::from_secs(10);

const HELP: &str = "\
Commands:
  send <peer> <json>         send an application payload
  set [status] <key> <json>  write to the shared data (or status) store
  del [status] <key>         delete from a store
  get [status] <key>         read from a store
  peer <name> <key>          read a peer's replicated data value
  keys [status]              list store keys
  ask <peer> <name> [json]   call a peer's request handler
  log <id> <severity> <msg>  relay a log record to the coordinator
  logid <id>                 relay a record from the log catalog
  peers                      list linked peers
  help                       show this text
  quit                       leave the mesh";

/// One line typed at the participant prompt.
#[derive(Debug, Clone, PartialEq)]
enum Line {
    Send { peer: String, payload: Value },
    Set { scope: StoreScope, key: String, value: Value },
    Del { scope: StoreScope, key: String },
    Get { scope: StoreScope, key: String },
    Peer { name: String, key: String },
    Keys { scope: StoreScope },
    Ask {
        peer: String,
        name: String,
        data: Value,
    },
    Log {
        id: String,
        severity: Severity,
        message: String,
    },
    LogId { id: String },
    Peers,
    Help,
    Quit,
    Empty,
}

/// Split an optional leading `status`/`data` scope word off `rest`.
fn scoped(rest: &str) -> (StoreScope, &str) {
    let rest = rest.trim_start();
    match rest.split_once(char::is_whitespace) {
        Some(("status", tail)) => (StoreScope::Status, tail.trim_start()),
        Some(("data", tail)) => (StoreScope::Data, tail.trim_start()),
        _ if rest == "status" => (StoreScope::Status, ""),
        _ if rest == "data" => (StoreScope::Data, ""),
        _ => (StoreScope::Data, rest),
    }
}

/// Parse a JSON value, treating anything that is not valid JSON as a string.
fn value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn two<'a>(rest: &'a str, usage: &str) -> Result<(&'a str, &'a str), String> {
    rest.trim()
        .split_once(char::is_whitespace)
        .map(|(a, b)| (a, b.trim()))
        .filter(|(_, b)| !b.is_empty())
        .ok_or_else(|| format!("usage: {usage}"))
}

fn one<'a>(rest: &'a str, usage: &str) -> Result<&'a str, String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        Err(format!("usage: {usage}"))
    } else {
        Ok(rest)
    }
}

fn parse_line(line: &str) -> Result<Line, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Empty);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match word {
        "send" => {
            let (peer, payload) = two(rest, "send <peer> <json>")?;
            Ok(Line::Send {
                peer: peer.to_string(),
                payload: value(payload),
            })
        }
        "set" => {
            let (scope, rest) = scoped(rest);
            let (key, raw) = two(rest, "set [status] <key> <json>")?;
            Ok(Line::Set {
                scope,
                key: key.to_string(),
                value: value(raw),
            })
        }
        "del" => {
            let (scope, rest) = scoped(rest);
            let key = one(rest, "del [status] <key>")?;
            Ok(Line::Del {
                scope,
                key: key.to_string(),
            })
        }
        "get" => {
            let (scope, rest) = scoped(rest);
            let key = one(rest, "get [status] <key>")?;
            Ok(Line::Get {
                scope,
                key: key.to_string(),
            })
        }
        "peer" => {
            let (name, key) = two(rest, "peer <name> <key>")?;
            Ok(Line::Peer {
                name: name.to_string(),
                key: key.to_string(),
            })
        }
        "keys" => Ok(Line::Keys {
            scope: scoped(rest).0,
        }),
        "ask" => {
            let usage = "ask <peer> <name> [json]";
            let (peer, rest) = two(rest, usage)?;
            let (name, data) = match rest.split_once(char::is_whitespace) {
                Some((name, raw)) => (name, value(raw.trim())),
                None => (rest, Value::Null),
            };
            Ok(Line::Ask {
                peer: peer.to_string(),
                name: name.to_string(),
                data,
            })
        }
        "log" => {
            let usage = "log <id> <severity> <message>";
            let (id, rest) = two(rest, usage)?;
            let (severity, message) = two(rest, usage)?;
            Ok(Line::Log {
                id: id.to_string(),
                severity: severity.parse()?,
                message: message.to_string(),
            })
        }
        "logid" => Ok(Line::LogId {
            id: one(rest, "logid <id>")?.to_string(),
        }),
        "peers" => Ok(Line::Peers),
        "help" | "?" => Ok(Line::Help),
        "quit" | "exit" => Ok(Line::Quit),
        other => Err(format!("unknown command '{other}', try 'help'")),
    }
}

/// Run one parsed line. Returns false when the user asked to quit.
async fn execute(participant: &Participant, line: Line) -> bool {
    match line {
        Line::Send { peer, payload } => match participant.send(&peer, payload).await {
            Ok(()) => println!("sent to {peer}"),
            Err(e) => println!("send failed: {e}"),
        },
        Line::Set { scope, key, value } => {
            participant.write(scope, key, value).await;
        }
        Line::Del { scope, key } => {
            if !participant.delete(scope, &key).await {
                println!("{scope}/{key} was not set");
            }
        }
        Line::Get { scope, key } => match participant.read(scope, &key) {
            Ok(v) => println!("{v}"),
            Err(e) => println!("{e}"),
        },
        Line::Peer { name, key } => match participant.peer_value(&name, StoreScope::Data, &key) {
            Some(v) => println!("{v}"),
            None => println!("{name} has not shared '{key}'"),
        },
        Line::Keys { scope } => {
            for key in participant.store(scope).enumerate() {
                println!("{key}");
            }
        }
        Line::Ask { peer, name, data } => {
            match participant.request(&peer, &name, data, ASK_TIMEOUT).await {
                Ok(v) => println!("{v}"),
                Err(e) => println!("ask failed: {e}"),
            }
        }
        Line::Log {
            id,
            severity,
            message,
        } => {
            let outcome = participant.log(id, severity, message).await;
            println!("{outcome:?}");
        }
        Line::LogId { id } => {
            let outcome = participant.log_id(&id).await;
            println!("{outcome:?}");
        }
        Line::Peers => {
            let peers = participant.peers();
            if peers.is_empty() {
                println!("no linked peers");
            }
            for peer in peers {
                println!("{peer}");
            }
        }
        Line::Help => println!("{HELP}"),
        Line::Quit => return false,
        Line::Empty => {}
    }
    true
}

pub(super) async fn cmd_participant(
    config: HuddleConfig,
    name: Option<String>,
    segment: Option<String>,
) -> huddle_core::Result<()> {
    let mut settings = ParticipantSettings::from_config(&config);
    if let Some(name) = name {
        settings.name = name;
    }
    if let Some(segment) = segment {
        settings.segment = segment;
    }
    if settings.name.is_empty() {
        return Err(HuddleError::Config(
            "participant name is required (--name, HUDDLE_NAME or participant.name)".into(),
        ));
    }

    let credential = config.participant.credential.clone();
    let participant = Participant::start(
        settings.clone(),
        TcpTransport::new(settings.name.clone(), credential.clone()).into(),
        TcpTransport::new(settings.name.clone(), credential).into(),
    )
    .await?;

    println!(
        "Participant '{}' listening on {}:{} (segment {})",
        participant.name(),
        settings.local_address,
        participant.listen_port(),
        settings.segment
    );
    println!(
        "Coordinator at {}:{}. Type 'help' for commands.",
        settings.coordinator_address, settings.coordinator_port
    );

    // Peers can read our status store with `ask <us> status`.
    let status_of = Arc::downgrade(&participant);
    participant.register_handler("status", move |_from: &str, _data: Value| {
        status_of
            .upgrade()
            .map(|p| Value::Object(p.status().entries().into_iter().collect()))
            .unwrap_or(Value::Null)
    });

    let inbox = Arc::clone(&participant);
    let printer = tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            println!("<{}> {}", msg.from, msg.payload);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_line(&line) {
                    Ok(parsed) => {
                        if !execute(&participant, parsed).await {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                },
                // Keep running headless until Ctrl-C.
                None => stdin_open = false,
            },
        }
    }

    info!("leaving the mesh");
    printer.abort();
    participant.shutdown().await;
    Ok(())
}
