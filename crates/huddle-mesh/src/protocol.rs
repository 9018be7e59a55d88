use std::collections::BTreeMap;

use huddle_core::{ConnectionDirective, CredentialTable, HuddleError, LogRecord, ParticipantProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which of a participant's two merged stores a replication command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreScope {
    /// Long-lived shared data.
    Data,
    /// Ephemeral status values.
    Status,
}

impl std::fmt::Display for StoreScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreScope::Data => f.write_str("data"),
            StoreScope::Status => f.write_str("status"),
        }
    }
}

/// System commands exchanged between participants and the coordinator, and
/// between linked participants for store replication.
///
/// Serialized with a `cmd` tag, e.g. `{"cmd": "credential_table_request"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Participant → coordinator: current reachability profile.
    PresenceAnnounce(ParticipantProfile),
    /// Participant → coordinator.
    CredentialTableRequest,
    /// Coordinator → participant.
    CredentialTableResponse { table: CredentialTable },
    /// Coordinator → initiating participant.
    ConnectDirective(ConnectionDirective),
    /// Participant → coordinator.
    LogRecord(LogRecord),
    /// Participant → peers: one key written.
    ShareUpdate {
        scope: StoreScope,
        key: String,
        value: Value,
    },
    /// Participant → peers: one key deleted.
    ShareDelete { scope: StoreScope, key: String },
    /// Participant → peers: full contents, replacing the peer's replica.
    ShareFlush {
        scope: StoreScope,
        entries: BTreeMap<String, Value>,
    },
    /// Participant → peer: call the handler registered under `name`.
    Request { id: u64, name: String, data: Value },
    /// Peer → participant: answer to request `id`. `handled` is false when
    /// the peer has no handler under the requested name.
    Response {
        id: u64,
        handled: bool,
        result: Value,
    },
}

/// Every tag `Command` accepts on the wire.
pub const COMMAND_TAGS: &[&str] = &[
    "presence_announce",
    "credential_table_request",
    "credential_table_response",
    "connect_directive",
    "log_record",
    "share_update",
    "share_delete",
    "share_flush",
    "request",
    "response",
];

impl Command {
    /// Wire tag of this command, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::PresenceAnnounce(_) => "presence_announce",
            Command::CredentialTableRequest => "credential_table_request",
            Command::CredentialTableResponse { .. } => "credential_table_response",
            Command::ConnectDirective(_) => "connect_directive",
            Command::LogRecord(_) => "log_record",
            Command::ShareUpdate { .. } => "share_update",
            Command::ShareDelete { .. } => "share_delete",
            Command::ShareFlush { .. } => "share_flush",
            Command::Request { .. } => "request",
            Command::Response { .. } => "response",
        }
    }
}

/// One message on a transport link: either a system command or an opaque
/// application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Command(Command),
    Data(Value),
}

impl Frame {
    pub fn encode(&self) -> huddle_core::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a frame, distinguishing a missing/invalid `cmd` tag
    /// (`MalformedMessage`) from a well-formed but unrecognized one
    /// (`UnknownCommand`).
    pub fn decode(bytes: &[u8]) -> huddle_core::Result<Frame> {
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| HuddleError::MalformedMessage(format!("not json: {e}")))?;
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| HuddleError::MalformedMessage("missing frame kind".into()))?;

        match kind {
            "data" => Ok(Frame::Data(raw.get("body").cloned().unwrap_or(Value::Null))),
            "command" => {
                let body = raw
                    .get("body")
                    .ok_or_else(|| HuddleError::MalformedMessage("command without body".into()))?;
                let tag = body
                    .get("cmd")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HuddleError::MalformedMessage("command without cmd tag".into()))?;
                if !COMMAND_TAGS.contains(&tag) {
                    return Err(HuddleError::UnknownCommand(tag.to_string()));
                }
                let command = serde_json::from_value::<Command>(body.clone())
                    .map_err(|e| HuddleError::MalformedMessage(format!("{tag}: {e}")))?;
                Ok(Frame::Command(command))
            }
            other => Err(HuddleError::MalformedMessage(format!(
                "unknown frame kind '{other}'"
            ))),
        }
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::Command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::Severity;
    use serde_json::json;

    #[test]
    fn presence_announce_carries_profile_fields() {
        let profile = huddle_core::ParticipantProfile::new("A", "10.0.0.1", 4000, "k")
            .with_public_address("1.2.3.4")
            .with_segment("X");
        let bytes = Frame::from(Command::PresenceAnnounce(profile.clone()))
            .encode()
            .unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["body"]["cmd"], "presence_announce");
        assert_eq!(raw["body"]["segment_id"], "X");
        assert_eq!(raw["body"]["is_public"], true);

        match Frame::decode(&bytes).unwrap() {
            Frame::Command(Command::PresenceAnnounce(p)) => assert_eq!(p, profile),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unit_command_decodes() {
        let bytes = br#"{"kind":"command","body":{"cmd":"credential_table_request"}}"#;
        assert_eq!(
            Frame::decode(bytes).unwrap(),
            Frame::Command(Command::CredentialTableRequest)
        );
    }

    #[test]
    fn log_record_decodes() {
        let rec = huddle_core::LogRecord::now("7", Severity::Warn, "slow");
        let bytes = Frame::from(Command::LogRecord(rec.clone())).encode().unwrap();
        assert_eq!(
            Frame::decode(&bytes).unwrap(),
            Frame::Command(Command::LogRecord(rec))
        );
    }

    #[test]
    fn missing_cmd_tag_is_malformed() {
        let bytes = br#"{"kind":"command","body":{"target_name":"B"}}"#;
        assert!(matches!(
            Frame::decode(bytes),
            Err(HuddleError::MalformedMessage(_))
        ));
    }

    #[test]
    fn unknown_cmd_tag_is_reported() {
        let bytes = br#"{"kind":"command","body":{"cmd":"reboot"}}"#;
        match Frame::decode(bytes) {
            Err(HuddleError::UnknownCommand(tag)) => assert_eq!(tag, "reboot"),
            other => panic!("expected unknown command, got {other:?}"),
        }
    }

    #[test]
    fn known_tag_with_bad_fields_is_malformed() {
        let bytes = br#"{"kind":"command","body":{"cmd":"share_delete","scope":"nope","key":"a"}}"#;
        assert!(matches!(
            Frame::decode(bytes),
            Err(HuddleError::MalformedMessage(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            Frame::decode(b"\x00\x01"),
            Err(HuddleError::MalformedMessage(_))
        ));
        assert!(matches!(
            Frame::decode(br#"["CMD_Connect","B"]"#),
            Err(HuddleError::MalformedMessage(_))
        ));
    }

    #[test]
    fn request_wire_shape() {
        let frame = Frame::from(Command::Request {
            id: 7,
            name: "board".into(),
            data: json!({"row": 2}),
        });
        let raw: Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(raw["body"]["cmd"], "request");
        assert_eq!(raw["body"]["id"], 7);
        assert_eq!(raw["body"]["name"], "board");

        let bytes = br#"{"kind":"command","body":{"cmd":"response","id":7,"handled":true,"result":[1,2]}}"#;
        assert_eq!(
            Frame::decode(bytes).unwrap(),
            Frame::Command(Command::Response {
                id: 7,
                handled: true,
                result: json!([1, 2]),
            })
        );
    }

    #[test]
    fn data_frame_passes_payload_through() {
        let frame = Frame::Data(json!({"cmd": "looks like a command", "n": 1}));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn every_tag_is_listed() {
        let samples = [
            Command::CredentialTableRequest,
            Command::CredentialTableResponse {
                table: Default::default(),
            },
            Command::ShareDelete {
                scope: StoreScope::Status,
                key: "k".into(),
            },
            Command::Request {
                id: 1,
                name: "board".into(),
                data: Value::Null,
            },
            Command::Response {
                id: 1,
                handled: false,
                result: Value::Null,
            },
        ];
        for c in samples {
            assert!(COMMAND_TAGS.contains(&c.tag()));
        }
    }
}
