use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name under which every participant's dialer knows the coordinator.
/// Reserved: no participant may register with it.
pub const COORDINATOR_NAME: &str = "Coordinator";

/// Segment label for participants the operator has not grouped.
pub const DEFAULT_SEGMENT: &str = "Default";

/// Unique name of a participant in the mesh.
pub type ParticipantName = String;

/// Name → credential digest table distributed by the coordinator.
pub type CredentialTable = BTreeMap<String, String>;

/// Reachability profile of one participant, as held by the coordinator.
///
/// Created or overwritten on every presence announcement and dropped when the
/// participant's link to the coordinator closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub name: ParticipantName,
    pub local_address: String,
    /// Empty when the participant has no public address.
    pub public_address: String,
    pub listen_port: u16,
    /// Secret gating inbound links to this participant's listener.
    pub access_key: String,
    pub is_public: bool,
    pub segment_id: String,
    pub whitelist: BTreeSet<ParticipantName>,
    pub blacklist: BTreeSet<ParticipantName>,
}

impl ParticipantProfile {
    /// A private, ungrouped profile with empty allow/deny lists.
    pub fn new(
        name: impl Into<String>,
        local_address: impl Into<String>,
        listen_port: u16,
        access_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_address: local_address.into(),
            public_address: String::new(),
            listen_port,
            access_key: access_key.into(),
            is_public: false,
            segment_id: DEFAULT_SEGMENT.to_string(),
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
        }
    }

    /// Set the public address; a non-empty address marks the profile public.
    pub fn with_public_address(mut self, addr: impl Into<String>) -> Self {
        self.public_address = addr.into();
        self.is_public = !self.public_address.is_empty();
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment_id = segment.into();
        self
    }

    pub fn with_whitelist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Instruction telling `initiator` to dial `target_name` directly.
///
/// Computed by the planner each cycle and never persisted; re-delivery is
/// harmless because the initiator ignores directives for live links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDirective {
    pub initiator: ParticipantName,
    pub target_name: ParticipantName,
    pub target_address: String,
    pub target_port: u16,
    pub target_access_key: String,
}

/// Severity of a relayed log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" | "err" => Ok(Severity::Error),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A structured log record forwarded from a participant to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn now(id: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
