use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use huddle_core::{COORDINATOR_NAME, DEFAULT_SEGMENT, Severity};

/// Root configuration, maps to `huddle.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleConfig {
    pub coordinator: CoordinatorConfig,
    pub participant: ParticipantConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    /// Predefined log records, relayed by id alone.
    pub log_catalog: BTreeMap<String, LogCatalogEntry>,
}

// ── Coordinator ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the coordinator listens on.
    pub listen: String,
    pub port: u16,
    /// Key participants must present when dialing the coordinator.
    pub access_key: String,
    /// Seconds between planning cycles.
    pub plan_interval_secs: u64,
    /// Extra wait before planning when the registry has not changed.
    pub debounce_secs: u64,
    /// When non-empty, two participants that are both outside this set are
    /// never told to link with each other.
    pub allowed_members: Vec<String>,
    /// Name → credential digest table handed to participants on request.
    /// Generate digests with `huddle hash-credential`.
    pub credentials: Option<BTreeMap<String, String>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".into(),
            port: 2428,
            access_key: "Passable".into(),
            plan_interval_secs: 30,
            debounce_secs: 20,
            allowed_members: vec![],
            credentials: None,
        }
    }
}

// ── Participant ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Unique participant name. Must not be the reserved coordinator name.
    pub name: String,
    pub coordinator_address: String,
    pub coordinator_port: u16,
    pub coordinator_key: String,
    /// Secret presented when dialing listeners that enforce a credential table.
    pub credential: Option<String>,
    /// LAN address peers in the same segment dial.
    pub local_address: String,
    /// Public address; empty when the host is not publicly reachable.
    pub public_address: String,
    /// Listener port (0 = pick an ephemeral port).
    pub listen_port: u16,
    /// Operator-assigned network segment label.
    pub segment: String,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    /// Length of the random access key gating inbound links.
    pub access_key_len: usize,
    /// Seconds between coordinator reconnect attempts.
    pub reconnect_secs: u64,
    /// Seconds between full pushes of the shared data store to peers.
    pub share_flush_secs: u64,
    /// Seconds between full pushes of the status store to peers.
    pub status_flush_secs: u64,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            coordinator_address: "127.0.0.1".into(),
            coordinator_port: 2428,
            coordinator_key: "Passable".into(),
            credential: None,
            local_address: "127.0.0.1".into(),
            public_address: String::new(),
            listen_port: 0,
            segment: DEFAULT_SEGMENT.into(),
            whitelist: vec![],
            blacklist: vec![],
            access_key_len: 16,
            reconnect_secs: 5,
            share_flush_secs: 60,
            status_flush_secs: 30,
        }
    }
}

// ── Log relay ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Records sent per window before overflow buffering starts.
    pub max_per_window: u32,
    pub window_millis: u64,
    /// Seconds between overflow drains.
    pub drain_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_per_window: 6,
            window_millis: 1000,
            drain_secs: 15,
        }
    }
}

/// One predefined log record, e.g.
///
/// ```toml
/// [log_catalog.E100]
/// severity = "error"
/// message = "disk full"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCatalogEntry {
    pub severity: Severity,
    pub message: String,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{}: {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " (hint: {})", h)?;
        }
        Ok(())
    }
}

impl HuddleConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Coordinator timing ───
        if self.coordinator.plan_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "coordinator.plan_interval_secs".into(),
                message: "planning interval must be greater than zero".into(),
                severity: WarningSeverity::Error,
                hint: Some("The reference interval is 30 seconds".into()),
            });
        }
        if self.coordinator.debounce_secs > self.coordinator.plan_interval_secs * 10 {
            warnings.push(ConfigWarning {
                field: "coordinator.debounce_secs".into(),
                message: format!(
                    "debounce of {}s dwarfs the {}s planning interval",
                    self.coordinator.debounce_secs, self.coordinator.plan_interval_secs
                ),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if self.coordinator.access_key == "Passable" {
            warnings.push(ConfigWarning {
                field: "coordinator.access_key".into(),
                message: "coordinator uses the default access key".into(),
                severity: WarningSeverity::Info,
                hint: Some("Set coordinator.access_key and participant.coordinator_key".into()),
            });
        }

        // ── Participant identity ───
        if self.participant.name == COORDINATOR_NAME {
            warnings.push(ConfigWarning {
                field: "participant.name".into(),
                message: format!("'{}' is reserved for the coordinator", COORDINATOR_NAME),
                severity: WarningSeverity::Error,
                hint: Some("Pick another participant name".into()),
            });
        }
        if self.participant.access_key_len == 0 {
            warnings.push(ConfigWarning {
                field: "participant.access_key_len".into(),
                message: "access key length must be greater than zero".into(),
                severity: WarningSeverity::Error,
                hint: Some("The reference length is 16".into()),
            });
        }
        for name in &self.participant.whitelist {
            if self.participant.blacklist.contains(name) {
                warnings.push(ConfigWarning {
                    field: "participant.whitelist".into(),
                    message: format!("'{}' is both whitelisted and blacklisted", name),
                    severity: WarningSeverity::Warning,
                    hint: Some("The blacklist wins".into()),
                });
            }
        }

        // ── Relay ───
        if self.relay.max_per_window == 0 {
            warnings.push(ConfigWarning {
                field: "relay.max_per_window".into(),
                message: "relay limit must be greater than zero".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        if self.relay.window_millis == 0 || self.relay.drain_secs == 0 {
            warnings.push(ConfigWarning {
                field: "relay".into(),
                message: "relay window and drain interval must be greater than zero".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        for (id, entry) in &self.log_catalog {
            if entry.message.trim().is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("log_catalog.{id}"),
                    message: "catalog entry has an empty message".into(),
                    severity: WarningSeverity::Warning,
                    hint: None,
                });
            }
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
