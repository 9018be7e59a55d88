//! # huddle-config
//!
//! Configuration system for the huddle coordinator and participants. Reads from
//! `huddle.toml`, then applies environment variable overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::HuddleConfig;
pub use schema::{
    ConfigWarning, CoordinatorConfig, LogCatalogEntry, LoggingConfig, ParticipantConfig, RelayConfig,
    WarningSeverity,
};
