//! # huddle-core
//!
//! Core types shared by the huddle coordinator and its participants: the
//! participant profile held in the coordinator's registry, the connection
//! directives computed from it, relayed log records, and the unified error type.

pub mod error;
pub mod types;

pub use error::{HuddleError, Result};
pub use types::*;
