//! # huddle-cli
//!
//! Command-line interface for the huddle peer mesh.
//!
//! ## Commands
//!
//! - `huddle coordinator`: Run the rendezvous coordinator
//! - `huddle participant`: Join the mesh and drive it from stdin
//! - `huddle hash-credential`: Digest a secret for the credential table
//! - `huddle config`: Show the effective configuration
//! - `huddle version`: Show version info

pub mod commands;

pub use commands::Cli;
