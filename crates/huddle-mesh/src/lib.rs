//! # huddle-mesh
//!
//! Rendezvous-based peer mesh. A [`Coordinator`] keeps a registry of
//! participant profiles and periodically tells pairs of participants to dial
//! each other; it never relays application traffic. Each [`Participant`] runs a
//! listener identity and a dialer identity under one name, and exposes two
//! [`MergedStore`]s (`data` and `status`) that are replicated to linked peers,
//! plus named request handlers its peers can call.
//!
//! The wire layer sits behind the [`Transport`] trait, with a TCP
//! implementation for real deployments and an in-memory one for tests.

pub mod coordinator;
pub mod credential;
pub mod memory;
pub mod participant;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod request;
pub mod store;
pub mod supervise;
pub mod tcp;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorSettings, LogSink, TracingSink};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use participant::{Identity, Inbound, Participant, ParticipantSettings};
pub use planner::{PairDecision, Plan};
pub use protocol::{Command, Frame, StoreScope};
pub use registry::{Registry, RegistrySnapshot};
pub use relay::{LogRelay, LogSender, RelaySettings, SendOutcome};
pub use request::RequestHandler;
pub use store::{MergedStore, Side};
pub use tcp::TcpTransport;
pub use transport::{LinkEvent, Transport};
