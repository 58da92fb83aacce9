//! # Integration Bus Core
//!
//! A distributed co-simulation middleware for virtual electronic control
//! units. Participant processes exchange automotive bus traffic (CAN, LIN,
//! FlexRay, Ethernet), generic publish/subscribe payloads, and RPC calls
//! over a broker-less peer mesh, while a shared lifecycle and an optional
//! virtual clock keep them in step.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐   announce    ┌──────────┐   announce   ┌──────────┐
//! │ P1       │──────────────▶│ registry │◀─────────────│ P2       │
//! │          │◀── peers ─────│          │─── peers ───▶│          │
//! └────┬─────┘               └──────────┘              └────┬─────┘
//!      │            direct peer connection                  │
//!      └────────────────────────────────────────────────────┘
//! ```
//!
//! A participant connects to the registry of its domain, learns the peer
//! list, and opens direct framed connections to every peer; from then on
//! all traffic (bus messages, lifecycle commands, time synchronization)
//! flows peer to peer. Controllers register on named links; subscription
//! announcements keep every publisher's routing table current.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod participant;
pub mod registry;
pub mod routing;
pub mod services;
pub mod timesync;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{Config, SyncPolicy, SyncType};
pub use error::{IbError, IbResult};
pub use lifecycle::{ParticipantState, SystemController, SystemMonitor, SystemState};
pub use participant::{Participant, ParticipantController};
pub use registry::{start_registry, RegistryHandle};
pub use routing::LinkSimulator;
pub use services::{HandlerId, TraceSink};
pub use types::{Direction, EndpointAddress, Label, NanosecondsTime, ParticipantId, ServiceKind};

/// The crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
