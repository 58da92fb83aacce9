//! # Core Identifier and Addressing Types
//!
//! This module defines the fundamental value types shared by every other
//! subsystem: participant and endpoint identifiers, endpoint addresses,
//! service kinds, link kinds, transmit directions, and the label set used
//! for publish/subscribe matching.
//!
//! ## Addressing Model
//!
//! - A **participant** is one process in the simulation, identified by a
//!   registry-assigned numeric id and a configured unique name.
//! - An **endpoint** is a controller inside a participant. Endpoint ids are
//!   assigned locally, are stable within a run, and are unique within their
//!   participant.
//! - The pair of both forms an [`EndpointAddress`], the routable identity
//!   of a controller. The human-readable form is the qualified name
//!   `participant/controller`, which is globally unique by configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric participant identifier, assigned by the registry at join time.
///
/// Id `0` is reserved for the registry itself.
pub type ParticipantId = u64;

/// Locally assigned controller identifier, stable within a run.
///
/// Endpoint `0` is reserved for the participant's control endpoint that
/// carries lifecycle, time-sync, and registry traffic.
pub type EndpointId = u16;

/// Simulation timestamps in nanoseconds.
///
/// Synchronized participants stamp messages with virtual time; in
/// unsynchronized mode this is wall-clock nanoseconds since the Unix epoch.
pub type NanosecondsTime = u64;

/// The endpoint id reserved for lifecycle/sync/registry control traffic.
pub const CONTROL_ENDPOINT: EndpointId = 0;

/// The participant id the registry uses as message sender.
pub const REGISTRY_PARTICIPANT_ID: ParticipantId = 0;

/// Routable identity of a controller: `(participant, endpoint)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    /// Registry-assigned id of the owning participant
    pub participant: ParticipantId,
    /// Locally assigned controller id within the participant
    pub endpoint: EndpointId,
}

impl EndpointAddress {
    /// Create an endpoint address from its two components.
    pub fn new(participant: ParticipantId, endpoint: EndpointId) -> Self {
        Self {
            participant,
            endpoint,
        }
    }

    /// The control endpoint of the given participant.
    pub fn control(participant: ParticipantId) -> Self {
        Self {
            participant,
            endpoint: CONTROL_ENDPOINT,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.participant, self.endpoint)
    }
}

/// The class of bus or service a controller implements.
///
/// Every link carries exactly one [`LinkKind`]; the service kinds of all
/// endpoints on a link must map onto that kind (publishers and subscribers
/// of the generic data service share a link, as do RPC clients and servers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// CAN bus controller
    Can,
    /// LIN bus controller (master or slave)
    Lin,
    /// FlexRay communication controller
    FlexRay,
    /// Ethernet controller
    Ethernet,
    /// Generic data publisher (topic + labels)
    DataPublisher,
    /// Generic data subscriber
    DataSubscriber,
    /// RPC client
    RpcClient,
    /// RPC server
    RpcServer,
    /// Not yet bound to a link
    Undefined,
}

impl ServiceKind {
    /// Map the service kind onto the link kind it participates in.
    pub fn link_kind(self) -> LinkKind {
        match self {
            ServiceKind::Can => LinkKind::Can,
            ServiceKind::Lin => LinkKind::Lin,
            ServiceKind::FlexRay => LinkKind::FlexRay,
            ServiceKind::Ethernet => LinkKind::Ethernet,
            ServiceKind::DataPublisher | ServiceKind::DataSubscriber => LinkKind::Data,
            ServiceKind::RpcClient | ServiceKind::RpcServer => LinkKind::Rpc,
            ServiceKind::Undefined => LinkKind::Undefined,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::Can => "CAN",
            ServiceKind::Lin => "LIN",
            ServiceKind::FlexRay => "FlexRay",
            ServiceKind::Ethernet => "Ethernet",
            ServiceKind::DataPublisher => "DataPublisher",
            ServiceKind::DataSubscriber => "DataSubscriber",
            ServiceKind::RpcClient => "RpcClient",
            ServiceKind::RpcServer => "RpcServer",
            ServiceKind::Undefined => "Undefined",
        };
        f.write_str(name)
    }
}

/// The multiplexing class of a link (network).
///
/// `Undefined` exists only before binding; configuration validation derives
/// the definite kind from the link's member endpoints and rejects mixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    Can,
    Lin,
    FlexRay,
    Ethernet,
    Data,
    Rpc,
    Undefined,
}

/// Transmit direction of a bus event, used to filter frame handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Events for frames this controller transmitted
    Tx,
    /// Events for frames received from the link
    Rx,
    /// Both directions
    Both,
}

impl Direction {
    /// Whether a handler registered with `self` accepts an event tagged
    /// with `event_direction`.
    pub fn accepts(self, event_direction: Direction) -> bool {
        matches!(
            (self, event_direction),
            (Direction::Both, _)
                | (Direction::Tx, Direction::Tx)
                | (Direction::Rx, Direction::Rx)
        )
    }
}

/// One key/value label attached to a data or RPC endpoint.
///
/// Labels are ordered; matching ignores the order but not the values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Subscription label matching.
///
/// A subscription matches a publication iff for every subscriber label the
/// key is either absent on the publisher or carries the exact same value.
/// An empty subscriber value acts as a wildcard that only requires the key
/// to be present-or-absent-compatible, i.e. it matches any publisher value
/// including absence of the key.
pub fn labels_match(subscriber: &[Label], publisher: &[Label]) -> bool {
    subscriber.iter().all(|wanted| {
        match publisher.iter().find(|l| l.key == wanted.key) {
            None => true,
            Some(found) => wanted.value.is_empty() || wanted.value == found.value,
        }
    })
}

/// Matching for *specific* data handlers: every pattern key must be present
/// on the publisher, with an empty pattern value acting as a wildcard.
///
/// This is the narrowing rule that lets a handler keyed on
/// `{KeyA:"", KeyB:""}` capture only publishers that carry both keys.
pub fn specific_labels_match(pattern: &[Label], publisher: &[Label]) -> bool {
    pattern.iter().all(|wanted| {
        match publisher.iter().find(|l| l.key == wanted.key) {
            None => false,
            Some(found) => wanted.value.is_empty() || wanted.value == found.value,
        }
    })
}
