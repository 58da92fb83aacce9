//! # Wire Envelope and Message Taxonomy
//!
//! Every frame exchanged between participants (and with the registry) is a
//! bincode-encoded [`Envelope`] carrying one [`Payload`] variant. The
//! envelope contributes the metadata the routing core needs without looking
//! at the payload: the interface identifier, the sending endpoint, a
//! per-endpoint sequence number, the simulation timestamp, the link the
//! message travels on, and an optional directed recipient.
//!
//! ## Interface identifiers
//!
//! Payloads are versioned by an `InterfaceIdentifier` integer with numeric
//! families per service kind (CAN `1002xxx`, Ethernet `2002xxx`, FlexRay
//! `3001xxx`, data `4002xxx`, LIN `5001xxx`, RPC `6001xxx`, control
//! `9001xxx`). The identifier is redundant with the payload tag and exists
//! so that a receiver can reject an incompatible payload revision before
//! interpreting it.
//!
//! ## Directed delivery
//!
//! Most traffic is link-routed: the envelope names a link and every
//! matching endpoint on that link receives it. A `recipient` turns the
//! envelope into a point-to-point message instead; this carries history
//! replay to a late-joining subscriber and RPC results back to the calling
//! client without disturbing other endpoints on the link.

use crate::error::IbResult;
use crate::lifecycle::ParticipantState;
use crate::services::can::{CanFrameEvent, CanFrameTransmitEvent};
use crate::services::data::DataMessageEvent;
use crate::services::ethernet::{EthernetFrameEvent, EthernetFrameTransmitEvent};
use crate::services::flexray::{
    FlexRayCycleStartEvent, FlexRayFrameEvent, FlexRayFrameTransmitEvent, FlexRayPocStatusEvent,
    FlexRaySymbolEvent,
};
use crate::services::lin::{LinControllerConfigUpdate, LinTransmission, LinWakeupPulse};
use crate::services::rpc::{RpcCallMessage, RpcResultMessage};
use crate::types::{EndpointAddress, Label, NanosecondsTime, ParticipantId, ServiceKind};
use serde::{Deserialize, Serialize};

/// Version of the wire protocol; announced at join and checked by the
/// registry and by every peer before a connection is admitted to the mesh.
pub const PROTOCOL_VERSION: u32 = 1;

/// Interface-identifier constants, one numeric family per service kind.
pub mod interface_ids {
    pub const CAN_FRAME: i32 = 1_002_001;
    pub const CAN_TRANSMIT_ACKNOWLEDGE: i32 = 1_003_001;
    pub const ETHERNET_FRAME: i32 = 2_002_001;
    pub const ETHERNET_TRANSMIT_ACKNOWLEDGE: i32 = 2_003_001;
    pub const FLEXRAY_FRAME: i32 = 3_001_001;
    pub const FLEXRAY_FRAME_ACKNOWLEDGE: i32 = 3_002_001;
    pub const FLEXRAY_SYMBOL: i32 = 3_003_001;
    pub const FLEXRAY_CYCLE_START: i32 = 3_005_001;
    pub const FLEXRAY_POC_STATUS: i32 = 3_007_001;
    pub const DATA_MESSAGE: i32 = 4_002_001;
    pub const LIN_CONTROLLER_CONFIG: i32 = 5_001_001;
    pub const LIN_TRANSMISSION: i32 = 5_001_002;
    pub const LIN_WAKEUP_PULSE: i32 = 5_001_003;
    pub const RPC_CALL: i32 = 6_001_001;
    pub const RPC_RESULT: i32 = 6_001_002;
    pub const CONTROL: i32 = 9_001_001;
}

/// The framed unit of transfer between two processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload revision tag (see [`interface_ids`])
    pub interface_id: i32,
    /// The endpoint that produced this message
    pub sender: EndpointAddress,
    /// Monotone per-sender-endpoint sequence number
    pub sequence: u64,
    /// Simulation timestamp in nanoseconds
    pub timestamp_ns: NanosecondsTime,
    /// The link this message is routed on; `None` for control traffic
    pub link: Option<String>,
    /// Directed recipient; `None` means link-routed broadcast
    pub recipient: Option<EndpointAddress>,
    /// The message itself
    pub payload: Payload,
}

impl Envelope {
    /// Serialize to the bincode wire representation (without the length
    /// prefix, which the transport layer adds).
    pub fn to_bytes(&self) -> IbResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Reconstruct an envelope from its wire representation.
    pub fn from_bytes(bytes: &[u8]) -> IbResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Closed union of every message the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    // -- registry and mesh control --------------------------------------
    ParticipantAnnouncement(ParticipantAnnouncement),
    KnownParticipants(KnownParticipants),
    RegistryRejection(RegistryRejection),
    Subscription(SubscriptionAnnouncement),
    Log(LogMessage),

    // -- lifecycle -------------------------------------------------------
    ParticipantStatus(ParticipantStatusUpdate),
    ParticipantCommand(ParticipantCommand),
    SystemCommand(SystemCommand),
    RequiredParticipants(RequiredParticipants),

    // -- time synchronization ---------------------------------------------
    Tick(Tick),
    TickDone(TickDone),
    QuantumRequest(QuantumRequest),
    QuantumGrant(QuantumGrant),
    NextSimTask(NextSimTask),

    // -- bus traffic -------------------------------------------------------
    CanFrame(CanFrameEvent),
    CanAck(CanFrameTransmitEvent),
    LinConfig(LinControllerConfigUpdate),
    LinTransmission(LinTransmission),
    LinWakeup(LinWakeupPulse),
    FlexRayFrame(FlexRayFrameEvent),
    FlexRayAck(FlexRayFrameTransmitEvent),
    FlexRaySymbol(FlexRaySymbolEvent),
    FlexRayCycleStart(FlexRayCycleStartEvent),
    FlexRayPocStatus(FlexRayPocStatusEvent),
    EthernetFrame(EthernetFrameEvent),
    EthernetAck(EthernetFrameTransmitEvent),
    DataMessage(DataMessageEvent),
    RpcCall(RpcCallMessage),
    RpcResult(RpcResultMessage),
}

impl Payload {
    /// The interface identifier this payload is stamped with on the wire.
    pub fn interface_id(&self) -> i32 {
        use interface_ids::*;
        match self {
            Payload::CanFrame(_) => CAN_FRAME,
            Payload::CanAck(_) => CAN_TRANSMIT_ACKNOWLEDGE,
            Payload::EthernetFrame(_) => ETHERNET_FRAME,
            Payload::EthernetAck(_) => ETHERNET_TRANSMIT_ACKNOWLEDGE,
            Payload::FlexRayFrame(_) => FLEXRAY_FRAME,
            Payload::FlexRayAck(_) => FLEXRAY_FRAME_ACKNOWLEDGE,
            Payload::FlexRaySymbol(_) => FLEXRAY_SYMBOL,
            Payload::FlexRayCycleStart(_) => FLEXRAY_CYCLE_START,
            Payload::FlexRayPocStatus(_) => FLEXRAY_POC_STATUS,
            Payload::DataMessage(_) => DATA_MESSAGE,
            Payload::LinConfig(_) => LIN_CONTROLLER_CONFIG,
            Payload::LinTransmission(_) => LIN_TRANSMISSION,
            Payload::LinWakeup(_) => LIN_WAKEUP_PULSE,
            Payload::RpcCall(_) => RPC_CALL,
            Payload::RpcResult(_) => RPC_RESULT,
            _ => CONTROL,
        }
    }

    /// Whether this payload is bus traffic routed by link, as opposed to
    /// control traffic interpreted by the participant core itself.
    pub fn is_bus_traffic(&self) -> bool {
        self.interface_id() != interface_ids::CONTROL
    }
}

/// First message on every connection: who is connecting.
///
/// Toward the registry `participant_id` is `None` (the registry assigns
/// one); toward a peer it carries the id the registry handed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantAnnouncement {
    pub participant_id: Option<ParticipantId>,
    pub participant_name: String,
    pub domain_id: u32,
    pub protocol_version: u32,
    /// TCP endpoint (`host:port`) this participant accepts peers on
    pub tcp_endpoint: String,
    /// Optional Unix-domain-socket path for co-host peers
    pub domain_socket: Option<String>,
    /// Whether this participant forwards its log records to the registry
    pub log_from_remotes: bool,
}

/// One already-connected participant, as reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    pub tcp_endpoint: String,
    pub domain_socket: Option<String>,
}

/// Registry reply to a successful announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownParticipants {
    /// The id assigned to the announcing participant
    pub assigned_id: ParticipantId,
    /// All peers already in the mesh; the new participant dials each
    pub peers: Vec<PeerInfo>,
}

/// Registry reply to a rejected announcement; the connection is closed
/// immediately afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRejection {
    pub reason: String,
}

/// Broadcast whenever a controller registers on a link.
///
/// Every publisher folds these into its local routing table so that bus
/// traffic flows directly to the owning connections without touching the
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionAnnouncement {
    pub address: EndpointAddress,
    pub qualified_name: String,
    pub link: String,
    pub kind: ServiceKind,
    pub labels: Vec<Label>,
    /// Data publishers: media type string announced to subscribers
    pub media_type: Option<String>,
    /// Data publishers: configured history depth (0 or 1)
    pub history: u8,
}

/// A log record forwarded to the registry by a participant that opted in
/// to remote logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub participant_name: String,
    /// `tracing` level as string (`ERROR`, `WARN`, ...)
    pub level: String,
    pub message: String,
}

/// Lifecycle state report, broadcast on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantStatusUpdate {
    pub participant_name: String,
    pub state: ParticipantState,
    /// Human-readable cause of the transition
    pub reason: String,
    /// Wall-clock time the state was entered, nanoseconds since epoch
    pub enter_time_ns: NanosecondsTime,
}

impl ParticipantStatusUpdate {
    /// The state entry time as a UTC timestamp.
    pub fn enter_time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_nanos(self.enter_time_ns as i64)
    }
}

/// Command addressed to a single participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantCommand {
    pub target_participant: String,
    pub kind: ParticipantCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantCommandKind {
    Initialize,
    Reinitialize,
}

/// Command addressed to every participant of the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemCommandKind {
    Run,
    Stop,
    Shutdown,
    PrepareColdswap,
    ExecuteColdswap,
}

/// Declaration of the required participant set by the system controller.
///
/// The system state aggregates over exactly this set; absent a declaration
/// every synchronized participant of the configuration is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredParticipants {
    pub names: Vec<String>,
}

/// Strict sync: the master's tick broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub now_ns: NanosecondsTime,
    pub duration_ns: NanosecondsTime,
}

/// Strict sync: a participant finished its simulation task for a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickDone {
    pub participant_name: String,
    pub now_ns: NanosecondsTime,
}

/// Loose sync: a participant requests its next quantum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumRequest {
    pub participant_name: String,
    pub start_ns: NanosecondsTime,
    pub duration_ns: NanosecondsTime,
}

/// Loose sync: the master grants a previously requested quantum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumGrant {
    pub participant_name: String,
    pub start_ns: NanosecondsTime,
    pub duration_ns: NanosecondsTime,
}

/// Distributed quantum: announcement of the sender's next ready time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextSimTask {
    pub participant_name: String,
    pub next_ns: NanosecondsTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::can::{CanFrame, CanFrameEvent};
    use crate::types::Direction;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            interface_id: interface_ids::CAN_FRAME,
            sender: EndpointAddress::new(3, 1),
            sequence: 17,
            timestamp_ns: 1_000_000,
            link: Some("CAN1".to_string()),
            recipient: None,
            payload: Payload::CanFrame(CanFrameEvent {
                frame: CanFrame {
                    id: 0x11,
                    flags: 0,
                    dlc: 3,
                    data: vec![1, 2, 3],
                },
                direction: Direction::Rx,
                user_context: 0,
            }),
        };

        let bytes = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.sender, envelope.sender);
        assert_eq!(decoded.sequence, 17);
        assert_eq!(decoded.link.as_deref(), Some("CAN1"));
        assert_eq!(decoded.payload.interface_id(), interface_ids::CAN_FRAME);
    }

    #[test]
    fn test_control_payloads_share_the_control_family() {
        let tick = Payload::Tick(Tick {
            now_ns: 0,
            duration_ns: 1_000_000,
        });
        assert_eq!(tick.interface_id(), interface_ids::CONTROL);
        assert!(!tick.is_bus_traffic());
    }
}
