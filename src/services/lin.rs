//! # LIN Controller Service
//!
//! Simple-mode LIN semantics. Every controller broadcasts its response
//! configuration (`Unused` / `Rx` / `TxUnconditional` per LIN ID) at init
//! time, so each node holds the full response map of the link and can
//! resolve transmissions locally:
//!
//! - With a master-provided response, every node with a configured `Rx` on
//!   the ID receives the frame; the master observes each receiver's
//!   reception result. No configured receiver means no status callback.
//! - With a slave response (or a bare frame header), the nodes with
//!   `TxUnconditional` on the ID are the producers: exactly one producer is
//!   required for `LIN_RX_OK`; several yield `LIN_RX_ERROR`; none yields
//!   `LIN_RX_NO_RESPONSE`.
//! - A mismatched checksum model or data length between the configured
//!   expectation and the distributed frame yields `LIN_RX_ERROR`.
//!
//! Sleep and wakeup are modeled: the go-to-sleep frame (ID `0x3C`, payload
//! `00 FF FF FF FF FF FF FF`) raises the go-to-sleep handler on every
//! node; `go_to_sleep_internal` performs the transition to `Sleep`. A
//! wakeup pulse raises the wakeup handler; `wakeup_internal` restores
//! `Operational`. `SleepPending` is reserved for detailed simulation.

use crate::error::{IbError, IbResult};
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::{EndpointAddress, NanosecondsTime};
use crate::wire::{Envelope, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// A LIN frame identifier; valid range 0..=0x3F.
pub type LinId = u8;

/// The identifier of the go-to-sleep frame.
pub const GO_TO_SLEEP_ID: LinId = 0x3C;

/// The go-to-sleep command frame as defined by the LIN standard.
pub fn go_to_sleep_frame() -> LinFrame {
    LinFrame {
        id: GO_TO_SLEEP_ID,
        checksum_model: LinChecksumModel::Classic,
        data_length: 8,
        data: [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinChecksumModel {
    /// Unconfigured; matches either model
    Undefined,
    Enhanced,
    Classic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinControllerMode {
    Inactive,
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinControllerStatus {
    Unknown,
    Operational,
    Sleep,
    /// Only entered in detailed simulation
    SleepPending,
}

/// Who provides the response to a transmitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinFrameResponseType {
    /// This (master) node provides the response
    MasterResponse,
    /// A remote slave provides the response
    SlaveResponse,
    /// Slave-to-slave communication; the master response is anonymous
    SlaveToSlave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinFrameResponseMode {
    /// The ID is ignored by this node
    Unused,
    /// The ID is received by this node
    Rx,
    /// This node transmits the response unconditionally
    TxUnconditional,
}

/// Status delivered to frame status handlers, mirroring the AUTOSAR
/// `Lin_StatusType` values the original stack uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinFrameStatus {
    NotOk,
    LinTxOk,
    LinTxBusy,
    LinTxHeaderError,
    LinTxError,
    LinRxOk,
    LinRxBusy,
    LinRxError,
    LinRxNoResponse,
}

/// A LIN frame: identifier, checksum model, data length, payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinFrame {
    pub id: LinId,
    pub checksum_model: LinChecksumModel,
    pub data_length: u8,
    pub data: [u8; 8],
}

impl LinFrame {
    /// A header-only frame with unconfigured meta, used to request a slave
    /// response without an own expectation.
    pub fn header(id: LinId) -> Self {
        Self {
            id,
            checksum_model: LinChecksumModel::Undefined,
            data_length: 0,
            data: [0; 8],
        }
    }
}

/// Response configuration of one node for one LIN ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinFrameResponse {
    pub frame: LinFrame,
    pub response_mode: LinFrameResponseMode,
}

/// Initialization data of a LIN controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinControllerConfig {
    pub controller_mode: LinControllerMode,
    /// Operational baud rate; recorded, only relevant in detailed mode
    pub baud_rate: u32,
    pub frame_responses: Vec<LinFrameResponse>,
}

/// Wire message: a node announces (or updates) its response configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinControllerConfigUpdate {
    pub controller_mode: LinControllerMode,
    pub baud_rate: u32,
    pub frame_responses: Vec<LinFrameResponse>,
}

/// Wire message: one resolved LIN transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinTransmission {
    pub frame: LinFrame,
    /// The node whose response data is carried; `None` on collision
    pub producer: Option<EndpointAddress>,
    /// More than one `TxUnconditional` producer was configured for the ID
    pub collision: bool,
    /// The frame is the go-to-sleep command
    pub is_go_to_sleep: bool,
}

/// Wire message: a wakeup pulse on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinWakeupPulse {}

/// Delivered to frame status handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinFrameStatusEvent {
    pub timestamp_ns: NanosecondsTime,
    pub frame: LinFrame,
    pub status: LinFrameStatus,
}

/// Delivered to go-to-sleep handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinGoToSleepEvent {
    pub timestamp_ns: NanosecondsTime,
}

/// Delivered to wakeup handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinWakeupEvent {
    pub timestamp_ns: NanosecondsTime,
}

/// Whether a configured expectation accepts a distributed frame.
///
/// `Undefined` checksum models and zero data lengths are unconfigured and
/// match anything; otherwise both properties must agree exactly.
pub(crate) fn meta_matches(expected: &LinFrame, actual: &LinFrame) -> bool {
    let checksum_ok = expected.checksum_model == LinChecksumModel::Undefined
        || actual.checksum_model == LinChecksumModel::Undefined
        || expected.checksum_model == actual.checksum_model;
    let length_ok = expected.data_length == 0
        || actual.data_length == 0
        || expected.data_length == actual.data_length;
    checksum_ok && length_ok
}

type ResponseTable = HashMap<LinId, LinFrameResponse>;

/// A LIN bus controller (master or slave) inside a participant.
#[derive(Clone)]
pub struct LinController {
    inner: Arc<LinControllerInner>,
}

pub(crate) struct LinControllerInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    mode: Mutex<LinControllerMode>,
    status: Mutex<LinControllerStatus>,
    baud_rate: Mutex<u32>,
    responses: Mutex<ResponseTable>,
    remote_nodes: Mutex<HashMap<EndpointAddress, ResponseTable>>,
    frame_status_handlers: HandlerRegistry<LinFrameStatusEvent>,
    go_to_sleep_handlers: HandlerRegistry<LinGoToSleepEvent>,
    wakeup_handlers: HandlerRegistry<LinWakeupEvent>,
}

impl LinController {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<LinControllerInner>) {
        let inner = Arc::new(LinControllerInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            mode: Mutex::new(LinControllerMode::Inactive),
            status: Mutex::new(LinControllerStatus::Unknown),
            baud_rate: Mutex::new(0),
            responses: Mutex::new(HashMap::new()),
            remote_nodes: Mutex::new(HashMap::new()),
            frame_status_handlers: HandlerRegistry::new(),
            go_to_sleep_handlers: HandlerRegistry::new(),
            wakeup_handlers: HandlerRegistry::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Initialize the controller as master or slave and announce the
    /// response configuration on the link.
    pub fn init(&self, config: LinControllerConfig) -> IbResult<()> {
        let inner = &self.inner;
        if config.controller_mode == LinControllerMode::Inactive {
            return Err(IbError::state(
                "Inactive",
                "LIN controller cannot be initialized as Inactive",
            ));
        }
        {
            let mut mode = inner.mode.lock();
            if *mode != LinControllerMode::Inactive {
                return Err(IbError::state(
                    format!("{:?}", *mode),
                    "LIN controller is already initialized",
                ));
            }
            *mode = config.controller_mode;
        }
        *inner.baud_rate.lock() = config.baud_rate;
        {
            let mut responses = inner.responses.lock();
            for response in &config.frame_responses {
                responses.insert(response.frame.id, *response);
            }
        }
        *inner.status.lock() = LinControllerStatus::Operational;

        inner.bus.publish(
            &inner.descriptor,
            &inner.sequence,
            Payload::LinConfig(LinControllerConfigUpdate {
                controller_mode: config.controller_mode,
                baud_rate: config.baud_rate,
                frame_responses: config.frame_responses,
            }),
        )
    }

    /// Current operational status.
    pub fn status(&self) -> LinControllerStatus {
        *self.inner.status.lock()
    }

    /// Update the node's response table and re-announce it on the link.
    pub fn set_frame_responses(&self, responses: Vec<LinFrameResponse>) -> IbResult<()> {
        let inner = &self.inner;
        let (mode, baud_rate) = {
            let mode = *inner.mode.lock();
            if mode == LinControllerMode::Inactive {
                return Err(IbError::state("Inactive", "LIN controller not initialized"));
            }
            (mode, *inner.baud_rate.lock())
        };
        {
            let mut table = inner.responses.lock();
            for response in &responses {
                table.insert(response.frame.id, *response);
            }
        }
        let frame_responses = {
            let table = inner.responses.lock();
            table.values().copied().collect()
        };
        inner.bus.publish(
            &inner.descriptor,
            &inner.sequence,
            Payload::LinConfig(LinControllerConfigUpdate {
                controller_mode: mode,
                baud_rate,
                frame_responses,
            }),
        )
    }

    /// Transmit a frame. Master only.
    pub fn send_frame(
        &self,
        frame: LinFrame,
        response_type: LinFrameResponseType,
    ) -> IbResult<()> {
        self.inner.require_operational_master()?;
        match response_type {
            LinFrameResponseType::MasterResponse => self.inner.transmit_master_response(frame),
            LinFrameResponseType::SlaveResponse | LinFrameResponseType::SlaveToSlave => {
                self.inner.transmit_slave_response(frame)
            }
        }
    }

    /// Transmit a bare frame header and let the configured slave respond.
    /// Master only.
    pub fn send_frame_header(&self, id: LinId) -> IbResult<()> {
        self.inner.require_operational_master()?;
        // The master's own Rx configuration, if any, is the expectation the
        // response is checked against.
        let request = self
            .inner
            .responses
            .lock()
            .get(&id)
            .filter(|r| r.response_mode == LinFrameResponseMode::Rx)
            .map(|r| r.frame)
            .unwrap_or_else(|| LinFrame::header(id));
        self.inner.transmit_slave_response(request)
    }

    /// Send the go-to-sleep command and enter `Sleep`. Master only.
    pub fn go_to_sleep(&self) -> IbResult<()> {
        self.inner.require_operational_master()?;
        self.inner.bus.publish(
            &self.inner.descriptor,
            &self.inner.sequence,
            Payload::LinTransmission(LinTransmission {
                frame: go_to_sleep_frame(),
                producer: Some(self.inner.descriptor.address),
                collision: false,
                is_go_to_sleep: true,
            }),
        )?;
        *self.inner.status.lock() = LinControllerStatus::Sleep;
        Ok(())
    }

    /// Enter `Sleep` without sending the command frame; typically called
    /// from a go-to-sleep handler.
    pub fn go_to_sleep_internal(&self) {
        *self.inner.status.lock() = LinControllerStatus::Sleep;
    }

    /// Emit a wakeup pulse on the link and become `Operational`.
    pub fn wakeup(&self) -> IbResult<()> {
        {
            let mode = *self.inner.mode.lock();
            if mode == LinControllerMode::Inactive {
                return Err(IbError::state("Inactive", "LIN controller not initialized"));
            }
        }
        *self.inner.status.lock() = LinControllerStatus::Operational;
        self.inner.bus.publish(
            &self.inner.descriptor,
            &self.inner.sequence,
            Payload::LinWakeup(LinWakeupPulse {}),
        )
    }

    /// Become `Operational` without emitting a pulse; typically called
    /// from a wakeup handler.
    pub fn wakeup_internal(&self) {
        *self.inner.status.lock() = LinControllerStatus::Operational;
    }

    pub fn add_frame_status_handler(
        &self,
        handler: impl Fn(&LinFrameStatusEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.frame_status_handlers.add(handler)
    }

    pub fn remove_frame_status_handler(&self, id: HandlerId) -> bool {
        self.inner.frame_status_handlers.remove(id)
    }

    pub fn add_go_to_sleep_handler(
        &self,
        handler: impl Fn(&LinGoToSleepEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.go_to_sleep_handlers.add(handler)
    }

    pub fn remove_go_to_sleep_handler(&self, id: HandlerId) -> bool {
        self.inner.go_to_sleep_handlers.remove(id)
    }

    pub fn add_wakeup_handler(
        &self,
        handler: impl Fn(&LinWakeupEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.wakeup_handlers.add(handler)
    }

    pub fn remove_wakeup_handler(&self, id: HandlerId) -> bool {
        self.inner.wakeup_handlers.remove(id)
    }
}

impl LinControllerInner {
    fn require_operational_master(&self) -> IbResult<()> {
        let mode = *self.mode.lock();
        if mode != LinControllerMode::Master {
            return Err(IbError::state(
                format!("{mode:?}"),
                "only a LIN master transmits frames",
            ));
        }
        let status = *self.status.lock();
        if status != LinControllerStatus::Operational {
            return Err(IbError::state(
                format!("{status:?}"),
                "LIN master is not operational",
            ));
        }
        Ok(())
    }

    fn deliver_status(&self, frame: LinFrame, status: LinFrameStatus) {
        self.frame_status_handlers.invoke(&LinFrameStatusEvent {
            timestamp_ns: self.bus.now_ns(),
            frame,
            status,
        });
    }

    /// Master provides the response data itself; the master observes the
    /// reception result of every configured receiver.
    fn transmit_master_response(&self, frame: LinFrame) -> IbResult<()> {
        self.bus.publish(
            &self.descriptor,
            &self.sequence,
            Payload::LinTransmission(LinTransmission {
                frame,
                producer: Some(self.descriptor.address),
                collision: false,
                is_go_to_sleep: false,
            }),
        )?;

        let receivers: Vec<LinFrameStatus> = {
            let nodes = self.remote_nodes.lock();
            nodes
                .values()
                .filter_map(|responses| responses.get(&frame.id))
                .filter(|response| response.response_mode == LinFrameResponseMode::Rx)
                .map(|response| {
                    if meta_matches(&response.frame, &frame) {
                        LinFrameStatus::LinRxOk
                    } else {
                        LinFrameStatus::LinRxError
                    }
                })
                .collect()
        };
        for status in receivers {
            self.deliver_status(frame, status);
        }
        Ok(())
    }

    /// A slave provides the response; resolve the producer set from the
    /// announced configurations.
    fn transmit_slave_response(&self, request: LinFrame) -> IbResult<()> {
        let producers: Vec<(EndpointAddress, LinFrame)> = {
            let nodes = self.remote_nodes.lock();
            nodes
                .iter()
                .filter_map(|(address, responses)| {
                    responses
                        .get(&request.id)
                        .filter(|r| r.response_mode == LinFrameResponseMode::TxUnconditional)
                        .map(|r| (*address, r.frame))
                })
                .collect()
        };

        match producers.len() {
            0 => {
                // Nothing on the bus answers the header.
                self.deliver_status(request, LinFrameStatus::LinRxNoResponse);
                Ok(())
            }
            1 => {
                let (producer, response) = producers[0];
                self.bus.publish(
                    &self.descriptor,
                    &self.sequence,
                    Payload::LinTransmission(LinTransmission {
                        frame: response,
                        producer: Some(producer),
                        collision: false,
                        is_go_to_sleep: false,
                    }),
                )?;
                let status = if meta_matches(&request, &response) {
                    LinFrameStatus::LinRxOk
                } else {
                    LinFrameStatus::LinRxError
                };
                self.deliver_status(response, status);
                Ok(())
            }
            _ => {
                self.bus.publish(
                    &self.descriptor,
                    &self.sequence,
                    Payload::LinTransmission(LinTransmission {
                        frame: request,
                        producer: None,
                        collision: true,
                        is_go_to_sleep: false,
                    }),
                )?;
                self.deliver_status(request, LinFrameStatus::LinRxError);
                Ok(())
            }
        }
    }

    fn handle_transmission(&self, envelope: &Envelope, transmission: &LinTransmission) {
        let status = *self.status.lock();

        if transmission.is_go_to_sleep {
            self.go_to_sleep_handlers.invoke(&LinGoToSleepEvent {
                timestamp_ns: envelope.timestamp_ns,
            });
            return;
        }

        // A sleeping node only listens for wakeup pulses.
        if status == LinControllerStatus::Sleep {
            return;
        }

        if transmission.collision {
            let configured_rx = self
                .responses
                .lock()
                .get(&transmission.frame.id)
                .map(|r| r.response_mode == LinFrameResponseMode::Rx)
                .unwrap_or(false);
            if configured_rx {
                self.deliver_status(transmission.frame, LinFrameStatus::LinRxError);
            }
            return;
        }

        if transmission.producer == Some(self.descriptor.address) {
            // Our unconditional response was distributed by the master.
            self.deliver_status(transmission.frame, LinFrameStatus::LinTxOk);
            return;
        }

        let expectation = self
            .responses
            .lock()
            .get(&transmission.frame.id)
            .filter(|r| r.response_mode == LinFrameResponseMode::Rx)
            .map(|r| r.frame);
        if let Some(expected) = expectation {
            let status = if meta_matches(&expected, &transmission.frame) {
                LinFrameStatus::LinRxOk
            } else {
                LinFrameStatus::LinRxError
            };
            self.deliver_status(transmission.frame, status);
        }
    }
}

impl BusController for LinControllerInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.payload {
            Payload::LinConfig(update) => {
                let mut responses = ResponseTable::new();
                for response in &update.frame_responses {
                    responses.insert(response.frame.id, *response);
                }
                self.remote_nodes.lock().insert(envelope.sender, responses);
            }
            Payload::LinTransmission(transmission) => {
                self.bus.trace(&self.descriptor, crate::types::Direction::Rx, envelope);
                self.handle_transmission(envelope, transmission);
            }
            Payload::LinWakeup(_) => {
                self.wakeup_handlers.invoke(&LinWakeupEvent {
                    timestamp_ns: envelope.timestamp_ns,
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: LinId, checksum_model: LinChecksumModel, data_length: u8) -> LinFrame {
        LinFrame {
            id,
            checksum_model,
            data_length,
            data: [0; 8],
        }
    }

    #[test]
    fn test_meta_matching_rules() {
        let classic8 = frame(18, LinChecksumModel::Classic, 8);
        let enhanced8 = frame(18, LinChecksumModel::Enhanced, 8);
        let enhanced1 = frame(19, LinChecksumModel::Enhanced, 1);
        let classic8_again = frame(19, LinChecksumModel::Classic, 8);

        // Checksum model mismatch
        assert!(!meta_matches(&classic8, &enhanced8));
        // Data length mismatch
        assert!(!meta_matches(&enhanced1, &classic8_again));
        // Exact match
        assert!(meta_matches(&classic8, &classic8));
        // Undefined checksum is a wildcard
        assert!(meta_matches(&frame(34, LinChecksumModel::Undefined, 6), &frame(34, LinChecksumModel::Enhanced, 6)));
        // Zero data length is unconfigured
        assert!(meta_matches(&LinFrame::header(34), &frame(34, LinChecksumModel::Enhanced, 6)));
    }

    #[test]
    fn test_go_to_sleep_frame_shape() {
        let frame = go_to_sleep_frame();
        assert_eq!(frame.id, 0x3C);
        assert_eq!(frame.data[0], 0x00);
        assert!(frame.data[1..].iter().all(|b| *b == 0xFF));
    }
}
