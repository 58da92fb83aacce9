//! # CAN Controller Service
//!
//! Simple-mode CAN semantics: `send_frame` broadcasts the frame to every
//! peer on the link, and a transmit acknowledgement with status
//! `Transmitted` is synthesized immediately for the sender, carrying the
//! caller's user context verbatim. Received frames are delivered to frame
//! handlers filtered by direction (`Tx` for the controller's own
//! transmissions, `Rx` for frames from the link).
//!
//! Controller state transitions (`Uninit → Stopped → Started → Sleep`) are
//! driven purely by user calls; baud rates are recorded but unenforced in
//! simple mode.

use crate::error::{IbError, IbResult};
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::{Direction, NanosecondsTime};
use crate::wire::{Envelope, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// CAN frame flag bits, matching the classic register layout.
pub mod can_frame_flags {
    /// Identifier extension (29-bit id)
    pub const IDE: u32 = 1 << 9;
    /// Remote transmission request
    pub const RTR: u32 = 1 << 4;
    /// FD format indicator
    pub const FDF: u32 = 1 << 12;
    /// Bit-rate switch (FD only)
    pub const BRS: u32 = 1 << 13;
    /// Error state indicator (FD only)
    pub const ESI: u32 = 1 << 14;
}

/// A CAN (or CAN FD) frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// 11-bit or (with `IDE`) 29-bit identifier
    pub id: u32,
    /// Flag bits, see [`can_frame_flags`]
    pub flags: u32,
    /// Data length code
    pub dlc: u8,
    pub data: Vec<u8>,
}

/// Operational state of a CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanControllerState {
    Uninit,
    Stopped,
    Started,
    Sleep,
}

/// Error state of the controller; always `NotAvailable` in simple mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanErrorState {
    NotAvailable,
    ErrorActive,
    ErrorPassive,
    BusOff,
}

/// Result of a frame transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanTransmitStatus {
    /// The frame was transmitted on the link
    Transmitted,
    /// The transmit request was canceled
    Canceled,
    /// The controller's transmit queue was exhausted
    TransmitQueueFull,
    /// A transmit request with the same transmit id is still pending
    DuplicatedTransmitId,
}

/// A CAN frame delivery, as seen by frame handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanFrameEvent {
    pub frame: CanFrame,
    /// `Rx` for frames from the link, `Tx` for own transmissions
    pub direction: Direction,
    /// Caller-supplied context of the transmission, preserved verbatim
    pub user_context: u64,
}

/// Transmit acknowledgement synthesized for the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanFrameTransmitEvent {
    pub status: CanTransmitStatus,
    pub user_context: u64,
    pub timestamp_ns: NanosecondsTime,
}

/// A CAN bus controller inside a participant.
#[derive(Clone)]
pub struct CanController {
    inner: Arc<CanControllerInner>,
}

pub(crate) struct CanControllerInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    state: Mutex<CanControllerState>,
    baud_rate: Mutex<(u32, u32)>,
    frame_handlers: HandlerRegistry<CanFrameEvent>,
    transmit_handlers: HandlerRegistry<CanFrameTransmitEvent>,
    state_handlers: HandlerRegistry<CanControllerState>,
}

impl CanController {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<CanControllerInner>) {
        let inner = Arc::new(CanControllerInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            state: Mutex::new(CanControllerState::Uninit),
            baud_rate: Mutex::new((0, 0)),
            frame_handlers: HandlerRegistry::new(),
            transmit_handlers: HandlerRegistry::new(),
            state_handlers: HandlerRegistry::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Record the operational (and FD) baud rate. Unenforced in simple mode.
    pub fn set_baud_rate(&self, rate: u32, fd_rate: u32) {
        *self.inner.baud_rate.lock() = (rate, fd_rate);
    }

    /// The recorded (operational, FD) baud rates.
    pub fn baud_rate(&self) -> (u32, u32) {
        *self.inner.baud_rate.lock()
    }

    /// Current controller state.
    pub fn state(&self) -> CanControllerState {
        *self.inner.state.lock()
    }

    /// Error state; simple mode does not model CAN error counting.
    pub fn error_state(&self) -> CanErrorState {
        CanErrorState::NotAvailable
    }

    /// Start the controller; frames can be sent and are delivered.
    pub fn start(&self) {
        self.inner.change_state(CanControllerState::Started);
    }

    /// Stop the controller.
    pub fn stop(&self) {
        self.inner.change_state(CanControllerState::Stopped);
    }

    /// Put the controller to sleep.
    pub fn sleep(&self) {
        self.inner.change_state(CanControllerState::Sleep);
    }

    /// Reset to the uninitialized state.
    pub fn reset(&self) {
        self.inner.change_state(CanControllerState::Uninit);
    }

    /// Send a frame on the link.
    ///
    /// The user context is an opaque caller value returned verbatim in the
    /// transmit acknowledgement. Requires the `Started` state.
    pub fn send_frame(&self, frame: CanFrame, user_context: u64) -> IbResult<()> {
        let state = self.state();
        if state != CanControllerState::Started {
            return Err(IbError::state(
                format!("{state:?}"),
                "CAN controller must be started to send frames",
            ));
        }

        let inner = &self.inner;
        let timestamp_ns = inner.bus.now_ns();

        // Broadcast to the link; receivers see direction Rx.
        inner.bus.publish(
            &inner.descriptor,
            &inner.sequence,
            Payload::CanFrame(CanFrameEvent {
                frame: frame.clone(),
                direction: Direction::Rx,
                user_context,
            }),
        )?;

        // Deliver the own transmission to Tx-filtered frame handlers.
        inner.bus.send_directed(
            &inner.descriptor,
            &inner.sequence,
            inner.descriptor.address,
            Payload::CanFrame(CanFrameEvent {
                frame,
                direction: Direction::Tx,
                user_context,
            }),
            None,
        )?;

        // Simple mode acknowledges immediately.
        inner.bus.send_directed(
            &inner.descriptor,
            &inner.sequence,
            inner.descriptor.address,
            Payload::CanAck(CanFrameTransmitEvent {
                status: CanTransmitStatus::Transmitted,
                user_context,
                timestamp_ns,
            }),
            None,
        )?;
        Ok(())
    }

    /// Register a frame handler filtered by direction.
    pub fn add_frame_handler(
        &self,
        filter: Direction,
        handler: impl Fn(&CanFrameEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.frame_handlers.add(move |event| {
            if filter.accepts(event.direction) {
                handler(event);
            }
        })
    }

    pub fn remove_frame_handler(&self, id: HandlerId) -> bool {
        self.inner.frame_handlers.remove(id)
    }

    /// Register a transmit acknowledgement handler.
    pub fn add_frame_transmit_handler(
        &self,
        handler: impl Fn(&CanFrameTransmitEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.transmit_handlers.add(handler)
    }

    pub fn remove_frame_transmit_handler(&self, id: HandlerId) -> bool {
        self.inner.transmit_handlers.remove(id)
    }

    /// Register a controller state change handler.
    pub fn add_state_change_handler(
        &self,
        handler: impl Fn(&CanControllerState) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.state_handlers.add(handler)
    }

    pub fn remove_state_change_handler(&self, id: HandlerId) -> bool {
        self.inner.state_handlers.remove(id)
    }
}

impl CanControllerInner {
    fn change_state(&self, new_state: CanControllerState) {
        {
            let mut state = self.state.lock();
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        self.state_handlers.invoke(&new_state);
    }
}

impl BusController for CanControllerInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.payload {
            Payload::CanFrame(event) => {
                // A sleeping or stopped controller does not deliver frames,
                // but its own Tx loopback is always delivered.
                if event.direction == Direction::Rx
                    && *self.state.lock() != CanControllerState::Started
                {
                    return;
                }
                self.bus.trace(&self.descriptor, Direction::Rx, envelope);
                self.frame_handlers.invoke(event);
            }
            Payload::CanAck(event) => {
                self.transmit_handlers.invoke(event);
            }
            _ => {}
        }
    }
}
