//! # Ethernet Controller Service
//!
//! Simple-mode Ethernet: raw frames are routed per link, with optional
//! VLAN-aware switch forwarding performed by the routing core when the
//! configuration contains switches. A transmit acknowledgement is
//! synthesized for the sender; undersized frames are acknowledged with
//! `InvalidFrameFormat` instead of being transmitted.

use crate::error::IbResult;
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::{Direction, NanosecondsTime};
use crate::wire::{Envelope, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Minimum Ethernet frame size (without FCS).
pub const MIN_FRAME_SIZE: usize = 60;

/// 802.1Q tag protocol identifier.
const TPID_VLAN: [u8; 2] = [0x81, 0x00];

/// Link state of an Ethernet controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EthernetState {
    /// The controller is switched off
    Inactive,
    /// Activated but no link established
    LinkDown,
    /// Link established; frames flow
    LinkUp,
}

/// Result of a frame transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EthernetTransmitStatus {
    /// The frame was transmitted on the link
    Transmitted,
    /// The frame is malformed (e.g. shorter than 60 bytes)
    InvalidFrameFormat,
    /// The controller is not active
    ControllerInactive,
    /// No link is established
    LinkDown,
    /// The frame was dropped due to congestion
    Dropped,
}

/// A raw Ethernet frame delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetFrameEvent {
    /// Raw frame bytes: destination MAC, source MAC, (optional 802.1Q
    /// tag,) EtherType, payload
    pub frame: Vec<u8>,
    pub direction: Direction,
    /// Caller-supplied transmit id, preserved in the acknowledgement
    pub transmit_id: u64,
}

/// Transmit acknowledgement for the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetFrameTransmitEvent {
    pub transmit_id: u64,
    pub status: EthernetTransmitStatus,
    pub timestamp_ns: NanosecondsTime,
}

/// Extract the VLAN id of an 802.1Q-tagged frame, if any.
pub(crate) fn frame_vlan_id(frame: &[u8]) -> Option<u16> {
    if frame.len() >= 16 && frame[12..14] == TPID_VLAN {
        let tci = u16::from_be_bytes([frame[14], frame[15]]);
        Some(tci & 0x0FFF)
    } else {
        None
    }
}

/// An Ethernet controller inside a participant.
#[derive(Clone)]
pub struct EthernetController {
    inner: Arc<EthernetControllerInner>,
}

pub(crate) struct EthernetControllerInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    state: Mutex<EthernetState>,
    frame_handlers: HandlerRegistry<EthernetFrameEvent>,
    transmit_handlers: HandlerRegistry<EthernetFrameTransmitEvent>,
    state_handlers: HandlerRegistry<EthernetState>,
}

impl EthernetController {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<EthernetControllerInner>) {
        let inner = Arc::new(EthernetControllerInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            state: Mutex::new(EthernetState::Inactive),
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

    /// Current link state.
    pub fn state(&self) -> EthernetState {
        *self.inner.state.lock()
    }

    /// Switch the controller on. Simple mode establishes the link
    /// immediately.
    pub fn activate(&self) {
        self.inner.change_state(EthernetState::LinkUp);
    }

    /// Switch the controller off.
    pub fn deactivate(&self) {
        self.inner.change_state(EthernetState::Inactive);
    }

    /// Send a raw frame.
    ///
    /// The transmit id is an opaque caller value returned verbatim in the
    /// acknowledgement. Frames shorter than [`MIN_FRAME_SIZE`] are
    /// acknowledged with `InvalidFrameFormat` and not transmitted; an
    /// inactive controller acknowledges with `ControllerInactive`.
    pub fn send_frame(&self, frame: Vec<u8>, transmit_id: u64) -> IbResult<()> {
        let inner = &self.inner;
        let timestamp_ns = inner.bus.now_ns();

        let status = match *inner.state.lock() {
            EthernetState::Inactive => EthernetTransmitStatus::ControllerInactive,
            EthernetState::LinkDown => EthernetTransmitStatus::LinkDown,
            EthernetState::LinkUp if frame.len() < MIN_FRAME_SIZE => {
                EthernetTransmitStatus::InvalidFrameFormat
            }
            EthernetState::LinkUp => EthernetTransmitStatus::Transmitted,
        };

        if status == EthernetTransmitStatus::Transmitted {
            inner.bus.publish(
                &inner.descriptor,
                &inner.sequence,
                Payload::EthernetFrame(EthernetFrameEvent {
                    frame: frame.clone(),
                    direction: Direction::Rx,
                    transmit_id,
                }),
            )?;
            inner.bus.send_directed(
                &inner.descriptor,
                &inner.sequence,
                inner.descriptor.address,
                Payload::EthernetFrame(EthernetFrameEvent {
                    frame,
                    direction: Direction::Tx,
                    transmit_id,
                }),
                None,
            )?;
        }

        inner.bus.send_directed(
            &inner.descriptor,
            &inner.sequence,
            inner.descriptor.address,
            Payload::EthernetAck(EthernetFrameTransmitEvent {
                transmit_id,
                status,
                timestamp_ns,
            }),
            None,
        )
    }

    /// Register a frame handler filtered by direction.
    pub fn add_frame_handler(
        &self,
        filter: Direction,
        handler: impl Fn(&EthernetFrameEvent) + Send + Sync + 'static,
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

    pub fn add_frame_transmit_handler(
        &self,
        handler: impl Fn(&EthernetFrameTransmitEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.transmit_handlers.add(handler)
    }

    pub fn remove_frame_transmit_handler(&self, id: HandlerId) -> bool {
        self.inner.transmit_handlers.remove(id)
    }

    pub fn add_state_change_handler(
        &self,
        handler: impl Fn(&EthernetState) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.state_handlers.add(handler)
    }

    pub fn remove_state_change_handler(&self, id: HandlerId) -> bool {
        self.inner.state_handlers.remove(id)
    }
}

impl EthernetControllerInner {
    fn change_state(&self, new_state: EthernetState) {
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

impl BusController for EthernetControllerInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.payload {
            Payload::EthernetFrame(event) => {
                if event.direction == Direction::Rx && *self.state.lock() != EthernetState::LinkUp
                {
                    return;
                }
                self.bus.trace(&self.descriptor, Direction::Rx, envelope);
                self.frame_handlers.invoke(event);
            }
            Payload::EthernetAck(event) => {
                self.transmit_handlers.invoke(event);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_tag_extraction() {
        let mut frame = vec![0u8; MIN_FRAME_SIZE];
        assert_eq!(frame_vlan_id(&frame), None);

        frame[12] = 0x81;
        frame[13] = 0x00;
        frame[14] = 0x00;
        frame[15] = 0x2A; // VLAN 42
        assert_eq!(frame_vlan_id(&frame), Some(42));

        // Priority bits do not leak into the VLAN id
        frame[14] = 0xE0;
        assert_eq!(frame_vlan_id(&frame), Some(42));
    }

    #[test]
    fn test_short_frame_has_no_tag() {
        assert_eq!(frame_vlan_id(&[0x81, 0x00]), None);
    }
}
