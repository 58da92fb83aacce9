//! # FlexRay Controller Service
//!
//! Protocol Operation Control (POC) state machine and slot-addressed TX
//! buffers. The POC progresses on `configure()` and explicit CHI commands;
//! simple mode collapses the time-consuming phases:
//!
//! ```text
//! DefaultConfig --configure--> Config --(ready)--> Ready
//! Ready --WAKEUP--> Wakeup --(pulse delivered)--> Ready
//! Ready --ALLOW_COLDSTART+RUN--> Startup --(sync)--> NormalActive
//! NormalActive --DEFERRED_HALT--> Halt ;  any --FREEZE--> Halt
//! ```
//!
//! `Config` and `Ready` are always traversed in order; there is no path
//! from `DefaultConfig` directly to `NormalActive`. In simple mode,
//! `update_tx_buffer` produces exactly one frame per call regardless of
//! the buffer's repetition configuration; cycle-accurate emission is a
//! detailed-simulation concern.

use crate::error::{IbError, IbResult};
use crate::participant::BusHandle;
use crate::services::{BusController, EndpointDescriptor, HandlerId, HandlerRegistry};
use crate::types::Direction;
use crate::wire::{Envelope, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// FlexRay channels a buffer or symbol applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlexRayChannel {
    None,
    A,
    B,
    AB,
}

/// Protocol Operation Control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PocState {
    DefaultConfig,
    Config,
    Ready,
    Startup,
    Wakeup,
    NormalActive,
    NormalPassive,
    Halt,
}

/// Controller Host Interface commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChiCommand {
    Run,
    DeferredHalt,
    Freeze,
    AllowColdstart,
    AllSlots,
    Wakeup,
}

/// Slot mode of the POC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotMode {
    KeySlot,
    AllPending,
    All,
}

/// Error mode of the POC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorMode {
    Active,
    Passive,
    CommHalt,
}

/// Cluster-wide FlexRay timing parameters (simple-mode subset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayClusterParameters {
    /// Number of attempts for a cold start before giving up
    pub g_cold_start_attempts: u8,
    /// Maximum cycle count value (always odd)
    pub g_cycle_count_max: u8,
    /// Duration of a static slot in macroticks
    pub gd_static_slot: u16,
    /// Number of static slots in the static segment
    pub g_number_of_static_slots: u16,
    /// Duration of the symbol window in macroticks
    pub gd_symbol_window: u8,
    /// Number of macroticks per cycle
    pub g_macro_per_cycle: u16,
}

impl Default for FlexRayClusterParameters {
    fn default() -> Self {
        Self {
            g_cold_start_attempts: 8,
            g_cycle_count_max: 63,
            gd_static_slot: 31,
            g_number_of_static_slots: 60,
            gd_symbol_window: 1,
            g_macro_per_cycle: 3636,
        }
    }
}

/// Node-specific FlexRay parameters (simple-mode subset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayNodeParameters {
    /// Channels the node is connected to
    pub p_channels: FlexRayChannel,
    /// The node's key slot id; 0 if none
    pub p_key_slot_id: u16,
    /// Whether the key slot is used for startup
    pub p_key_slot_used_for_startup: bool,
    /// Channel used for wakeup
    pub p_wakeup_channel: FlexRayChannel,
    /// Number of repetitions of the wakeup symbol
    pub p_wakeup_pattern: u8,
}

impl Default for FlexRayNodeParameters {
    fn default() -> Self {
        Self {
            p_channels: FlexRayChannel::AB,
            p_key_slot_id: 0,
            p_key_slot_used_for_startup: false,
            p_wakeup_channel: FlexRayChannel::A,
            p_wakeup_pattern: 33,
        }
    }
}

/// Transmission mode of a TX buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionMode {
    /// Transmit once per update
    SingleShot,
    /// Re-transmit the buffer content every matching cycle
    Continuous,
}

/// Configuration of one slot-addressed TX buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxBufferConfig {
    pub channels: FlexRayChannel,
    pub slot_id: u16,
    /// Base offset for cycle multiplexing (0..=63)
    pub offset: u8,
    /// Repetition for cycle multiplexing (power of two, 1..=64)
    pub repetition: u8,
    pub transmission_mode: TransmissionMode,
}

/// Complete controller configuration handed to `configure()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayControllerConfig {
    pub cluster_params: FlexRayClusterParameters,
    pub node_params: FlexRayNodeParameters,
    pub buffer_configs: Vec<TxBufferConfig>,
}

/// Header of a FlexRay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexRayHeader {
    /// Slot the frame is transmitted in
    pub frame_id: u16,
    /// Payload length in 16-bit words
    pub payload_length: u8,
    pub cycle_count: u8,
}

/// A FlexRay frame: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexRayFrame {
    pub header: FlexRayHeader,
    pub payload: Vec<u8>,
}

/// A frame delivery on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayFrameEvent {
    pub channel: FlexRayChannel,
    pub frame: FlexRayFrame,
}

/// Acknowledgement of a TX buffer emission, synthesized for the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayFrameTransmitEvent {
    pub tx_buffer_index: u16,
    pub channel: FlexRayChannel,
    pub frame: FlexRayFrame,
}

/// Symbol patterns observable on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlexRaySymbolPattern {
    /// Collision avoidance symbol / media access test symbol
    CasMts,
    /// Wakeup symbol
    Wus,
    /// Wakeup during operation pattern
    Wudop,
}

/// A symbol event on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRaySymbolEvent {
    pub channel: FlexRayChannel,
    pub pattern: FlexRaySymbolPattern,
}

/// Start of a new FlexRay cycle; emitted by detailed simulation only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayCycleStartEvent {
    pub cycle_counter: u64,
}

/// POC status snapshot, broadcast on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexRayPocStatusEvent {
    pub state: PocState,
    /// The POC halted due to an error condition requiring immediate halt
    pub freeze: bool,
    /// A halt request was received from the CHI
    pub chi_halt_request: bool,
    pub slot_mode: SlotMode,
    pub error_mode: ErrorMode,
}

struct PocStatus {
    state: PocState,
    freeze: bool,
    chi_halt_request: bool,
    coldstart_allowed: bool,
    slot_mode: SlotMode,
}

/// A FlexRay communication controller inside a participant.
#[derive(Clone)]
pub struct FlexRayController {
    inner: Arc<FlexRayControllerInner>,
}

pub(crate) struct FlexRayControllerInner {
    descriptor: EndpointDescriptor,
    bus: BusHandle,
    sequence: AtomicU64,
    poc: Mutex<PocStatus>,
    config: Mutex<Option<FlexRayControllerConfig>>,
    frame_handlers: HandlerRegistry<FlexRayFrameEvent>,
    transmit_handlers: HandlerRegistry<FlexRayFrameTransmitEvent>,
    poc_handlers: HandlerRegistry<FlexRayPocStatusEvent>,
    symbol_handlers: HandlerRegistry<FlexRaySymbolEvent>,
    cycle_start_handlers: HandlerRegistry<FlexRayCycleStartEvent>,
}

impl FlexRayController {
    pub(crate) fn create(
        descriptor: EndpointDescriptor,
        bus: BusHandle,
    ) -> (Self, Arc<FlexRayControllerInner>) {
        let inner = Arc::new(FlexRayControllerInner {
            descriptor,
            bus,
            sequence: AtomicU64::new(0),
            poc: Mutex::new(PocStatus {
                state: PocState::DefaultConfig,
                freeze: false,
                chi_halt_request: false,
                coldstart_allowed: false,
                slot_mode: SlotMode::KeySlot,
            }),
            config: Mutex::new(None),
            frame_handlers: HandlerRegistry::new(),
            transmit_handlers: HandlerRegistry::new(),
            poc_handlers: HandlerRegistry::new(),
            symbol_handlers: HandlerRegistry::new(),
            cycle_start_handlers: HandlerRegistry::new(),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Current POC state.
    pub fn poc_state(&self) -> PocState {
        self.inner.poc.lock().state
    }

    /// Apply the controller configuration.
    ///
    /// Traverses `Config` and settles in `Ready` (simple mode has no
    /// asynchronous configuration phase). Allowed from `DefaultConfig`,
    /// `Config`, `Ready`, and `Halt`.
    pub fn configure(&self, config: FlexRayControllerConfig) -> IbResult<()> {
        let inner = &self.inner;
        {
            let poc = inner.poc.lock();
            match poc.state {
                PocState::DefaultConfig | PocState::Config | PocState::Ready | PocState::Halt => {}
                state => {
                    return Err(IbError::state(
                        format!("{state:?}"),
                        "configure is not allowed in this POC state",
                    ));
                }
            }
        }
        *inner.config.lock() = Some(config);
        inner.transition(PocState::Config)?;
        inner.transition(PocState::Ready)
    }

    /// Replace the configuration of one TX buffer.
    pub fn reconfigure_tx_buffer(&self, index: u16, config: TxBufferConfig) -> IbResult<()> {
        let mut guard = self.inner.config.lock();
        let controller_config = guard
            .as_mut()
            .ok_or_else(|| IbError::state("DefaultConfig", "controller is not configured"))?;
        let slot = controller_config
            .buffer_configs
            .get_mut(index as usize)
            .ok_or_else(|| {
                IbError::state("Ready", format!("TX buffer {index} does not exist"))
            })?;
        *slot = config;
        Ok(())
    }

    /// Execute a CHI command.
    pub fn execute_cmd(&self, command: ChiCommand) -> IbResult<()> {
        let inner = &self.inner;
        match command {
            ChiCommand::AllowColdstart => {
                let mut poc = inner.poc.lock();
                if poc.state == PocState::DefaultConfig {
                    return Err(IbError::state(
                        "DefaultConfig",
                        "ALLOW_COLDSTART requires a configured controller",
                    ));
                }
                poc.coldstart_allowed = true;
                Ok(())
            }
            ChiCommand::Run => {
                {
                    let poc = inner.poc.lock();
                    if poc.state != PocState::Ready {
                        return Err(IbError::state(
                            format!("{:?}", poc.state),
                            "RUN requires the Ready state",
                        ));
                    }
                    if !poc.coldstart_allowed {
                        return Err(IbError::state(
                            "Ready",
                            "RUN requires a preceding ALLOW_COLDSTART",
                        ));
                    }
                }
                // Simple mode: startup and sync complete immediately, but
                // both POC phases are observable.
                inner.transition(PocState::Startup)?;
                inner.transition(PocState::NormalActive)
            }
            ChiCommand::Wakeup => {
                {
                    let poc = inner.poc.lock();
                    if poc.state != PocState::Ready {
                        return Err(IbError::state(
                            format!("{:?}", poc.state),
                            "WAKEUP requires the Ready state",
                        ));
                    }
                }
                inner.transition(PocState::Wakeup)?;
                let channel = inner
                    .config
                    .lock()
                    .as_ref()
                    .map(|c| c.node_params.p_wakeup_channel)
                    .unwrap_or(FlexRayChannel::A);
                inner.bus.publish(
                    &inner.descriptor,
                    &inner.sequence,
                    Payload::FlexRaySymbol(FlexRaySymbolEvent {
                        channel,
                        pattern: FlexRaySymbolPattern::Wus,
                    }),
                )?;
                inner.transition(PocState::Ready)
            }
            ChiCommand::DeferredHalt => {
                {
                    let mut poc = inner.poc.lock();
                    match poc.state {
                        PocState::NormalActive | PocState::NormalPassive => {
                            poc.chi_halt_request = true;
                        }
                        state => {
                            return Err(IbError::state(
                                format!("{state:?}"),
                                "DEFERRED_HALT requires normal operation",
                            ));
                        }
                    }
                }
                inner.transition(PocState::Halt)
            }
            ChiCommand::Freeze => {
                inner.poc.lock().freeze = true;
                inner.transition(PocState::Halt)
            }
            ChiCommand::AllSlots => {
                let mut poc = inner.poc.lock();
                poc.slot_mode = SlotMode::All;
                Ok(())
            }
        }
    }

    /// Update a TX buffer's payload, emitting exactly one frame.
    ///
    /// Requires `NormalActive`. The frame's slot id and channels come from
    /// the buffer's configuration; cycle multiplexing (offset/repetition)
    /// only takes effect in detailed simulation.
    pub fn update_tx_buffer(&self, index: u16, payload: Vec<u8>) -> IbResult<()> {
        let inner = &self.inner;
        {
            let poc = inner.poc.lock();
            if poc.state != PocState::NormalActive {
                return Err(IbError::state(
                    format!("{:?}", poc.state),
                    "UpdateTxBuffer requires NormalActive",
                ));
            }
        }
        let buffer = {
            let guard = inner.config.lock();
            let config = guard
                .as_ref()
                .ok_or_else(|| IbError::state("NormalActive", "controller is not configured"))?;
            config
                .buffer_configs
                .get(index as usize)
                .cloned()
                .ok_or_else(|| {
                    IbError::state("NormalActive", format!("TX buffer {index} does not exist"))
                })?
        };

        let frame = FlexRayFrame {
            header: FlexRayHeader {
                frame_id: buffer.slot_id,
                payload_length: payload.len().div_ceil(2) as u8,
                cycle_count: 0,
            },
            payload,
        };

        inner.bus.publish(
            &inner.descriptor,
            &inner.sequence,
            Payload::FlexRayFrame(FlexRayFrameEvent {
                channel: buffer.channels,
                frame: frame.clone(),
            }),
        )?;
        inner.bus.send_directed(
            &inner.descriptor,
            &inner.sequence,
            inner.descriptor.address,
            Payload::FlexRayAck(FlexRayFrameTransmitEvent {
                tx_buffer_index: index,
                channel: buffer.channels,
                frame,
            }),
            None,
        )
    }

    pub fn add_frame_handler(
        &self,
        handler: impl Fn(&FlexRayFrameEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.frame_handlers.add(handler)
    }

    pub fn remove_frame_handler(&self, id: HandlerId) -> bool {
        self.inner.frame_handlers.remove(id)
    }

    pub fn add_frame_transmit_handler(
        &self,
        handler: impl Fn(&FlexRayFrameTransmitEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.transmit_handlers.add(handler)
    }

    pub fn remove_frame_transmit_handler(&self, id: HandlerId) -> bool {
        self.inner.transmit_handlers.remove(id)
    }

    pub fn add_poc_status_handler(
        &self,
        handler: impl Fn(&FlexRayPocStatusEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.poc_handlers.add(handler)
    }

    pub fn remove_poc_status_handler(&self, id: HandlerId) -> bool {
        self.inner.poc_handlers.remove(id)
    }

    pub fn add_symbol_handler(
        &self,
        handler: impl Fn(&FlexRaySymbolEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.symbol_handlers.add(handler)
    }

    pub fn remove_symbol_handler(&self, id: HandlerId) -> bool {
        self.inner.symbol_handlers.remove(id)
    }

    pub fn add_cycle_start_handler(
        &self,
        handler: impl Fn(&FlexRayCycleStartEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.cycle_start_handlers.add(handler)
    }

    pub fn remove_cycle_start_handler(&self, id: HandlerId) -> bool {
        self.inner.cycle_start_handlers.remove(id)
    }
}

impl FlexRayControllerInner {
    /// Move the POC to `new_state`, notify local handlers, and broadcast
    /// the status on the link.
    fn transition(&self, new_state: PocState) -> IbResult<()> {
        let event = {
            let mut poc = self.poc.lock();
            poc.state = new_state;
            FlexRayPocStatusEvent {
                state: poc.state,
                freeze: poc.freeze,
                chi_halt_request: poc.chi_halt_request,
                slot_mode: poc.slot_mode,
                error_mode: ErrorMode::Active,
            }
        };
        self.poc_handlers.invoke(&event);
        self.bus.publish(
            &self.descriptor,
            &self.sequence,
            Payload::FlexRayPocStatus(event),
        )
    }
}

impl BusController for FlexRayControllerInner {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        match &envelope.payload {
            Payload::FlexRayFrame(event) => {
                self.bus.trace(&self.descriptor, Direction::Rx, envelope);
                self.frame_handlers.invoke(event);
            }
            Payload::FlexRayAck(event) => {
                self.transmit_handlers.invoke(event);
            }
            Payload::FlexRaySymbol(event) => {
                self.symbol_handlers.invoke(event);
            }
            Payload::FlexRayCycleStart(event) => {
                self.cycle_start_handlers.invoke(event);
            }
            // POC status of a remote controller; own handlers fire on
            // local transitions only.
            Payload::FlexRayPocStatus(_) => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_are_plausible() {
        let cluster = FlexRayClusterParameters::default();
        assert_eq!(cluster.g_cycle_count_max % 2, 1);
        assert!(cluster.g_number_of_static_slots > 0);

        let node = FlexRayNodeParameters::default();
        assert_eq!(node.p_channels, FlexRayChannel::AB);
    }

    #[test]
    fn test_payload_length_is_in_words() {
        // 5 bytes round up to 3 sixteen-bit words
        assert_eq!(5usize.div_ceil(2), 3);
    }
}
