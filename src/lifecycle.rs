//! # Lifecycle Coordination
//!
//! Moves every participant through the shared lifecycle, aggregates the
//! local states into a system state, and delivers the user-supplied
//! init/stop/shutdown callbacks and the simulation task.
//!
//! ## Participant state machine
//!
//! ```text
//! Invalid → Idle (bus up)
//! Idle → Initializing (ParticipantCommand{Initialize})
//! Initializing → Initialized (after the init callback)
//! Initialized → Running (SystemCommand{Run})
//! Running ⇄ Paused (local Pause/Continue)
//! Running|Paused → Stopping (SystemCommand{Stop}) → Stopped
//! Stopped → ShuttingDown (SystemCommand{Shutdown}) → Shutdown
//! any → Error (local failure)   any → ColdswapPrepare
//! ColdswapPrepare → ColdswapReady → ColdswapShutdown → Idle
//! ```
//!
//! All other transitions are invalid and are refused. Callbacks run on the
//! transport dispatch task; a panic in a user callback is caught and
//! escalates the participant to `Error` with the panic message as reason.
//!
//! ## System state aggregation
//!
//! The system state is the minimum participant state across the required
//! set under `Invalid < Idle < Initializing < Initialized < Running`,
//! with `Error`, the shutdown states, and the cold-swap states forcing the
//! matching aggregate.

use crate::config::{ParticipantControllerConfig, SyncType};
use crate::error::{IbError, IbResult};
use crate::metrics::{ExecTimeMonitor, ExecTimeVerdict};
use crate::participant::BusHandle;
use crate::services::{HandlerId, HandlerRegistry};
use crate::types::NanosecondsTime;
use crate::wire::{
    ParticipantCommand, ParticipantCommandKind, ParticipantStatusUpdate, Payload,
    RequiredParticipants, SystemCommand, SystemCommandKind,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    Invalid,
    Idle,
    Initializing,
    Initialized,
    Running,
    Paused,
    Stopping,
    Stopped,
    ColdswapPrepare,
    ColdswapReady,
    ColdswapShutdown,
    ColdswapIgnored,
    Error,
    ShuttingDown,
    Shutdown,
}

impl ParticipantState {
    /// Rank of the basic progression states for minimum aggregation.
    fn rank(self) -> u8 {
        match self {
            ParticipantState::Invalid => 0,
            ParticipantState::Idle => 1,
            ParticipantState::Initializing => 2,
            ParticipantState::Initialized => 3,
            _ => 4,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(self, to: ParticipantState) -> bool {
        use ParticipantState::*;
        if self == Shutdown {
            return false;
        }
        match to {
            Error => true,
            ColdswapPrepare => true,
            Idle => matches!(self, Invalid | ColdswapShutdown | ColdswapIgnored),
            Initializing => matches!(self, Idle | Stopped | Error),
            Initialized => self == Initializing,
            Running => matches!(self, Initialized | Paused),
            Paused => self == Running,
            Stopping => matches!(self, Running | Paused),
            Stopped => self == Stopping,
            ShuttingDown => matches!(self, Stopped | Error | ColdswapIgnored),
            Shutdown => self == ShuttingDown,
            ColdswapReady => self == ColdswapPrepare,
            ColdswapShutdown | ColdswapIgnored => self == ColdswapReady,
            Invalid => false,
        }
    }
}

/// Aggregated state of the required participant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    Invalid,
    Idle,
    Initializing,
    Initialized,
    Running,
    Paused,
    Stopping,
    Stopped,
    ColdswapPrepare,
    ColdswapReady,
    ColdswapShutdown,
    Error,
    ShuttingDown,
    Shutdown,
}

/// Fold the reported participant states into the system state.
///
/// `required` names the participants that count; every required
/// participant that has not reported yet counts as `Invalid`.
pub fn aggregate_system_state(
    states: &HashMap<String, ParticipantState>,
    required: &[String],
) -> SystemState {
    use ParticipantState as P;

    let observed: Vec<ParticipantState> = required
        .iter()
        .map(|name| states.get(name).copied().unwrap_or(P::Invalid))
        .collect();
    if observed.is_empty() {
        return SystemState::Invalid;
    }

    let any = |state: ParticipantState| observed.iter().any(|s| *s == state);
    let all = |state: ParticipantState| observed.iter().all(|s| *s == state);

    if any(P::Error) {
        return SystemState::Error;
    }
    if all(P::Shutdown) {
        return SystemState::Shutdown;
    }
    if any(P::ShuttingDown) || any(P::Shutdown) {
        return SystemState::ShuttingDown;
    }
    if any(P::ColdswapShutdown) {
        return SystemState::ColdswapShutdown;
    }
    if all(P::ColdswapReady) {
        return SystemState::ColdswapReady;
    }
    if any(P::ColdswapPrepare) || any(P::ColdswapReady) {
        return SystemState::ColdswapPrepare;
    }
    if any(P::Stopping) {
        return SystemState::Stopping;
    }
    if any(P::Stopped) {
        return if all(P::Stopped) {
            SystemState::Stopped
        } else {
            SystemState::Stopping
        };
    }
    if any(P::Paused) {
        return SystemState::Paused;
    }

    let minimum = observed
        .iter()
        .min_by_key(|s| s.rank())
        .copied()
        .unwrap_or(P::Invalid);
    match minimum {
        P::Invalid => SystemState::Invalid,
        P::Idle => SystemState::Idle,
        P::Initializing => SystemState::Initializing,
        P::Initialized => SystemState::Initialized,
        _ => SystemState::Running,
    }
}

type VoidHandler = Box<dyn FnMut() + Send>;
type InitHandler = Box<dyn FnMut(ParticipantCommandKind) + Send>;
type SimulationTask = Box<dyn FnMut(NanosecondsTime, NanosecondsTime) + Send>;

/// Per-participant lifecycle state, callbacks, and command handling.
pub(crate) struct LifecycleInner {
    participant_name: String,
    /// Whether this participant has a participant controller configured
    managed: bool,
    /// Whether this participant takes part in time synchronization
    pub(crate) synchronized: bool,
    allow_async_run: bool,
    state_tx: watch::Sender<ParticipantState>,
    init_handler: Mutex<Option<InitHandler>>,
    stop_handler: Mutex<Option<VoidHandler>>,
    shutdown_handler: Mutex<Option<VoidHandler>>,
    sim_task: Mutex<Option<SimulationTask>>,
    exec_monitor: ExecTimeMonitor,
    bus: BusHandle,
}

impl LifecycleInner {
    pub fn new(
        participant_name: String,
        controller_config: Option<&ParticipantControllerConfig>,
        allow_async_run: bool,
        bus: BusHandle,
    ) -> IbResult<Arc<Self>> {
        let exec_monitor = ExecTimeMonitor::new(
            controller_config
                .and_then(|c| c.exec_time_limit_soft_ms)
                .map(Duration::from_millis),
            controller_config
                .and_then(|c| c.exec_time_limit_hard_ms)
                .map(Duration::from_millis),
        )?;
        let (state_tx, _) = watch::channel(ParticipantState::Invalid);
        Ok(Arc::new(Self {
            participant_name,
            managed: controller_config.is_some(),
            synchronized: controller_config
                .map(|c| c.sync_type == SyncType::Synchronized)
                .unwrap_or(false),
            allow_async_run,
            state_tx,
            init_handler: Mutex::new(None),
            stop_handler: Mutex::new(None),
            shutdown_handler: Mutex::new(None),
            sim_task: Mutex::new(None),
            exec_monitor,
            bus,
        }))
    }

    pub fn state(&self) -> ParticipantState {
        *self.state_tx.borrow()
    }

    /// Whether this participant has a participant controller and thus
    /// takes part in the command-driven lifecycle.
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn subscribe(&self) -> watch::Receiver<ParticipantState> {
        self.state_tx.subscribe()
    }

    /// Attempt a transition; invalid ones are refused with a warning and
    /// leave the state untouched.
    fn try_transition(&self, to: ParticipantState, reason: &str) -> bool {
        let from = self.state();
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(
                "{}: refusing lifecycle transition {:?} -> {:?} ({})",
                self.participant_name, from, to, reason
            );
            return false;
        }
        debug!(
            "{}: lifecycle {:?} -> {:?} ({})",
            self.participant_name, from, to, reason
        );
        self.state_tx.send_replace(to);
        self.bus
            .broadcast_control(Payload::ParticipantStatus(ParticipantStatusUpdate {
                participant_name: self.participant_name.clone(),
                state: to,
                reason: reason.to_string(),
                enter_time_ns: crate::timesync::wall_clock_ns(),
            }));
        true
    }

    /// The transport mesh is established; announce `Idle`.
    pub fn bus_up(&self) {
        self.try_transition(ParticipantState::Idle, "bus is up");
    }

    /// Escalate to the `Error` state.
    pub fn escalate_error(&self, reason: &str) {
        error!("{}: entering Error state: {}", self.participant_name, reason);
        self.try_transition(ParticipantState::Error, reason);
    }

    /// Local cooperative pause.
    pub fn pause(&self, reason: &str) -> IbResult<()> {
        if self.try_transition(ParticipantState::Paused, reason) {
            Ok(())
        } else {
            Err(IbError::state(
                format!("{:?}", self.state()),
                "Pause requires the Running state",
            ))
        }
    }

    /// Resume from a cooperative pause.
    pub fn resume(&self, reason: &str) -> IbResult<()> {
        if self.try_transition(ParticipantState::Running, reason) {
            Ok(())
        } else {
            Err(IbError::state(
                format!("{:?}", self.state()),
                "Continue requires the Paused state",
            ))
        }
    }

    pub fn set_init_handler(&self, handler: InitHandler) {
        *self.init_handler.lock() = Some(handler);
    }

    pub fn set_stop_handler(&self, handler: VoidHandler) {
        *self.stop_handler.lock() = Some(handler);
    }

    pub fn set_shutdown_handler(&self, handler: VoidHandler) {
        *self.shutdown_handler.lock() = Some(handler);
    }

    pub fn set_simulation_task(&self, task: SimulationTask) {
        *self.sim_task.lock() = Some(task);
    }

    pub fn allow_async_run(&self) -> bool {
        self.allow_async_run
    }

    pub fn exec_summary(&self) -> crate::metrics::ExecTimeSummary {
        self.exec_monitor.summary()
    }

    /// Run a user callback, converting panics into the `Error` state.
    fn guarded<F: FnOnce()>(&self, what: &str, callback: F) -> bool {
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => true,
            Err(payload) => {
                let message = panic_message(payload);
                self.escalate_error(&format!("{what} callback panicked: {message}"));
                false
            }
        }
    }

    /// Process a command addressed to one participant.
    pub fn handle_participant_command(&self, command: &ParticipantCommand) {
        if command.target_participant != self.participant_name || !self.managed {
            return;
        }
        match command.kind {
            ParticipantCommandKind::Initialize | ParticipantCommandKind::Reinitialize => {
                if !self.try_transition(ParticipantState::Initializing, "initialize command") {
                    return;
                }
                let handler = self.init_handler.lock().take();
                if let Some(mut handler) = handler {
                    let kind = command.kind;
                    let ok = self.guarded("init", || handler(kind));
                    let mut slot = self.init_handler.lock();
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                    if !ok {
                        return;
                    }
                }
                self.try_transition(ParticipantState::Initialized, "initialization done");
            }
        }
    }

    /// Process a system-wide command.
    pub fn handle_system_command(&self, command: &SystemCommand) {
        if !self.managed {
            return;
        }
        match command.kind {
            SystemCommandKind::Run => {
                self.try_transition(ParticipantState::Running, "run command");
            }
            SystemCommandKind::Stop => {
                if !self.try_transition(ParticipantState::Stopping, "stop command") {
                    return;
                }
                let handler = self.stop_handler.lock().take();
                if let Some(mut handler) = handler {
                    let ok = self.guarded("stop", || handler());
                    let mut slot = self.stop_handler.lock();
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                    if !ok {
                        return;
                    }
                }
                self.try_transition(ParticipantState::Stopped, "stop handler done");
            }
            SystemCommandKind::Shutdown => {
                if !self.try_transition(ParticipantState::ShuttingDown, "shutdown command") {
                    return;
                }
                let handler = self.shutdown_handler.lock().take();
                if let Some(mut handler) = handler {
                    let ok = self.guarded("shutdown", || handler());
                    let mut slot = self.shutdown_handler.lock();
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                    if !ok {
                        return;
                    }
                }
                self.try_transition(ParticipantState::Shutdown, "shutdown handler done");
                info!("{}: lifecycle complete", self.participant_name);
            }
            SystemCommandKind::PrepareColdswap => {
                if self.try_transition(ParticipantState::ColdswapPrepare, "prepare coldswap") {
                    // This implementation has no pending work to wind down
                    // before a swap; readiness is immediate.
                    self.try_transition(ParticipantState::ColdswapReady, "coldswap prepared");
                }
            }
            SystemCommandKind::ExecuteColdswap => {
                if self.try_transition(ParticipantState::ColdswapShutdown, "execute coldswap") {
                    self.try_transition(ParticipantState::Idle, "coldswap reset");
                }
            }
        }
    }

    /// Invoke the simulation task for one tick or quantum.
    ///
    /// Execution time is recorded; a soft-limit breach warns, a hard-limit
    /// breach (and a panicking task) escalates to `Error` and reports
    /// failure to the caller.
    pub fn run_simulation_task(&self, now: NanosecondsTime, duration: NanosecondsTime) -> bool {
        let task = self.sim_task.lock().take();
        let Some(mut task) = task else {
            return true;
        };

        let start = Instant::now();
        let ok = self.guarded("simulation task", || task(now, duration));
        let elapsed = start.elapsed();
        {
            let mut slot = self.sim_task.lock();
            if slot.is_none() {
                *slot = Some(task);
            }
        }
        if !ok {
            return false;
        }

        match self.exec_monitor.record(elapsed) {
            ExecTimeVerdict::Ok => true,
            ExecTimeVerdict::SoftLimitExceeded(spent) => {
                warn!(
                    "{}: simulation task exceeded the soft execution limit ({:?})",
                    self.participant_name, spent
                );
                true
            }
            ExecTimeVerdict::HardLimitExceeded(spent) => {
                self.escalate_error(&format!(
                    "simulation task exceeded the hard execution limit ({spent:?})"
                ));
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Aggregating observer of all participant statuses.
pub(crate) struct MonitorInner {
    states: Mutex<HashMap<String, ParticipantState>>,
    required: Mutex<Vec<String>>,
    last_aggregate: Mutex<SystemState>,
    system_handlers: HandlerRegistry<SystemState>,
    participant_handlers: HandlerRegistry<ParticipantStatusUpdate>,
}

impl MonitorInner {
    pub fn new(required: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            required: Mutex::new(required),
            last_aggregate: Mutex::new(SystemState::Invalid),
            system_handlers: HandlerRegistry::new(),
            participant_handlers: HandlerRegistry::new(),
        })
    }

    /// Fold one status report into the aggregate.
    pub fn update(&self, status: &ParticipantStatusUpdate) {
        debug!(
            "'{}' entered {:?} at {} ({})",
            status.participant_name,
            status.state,
            status.enter_time().format("%H:%M:%S%.3f"),
            status.reason
        );
        self.states
            .lock()
            .insert(status.participant_name.clone(), status.state);
        self.participant_handlers.invoke(status);

        let aggregate = {
            let states = self.states.lock();
            let required = self.required.lock();
            aggregate_system_state(&states, &required)
        };
        let changed = {
            let mut last = self.last_aggregate.lock();
            if *last == aggregate {
                false
            } else {
                *last = aggregate;
                true
            }
        };
        if changed {
            debug!("system state is now {:?}", aggregate);
            self.system_handlers.invoke(&aggregate);
        }
    }

    pub fn set_required(&self, names: Vec<String>) {
        *self.required.lock() = names;
    }

    pub fn system_state(&self) -> SystemState {
        *self.last_aggregate.lock()
    }

    pub fn participant_state(&self, name: &str) -> Option<ParticipantState> {
        self.states.lock().get(name).copied()
    }

    pub fn add_system_state_handler(
        &self,
        handler: impl Fn(&SystemState) + Send + Sync + 'static,
    ) -> HandlerId {
        self.system_handlers.add(handler)
    }

    pub fn remove_system_state_handler(&self, id: HandlerId) -> bool {
        self.system_handlers.remove(id)
    }

    pub fn add_participant_status_handler(
        &self,
        handler: impl Fn(&ParticipantStatusUpdate) + Send + Sync + 'static,
    ) -> HandlerId {
        self.participant_handlers.add(handler)
    }

    pub fn remove_participant_status_handler(&self, id: HandlerId) -> bool {
        self.participant_handlers.remove(id)
    }
}

/// Public handle for observing participant and system states.
#[derive(Clone)]
pub struct SystemMonitor {
    pub(crate) inner: Arc<MonitorInner>,
}

impl SystemMonitor {
    /// The current aggregated system state.
    pub fn system_state(&self) -> SystemState {
        self.inner.system_state()
    }

    /// The last reported state of one participant.
    pub fn participant_state(&self, name: &str) -> Option<ParticipantState> {
        self.inner.participant_state(name)
    }

    /// Register a handler fired on every system-state change.
    pub fn register_system_state_handler(
        &self,
        handler: impl Fn(&SystemState) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.add_system_state_handler(handler)
    }

    pub fn unregister_system_state_handler(&self, id: HandlerId) -> bool {
        self.inner.remove_system_state_handler(id)
    }

    /// Register a handler fired on every participant status report.
    pub fn register_participant_status_handler(
        &self,
        handler: impl Fn(&ParticipantStatusUpdate) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.add_participant_status_handler(handler)
    }

    pub fn unregister_participant_status_handler(&self, id: HandlerId) -> bool {
        self.inner.remove_participant_status_handler(id)
    }
}

/// Public handle issuing lifecycle commands to the whole simulation.
#[derive(Clone)]
pub struct SystemController {
    pub(crate) bus: BusHandle,
}

impl SystemController {
    /// Declare the required participant set the system state aggregates
    /// over.
    pub fn set_required_participants(&self, names: Vec<String>) {
        self.bus
            .broadcast_control(Payload::RequiredParticipants(RequiredParticipants {
                names,
            }));
    }

    /// Command one participant to initialize.
    pub fn initialize(&self, participant: &str) {
        self.bus
            .broadcast_control(Payload::ParticipantCommand(ParticipantCommand {
                target_participant: participant.to_string(),
                kind: ParticipantCommandKind::Initialize,
            }));
    }

    /// Command one participant to re-initialize after a stop or error.
    pub fn reinitialize(&self, participant: &str) {
        self.bus
            .broadcast_control(Payload::ParticipantCommand(ParticipantCommand {
                target_participant: participant.to_string(),
                kind: ParticipantCommandKind::Reinitialize,
            }));
    }

    /// Start the simulation.
    pub fn run(&self) {
        self.system_command(SystemCommandKind::Run);
    }

    /// Stop the simulation; participants finish their current tick.
    pub fn stop(&self) {
        self.system_command(SystemCommandKind::Stop);
    }

    /// Shut the simulation down.
    pub fn shutdown(&self) {
        self.system_command(SystemCommandKind::Shutdown);
    }

    /// Begin a coordinated cold swap.
    pub fn prepare_coldswap(&self) {
        self.system_command(SystemCommandKind::PrepareColdswap);
    }

    /// Execute a prepared cold swap.
    pub fn execute_coldswap(&self) {
        self.system_command(SystemCommandKind::ExecuteColdswap);
    }

    fn system_command(&self, kind: SystemCommandKind) {
        self.bus
            .broadcast_control(Payload::SystemCommand(SystemCommand { kind }));
    }
}
