//! # Time-Synchronization Engine
//!
//! One policy is selected per simulation:
//!
//! - **Unsynchronized**: no virtual clock, wall-time timestamps, no
//!   simulation task.
//! - **Strict** (tick/tick-done): the sync master broadcasts `Tick(now)`;
//!   every synchronized participant runs its simulation task for the tick
//!   and answers `TickDone`; the master waits for all answers before the
//!   next tick. No participant enters tick `T+1` before every required
//!   participant finished tick `T`.
//! - **Loose** (quantum-grant): each participant requests the quantum
//!   `[now, now+period]`; the master grants once every requester is
//!   pending; the grant triggers the simulation task.
//! - **DistributedQuantum**: every participant announces its next ready
//!   time; a participant advances once all required peers announced a time
//!   at least as large, making the effective tick the maximum of the
//!   announcements. No central grant is involved.
//!
//! The master checks for cancellation before emitting a tick or grant:
//! a `Stop` that arrives while a tick is in flight lets the tick complete
//! and prevents the next one. A paused participant defers its pending
//! tick or grant until `Continue`.

use crate::config::SyncPolicy;
use crate::lifecycle::{LifecycleInner, ParticipantState, SystemState};
use crate::participant::BusHandle;
use crate::types::NanosecondsTime;
use crate::wire::{
    NextSimTask, ParticipantStatusUpdate, Payload, QuantumGrant, QuantumRequest, Tick, TickDone,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Current wall-clock time as nanoseconds since the Unix epoch.
///
/// Falls back to 0 for clocks before the epoch rather than panicking.
pub fn wall_clock_ns() -> NanosecondsTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as NanosecondsTime
}

/// The participant's clock: virtual time when synchronized, wall time
/// otherwise.
pub struct TimeProvider {
    virtual_now: AtomicU64,
    synchronized: bool,
}

impl TimeProvider {
    pub fn new(synchronized: bool) -> Self {
        Self {
            virtual_now: AtomicU64::new(0),
            synchronized,
        }
    }

    /// The timestamp outgoing messages are stamped with.
    pub fn now_ns(&self) -> NanosecondsTime {
        if self.synchronized {
            self.virtual_now.load(Ordering::Acquire)
        } else {
            wall_clock_ns()
        }
    }

    /// Advance the virtual clock (no-op for unsynchronized participants).
    pub fn advance_to(&self, now: NanosecondsTime) {
        if self.synchronized {
            self.virtual_now.store(now, Ordering::Release);
        }
    }
}

/// Per-participant synchronization state; driven from the dispatch task.
pub(crate) struct TimeSyncInner {
    policy: SyncPolicy,
    period_ns: NanosecondsTime,
    participant_name: String,
    is_master: bool,
    /// Whether this participant runs a simulation task
    synchronized: bool,
    /// The synchronized participants forming the tick barrier
    required: Vec<String>,
    time: Arc<TimeProvider>,
    lifecycle: Arc<LifecycleInner>,
    bus: BusHandle,

    /// Master: the system is in a state that allows advancing time
    master_active: AtomicBool,
    /// Master: ticking has started
    started: AtomicBool,
    /// Master (strict): participants the current tick still waits for
    awaiting: Mutex<HashSet<String>>,
    /// Master (strict): virtual time of the current tick
    master_now: AtomicU64,
    /// Master (loose): pending quantum requests
    pending_requests: Mutex<HashMap<String, QuantumRequest>>,

    /// Participant: tick or grant deferred while paused
    deferred: Mutex<Option<Payload>>,
    /// Distributed: own next ready time
    my_next: AtomicU64,
    /// Distributed: announced next ready times of all peers
    peer_next: Mutex<HashMap<String, NanosecondsTime>>,
}

impl TimeSyncInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: SyncPolicy,
        period_ns: NanosecondsTime,
        participant_name: String,
        is_master: bool,
        synchronized: bool,
        required: Vec<String>,
        time: Arc<TimeProvider>,
        lifecycle: Arc<LifecycleInner>,
        bus: BusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy,
            period_ns,
            participant_name,
            is_master,
            synchronized,
            required,
            time,
            lifecycle,
            bus,
            master_active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            awaiting: Mutex::new(HashSet::new()),
            master_now: AtomicU64::new(0),
            pending_requests: Mutex::new(HashMap::new()),
            deferred: Mutex::new(None),
            my_next: AtomicU64::new(0),
            peer_next: Mutex::new(HashMap::new()),
        })
    }

    /// Dispatch one synchronization payload.
    pub fn handle_payload(&self, payload: &Payload) {
        match payload {
            Payload::Tick(tick) => self.on_tick(*tick),
            Payload::TickDone(done) => self.on_tick_done(done),
            Payload::QuantumRequest(request) => self.on_quantum_request(request),
            Payload::QuantumGrant(grant) => self.on_quantum_grant(grant),
            Payload::NextSimTask(next) => self.on_next_sim_task(next),
            _ => {}
        }
    }

    /// Observe a participant status report (including the own one).
    pub fn on_participant_status(&self, status: &ParticipantStatusUpdate) {
        if status.participant_name != self.participant_name || !self.synchronized {
            return;
        }
        match status.state {
            ParticipantState::Running => {
                match self.policy {
                    SyncPolicy::Loose => {
                        // First entry into Running requests the first
                        // quantum; after Continue a deferred grant resumes.
                        if !self.replay_deferred() && self.my_next.load(Ordering::Acquire) == 0 {
                            self.request_quantum();
                        }
                    }
                    SyncPolicy::DistributedQuantum => {
                        if !self.started.swap(true, Ordering::AcqRel) {
                            self.announce_next(self.my_next.load(Ordering::Acquire));
                            self.evaluate_distributed();
                        }
                    }
                    SyncPolicy::Strict => {
                        self.replay_deferred();
                    }
                    SyncPolicy::Unsynchronized => {}
                }
            }
            _ => {}
        }
    }

    /// Observe the aggregated system state; gates the master.
    pub fn on_system_state(&self, state: SystemState) {
        if !self.is_master {
            return;
        }
        match state {
            SystemState::Running => {
                self.master_active.store(true, Ordering::Release);
                match self.policy {
                    SyncPolicy::Strict => {
                        if !self.started.swap(true, Ordering::AcqRel) {
                            self.send_tick();
                        } else if self.awaiting.lock().is_empty() {
                            // Resuming from Paused with a completed tick
                            self.advance_and_tick();
                        }
                    }
                    SyncPolicy::Loose => self.try_grant(),
                    _ => {}
                }
            }
            SystemState::Paused => {
                self.master_active.store(false, Ordering::Release);
            }
            _ => {
                if self.master_active.swap(false, Ordering::AcqRel) {
                    debug!(
                        "{}: sync master stops at {:?}",
                        self.participant_name, state
                    );
                }
            }
        }
    }

    /// Whether the master may advance virtual time right now.
    ///
    /// The aggregate gate (`master_active`) lags the own lifecycle by one
    /// dispatch round; checking the local state as well guarantees that a
    /// Stop processed between two tick completions prevents the next tick.
    fn may_advance(&self) -> bool {
        if !self.master_active.load(Ordering::Acquire) {
            return false;
        }
        !self.lifecycle.is_managed() || self.lifecycle.state() == ParticipantState::Running
    }

    // -- strict ----------------------------------------------------------

    fn send_tick(&self) {
        let now = self.master_now.load(Ordering::Acquire);
        {
            let mut awaiting = self.awaiting.lock();
            awaiting.clear();
            awaiting.extend(self.required.iter().cloned());
        }
        trace!("{}: tick at {} ns", self.participant_name, now);
        self.bus.broadcast_control(Payload::Tick(Tick {
            now_ns: now,
            duration_ns: self.period_ns,
        }));
    }

    fn advance_and_tick(&self) {
        self.master_now
            .fetch_add(self.period_ns, Ordering::AcqRel);
        self.send_tick();
    }

    fn on_tick(&self, tick: Tick) {
        if !self.synchronized || self.policy != SyncPolicy::Strict {
            return;
        }
        match self.lifecycle.state() {
            ParticipantState::Running => self.execute_tick(tick),
            ParticipantState::Paused => {
                *self.deferred.lock() = Some(Payload::Tick(tick));
            }
            state => {
                trace!(
                    "{}: ignoring tick in state {:?}",
                    self.participant_name,
                    state
                );
            }
        }
    }

    fn execute_tick(&self, tick: Tick) {
        self.time.advance_to(tick.now_ns);
        if !self
            .lifecycle
            .run_simulation_task(tick.now_ns, tick.duration_ns)
        {
            return;
        }
        self.bus.broadcast_control(Payload::TickDone(TickDone {
            participant_name: self.participant_name.clone(),
            now_ns: tick.now_ns,
        }));
    }

    fn on_tick_done(&self, done: &TickDone) {
        if !self.is_master || self.policy != SyncPolicy::Strict {
            return;
        }
        let complete = {
            let mut awaiting = self.awaiting.lock();
            awaiting.remove(&done.participant_name);
            awaiting.is_empty()
        };
        // Cancellation check: a Stop processed before the last TickDone
        // prevents the next tick.
        if complete && self.may_advance() {
            self.advance_and_tick();
        }
    }

    // -- loose -----------------------------------------------------------

    fn request_quantum(&self) {
        let start = self.my_next.load(Ordering::Acquire);
        self.bus
            .broadcast_control(Payload::QuantumRequest(QuantumRequest {
                participant_name: self.participant_name.clone(),
                start_ns: start,
                duration_ns: self.period_ns,
            }));
    }

    fn on_quantum_request(&self, request: &QuantumRequest) {
        if !self.is_master || self.policy != SyncPolicy::Loose {
            return;
        }
        self.pending_requests
            .lock()
            .insert(request.participant_name.clone(), request.clone());
        self.try_grant();
    }

    fn try_grant(&self) {
        if !self.may_advance() {
            return;
        }
        let grants: Vec<QuantumRequest> = {
            let mut pending = self.pending_requests.lock();
            let all_present = self
                .required
                .iter()
                .all(|name| pending.contains_key(name));
            if !all_present {
                return;
            }
            pending.drain().map(|(_, request)| request).collect()
        };
        for request in grants {
            self.bus.broadcast_control(Payload::QuantumGrant(QuantumGrant {
                participant_name: request.participant_name,
                start_ns: request.start_ns,
                duration_ns: request.duration_ns,
            }));
        }
    }

    fn on_quantum_grant(&self, grant: &QuantumGrant) {
        if !self.synchronized
            || self.policy != SyncPolicy::Loose
            || grant.participant_name != self.participant_name
        {
            return;
        }
        match self.lifecycle.state() {
            ParticipantState::Running => self.execute_grant(grant.clone()),
            ParticipantState::Paused => {
                *self.deferred.lock() = Some(Payload::QuantumGrant(grant.clone()));
            }
            _ => {}
        }
    }

    fn execute_grant(&self, grant: QuantumGrant) {
        self.time.advance_to(grant.start_ns);
        if !self
            .lifecycle
            .run_simulation_task(grant.start_ns, grant.duration_ns)
        {
            return;
        }
        self.my_next
            .store(grant.start_ns + grant.duration_ns, Ordering::Release);
        if self.lifecycle.state() == ParticipantState::Running {
            self.request_quantum();
        }
    }

    // -- distributed quantum ----------------------------------------------

    fn announce_next(&self, next: NanosecondsTime) {
        self.peer_next
            .lock()
            .insert(self.participant_name.clone(), next);
        self.bus
            .broadcast_control(Payload::NextSimTask(NextSimTask {
                participant_name: self.participant_name.clone(),
                next_ns: next,
            }));
    }

    fn on_next_sim_task(&self, next: &NextSimTask) {
        if self.policy != SyncPolicy::DistributedQuantum {
            return;
        }
        self.peer_next
            .lock()
            .insert(next.participant_name.clone(), next.next_ns);
        if self.synchronized {
            self.evaluate_distributed();
        }
    }

    /// Advance while every required peer has announced a next time at
    /// least as large as the own one (the effective tick is the maximum).
    fn evaluate_distributed(&self) {
        loop {
            if self.lifecycle.state() != ParticipantState::Running {
                return;
            }
            let my_next = self.my_next.load(Ordering::Acquire);
            let ready = {
                let peers = self.peer_next.lock();
                self.required.iter().all(|name| {
                    peers
                        .get(name)
                        .map(|next| *next >= my_next)
                        .unwrap_or(false)
                })
            };
            if !ready {
                return;
            }
            self.time.advance_to(my_next);
            if !self.lifecycle.run_simulation_task(my_next, self.period_ns) {
                return;
            }
            let next = my_next + self.period_ns;
            self.my_next.store(next, Ordering::Release);
            self.announce_next(next);
        }
    }

    // -- shared ------------------------------------------------------------

    /// Replay a tick or grant deferred while paused. Returns whether one
    /// was replayed.
    fn replay_deferred(&self) -> bool {
        let deferred = self.deferred.lock().take();
        match deferred {
            Some(Payload::Tick(tick)) => {
                self.execute_tick(tick);
                true
            }
            Some(Payload::QuantumGrant(grant)) => {
                self.execute_grant(grant);
                true
            }
            Some(other) => {
                warn!(
                    "{}: unexpected deferred sync payload {:?}",
                    self.participant_name, other
                );
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_is_monotonic_enough() {
        let a = wall_clock_ns();
        let b = wall_clock_ns();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000_000_000); // after 2017 in ns
    }

    #[test]
    fn test_time_provider_virtual_vs_wall() {
        let synced = TimeProvider::new(true);
        assert_eq!(synced.now_ns(), 0);
        synced.advance_to(5_000_000);
        assert_eq!(synced.now_ns(), 5_000_000);

        let unsynced = TimeProvider::new(false);
        unsynced.advance_to(5_000_000);
        assert!(unsynced.now_ns() > 5_000_000);
    }
}
