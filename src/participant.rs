//! # Participant
//!
//! One process endpoint of the simulation: owns the controllers, the
//! connection mesh, and the single dispatch task that serializes every
//! inbound message, user callback, and simulation-task invocation.
//!
//! ## Bring-up
//!
//! `Participant::connect` validates the configuration, binds the peer
//! listener(s), announces itself to the registry, dials every already
//! connected peer from the `KnownParticipants` reply, and starts accepting
//! late joiners. Once the mesh is up the participant enters the `Idle`
//! lifecycle state; from then on the registry is off the critical path.
//!
//! ## Ownership
//!
//! The participant owns its controllers in an arena indexed by endpoint
//! id; the routing tables hold addresses, not references, and are
//! invalidated in bulk at shutdown. Connections close in LIFO order of
//! their opening.

use crate::config::{Config, DataPortConfig, ParticipantConfig, RpcPortConfig, SyncPolicy};
use crate::error::{IbError, IbResult};
use crate::lifecycle::{
    LifecycleInner, MonitorInner, ParticipantState, SystemController, SystemMonitor,
};
use crate::metrics::ExecTimeSummary;
use crate::registry::announce_to_registry;
use crate::routing::{LinkSimulator, Router};
use crate::services::can::CanController;
use crate::services::data::{DataPublisher, DataSubscriber};
use crate::services::ethernet::EthernetController;
use crate::services::flexray::FlexRayController;
use crate::services::lin::LinController;
use crate::services::rpc::{RpcClient, RpcServer};
use crate::services::{BusController, EndpointDescriptor, TraceSink};
use crate::timesync::{TimeProvider, TimeSyncInner};
use crate::transport::{
    read_envelope, tcp, write_envelope, DeliveryPolicy, PeerLink, PeerStream, SocketOptions,
};
use crate::types::{
    Direction, EndpointAddress, EndpointId, NanosecondsTime, ParticipantId, ServiceKind,
    CONTROL_ENDPOINT, REGISTRY_PARTICIPANT_ID,
};
use crate::wire::{
    Envelope, LogMessage, ParticipantAnnouncement, ParticipantCommandKind, Payload,
    SubscriptionAnnouncement, PROTOCOL_VERSION,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the dispatch queue feeding the serialized event loop.
const DISPATCH_QUEUE_DEPTH: usize = 4096;

/// Events processed by the participant's dispatch task.
pub(crate) enum DispatchEvent {
    /// An envelope read from a peer connection
    Inbound(ParticipantId, Envelope),
    /// A locally produced envelope (loopback delivery)
    Local(Envelope),
    /// A peer connection was lost
    PeerLost(ParticipantId),
}

/// Shared sending fabric of one participant: peer links, routing tables,
/// clock, and the dispatch queue. Cloned into every controller.
pub(crate) struct BusCore {
    participant_id: ParticipantId,
    participant_name: String,
    peers: RwLock<HashMap<ParticipantId, PeerLink>>,
    /// Insertion order of peer connections, for LIFO close
    peer_order: Mutex<Vec<ParticipantId>>,
    registry_link: Mutex<Option<PeerLink>>,
    router: Router,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
    time: Arc<TimeProvider>,
    control_sequence: AtomicU64,
    /// Announcements of all local endpoints, replayed to late joiners
    local_announcements: RwLock<Vec<SubscriptionAnnouncement>>,
    /// Last own lifecycle status, replayed to late joiners
    status_snapshot: Mutex<Option<crate::wire::ParticipantStatusUpdate>>,
    trace_sinks: RwLock<Vec<Arc<dyn TraceSink>>>,
}

pub(crate) type BusHandle = Arc<BusCore>;

impl BusCore {
    pub fn now_ns(&self) -> NanosecondsTime {
        self.time.now_ns()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn make_envelope(
        &self,
        sender: EndpointAddress,
        sequence: u64,
        link: Option<String>,
        recipient: Option<EndpointAddress>,
        timestamp_ns: NanosecondsTime,
        payload: Payload,
    ) -> Envelope {
        Envelope {
            interface_id: payload.interface_id(),
            sender,
            sequence,
            timestamp_ns,
            link,
            recipient,
            payload,
        }
    }

    /// Broadcast a control payload to every peer and to the own dispatch
    /// queue (lifecycle, time sync, subscriptions).
    pub fn broadcast_control(&self, payload: Payload) {
        if let Payload::ParticipantStatus(status) = &payload {
            if status.participant_name == self.participant_name {
                *self.status_snapshot.lock() = Some(status.clone());
            }
        }
        let envelope = self.make_envelope(
            EndpointAddress::new(self.participant_id, CONTROL_ENDPOINT),
            self.control_sequence.fetch_add(1, Ordering::Relaxed),
            None,
            None,
            self.time.now_ns(),
            payload,
        );
        for peer in self.peers.read().values() {
            if let Err(error) = peer.send(envelope.clone(), DeliveryPolicy::Reliable) {
                warn!(
                    "{}: control broadcast to '{}' failed: {}",
                    self.participant_name, peer.participant_name, error
                );
            }
        }
        self.loopback(envelope);
    }

    /// Forward a payload to the registry connection (remote logging).
    pub fn send_to_registry(&self, payload: Payload) {
        let envelope = self.make_envelope(
            EndpointAddress::new(self.participant_id, CONTROL_ENDPOINT),
            self.control_sequence.fetch_add(1, Ordering::Relaxed),
            None,
            None,
            self.time.now_ns(),
            payload,
        );
        if let Some(link) = self.registry_link.lock().as_ref() {
            let _ = link.send(envelope, DeliveryPolicy::BestEffort);
        }
    }

    /// Link-routed publish: direct sends to every matching peer plus
    /// loopback delivery to the local controllers on the link. Ethernet
    /// frames additionally fan out through configured VLAN switches.
    pub fn publish(
        &self,
        descriptor: &EndpointDescriptor,
        sequence: &AtomicU64,
        payload: Payload,
    ) -> IbResult<()> {
        let sequence_number = sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_ns = self.time.now_ns();

        // Detailed-mode seam: a link claimed by a network simulator gets
        // the traffic unmodified and skips simple-mode distribution.
        if let Some(simulator) = self.router.simulator_for(&descriptor.link) {
            let envelope = self.make_envelope(
                descriptor.address,
                sequence_number,
                Some(descriptor.link.clone()),
                None,
                timestamp_ns,
                payload,
            );
            self.trace(descriptor, Direction::Tx, &envelope);
            return simulator.try_send(envelope).map_err(|_| {
                IbError::Transport(format!(
                    "detailed simulator for link '{}' is congested",
                    descriptor.link
                ))
            });
        }

        let mut links = vec![descriptor.link.clone()];
        if let Payload::EthernetFrame(event) = &payload {
            links.extend(self.router.switch_fanout(&descriptor.link, &event.frame));
        }

        let mut first_error = None;
        for target_link in links {
            let envelope = self.make_envelope(
                descriptor.address,
                sequence_number,
                Some(target_link.clone()),
                None,
                timestamp_ns,
                payload.clone(),
            );
            self.trace(descriptor, Direction::Tx, &envelope);

            let peers = match &payload {
                Payload::DataMessage(_) => {
                    self.router.peers_for_data(&target_link, &descriptor.labels)
                }
                _ => self.router.peers_on_link(&target_link),
            };
            for participant in peers {
                let link = self.peers.read().get(&participant).cloned();
                if let Some(link) = link {
                    if let Err(error) = link.send(envelope.clone(), DeliveryPolicy::Reliable) {
                        warn!(
                            "{}: publish on '{}' to '{}' failed: {}",
                            self.participant_name, target_link, link.participant_name, error
                        );
                        first_error.get_or_insert(error);
                    }
                }
            }
            self.loopback(envelope);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Directed point-to-point send (history replay, RPC results, local
    /// acknowledgements).
    pub fn send_directed(
        &self,
        descriptor: &EndpointDescriptor,
        sequence: &AtomicU64,
        recipient: EndpointAddress,
        payload: Payload,
        timestamp_override: Option<NanosecondsTime>,
    ) -> IbResult<()> {
        let envelope = self.make_envelope(
            descriptor.address,
            sequence.fetch_add(1, Ordering::Relaxed),
            Some(descriptor.link.clone()),
            Some(recipient),
            timestamp_override.unwrap_or_else(|| self.time.now_ns()),
            payload,
        );
        self.trace(descriptor, Direction::Tx, &envelope);

        if recipient.participant == self.participant_id {
            self.loopback(envelope);
            return Ok(());
        }
        let link = self.peers.read().get(&recipient.participant).cloned();
        match link {
            Some(link) => link.send(envelope, DeliveryPolicy::Reliable),
            None => Err(IbError::Transport(format!(
                "no connection to participant {}",
                recipient.participant
            ))),
        }
    }

    /// Deliver an envelope built now to the own dispatch queue after a
    /// delay (RPC timeouts).
    pub fn loopback_later(
        &self,
        delay: Duration,
        descriptor: &EndpointDescriptor,
        sequence: &AtomicU64,
        payload: Payload,
    ) {
        let envelope = self.make_envelope(
            descriptor.address,
            sequence.fetch_add(1, Ordering::Relaxed),
            Some(descriptor.link.clone()),
            Some(descriptor.address),
            self.time.now_ns(),
            payload,
        );
        let dispatch = self.dispatch_tx.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "{}: no runtime available for a delayed delivery, dropping it",
                self.participant_name
            );
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = dispatch.send(DispatchEvent::Local(envelope)).await;
        });
    }

    fn loopback(&self, envelope: Envelope) {
        if self.dispatch_tx.try_send(DispatchEvent::Local(envelope)).is_err() {
            warn!(
                "{}: dispatch queue full, dropping loopback message",
                self.participant_name
            );
        }
    }

    /// Hand an envelope to the trace sinks the controller is bound to.
    pub fn trace(&self, descriptor: &EndpointDescriptor, direction: Direction, envelope: &Envelope) {
        if descriptor.trace_sinks.is_empty() {
            return;
        }
        let sinks = self.trace_sinks.read();
        for sink in sinks.iter() {
            if descriptor.trace_sinks.iter().any(|name| name == sink.name()) {
                sink.trace(direction, envelope);
            }
        }
    }

    /// Register a peer connection and remember its opening order.
    fn register_peer(&self, link: PeerLink) {
        let id = link.participant_id;
        self.peers.write().insert(id, link);
        self.peer_order.lock().push(id);
    }

    /// Register a local endpoint: routing table, announcement snapshot,
    /// broadcast to peers, loopback for the local controllers.
    fn announce_endpoint(&self, announcement: SubscriptionAnnouncement) {
        self.router.register_local(announcement.clone());
        self.local_announcements.write().push(announcement.clone());
        self.broadcast_control(Payload::Subscription(announcement));
    }
}

/// The participant: entry point of the public API.
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

pub(crate) struct ParticipantInner {
    name: String,
    id: ParticipantId,
    domain_id: u32,
    config: Config,
    participant_config: ParticipantConfig,
    bus: BusHandle,
    controllers: RwLock<Vec<Arc<dyn BusController>>>,
    lifecycle: Arc<LifecycleInner>,
    monitor: Arc<MonitorInner>,
    timesync: Arc<TimeSyncInner>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(unix)]
    domain_socket_path: Mutex<Option<std::path::PathBuf>>,
}

impl Participant {
    /// Join the domain: validate the configuration, connect to the
    /// registry, and build the peer mesh.
    pub async fn connect(config: Config, participant_name: &str, domain_id: u32) -> IbResult<Self> {
        config.validate()?;
        let participant_config = config.find_participant(participant_name)?.clone();
        let middleware = &config.middleware;
        let options = SocketOptions::from(middleware);

        // Peer listeners come up before the announcement so that the
        // advertised endpoints are immediately reachable.
        let listener = tcp::bind_listener(&middleware.registry.hostname).await?;
        let listen_addr = listener.local_addr()?;
        let advertised_tcp = format!("{}:{}", middleware.registry.hostname, listen_addr.port());

        #[cfg(unix)]
        let (uds_listener, uds_path) = if middleware.enable_domain_sockets {
            let path = crate::transport::domain_socket::socket_path(domain_id, participant_name);
            let listener = crate::transport::domain_socket::bind(&path)?;
            (Some(listener), Some(path))
        } else {
            (None, None)
        };

        // Registry handshake.
        let registry_endpoint = format!(
            "{}:{}",
            middleware.registry.hostname, middleware.registry.port
        );
        let mut registry_stream = tcp::connect_with_retries(
            &registry_endpoint,
            &options,
            middleware.registry.connect_attempts,
        )
        .await?;
        #[cfg(unix)]
        let advertised_uds = uds_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        #[cfg(not(unix))]
        let advertised_uds: Option<String> = None;

        let known = announce_to_registry(
            &mut registry_stream,
            ParticipantAnnouncement {
                participant_id: None,
                participant_name: participant_name.to_string(),
                domain_id,
                protocol_version: PROTOCOL_VERSION,
                tcp_endpoint: advertised_tcp.clone(),
                domain_socket: advertised_uds.clone(),
                log_from_remotes: participant_config.logger.log_from_remotes,
            },
        )
        .await?;
        let participant_id = known.assigned_id;
        info!(
            "'{}' joined domain {} as participant {}",
            participant_name, domain_id, participant_id
        );

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);

        let time_sync_config = &config.simulation_setup.time_sync;
        let synchronized = time_sync_config.sync_policy != SyncPolicy::Unsynchronized
            && participant_config
                .participant_controller
                .as_ref()
                .map(|pc| pc.sync_type == crate::config::SyncType::Synchronized)
                .unwrap_or(false);
        let time = Arc::new(TimeProvider::new(synchronized));

        let bus: BusHandle = Arc::new(BusCore {
            participant_id,
            participant_name: participant_name.to_string(),
            peers: RwLock::new(HashMap::new()),
            peer_order: Mutex::new(Vec::new()),
            registry_link: Mutex::new(None),
            router: Router::new(config.simulation_setup.switches.clone()),
            dispatch_tx: dispatch_tx.clone(),
            time: Arc::clone(&time),
            control_sequence: AtomicU64::new(0),
            local_announcements: RwLock::new(Vec::new()),
            status_snapshot: Mutex::new(None),
            trace_sinks: RwLock::new(Vec::new()),
        });

        let lifecycle = LifecycleInner::new(
            participant_name.to_string(),
            participant_config.participant_controller.as_ref(),
            config.allows_async_run(participant_name),
            Arc::clone(&bus),
        )?;
        let monitor = MonitorInner::new(config.synchronized_participants());
        let timesync = TimeSyncInner::new(
            time_sync_config.sync_policy,
            time_sync_config.tick_period_ns,
            participant_name.to_string(),
            participant_config.is_sync_master,
            synchronized,
            config.synchronized_participants(),
            Arc::clone(&time),
            Arc::clone(&lifecycle),
            Arc::clone(&bus),
        );

        let mut background_tasks = Vec::new();

        // Keep the registry connection: it carries forwarded log records
        // and serves late joiners; its loss after the mesh is up is not
        // fatal.
        {
            let (mut reader, writer) = PeerStream::Tcp(registry_stream).into_split();
            let link = PeerLink::spawn(
                REGISTRY_PARTICIPANT_ID,
                "registry".to_string(),
                writer,
            );
            *bus.registry_link.lock() = Some(link);
            background_tasks.push(tokio::spawn(async move {
                while read_envelope(&mut reader).await.is_ok() {}
                debug!("registry connection closed");
            }));
        }

        // Dial every peer the registry reported.
        for peer in &known.peers {
            let stream = Self::dial_peer(peer, middleware.enable_domain_sockets, &options).await?;
            let introduction = Envelope {
                interface_id: crate::wire::interface_ids::CONTROL,
                sender: EndpointAddress::new(participant_id, CONTROL_ENDPOINT),
                sequence: 0,
                timestamp_ns: time.now_ns(),
                link: None,
                recipient: None,
                payload: Payload::ParticipantAnnouncement(ParticipantAnnouncement {
                    participant_id: Some(participant_id),
                    participant_name: participant_name.to_string(),
                    domain_id,
                    protocol_version: PROTOCOL_VERSION,
                    tcp_endpoint: advertised_tcp.clone(),
                    domain_socket: advertised_uds.clone(),
                    log_from_remotes: false,
                }),
            };
            let (reader, mut writer) = stream.into_split();
            write_envelope(&mut writer, &introduction).await?;
            let link = PeerLink::spawn(
                peer.participant_id,
                peer.participant_name.clone(),
                writer,
            );
            bus.register_peer(link);
            background_tasks.push(spawn_reader(
                reader,
                peer.participant_id,
                dispatch_tx.clone(),
            ));
            debug!(
                "'{}' connected to peer '{}'",
                participant_name, peer.participant_name
            );
        }

        // Accept loop for late joiners (TCP).
        background_tasks.push(spawn_accept_loop(
            listener,
            Arc::clone(&bus),
            dispatch_tx.clone(),
        ));
        #[cfg(unix)]
        if let Some(uds_listener) = uds_listener {
            background_tasks.push(spawn_uds_accept_loop(
                uds_listener,
                Arc::clone(&bus),
                dispatch_tx.clone(),
            ));
        }

        let inner = Arc::new(ParticipantInner {
            name: participant_name.to_string(),
            id: participant_id,
            domain_id,
            config,
            participant_config,
            bus: Arc::clone(&bus),
            controllers: RwLock::new(Vec::new()),
            lifecycle,
            monitor,
            timesync,
            background_tasks: Mutex::new(background_tasks),
            #[cfg(unix)]
            domain_socket_path: Mutex::new(uds_path),
        });

        // The dispatch task serializes everything; it holds only a weak
        // reference so that dropping the participant ends the loop.
        let dispatch_handle = spawn_dispatch(&inner, dispatch_rx);
        inner.background_tasks.lock().push(dispatch_handle);

        inner.lifecycle.bus_up();
        Ok(Self { inner })
    }

    async fn dial_peer(
        peer: &crate::wire::PeerInfo,
        domain_sockets: bool,
        options: &SocketOptions,
    ) -> IbResult<PeerStream> {
        #[cfg(unix)]
        if domain_sockets {
            if let Some(path) = &peer.domain_socket {
                match crate::transport::domain_socket::connect(path).await {
                    Ok(stream) => return Ok(PeerStream::Unix(stream)),
                    Err(error) => {
                        warn!(
                            "domain socket to '{}' failed ({}), falling back to TCP",
                            peer.participant_name, error
                        );
                    }
                }
            }
        }
        #[cfg(not(unix))]
        let _ = domain_sockets;
        let stream = tcp::connect_with_retries(&peer.tcp_endpoint, options, 1).await?;
        Ok(PeerStream::Tcp(stream))
    }

    /// The registry-assigned participant id.
    pub fn id(&self) -> ParticipantId {
        self.inner.id
    }

    /// The configured participant name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The domain this participant joined.
    pub fn domain_id(&self) -> u32 {
        self.inner.domain_id
    }

    /// Lifecycle control of this participant. Requires a configured
    /// participant controller block.
    pub fn participant_controller(&self) -> IbResult<ParticipantController> {
        if self.inner.participant_config.participant_controller.is_none() {
            return Err(IbError::Misconfiguration(format!(
                "participant '{}' has no participant controller configured",
                self.inner.name
            )));
        }
        Ok(ParticipantController {
            lifecycle: Arc::clone(&self.inner.lifecycle),
        })
    }

    /// Command interface for the system controller role.
    pub fn system_controller(&self) -> SystemController {
        SystemController {
            bus: Arc::clone(&self.inner.bus),
        }
    }

    /// Observer of participant and system states.
    pub fn system_monitor(&self) -> SystemMonitor {
        SystemMonitor {
            inner: Arc::clone(&self.inner.monitor),
        }
    }

    /// Attach a detailed network simulator to a link, replacing the
    /// simple-mode semantics for that link.
    pub fn attach_network_simulator(&self, link: &str, simulator: Arc<dyn LinkSimulator>) {
        self.inner.bus.router().attach_simulator(link, simulator);
    }

    /// Register a trace sink named in this participant's configuration.
    pub fn add_trace_sink(&self, sink: Arc<dyn TraceSink>) -> IbResult<()> {
        let known = self
            .inner
            .participant_config
            .trace_sinks
            .iter()
            .any(|s| s.name == sink.name());
        if !known {
            return Err(IbError::Misconfiguration(format!(
                "trace sink '{}' is not configured for participant '{}'",
                sink.name(),
                self.inner.name
            )));
        }
        self.inner.bus.trace_sinks.write().push(sink);
        Ok(())
    }

    /// Forward a log record to the registry (remote logging sink).
    pub fn forward_log(&self, level: &str, message: &str) {
        self.inner.bus.send_to_registry(Payload::Log(LogMessage {
            participant_name: self.inner.name.clone(),
            level: level.to_string(),
            message: message.to_string(),
        }));
    }

    /// Drain a [`crate::logging::RemoteLogHandle`] toward the registry.
    ///
    /// Forwarding is best-effort: records are dropped under congestion
    /// rather than stalling the emitting thread or the simulation.
    pub fn attach_remote_logging(&self, mut handle: crate::logging::RemoteLogHandle) {
        let bus = Arc::clone(&self.inner.bus);
        let task = tokio::spawn(async move {
            while let Some(record) = handle.rx.recv().await {
                bus.send_to_registry(Payload::Log(record));
            }
        });
        self.inner.background_tasks.lock().push(task);
    }

    /// Create a CAN controller declared in the configuration.
    pub fn create_can_controller(&self, name: &str) -> IbResult<CanController> {
        let entry = self
            .inner
            .participant_config
            .can_controllers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("CAN", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::Can,
            Vec::new(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = CanController::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create a LIN controller declared in the configuration.
    pub fn create_lin_controller(&self, name: &str) -> IbResult<LinController> {
        let entry = self
            .inner
            .participant_config
            .lin_controllers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("LIN", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::Lin,
            Vec::new(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = LinController::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create a FlexRay controller declared in the configuration.
    pub fn create_flexray_controller(&self, name: &str) -> IbResult<FlexRayController> {
        let entry = self
            .inner
            .participant_config
            .flexray_controllers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("FlexRay", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::FlexRay,
            Vec::new(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) =
            FlexRayController::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create an Ethernet controller declared in the configuration.
    pub fn create_ethernet_controller(&self, name: &str) -> IbResult<EthernetController> {
        let entry = self
            .inner
            .participant_config
            .ethernet_controllers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("Ethernet", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::Ethernet,
            Vec::new(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) =
            EthernetController::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create a data publisher declared in the configuration.
    pub fn create_data_publisher(&self, name: &str) -> IbResult<DataPublisher> {
        let entry: DataPortConfig = self
            .inner
            .participant_config
            .data_publishers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("data publisher", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::DataPublisher,
            entry.labels.clone(),
            Some(entry.media_type.clone()),
            entry.history.min(1),
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = DataPublisher::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create a data subscriber declared in the configuration.
    pub fn create_data_subscriber(&self, name: &str) -> IbResult<DataSubscriber> {
        let entry: DataPortConfig = self
            .inner
            .participant_config
            .data_subscribers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("data subscriber", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::DataSubscriber,
            entry.labels.clone(),
            Some(entry.media_type.clone()),
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = DataSubscriber::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create an RPC client declared in the configuration.
    pub fn create_rpc_client(&self, name: &str) -> IbResult<RpcClient> {
        let entry: RpcPortConfig = self
            .inner
            .participant_config
            .rpc_clients
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("RPC client", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::RpcClient,
            entry.labels.clone(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = RpcClient::create(
            descriptor,
            Arc::clone(&self.inner.bus),
            entry.call_timeout_ms.map(Duration::from_millis),
        );
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Create an RPC server declared in the configuration.
    pub fn create_rpc_server(&self, name: &str) -> IbResult<RpcServer> {
        let entry: RpcPortConfig = self
            .inner
            .participant_config
            .rpc_servers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| self.inner.unknown_controller("RPC server", name))?
            .clone();
        let descriptor = self.inner.new_descriptor(
            name,
            entry.link_name(),
            ServiceKind::RpcServer,
            entry.labels.clone(),
            None,
            0,
            entry.use_trace_sinks.clone(),
        );
        let (controller, inner) = RpcServer::create(descriptor, Arc::clone(&self.inner.bus));
        self.inner.register_controller(inner);
        Ok(controller)
    }

    /// Leave the simulation: invalidate the routing tables, close peer
    /// connections in LIFO order, and stop the background tasks.
    pub fn disconnect(&self) {
        self.inner.shutdown_transport();
    }
}

impl ParticipantInner {
    fn unknown_controller(&self, kind: &str, name: &str) -> IbError {
        IbError::Misconfiguration(format!(
            "{kind} controller '{name}' is not configured for participant '{}'",
            self.name
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new_descriptor(
        &self,
        name: &str,
        link: &str,
        kind: ServiceKind,
        labels: Vec<crate::types::Label>,
        media_type: Option<String>,
        history: u8,
        trace_sinks: Vec<String>,
    ) -> EndpointDescriptor {
        let endpoint: EndpointId = (self.controllers.read().len() + 1) as EndpointId;
        EndpointDescriptor {
            address: EndpointAddress::new(self.id, endpoint),
            qualified_name: format!("{}/{}", self.name, name),
            link: link.to_string(),
            kind,
            labels,
            media_type,
            history,
            trace_sinks,
        }
    }

    /// Arena registration plus announcement; existing endpoints are
    /// replayed to the newcomer before it is announced itself.
    fn register_controller(&self, controller: Arc<dyn BusController>) {
        for announcement in self.bus.router().remote_endpoints() {
            controller.on_remote_endpoint(&announcement);
        }
        for announcement in self.bus.local_announcements.read().iter() {
            controller.on_remote_endpoint(announcement);
        }
        let announcement = controller.descriptor().announcement();
        self.controllers.write().push(controller);
        self.bus.announce_endpoint(announcement);
    }

    fn handle_event(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Inbound(_, envelope) | DispatchEvent::Local(envelope) => {
                self.dispatch_envelope(envelope);
            }
            DispatchEvent::PeerLost(peer_id) => self.handle_peer_lost(peer_id),
        }
    }

    fn handle_peer_lost(&self, peer_id: ParticipantId) {
        let link = self.bus.peers.write().remove(&peer_id);
        let Some(link) = link else {
            return;
        };
        self.bus.router().remove_participant(peer_id);
        self.bus.peer_order.lock().retain(|id| *id != peer_id);

        let peer_name = link.participant_name.clone();
        let peer_state = self.monitor.participant_state(&peer_name);
        let orderly = matches!(
            peer_state,
            Some(ParticipantState::Shutdown) | Some(ParticipantState::ColdswapShutdown)
        );
        let required = self
            .config
            .synchronized_participants()
            .iter()
            .any(|name| *name == peer_name);
        if orderly || !required {
            debug!("'{}': peer '{}' disconnected", self.name, peer_name);
            return;
        }
        self.lifecycle.escalate_error(&format!(
            "connection to required participant '{peer_name}' lost"
        ));
    }

    fn dispatch_envelope(&self, envelope: Envelope) {
        match &envelope.payload {
            Payload::Subscription(announcement) => {
                let local = announcement.address.participant == self.id;
                if !local && !self.bus.router().add_remote(announcement.clone()) {
                    return;
                }
                let controllers = self.controllers.read().clone();
                for controller in controllers {
                    if controller.descriptor().address != announcement.address {
                        controller.on_remote_endpoint(announcement);
                    }
                }
            }
            Payload::ParticipantStatus(status) => {
                self.monitor.update(status);
                self.timesync.on_participant_status(status);
                self.timesync.on_system_state(self.monitor.system_state());
            }
            Payload::ParticipantCommand(command) => {
                self.lifecycle.handle_participant_command(command);
            }
            Payload::SystemCommand(command) => {
                self.lifecycle.handle_system_command(command);
            }
            Payload::RequiredParticipants(required) => {
                self.monitor.set_required(required.names.clone());
            }
            Payload::Tick(_)
            | Payload::TickDone(_)
            | Payload::QuantumRequest(_)
            | Payload::QuantumGrant(_)
            | Payload::NextSimTask(_) => {
                self.timesync.handle_payload(&envelope.payload);
            }
            Payload::ParticipantAnnouncement(_)
            | Payload::KnownParticipants(_)
            | Payload::RegistryRejection(_)
            | Payload::Log(_) => {}
            _ => self.dispatch_bus_traffic(&envelope),
        }
    }

    fn dispatch_bus_traffic(&self, envelope: &Envelope) {
        if let Some(recipient) = envelope.recipient {
            if recipient.participant != self.id {
                return;
            }
            let controller = {
                let controllers = self.controllers.read();
                let index = (recipient.endpoint as usize).checked_sub(1);
                index.and_then(|i| controllers.get(i).cloned())
            };
            if let Some(controller) = controller {
                self.deliver(controller.as_ref(), envelope);
            }
            return;
        }

        let Some(link) = &envelope.link else {
            return;
        };
        let controllers = self.controllers.read().clone();
        for controller in controllers {
            let descriptor = controller.descriptor();
            if descriptor.link == *link && descriptor.address != envelope.sender {
                self.deliver(controller.as_ref(), envelope);
            }
        }
    }

    /// Deliver one envelope to one controller, converting a panicking
    /// user handler into the `Error` lifecycle state.
    fn deliver(&self, controller: &dyn BusController, envelope: &Envelope) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            controller.handle_envelope(envelope);
        }));
        if result.is_err() {
            self.lifecycle.escalate_error(&format!(
                "handler of '{}' panicked",
                controller.descriptor().qualified_name
            ));
        }
    }

    fn shutdown_transport(&self) {
        self.bus.router().clear_local();
        // LIFO close of the peer connections
        let order: Vec<ParticipantId> = {
            let mut order = self.bus.peer_order.lock();
            order.drain(..).rev().collect()
        };
        for peer_id in order {
            self.bus.peers.write().remove(&peer_id);
        }
        *self.bus.registry_link.lock() = None;
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
        #[cfg(unix)]
        if let Some(path) = self.domain_socket_path.lock().take() {
            crate::transport::domain_socket::cleanup(&path);
        }
    }
}

impl Drop for ParticipantInner {
    fn drop(&mut self) {
        self.shutdown_transport();
    }
}

/// Lifecycle control handle of one participant.
#[derive(Clone)]
pub struct ParticipantController {
    lifecycle: Arc<LifecycleInner>,
}

impl ParticipantController {
    /// Install the init callback, run on `Initialize`/`Reinitialize`.
    pub fn set_init_handler(
        &self,
        handler: impl FnMut(ParticipantCommandKind) + Send + 'static,
    ) {
        self.lifecycle.set_init_handler(Box::new(handler));
    }

    /// Install the stop callback, run on `Stop`.
    pub fn set_stop_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.lifecycle.set_stop_handler(Box::new(handler));
    }

    /// Install the shutdown callback, run on `Shutdown`.
    pub fn set_shutdown_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.lifecycle.set_shutdown_handler(Box::new(handler));
    }

    /// Install the simulation task `(now, duration)`, invoked once per
    /// tick or granted quantum.
    pub fn set_simulation_task(
        &self,
        task: impl FnMut(NanosecondsTime, NanosecondsTime) + Send + 'static,
    ) {
        self.lifecycle.set_simulation_task(Box::new(task));
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ParticipantState {
        self.lifecycle.state()
    }

    /// Report a local failure; the participant enters the `Error` state
    /// and the reason travels with the status broadcast.
    pub fn report_error(&self, reason: &str) {
        self.lifecycle.escalate_error(reason);
    }

    /// Cooperative pause: the simulation task is not invoked while paused.
    pub fn pause(&self, reason: &str) -> IbResult<()> {
        self.lifecycle.pause(reason)
    }

    /// Resume from a cooperative pause.
    pub fn resume(&self, reason: &str) -> IbResult<()> {
        self.lifecycle.resume(reason)
    }

    /// Execution-time statistics of the simulation task.
    pub fn execution_statistics(&self) -> ExecTimeSummary {
        self.lifecycle.exec_summary()
    }

    /// Participate in the lifecycle until `Shutdown`; returns the final
    /// state.
    pub async fn run(&self) -> IbResult<ParticipantState> {
        self.wait_for_lifecycle_to_complete().await
    }

    /// Non-blocking participation. Rejected when strict synchronization
    /// applies to this participant, which would deadlock.
    pub fn run_async(&self) -> IbResult<()> {
        if !self.lifecycle.allow_async_run() {
            return Err(IbError::state(
                format!("{:?}", self.lifecycle.state()),
                "asynchronous run is not available under strict synchronization",
            ));
        }
        Ok(())
    }

    /// Wait until the lifecycle reaches `Shutdown`.
    pub async fn wait_for_lifecycle_to_complete(&self) -> IbResult<ParticipantState> {
        let mut states = self.lifecycle.subscribe();
        loop {
            let current = *states.borrow();
            if current == ParticipantState::Shutdown {
                return Ok(current);
            }
            if states.changed().await.is_err() {
                return Ok(self.lifecycle.state());
            }
        }
    }
}

fn spawn_reader(
    mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    peer_id: ParticipantId,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_envelope(&mut reader).await {
                Ok(envelope) => {
                    if dispatch_tx
                        .send(DispatchEvent::Inbound(peer_id, envelope))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) => {
                    debug!("peer {} connection ended: {}", peer_id, error);
                    let _ = dispatch_tx.send(DispatchEvent::PeerLost(peer_id)).await;
                    break;
                }
            }
        }
    })
}

/// Handshake on an accepted connection: the first frame introduces the
/// dialing participant; afterwards the local announcement snapshot is
/// replayed so the newcomer can route immediately.
async fn admit_accepted_stream(
    stream: PeerStream,
    bus: BusHandle,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let introduction = match read_envelope(&mut reader).await {
        Ok(Envelope {
            payload: Payload::ParticipantAnnouncement(announcement),
            ..
        }) => announcement,
        Ok(_) => {
            warn!("accepted connection did not introduce itself, dropping");
            return;
        }
        Err(error) => {
            debug!("accepted connection lost during handshake: {}", error);
            return;
        }
    };
    let Some(peer_id) = introduction.participant_id else {
        warn!(
            "peer '{}' introduced itself without an id, dropping",
            introduction.participant_name
        );
        return;
    };
    if introduction.protocol_version != PROTOCOL_VERSION {
        warn!(
            "peer '{}' speaks protocol {} (expected {}), dropping",
            introduction.participant_name, introduction.protocol_version, PROTOCOL_VERSION
        );
        return;
    }

    // Replay the endpoint announcements and the current lifecycle status
    // before any fresh broadcast can race past them on this connection.
    let mut replay: Vec<Payload> = bus
        .local_announcements
        .read()
        .iter()
        .cloned()
        .map(Payload::Subscription)
        .collect();
    if let Some(status) = bus.status_snapshot.lock().clone() {
        replay.push(Payload::ParticipantStatus(status));
    }
    let mut sequence = 0u64;
    for payload in replay {
        let envelope = Envelope {
            interface_id: crate::wire::interface_ids::CONTROL,
            sender: EndpointAddress::new(bus.participant_id, CONTROL_ENDPOINT),
            sequence: {
                sequence += 1;
                sequence
            },
            timestamp_ns: bus.time.now_ns(),
            link: None,
            recipient: None,
            payload,
        };
        if let Err(error) = write_envelope(&mut writer, &envelope).await {
            warn!(
                "announcement replay to '{}' failed: {}",
                introduction.participant_name, error
            );
            return;
        }
    }

    let link = PeerLink::spawn(peer_id, introduction.participant_name.clone(), writer);
    bus.register_peer(link);
    let _ = spawn_reader(reader, peer_id, dispatch_tx);
    debug!(
        "accepted peer '{}' ({})",
        introduction.participant_name, peer_id
    );
}

fn spawn_accept_loop(
    listener: tokio::net::TcpListener,
    bus: BusHandle,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(admit_accepted_stream(
                        PeerStream::Tcp(stream),
                        Arc::clone(&bus),
                        dispatch_tx.clone(),
                    ));
                }
                Err(error) => {
                    warn!("peer accept failed: {}", error);
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn spawn_uds_accept_loop(
    listener: tokio::net::UnixListener,
    bus: BusHandle,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(admit_accepted_stream(
                        PeerStream::Unix(stream),
                        Arc::clone(&bus),
                        dispatch_tx.clone(),
                    ));
                }
                Err(error) => {
                    warn!("domain socket accept failed: {}", error);
                    break;
                }
            }
        }
    })
}

fn spawn_dispatch(
    inner: &Arc<ParticipantInner>,
    mut rx: mpsc::Receiver<DispatchEvent>,
) -> JoinHandle<()> {
    let weak: Weak<ParticipantInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.handle_event(event);
        }
    })
}
