//! # Registry
//!
//! The rendezvous process of a simulation domain. Every participant opens
//! a connection, announces itself, and receives the list of already
//! connected peers; the participant then dials each peer directly and the
//! registry leaves the critical path. It stays resident for late joiners
//! and, for participants that opted in, re-emits their forwarded log
//! records.
//!
//! Announcements with a mismatched protocol version or domain id are
//! rejected and the connection is closed; duplicate participant names are
//! refused the same way.

use crate::config::RegistryConfig;
use crate::error::{IbError, IbResult};
use crate::transport::{read_envelope, write_envelope};
use crate::types::{EndpointAddress, ParticipantId, REGISTRY_PARTICIPANT_ID};
use crate::wire::{
    Envelope, KnownParticipants, ParticipantAnnouncement, Payload, PeerInfo, RegistryRejection,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct RegisteredParticipant {
    participant_name: String,
    tcp_endpoint: String,
    domain_socket: Option<String>,
}

struct RegistryState {
    domain_id: u32,
    next_participant_id: AtomicU64,
    participants: Mutex<HashMap<ParticipantId, RegisteredParticipant>>,
    sequence: AtomicU64,
}

impl RegistryState {
    fn control_envelope(&self, payload: Payload) -> Envelope {
        Envelope {
            interface_id: payload.interface_id(),
            sender: EndpointAddress::control(REGISTRY_PARTICIPANT_ID),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp_ns: crate::timesync::wall_clock_ns(),
            link: None,
            recipient: None,
            payload,
        }
    }
}

/// Handle of a started registry; dropping it does not stop the registry,
/// call [`RegistryHandle::shutdown`] for that.
pub struct RegistryHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl RegistryHandle {
    /// The address the registry accepts participants on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new participants and terminate the accept loop.
    /// Established participant meshes keep working.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Bind and start a registry for one simulation domain.
pub async fn start_registry(config: &RegistryConfig, domain_id: u32) -> IbResult<RegistryHandle> {
    let listener = TcpListener::bind((config.hostname.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(
        "registry for domain {} listening on {}",
        domain_id, local_addr
    );

    let state = Arc::new(RegistryState {
        domain_id,
        next_participant_id: AtomicU64::new(1),
        participants: Mutex::new(HashMap::new()),
        sequence: AtomicU64::new(0),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("registry shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("registry: connection from {}", peer_addr);
                            tokio::spawn(handle_participant(Arc::clone(&state), stream));
                        }
                        Err(error) => {
                            warn!("registry: accept failed: {}", error);
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(RegistryHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
    })
}

async fn handle_participant(state: Arc<RegistryState>, mut stream: TcpStream) {
    let announcement = match read_envelope(&mut stream).await {
        Ok(Envelope {
            payload: Payload::ParticipantAnnouncement(announcement),
            ..
        }) => announcement,
        Ok(_) => {
            warn!("registry: first frame was not an announcement, dropping connection");
            return;
        }
        Err(error) => {
            debug!("registry: connection lost before announcement: {}", error);
            return;
        }
    };

    let assigned_id = match admit(&state, &announcement) {
        Ok(id) => id,
        Err(reason) => {
            warn!(
                "registry: rejecting participant '{}': {}",
                announcement.participant_name, reason
            );
            let rejection =
                state.control_envelope(Payload::RegistryRejection(RegistryRejection { reason }));
            let _ = write_envelope(&mut stream, &rejection).await;
            return;
        }
    };

    let known = {
        let participants = state.participants.lock();
        let peers = participants
            .iter()
            .filter(|(id, _)| **id != assigned_id)
            .map(|(id, p)| PeerInfo {
                participant_id: *id,
                participant_name: p.participant_name.clone(),
                tcp_endpoint: p.tcp_endpoint.clone(),
                domain_socket: p.domain_socket.clone(),
            })
            .collect();
        state.control_envelope(Payload::KnownParticipants(KnownParticipants {
            assigned_id,
            peers,
        }))
    };

    if let Err(error) = write_envelope(&mut stream, &known).await {
        warn!(
            "registry: failed to answer '{}': {}",
            announcement.participant_name, error
        );
        state.participants.lock().remove(&assigned_id);
        return;
    }
    info!(
        "registry: participant '{}' joined as {}",
        announcement.participant_name, assigned_id
    );

    // Stay on the connection: it carries forwarded log records and its
    // loss deregisters the participant.
    loop {
        match read_envelope(&mut stream).await {
            Ok(envelope) => {
                if let Payload::Log(record) = envelope.payload {
                    emit_remote_log(&record.participant_name, &record.level, &record.message);
                }
            }
            Err(_) => {
                info!(
                    "registry: participant '{}' ({}) left",
                    announcement.participant_name, assigned_id
                );
                state.participants.lock().remove(&assigned_id);
                return;
            }
        }
    }
}

/// Validate an announcement and register the participant.
fn admit(
    state: &RegistryState,
    announcement: &ParticipantAnnouncement,
) -> Result<ParticipantId, String> {
    if announcement.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version {} does not match registry version {}",
            announcement.protocol_version, PROTOCOL_VERSION
        ));
    }
    if announcement.domain_id != state.domain_id {
        return Err(format!(
            "domain {} does not match registry domain {}",
            announcement.domain_id, state.domain_id
        ));
    }

    let mut participants = state.participants.lock();
    if participants
        .values()
        .any(|p| p.participant_name == announcement.participant_name)
    {
        return Err(format!(
            "participant name '{}' is already connected",
            announcement.participant_name
        ));
    }

    let id = state.next_participant_id.fetch_add(1, Ordering::Relaxed);
    participants.insert(
        id,
        RegisteredParticipant {
            participant_name: announcement.participant_name.clone(),
            tcp_endpoint: announcement.tcp_endpoint.clone(),
            domain_socket: announcement.domain_socket.clone(),
        },
    );
    Ok(id)
}

fn emit_remote_log(participant: &str, level: &str, message: &str) {
    match level {
        "ERROR" => tracing::error!("[{}] {}", participant, message),
        "WARN" => tracing::warn!("[{}] {}", participant, message),
        "DEBUG" => tracing::debug!("[{}] {}", participant, message),
        "TRACE" => tracing::trace!("[{}] {}", participant, message),
        _ => tracing::info!("[{}] {}", participant, message),
    }
}

/// Convenience used by the participant: first announcement exchange on a
/// fresh registry connection.
pub(crate) async fn announce_to_registry(
    stream: &mut TcpStream,
    announcement: ParticipantAnnouncement,
) -> IbResult<KnownParticipants> {
    let envelope = Envelope {
        interface_id: crate::wire::interface_ids::CONTROL,
        sender: EndpointAddress::control(0),
        sequence: 0,
        timestamp_ns: crate::timesync::wall_clock_ns(),
        link: None,
        recipient: None,
        payload: Payload::ParticipantAnnouncement(announcement),
    };
    write_envelope(stream, &envelope).await?;

    match read_envelope(stream).await? {
        Envelope {
            payload: Payload::KnownParticipants(known),
            ..
        } => Ok(known),
        Envelope {
            payload: Payload::RegistryRejection(rejection),
            ..
        } => Err(IbError::Protocol(format!(
            "registry rejected the announcement: {}",
            rejection.reason
        ))),
        _ => Err(IbError::Protocol(
            "unexpected registry reply to the announcement".to_string(),
        )),
    }
}
