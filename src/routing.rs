//! # Routing Core
//!
//! Link/topic routing tables. Every controller registration and every
//! subscription announcement received from a peer lands here; publishers
//! consult the tables to send bus traffic directly to the owning
//! connections.
//!
//! ## Tables and locking
//!
//! The tables are written only on registration and deregistration events,
//! which are serialized on the participant's dispatch task; the publish
//! path takes read locks only. Local endpoints are invalidated in bulk at
//! participant shutdown, remote endpoints in bulk when a peer is lost.
//!
//! ## Simulation-mode seam
//!
//! Each link is in simple mode by default: the controllers synthesize the
//! bus semantics themselves. Attaching a [`LinkSimulator`] switches the
//! link to detailed mode, where outgoing bus traffic for that link is
//! handed to the simulator, in publication order, instead of being
//! distributed by the simple-mode rules.

use crate::config::SwitchConfig;
use crate::error::IbResult;
use crate::services::ethernet::frame_vlan_id;
use crate::types::{labels_match, EndpointAddress, Label, ParticipantId, ServiceKind};
use crate::wire::{Envelope, SubscriptionAnnouncement};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Detailed-simulation attachment point for one link.
///
/// The network-simulator process itself is out of scope; the core only
/// guarantees that a link's traffic can be diverted to an implementation
/// of this trait in publication order.
#[async_trait]
pub trait LinkSimulator: Send + Sync {
    /// Deliver one envelope of the link this simulator claimed.
    async fn deliver(&self, envelope: Envelope) -> IbResult<()>;
}

/// Routing tables of one participant.
pub(crate) struct Router {
    /// Local controller registrations, by endpoint address
    local: RwLock<HashMap<EndpointAddress, SubscriptionAnnouncement>>,
    /// Remote endpoints, by link name
    remote_by_link: RwLock<HashMap<String, Vec<SubscriptionAnnouncement>>>,
    /// All remote endpoint addresses, for duplicate suppression
    remote_seen: RwLock<HashSet<EndpointAddress>>,
    /// Ethernet switches from the configuration
    switches: Vec<SwitchConfig>,
    /// Links diverted to a detailed simulator
    detailed: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
}

impl Router {
    pub fn new(switches: Vec<SwitchConfig>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote_by_link: RwLock::new(HashMap::new()),
            remote_seen: RwLock::new(HashSet::new()),
            switches,
            detailed: RwLock::new(HashMap::new()),
        }
    }

    /// Register a local controller.
    pub fn register_local(&self, announcement: SubscriptionAnnouncement) {
        self.local
            .write()
            .insert(announcement.address, announcement);
    }

    /// Drop every local registration (participant shutdown).
    pub fn clear_local(&self) {
        self.local.write().clear();
    }

    /// Fold a peer's subscription announcement into the tables.
    ///
    /// Returns `true` when the endpoint was previously unknown.
    pub fn add_remote(&self, announcement: SubscriptionAnnouncement) -> bool {
        if !self.remote_seen.write().insert(announcement.address) {
            return false;
        }
        debug!(
            "routing: new remote endpoint {} on link '{}'",
            announcement.qualified_name, announcement.link
        );
        self.remote_by_link
            .write()
            .entry(announcement.link.clone())
            .or_default()
            .push(announcement);
        true
    }

    /// Drop everything owned by a lost peer.
    pub fn remove_participant(&self, participant: ParticipantId) {
        let mut seen = self.remote_seen.write();
        seen.retain(|address| address.participant != participant);
        let mut by_link = self.remote_by_link.write();
        for endpoints in by_link.values_mut() {
            endpoints.retain(|a| a.address.participant != participant);
        }
        by_link.retain(|_, endpoints| !endpoints.is_empty());
    }

    /// Peers that own at least one endpoint on the link.
    pub fn peers_on_link(&self, link: &str) -> Vec<ParticipantId> {
        let by_link = self.remote_by_link.read();
        let mut peers: Vec<ParticipantId> = by_link
            .get(link)
            .map(|endpoints| endpoints.iter().map(|a| a.address.participant).collect())
            .unwrap_or_default();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    /// Peers that own a data subscriber matching the publisher's labels.
    pub fn peers_for_data(&self, link: &str, publisher_labels: &[Label]) -> Vec<ParticipantId> {
        let by_link = self.remote_by_link.read();
        let mut peers: Vec<ParticipantId> = by_link
            .get(link)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|a| a.kind == ServiceKind::DataSubscriber)
                    .filter(|a| labels_match(&a.labels, publisher_labels))
                    .map(|a| a.address.participant)
                    .collect()
            })
            .unwrap_or_default();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    /// All servers (local and remote) matching an RPC client, excluding
    /// the client itself.
    pub fn matching_rpc_servers(
        &self,
        link: &str,
        client_labels: &[Label],
        exclude: EndpointAddress,
    ) -> Vec<SubscriptionAnnouncement> {
        let mut servers: Vec<SubscriptionAnnouncement> = Vec::new();
        {
            let by_link = self.remote_by_link.read();
            if let Some(endpoints) = by_link.get(link) {
                servers.extend(endpoints.iter().cloned());
            }
        }
        {
            let local = self.local.read();
            servers.extend(
                local
                    .values()
                    .filter(|a| a.link == link)
                    .cloned(),
            );
        }
        servers.retain(|a| {
            a.kind == ServiceKind::RpcServer
                && a.address != exclude
                && labels_match(client_labels, &a.labels)
        });
        servers
    }

    /// Every known remote endpoint, for replaying announcements to a
    /// freshly created local controller.
    pub fn remote_endpoints(&self) -> Vec<SubscriptionAnnouncement> {
        let by_link = self.remote_by_link.read();
        by_link.values().flatten().cloned().collect()
    }

    /// Additional links an Ethernet frame forwards to through configured
    /// switches.
    ///
    /// A frame entering a switch through the port attached to its origin
    /// link leaves through every other port whose VLAN set intersects the
    /// frame's 802.1Q tag; untagged frames use the ingress port's native
    /// (first) VLAN.
    pub fn switch_fanout(&self, origin_link: &str, frame: &[u8]) -> Vec<String> {
        let mut forwarded: Vec<String> = Vec::new();
        for switch in &self.switches {
            let Some(ingress) = switch.ports.iter().find(|p| p.network == origin_link) else {
                continue;
            };
            let frame_vlan = frame_vlan_id(frame).or_else(|| ingress.vlan_ids.first().copied());
            let Some(vlan) = frame_vlan else {
                continue;
            };
            for port in &switch.ports {
                if port.network == origin_link || !port.vlan_ids.contains(&vlan) {
                    continue;
                }
                if !forwarded.iter().any(|l| l == &port.network) {
                    forwarded.push(port.network.clone());
                }
            }
        }
        forwarded
    }

    /// Divert a link to a detailed simulator. Envelopes are forwarded in
    /// publication order through a dedicated queue.
    pub fn attach_simulator(
        &self,
        link: &str,
        simulator: std::sync::Arc<dyn LinkSimulator>,
    ) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(1024);
        let link_name = link.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = simulator.deliver(envelope).await {
                    warn!(
                        "detailed simulator for link '{}' rejected a message: {}",
                        link_name, error
                    );
                }
            }
        });
        self.detailed.write().insert(link.to_string(), tx);
    }

    /// The simulator queue of a detailed-mode link, if any.
    pub fn simulator_for(&self, link: &str) -> Option<mpsc::Sender<Envelope>> {
        self.detailed.read().get(link).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchPortConfig;
    use crate::services::ethernet::MIN_FRAME_SIZE;

    fn announcement(
        participant: ParticipantId,
        endpoint: u16,
        link: &str,
        kind: ServiceKind,
        labels: Vec<Label>,
    ) -> SubscriptionAnnouncement {
        SubscriptionAnnouncement {
            address: EndpointAddress::new(participant, endpoint),
            qualified_name: format!("P{participant}/C{endpoint}"),
            link: link.to_string(),
            kind,
            labels,
            media_type: None,
            history: 0,
        }
    }

    #[test]
    fn test_peers_on_link_dedupes_participants() {
        let router = Router::new(Vec::new());
        router.add_remote(announcement(2, 1, "CAN1", ServiceKind::Can, vec![]));
        router.add_remote(announcement(2, 2, "CAN1", ServiceKind::Can, vec![]));
        router.add_remote(announcement(3, 1, "CAN1", ServiceKind::Can, vec![]));
        router.add_remote(announcement(4, 1, "CAN2", ServiceKind::Can, vec![]));

        assert_eq!(router.peers_on_link("CAN1"), vec![2, 3]);
        assert_eq!(router.peers_on_link("CAN2"), vec![4]);
        assert!(router.peers_on_link("LIN1").is_empty());
    }

    #[test]
    fn test_duplicate_announcements_are_suppressed() {
        let router = Router::new(Vec::new());
        let first = announcement(2, 1, "CAN1", ServiceKind::Can, vec![]);
        assert!(router.add_remote(first.clone()));
        assert!(!router.add_remote(first));
    }

    #[test]
    fn test_data_routing_honors_labels() {
        let router = Router::new(Vec::new());
        router.add_remote(announcement(
            2,
            1,
            "T",
            ServiceKind::DataSubscriber,
            vec![Label::new("KeyA", "ValA")],
        ));
        router.add_remote(announcement(
            3,
            1,
            "T",
            ServiceKind::DataSubscriber,
            vec![Label::new("KeyA", "Other")],
        ));

        let peers = router.peers_for_data("T", &[Label::new("KeyA", "ValA")]);
        assert_eq!(peers, vec![2]);
    }

    #[test]
    fn test_peer_loss_invalidates_in_bulk() {
        let router = Router::new(Vec::new());
        router.add_remote(announcement(2, 1, "CAN1", ServiceKind::Can, vec![]));
        router.add_remote(announcement(2, 2, "LIN1", ServiceKind::Lin, vec![]));
        router.add_remote(announcement(3, 1, "CAN1", ServiceKind::Can, vec![]));

        router.remove_participant(2);
        assert_eq!(router.peers_on_link("CAN1"), vec![3]);
        assert!(router.peers_on_link("LIN1").is_empty());
        // The address may re-register after a cold swap
        assert!(router.add_remote(announcement(2, 1, "CAN1", ServiceKind::Can, vec![])));
    }

    #[test]
    fn test_switch_fanout_by_vlan_intersection() {
        let switch = SwitchConfig {
            name: "SW1".to_string(),
            description: String::new(),
            ports: vec![
                SwitchPortConfig {
                    name: "Port0".to_string(),
                    vlan_ids: vec![1, 2],
                    network: "ETH_A".to_string(),
                },
                SwitchPortConfig {
                    name: "Port1".to_string(),
                    vlan_ids: vec![2],
                    network: "ETH_B".to_string(),
                },
                SwitchPortConfig {
                    name: "Port2".to_string(),
                    vlan_ids: vec![3],
                    network: "ETH_C".to_string(),
                },
            ],
        };
        let router = Router::new(vec![switch]);

        // Tagged with VLAN 2: reaches ETH_B only
        let mut tagged = vec![0u8; MIN_FRAME_SIZE];
        tagged[12] = 0x81;
        tagged[13] = 0x00;
        tagged[14] = 0x00;
        tagged[15] = 0x02;
        assert_eq!(router.switch_fanout("ETH_A", &tagged), vec!["ETH_B"]);

        // Untagged: native VLAN of the ingress port is 1, which no other
        // port carries
        let untagged = vec![0u8; MIN_FRAME_SIZE];
        assert!(router.switch_fanout("ETH_A", &untagged).is_empty());

        // Frames on unswitched links forward nowhere
        assert!(router.switch_fanout("ETH_X", &tagged).is_empty());
    }
}
