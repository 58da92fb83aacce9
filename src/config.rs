//! # Configuration Model and Validation
//!
//! The core consumes a validated, immutable, in-memory configuration tree.
//! Producing that tree (JSON/YAML files, fluent builders) is an external
//! concern; the serde derives on these types are the seam through which an
//! out-of-scope parser hands the tree over. [`Config::from_json_str`] exists
//! for tests and simple deployments and performs validation on load.
//!
//! ## Integrity rules
//!
//! [`Config::validate`] enforces the static rules; violations are fatal at
//! participant creation:
//!
//! - endpoint qualified names (`participant/controller`) are unique
//! - every link references only existing endpoints
//! - the service kind of a link is derived from its members; mixtures are
//!   invalid
//! - strict synchronization requires a nonzero tick period
//! - strict synchronization cannot be combined with asynchronous run
//! - trace sink and source names referenced by controllers must exist
//! - at most one participant is the sync master, and the synchronized
//!   policies require exactly one

use crate::error::{IbError, IbResult};
use crate::types::{LinkKind, ServiceKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default registry TCP port.
pub const DEFAULT_REGISTRY_PORT: u16 = 8500;

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_version: String,
    pub config_name: String,
    pub description: String,
    pub simulation_setup: SimulationSetup,
    pub middleware: MiddlewareConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSetup {
    pub participants: Vec<ParticipantConfig>,
    pub switches: Vec<SwitchConfig>,
    pub links: Vec<LinkConfig>,
    pub time_sync: TimeSyncConfig,
}

/// One participant process and the controllers it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    pub name: String,
    pub description: String,
    pub logger: LoggerConfig,
    pub participant_controller: Option<ParticipantControllerConfig>,
    pub can_controllers: Vec<ControllerConfig>,
    pub lin_controllers: Vec<ControllerConfig>,
    pub flexray_controllers: Vec<ControllerConfig>,
    pub ethernet_controllers: Vec<ControllerConfig>,
    pub data_publishers: Vec<DataPortConfig>,
    pub data_subscribers: Vec<DataPortConfig>,
    pub rpc_clients: Vec<RpcPortConfig>,
    pub rpc_servers: Vec<RpcPortConfig>,
    pub trace_sinks: Vec<TraceSinkConfig>,
    pub trace_sources: Vec<TraceSourceConfig>,
    /// Links claimed by an attached detailed network simulator
    pub network_simulators: Vec<String>,
    pub is_sync_master: bool,
}

/// Lifecycle/time-sync parameters of a participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantControllerConfig {
    pub sync_type: SyncType,
    /// Soft per-invocation execution limit in milliseconds; breaches warn
    pub exec_time_limit_soft_ms: Option<u64>,
    /// Hard per-invocation execution limit; breaches force `Error`
    pub exec_time_limit_hard_ms: Option<u64>,
}

/// Whether a participant takes part in virtual-time synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    #[default]
    Unsynchronized,
    Synchronized,
}

/// A bus controller entry (CAN, LIN, FlexRay, Ethernet).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    /// The link this controller joins; defaults to the controller name
    pub network: Option<String>,
    pub use_trace_sinks: Vec<String>,
    pub replay: Option<ReplayConfig>,
}

impl ControllerConfig {
    /// The effective link name (`network`, falling back to the name).
    pub fn link_name(&self) -> &str {
        self.network.as_deref().unwrap_or(&self.name)
    }
}

/// A generic data publisher or subscriber entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPortConfig {
    pub name: String,
    pub network: Option<String>,
    pub labels: Vec<crate::types::Label>,
    pub media_type: String,
    /// History depth: 0 (none) or 1 (replay last value to late joiners)
    pub history: u8,
    pub use_trace_sinks: Vec<String>,
    pub replay: Option<ReplayConfig>,
}

impl DataPortConfig {
    pub fn link_name(&self) -> &str {
        self.network.as_deref().unwrap_or(&self.name)
    }
}

/// An RPC client or server entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcPortConfig {
    pub name: String,
    pub network: Option<String>,
    pub labels: Vec<crate::types::Label>,
    /// Client-side call timeout in milliseconds; `None` waits indefinitely
    pub call_timeout_ms: Option<u64>,
    pub use_trace_sinks: Vec<String>,
    pub replay: Option<ReplayConfig>,
}

impl RpcPortConfig {
    pub fn link_name(&self) -> &str {
        self.network.as_deref().unwrap_or(&self.name)
    }
}

/// Replay binding of a controller to a trace source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub use_trace_source: String,
    pub direction: ReplayDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayDirection {
    #[default]
    Receive,
    Send,
    Both,
}

/// Named trace sink a controller may write to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSinkConfig {
    pub name: String,
    pub output_path: String,
}

/// Named trace source a controller may replay from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSourceConfig {
    pub name: String,
    pub input_path: String,
}

/// A named link and the qualified endpoint names attached to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub name: String,
    /// Qualified names `participant/controller` of the member endpoints
    pub endpoints: Vec<String>,
}

/// An Ethernet switch bridging several links with VLAN filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub name: String,
    pub description: String,
    pub ports: Vec<SwitchPortConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchPortConfig {
    pub name: String,
    pub vlan_ids: Vec<u16>,
    /// The link this port is attached to
    pub network: String,
}

/// Global time-synchronization policy of the simulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub sync_policy: SyncPolicy,
    pub tick_period_ns: u64,
}

/// The policies of §4.4; exactly one is selected per simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// No virtual clock; timestamps are wall time; no simulation task
    #[default]
    Unsynchronized,
    /// Quantum-grant: participants request quanta, the master grants
    Loose,
    /// Tick/tick-done lockstep driven by the master
    Strict,
    /// Peers announce next ready times; no central grant
    DistributedQuantum,
}

/// Participant logger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub sinks: Vec<SinkConfig>,
    pub flush_level: LogLevel,
    /// Forward this participant's log records to the registry
    pub log_from_remotes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub sink_type: SinkType,
    pub level: LogLevel,
    /// File sinks: output path
    pub log_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkType {
    #[default]
    Stdout,
    File,
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

/// Middleware (transport) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub registry: RegistryConfig,
    pub tcp_no_delay: bool,
    pub tcp_quick_ack: bool,
    pub tcp_send_buffer_size: Option<usize>,
    pub tcp_receive_buffer_size: Option<usize>,
    pub enable_domain_sockets: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            tcp_no_delay: true,
            tcp_quick_ack: false,
            tcp_send_buffer_size: None,
            tcp_receive_buffer_size: None,
            enable_domain_sockets: false,
        }
    }
}

/// Where the registry lives and how hard to try reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub hostname: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub logger: LoggerConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: DEFAULT_REGISTRY_PORT,
            connect_attempts: 1,
            logger: LoggerConfig::default(),
        }
    }
}

/// One configured endpoint, flattened out of its participant for
/// validation and lookup.
#[derive(Debug, Clone)]
pub struct ConfiguredEndpoint {
    pub qualified_name: String,
    pub participant: String,
    pub controller: String,
    pub kind: ServiceKind,
    pub link: String,
}

impl Config {
    /// Parse a configuration tree from JSON and validate it.
    pub fn from_json_str(json: &str) -> IbResult<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| IbError::Misconfiguration(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a participant block by name.
    pub fn find_participant(&self, name: &str) -> IbResult<&ParticipantConfig> {
        self.simulation_setup
            .participants
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                IbError::Misconfiguration(format!("participant '{name}' is not configured"))
            })
    }

    /// All endpoints of all participants, with their effective link names.
    pub fn configured_endpoints(&self) -> Vec<ConfiguredEndpoint> {
        let mut endpoints = Vec::new();
        for participant in &self.simulation_setup.participants {
            let mut push = |controller: &str, kind: ServiceKind, link: &str| {
                endpoints.push(ConfiguredEndpoint {
                    qualified_name: format!("{}/{}", participant.name, controller),
                    participant: participant.name.clone(),
                    controller: controller.to_string(),
                    kind,
                    link: link.to_string(),
                });
            };
            for c in &participant.can_controllers {
                push(&c.name, ServiceKind::Can, c.link_name());
            }
            for c in &participant.lin_controllers {
                push(&c.name, ServiceKind::Lin, c.link_name());
            }
            for c in &participant.flexray_controllers {
                push(&c.name, ServiceKind::FlexRay, c.link_name());
            }
            for c in &participant.ethernet_controllers {
                push(&c.name, ServiceKind::Ethernet, c.link_name());
            }
            for c in &participant.data_publishers {
                push(&c.name, ServiceKind::DataPublisher, c.link_name());
            }
            for c in &participant.data_subscribers {
                push(&c.name, ServiceKind::DataSubscriber, c.link_name());
            }
            for c in &participant.rpc_clients {
                push(&c.name, ServiceKind::RpcClient, c.link_name());
            }
            for c in &participant.rpc_servers {
                push(&c.name, ServiceKind::RpcServer, c.link_name());
            }
        }
        endpoints
    }

    /// Names of the participants that take part in time synchronization.
    ///
    /// This is the default required set for system-state aggregation and
    /// the tick barrier, until the system controller declares its own.
    pub fn synchronized_participants(&self) -> Vec<String> {
        self.simulation_setup
            .participants
            .iter()
            .filter(|p| {
                p.participant_controller
                    .as_ref()
                    .is_some_and(|pc| pc.sync_type == SyncType::Synchronized)
            })
            .map(|p| p.name.clone())
            .collect()
    }

    /// Enforce every static integrity rule. Returns the first violation.
    pub fn validate(&self) -> IbResult<()> {
        let endpoints = self.configured_endpoints();

        // Unique participant names
        let mut participant_names = HashSet::new();
        for p in &self.simulation_setup.participants {
            if p.name.is_empty() {
                return Err(IbError::Misconfiguration(
                    "participant with empty name".to_string(),
                ));
            }
            if !participant_names.insert(p.name.as_str()) {
                return Err(IbError::Misconfiguration(format!(
                    "duplicate participant name '{}'",
                    p.name
                )));
            }
        }

        // Unique qualified endpoint names
        let mut qualified = HashSet::new();
        for ep in &endpoints {
            if !qualified.insert(ep.qualified_name.as_str()) {
                return Err(IbError::Misconfiguration(format!(
                    "duplicate endpoint qualified name '{}'",
                    ep.qualified_name
                )));
            }
        }

        // Links: unique names, existing members, consistent kinds
        let by_name: HashMap<&str, &ConfiguredEndpoint> = endpoints
            .iter()
            .map(|ep| (ep.qualified_name.as_str(), ep))
            .collect();
        let mut link_names = HashSet::new();
        for link in &self.simulation_setup.links {
            if !link_names.insert(link.name.as_str()) {
                return Err(IbError::Misconfiguration(format!(
                    "duplicate link name '{}'",
                    link.name
                )));
            }
            let mut kind = LinkKind::Undefined;
            for member in &link.endpoints {
                let ep = by_name.get(member.as_str()).ok_or_else(|| {
                    IbError::Misconfiguration(format!(
                        "link '{}' references unknown endpoint '{}'",
                        link.name, member
                    ))
                })?;
                let member_kind = ep.kind.link_kind();
                if kind == LinkKind::Undefined {
                    kind = member_kind;
                } else if kind != member_kind {
                    return Err(IbError::Misconfiguration(format!(
                        "link '{}' mixes service kinds ({:?} and {:?})",
                        link.name, kind, member_kind
                    )));
                }
            }
        }

        // Implicit links (derived from controller network names) must not
        // mix kinds either.
        let mut derived: HashMap<&str, LinkKind> = HashMap::new();
        for ep in &endpoints {
            let kind = ep.kind.link_kind();
            match derived.get(ep.link.as_str()) {
                None => {
                    derived.insert(ep.link.as_str(), kind);
                }
                Some(existing) if *existing != kind => {
                    return Err(IbError::Misconfiguration(format!(
                        "network '{}' mixes service kinds ({:?} and {:?})",
                        ep.link, existing, kind
                    )));
                }
                Some(_) => {}
            }
        }

        // Switch ports must reference Ethernet networks
        for switch in &self.simulation_setup.switches {
            for port in &switch.ports {
                if let Some(kind) = derived.get(port.network.as_str()) {
                    if *kind != LinkKind::Ethernet {
                        return Err(IbError::Misconfiguration(format!(
                            "switch '{}' port '{}' attaches to non-Ethernet network '{}'",
                            switch.name, port.name, port.network
                        )));
                    }
                }
            }
        }

        // Time sync rules
        let time_sync = &self.simulation_setup.time_sync;
        let synced = self.synchronized_participants();
        match time_sync.sync_policy {
            SyncPolicy::Unsynchronized => {}
            SyncPolicy::Strict | SyncPolicy::Loose | SyncPolicy::DistributedQuantum => {
                if time_sync.tick_period_ns == 0 {
                    return Err(IbError::Misconfiguration(format!(
                        "{:?} synchronization requires a nonzero tick period",
                        time_sync.sync_policy
                    )));
                }
                let masters: Vec<&str> = self
                    .simulation_setup
                    .participants
                    .iter()
                    .filter(|p| p.is_sync_master)
                    .map(|p| p.name.as_str())
                    .collect();
                if masters.len() > 1 {
                    return Err(IbError::Misconfiguration(format!(
                        "more than one sync master configured: {masters:?}"
                    )));
                }
                let needs_master = !matches!(time_sync.sync_policy, SyncPolicy::DistributedQuantum);
                if needs_master && masters.is_empty() && !synced.is_empty() {
                    return Err(IbError::Misconfiguration(format!(
                        "{:?} synchronization requires a sync master",
                        time_sync.sync_policy
                    )));
                }
            }
        }

        // Trace sink / source references
        for p in &self.simulation_setup.participants {
            let sink_names: HashSet<&str> =
                p.trace_sinks.iter().map(|s| s.name.as_str()).collect();
            let source_names: HashSet<&str> =
                p.trace_sources.iter().map(|s| s.name.as_str()).collect();
            let check = |controller: &str,
                             sinks: &[String],
                             replay: &Option<ReplayConfig>|
             -> IbResult<()> {
                for sink in sinks {
                    if !sink_names.contains(sink.as_str()) {
                        return Err(IbError::Misconfiguration(format!(
                            "controller '{}/{}' references unknown trace sink '{}'",
                            p.name, controller, sink
                        )));
                    }
                }
                if let Some(replay) = replay {
                    if !source_names.contains(replay.use_trace_source.as_str()) {
                        return Err(IbError::Misconfiguration(format!(
                            "controller '{}/{}' references unknown trace source '{}'",
                            p.name, controller, replay.use_trace_source
                        )));
                    }
                }
                Ok(())
            };
            for c in p
                .can_controllers
                .iter()
                .chain(&p.lin_controllers)
                .chain(&p.flexray_controllers)
                .chain(&p.ethernet_controllers)
            {
                check(&c.name, &c.use_trace_sinks, &c.replay)?;
            }
            for c in p.data_publishers.iter().chain(&p.data_subscribers) {
                check(&c.name, &c.use_trace_sinks, &c.replay)?;
            }
            for c in p.rpc_clients.iter().chain(&p.rpc_servers) {
                check(&c.name, &c.use_trace_sinks, &c.replay)?;
            }
        }

        Ok(())
    }

    /// Whether the configuration permits `run_async` for the given
    /// participant. Strict synchronization and asynchronous run deadlock by
    /// construction, so the combination is rejected here and again at the
    /// `run_async` call site.
    pub fn allows_async_run(&self, participant: &str) -> bool {
        if self.simulation_setup.time_sync.sync_policy != SyncPolicy::Strict {
            return true;
        }
        !self
            .synchronized_participants()
            .iter()
            .any(|name| name == participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_can_participants() -> Config {
        let mut config = Config::default();
        for name in ["P1", "P2"] {
            config.simulation_setup.participants.push(ParticipantConfig {
                name: name.to_string(),
                can_controllers: vec![ControllerConfig {
                    name: "CAN1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        config
    }

    #[test]
    fn test_valid_config_passes() {
        two_can_participants().validate().unwrap();
    }

    #[test]
    fn test_duplicate_qualified_name_rejected() {
        let mut config = two_can_participants();
        config.simulation_setup.participants[0]
            .can_controllers
            .push(ControllerConfig {
                name: "CAN1".to_string(),
                ..Default::default()
            });
        assert!(matches!(
            config.validate(),
            Err(IbError::Misconfiguration(_))
        ));
    }

    #[test]
    fn test_link_with_unknown_endpoint_rejected() {
        let mut config = two_can_participants();
        config.simulation_setup.links.push(LinkConfig {
            name: "CAN1".to_string(),
            endpoints: vec!["P1/CAN1".to_string(), "P3/CAN9".to_string()],
        });
        assert!(matches!(
            config.validate(),
            Err(IbError::Misconfiguration(_))
        ));
    }

    #[test]
    fn test_mixed_kind_network_rejected() {
        let mut config = two_can_participants();
        config.simulation_setup.participants[1]
            .lin_controllers
            .push(ControllerConfig {
                name: "LIN1".to_string(),
                network: Some("CAN1".to_string()),
                ..Default::default()
            });
        assert!(matches!(
            config.validate(),
            Err(IbError::Misconfiguration(_))
        ));
    }

    #[test]
    fn test_strict_sync_requires_tick_period_and_master() {
        let mut config = two_can_participants();
        config.simulation_setup.time_sync.sync_policy = SyncPolicy::Strict;
        config.simulation_setup.participants[0].participant_controller =
            Some(ParticipantControllerConfig {
                sync_type: SyncType::Synchronized,
                ..Default::default()
            });
        assert!(config.validate().is_err());

        config.simulation_setup.time_sync.tick_period_ns = 1_000_000;
        assert!(config.validate().is_err());

        config.simulation_setup.participants[0].is_sync_master = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_strict_sync_rejects_async_run_for_synced_participants() {
        let mut config = two_can_participants();
        config.simulation_setup.time_sync.sync_policy = SyncPolicy::Strict;
        config.simulation_setup.time_sync.tick_period_ns = 1_000_000;
        config.simulation_setup.participants[0].is_sync_master = true;
        config.simulation_setup.participants[0].participant_controller =
            Some(ParticipantControllerConfig {
                sync_type: SyncType::Synchronized,
                ..Default::default()
            });
        assert!(!config.allows_async_run("P1"));
        assert!(config.allows_async_run("P2"));
    }

    #[test]
    fn test_unknown_trace_sink_rejected() {
        let mut config = two_can_participants();
        config.simulation_setup.participants[0].can_controllers[0]
            .use_trace_sinks
            .push("Mdf4Sink".to_string());
        assert!(config.validate().is_err());

        config.simulation_setup.participants[0]
            .trace_sinks
            .push(TraceSinkConfig {
                name: "Mdf4Sink".to_string(),
                output_path: "trace.mf4".to_string(),
            });
        config.validate().unwrap();
    }

    #[test]
    fn test_json_round_trip() {
        let config = two_can_participants();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json_str(&json).unwrap();
        assert_eq!(parsed.simulation_setup.participants.len(), 2);
        assert_eq!(
            parsed.simulation_setup.participants[0].can_controllers[0].link_name(),
            "CAN1"
        );
    }
}
