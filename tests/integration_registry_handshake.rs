//! Registry join handshake: id assignment, rejection of duplicate names
//! and mismatched domains, and configuration lookups at connect time.

use anyhow::Result;
use vecu_bus::config::{Config, ControllerConfig, ParticipantConfig, RegistryConfig};
use vecu_bus::{IbError, Participant};

const DOMAIN: u32 = 42;

fn mesh_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;
    for name in ["First", "Second"] {
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

#[tokio::test]
async fn test_participants_get_distinct_ids() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = mesh_config(registry.local_addr().port());

    let first = Participant::connect(config.clone(), "First", DOMAIN).await?;
    let second = Participant::connect(config, "Second", DOMAIN).await?;

    assert_ne!(first.id(), second.id());
    assert_ne!(first.id(), 0, "participant id 0 is reserved for the registry");
    assert_eq!(first.name(), "First");
    assert_eq!(first.domain_id(), DOMAIN);

    first.disconnect();
    second.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = mesh_config(registry.local_addr().port());

    let _first = Participant::connect(config.clone(), "First", DOMAIN).await?;
    let second = Participant::connect(config, "First", DOMAIN).await;
    assert!(matches!(second, Err(IbError::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn test_domain_mismatch_is_rejected() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = mesh_config(registry.local_addr().port());

    let joined = Participant::connect(config, "First", DOMAIN + 1).await;
    assert!(matches!(joined, Err(IbError::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn test_unconfigured_participant_is_a_misconfiguration() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = mesh_config(registry.local_addr().port());

    let joined = Participant::connect(config.clone(), "Nobody", DOMAIN).await;
    assert!(matches!(joined, Err(IbError::Misconfiguration(_))));

    // Controllers must be configured as well.
    let first = Participant::connect(config, "First", DOMAIN).await?;
    assert!(matches!(
        first.create_lin_controller("LIN1"),
        Err(IbError::Misconfiguration(_))
    ));
    first.disconnect();
    Ok(())
}
