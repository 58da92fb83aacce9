//! Ethernet: per-link frame routing, synthesized transmit
//! acknowledgements, and VLAN-filtered forwarding across a configured
//! switch.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use vecu_bus::config::{
    Config, ControllerConfig, ParticipantConfig, RegistryConfig, SwitchConfig, SwitchPortConfig,
};
use vecu_bus::services::ethernet::{EthernetState, EthernetTransmitStatus, MIN_FRAME_SIZE};
use vecu_bus::{Direction, Participant};

const DOMAIN: u32 = 42;

/// Two controllers on different links, bridged by a switch whose ports
/// both carry VLAN 2.
fn switched_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "EcuA".to_string(),
        ethernet_controllers: vec![ControllerConfig {
            name: "ETH0".to_string(),
            network: Some("ETH_A".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "EcuB".to_string(),
        ethernet_controllers: vec![ControllerConfig {
            name: "ETH0".to_string(),
            network: Some("ETH_B".to_string()),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.switches.push(SwitchConfig {
        name: "FrontSwitch".to_string(),
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
        ],
    });
    config
}

fn tagged_frame(vlan: u16, marker: u8) -> Vec<u8> {
    let mut frame = vec![0u8; MIN_FRAME_SIZE];
    frame[0..6].copy_from_slice(&[0xFF; 6]); // broadcast destination
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, marker]);
    frame[12] = 0x81;
    frame[13] = 0x00;
    frame[14] = (vlan >> 8) as u8;
    frame[15] = (vlan & 0xFF) as u8;
    frame[16] = 0x08; // EtherType IPv4
    frame[17] = 0x00;
    frame[MIN_FRAME_SIZE - 1] = marker;
    frame
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_switch_forwards_by_vlan() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = switched_config(registry.local_addr().port());

    let ecu_a = Participant::connect(config.clone(), "EcuA", DOMAIN).await?;
    let ecu_b = Participant::connect(config, "EcuB", DOMAIN).await?;

    let eth_a = ecu_a.create_ethernet_controller("ETH0")?;
    let eth_b = ecu_b.create_ethernet_controller("ETH0")?;
    eth_a.activate();
    eth_b.activate();
    assert_eq!(eth_a.state(), EthernetState::LinkUp);

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    eth_b.add_frame_handler(Direction::Rx, move |event| {
        received_clone.lock().unwrap().push(event.frame.clone());
    });

    let acks: Arc<Mutex<Vec<EthernetTransmitStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let acks_clone = Arc::clone(&acks);
    eth_a.add_frame_transmit_handler(move |event| {
        acks_clone.lock().unwrap().push(event.status);
    });

    sleep(Duration::from_millis(300)).await;

    // VLAN 2 crosses the switch; VLAN 3 does not; untagged frames use the
    // ingress port's native VLAN 1, which the other port does not carry.
    eth_a.send_frame(tagged_frame(2, 0x11), 1)?;
    eth_a.send_frame(tagged_frame(3, 0x22), 2)?;
    eth_a.send_frame(vec![0u8; MIN_FRAME_SIZE], 3)?;

    assert!(
        wait_until(Duration::from_secs(5), || acks.lock().unwrap().len() == 3).await
    );
    sleep(Duration::from_millis(200)).await;

    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1, "only the VLAN 2 frame crosses the switch");
        assert_eq!(received[0][MIN_FRAME_SIZE - 1], 0x11);
    }
    assert!(acks
        .lock()
        .unwrap()
        .iter()
        .all(|status| *status == EthernetTransmitStatus::Transmitted));

    ecu_a.disconnect();
    ecu_b.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_undersized_and_inactive_sends_are_refused() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = switched_config(registry.local_addr().port());

    let ecu_a = Participant::connect(config, "EcuA", DOMAIN).await?;
    let eth = ecu_a.create_ethernet_controller("ETH0")?;

    let acks: Arc<Mutex<Vec<EthernetTransmitStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let acks_clone = Arc::clone(&acks);
    eth.add_frame_transmit_handler(move |event| {
        acks_clone.lock().unwrap().push(event.status);
    });

    // Sending while inactive
    eth.send_frame(vec![0u8; MIN_FRAME_SIZE], 1)?;
    // Undersized frame after activation
    eth.activate();
    eth.send_frame(vec![0u8; 10], 2)?;

    assert!(
        wait_until(Duration::from_secs(5), || acks.lock().unwrap().len() == 2).await
    );
    let acks = acks.lock().unwrap();
    assert_eq!(acks[0], EthernetTransmitStatus::ControllerInactive);
    assert_eq!(acks[1], EthernetTransmitStatus::InvalidFrameFormat);

    ecu_a.disconnect();
    Ok(())
}
