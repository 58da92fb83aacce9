//! RPC call/response correlation: ten calls round-trip through a server
//! that mutates the argument bytes; calls without a matching server are
//! reported as undeliverable.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use vecu_bus::config::{Config, ParticipantConfig, RegistryConfig, RpcPortConfig};
use vecu_bus::services::rpc::CallStatus;
use vecu_bus::Participant;

const DOMAIN: u32 = 42;

fn rpc_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "Client".to_string(),
        rpc_clients: vec![RpcPortConfig {
            name: "TestFunc".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "Server".to_string(),
        rpc_servers: vec![RpcPortConfig {
            name: "TestFunc".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    config
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
async fn test_rpc_round_trip() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = rpc_config(registry.local_addr().port());

    let client_participant = Participant::connect(config.clone(), "Client", DOMAIN).await?;
    let server_participant = Participant::connect(config, "Server", DOMAIN).await?;

    let client = client_participant.create_rpc_client("TestFunc")?;
    let server = server_participant.create_rpc_server("TestFunc")?;

    // The server adds 100 to every argument byte.
    server.set_call_handler(|call| call.data.iter().map(|byte| byte + 100).collect());

    let results: Arc<Mutex<Vec<(CallStatus, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let results_clone = Arc::clone(&results);
    client.add_call_result_handler(move |event| {
        results_clone
            .lock()
            .unwrap()
            .push((event.status, event.return_data.clone()));
    });

    sleep(Duration::from_millis(300)).await;
    assert_eq!(client.discover_servers().len(), 1);

    for i in 0..10u8 {
        client.call(vec![i, i, i])?;
    }

    assert!(
        wait_until(Duration::from_secs(5), || results.lock().unwrap().len() == 10).await,
        "client received {:?} results",
        results.lock().unwrap().len()
    );

    let results = results.lock().unwrap();
    for (i, (status, data)) in results.iter().enumerate() {
        assert_eq!(*status, CallStatus::Success);
        assert_eq!(*data, vec![i as u8 + 100; 3]);
    }

    client_participant.disconnect();
    server_participant.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_call_without_server_is_undeliverable() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = rpc_config(registry.local_addr().port());

    // Only the client joins; no server matches at call time.
    let client_participant = Participant::connect(config, "Client", DOMAIN).await?;
    let client = client_participant.create_rpc_client("TestFunc")?;

    let statuses: Arc<Mutex<Vec<CallStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_clone = Arc::clone(&statuses);
    client.add_call_result_handler(move |event| {
        statuses_clone.lock().unwrap().push(event.status);
    });

    assert!(client.discover_servers().is_empty());
    client.call(vec![1, 2, 3])?;

    assert!(
        wait_until(Duration::from_secs(5), || !statuses.lock().unwrap().is_empty()).await
    );
    assert_eq!(statuses.lock().unwrap()[0], CallStatus::Undeliverable);

    client_participant.disconnect();
    Ok(())
}
