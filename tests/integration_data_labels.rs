//! Generic pub/sub: label matching, specific handlers narrowing a
//! general subscription, new-data-source notification, and last-value
//! history replay for late joiners.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use vecu_bus::config::{Config, DataPortConfig, ParticipantConfig, RegistryConfig};
use vecu_bus::{Label, Participant};

const DOMAIN: u32 = 42;

fn pubsub_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;

    config.simulation_setup.participants.push(ParticipantConfig {
        name: "PubA".to_string(),
        data_publishers: vec![DataPortConfig {
            name: "PortA".to_string(),
            network: Some("T".to_string()),
            labels: vec![Label::new("KeyA", "ValA")],
            media_type: "application/octet-stream".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "PubB".to_string(),
        data_publishers: vec![DataPortConfig {
            name: "PortB".to_string(),
            network: Some("T".to_string()),
            labels: vec![Label::new("KeyA", "ValA"), Label::new("KeyB", "ValB")],
            media_type: "application/octet-stream".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "Sub".to_string(),
        data_subscribers: vec![DataPortConfig {
            name: "Port".to_string(),
            network: Some("T".to_string()),
            labels: vec![Label::new("KeyA", "ValA")],
            media_type: "application/octet-stream".to_string(),
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
async fn test_label_matching_and_specific_handlers() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = pubsub_config(registry.local_addr().port());

    let pub_a_participant = Participant::connect(config.clone(), "PubA", DOMAIN).await?;
    let pub_b_participant = Participant::connect(config.clone(), "PubB", DOMAIN).await?;
    let sub_participant = Participant::connect(config, "Sub", DOMAIN).await?;

    // Subscriber first, so its handlers observe the publishers appearing.
    let subscriber = sub_participant.create_data_subscriber("Port")?;

    let sources: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sources_clone = Arc::clone(&sources);
    subscriber.add_new_data_source_handler(move |event| {
        sources_clone.lock().unwrap().push(event.qualified_name.clone());
    });

    let default_received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let default_clone = Arc::clone(&default_received);
    subscriber.add_data_message_handler(move |event| {
        default_clone.lock().unwrap().push(event.data.clone());
    });

    let publisher_a = pub_a_participant.create_data_publisher("PortA")?;
    let publisher_b = pub_b_participant.create_data_publisher("PortB")?;

    sleep(Duration::from_millis(300)).await;

    // Both publishers match the general subscription {KeyA:ValA}.
    publisher_a.publish(b"from A 1")?;
    publisher_b.publish(b"from B 1")?;
    assert!(
        wait_until(Duration::from_secs(5), || {
            default_received.lock().unwrap().len() == 2
        })
        .await
    );

    // Both matching publishers were discovered exactly once.
    {
        let mut sources = sources.lock().unwrap();
        sources.sort();
        assert_eq!(*sources, vec!["PubA/PortA", "PubB/PortB"]);
    }

    // A specific handler keyed on {KeyA:"", KeyB:""} captures only B.
    let specific_received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let specific_clone = Arc::clone(&specific_received);
    subscriber.add_explicit_data_message_handler(
        vec![Label::new("KeyA", ""), Label::new("KeyB", "")],
        move |event| {
            specific_clone.lock().unwrap().push(event.data.clone());
        },
    );

    publisher_a.publish(b"from A 2")?;
    publisher_b.publish(b"from B 2")?;
    assert!(
        wait_until(Duration::from_secs(5), || {
            specific_received.lock().unwrap().len() == 1
                && default_received.lock().unwrap().len() == 3
        })
        .await,
        "default {:?}, specific {:?}",
        default_received.lock().unwrap(),
        specific_received.lock().unwrap()
    );
    assert_eq!(specific_received.lock().unwrap()[0], b"from B 2");
    assert_eq!(default_received.lock().unwrap()[2], b"from A 2");

    pub_a_participant.disconnect();
    pub_b_participant.disconnect();
    sub_participant.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_history_replays_last_value_to_late_joiner() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let mut config = Config::default();
    config.middleware.registry.port = registry.local_addr().port();
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "Pub".to_string(),
        data_publishers: vec![DataPortConfig {
            name: "State".to_string(),
            history: 1,
            media_type: "application/octet-stream".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    config.simulation_setup.participants.push(ParticipantConfig {
        name: "LateSub".to_string(),
        data_subscribers: vec![DataPortConfig {
            name: "State".to_string(),
            media_type: "application/octet-stream".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });

    let pub_participant = Participant::connect(config.clone(), "Pub", DOMAIN).await?;
    let publisher = pub_participant.create_data_publisher("State")?;

    // Two publishes with nobody listening; only the last survives.
    publisher.publish(b"v1")?;
    sleep(Duration::from_millis(50)).await;
    publisher.publish(b"v2")?;
    let published_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    sleep(Duration::from_millis(100)).await;

    let sub_participant = Participant::connect(config, "LateSub", DOMAIN).await?;
    let subscriber = sub_participant.create_data_subscriber("State")?;
    let received: Arc<Mutex<Vec<(Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    subscriber.add_data_message_handler(move |event| {
        received_clone
            .lock()
            .unwrap()
            .push((event.data.clone(), event.timestamp_ns));
    });

    assert!(
        wait_until(Duration::from_secs(5), || !received.lock().unwrap().is_empty()).await,
        "late joiner never received the history replay"
    );
    sleep(Duration::from_millis(200)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1, "exactly the last payload is replayed once");
    assert_eq!(received[0].0, b"v2");
    // The original publication timestamp is preserved.
    assert!(received[0].1 <= published_at);

    pub_participant.disconnect();
    sub_participant.disconnect();
    Ok(())
}
