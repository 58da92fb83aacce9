//! Lifecycle aggregation: the system state follows the minimum of the
//! required participants, an error forces the aggregate exactly once, and
//! a subsequent shutdown drives everything to the terminal state.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use vecu_bus::config::{
    Config, ParticipantConfig, ParticipantControllerConfig, RegistryConfig,
};
use vecu_bus::{Participant, ParticipantState, SystemState};

const DOMAIN: u32 = 42;

fn lifecycle_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;
    for name in ["Controller", "Node1", "Node2"] {
        config.simulation_setup.participants.push(ParticipantConfig {
            name: name.to_string(),
            participant_controller: if name == "Controller" {
                None
            } else {
                Some(ParticipantControllerConfig::default())
            },
            ..Default::default()
        });
    }
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
async fn test_error_forces_the_system_state_once() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = lifecycle_config(registry.local_addr().port());

    let controller_participant =
        Participant::connect(config.clone(), "Controller", DOMAIN).await?;
    let node1 = Participant::connect(config.clone(), "Node1", DOMAIN).await?;
    let node2 = Participant::connect(config, "Node2", DOMAIN).await?;

    let controller = controller_participant.system_controller();
    let monitor = controller_participant.system_monitor();
    controller.set_required_participants(vec!["Node1".to_string(), "Node2".to_string()]);

    let error_observations = Arc::new(AtomicUsize::new(0));
    let error_observations_clone = Arc::clone(&error_observations);
    let observed_states: Arc<Mutex<Vec<SystemState>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_states_clone = Arc::clone(&observed_states);
    monitor.register_system_state_handler(move |state| {
        observed_states_clone.lock().unwrap().push(*state);
        if *state == SystemState::Error {
            error_observations_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    let node1_pc = node1.participant_controller()?;
    let node2_pc = node2.participant_controller()?;
    node1_pc.set_init_handler(|_| {});
    node2_pc.set_init_handler(|_| {});

    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.participant_state("Node1") == Some(ParticipantState::Idle)
                && monitor.participant_state("Node2") == Some(ParticipantState::Idle)
        })
        .await
    );

    controller.initialize("Node1");
    controller.initialize("Node2");
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Initialized
        })
        .await
    );

    controller.run();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Running
        })
        .await
    );

    // One required participant fails; the aggregate follows.
    node1_pc.report_error("injected failure");
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Error
        })
        .await
    );
    assert_eq!(node1_pc.state(), ParticipantState::Error);
    assert_eq!(node2_pc.state(), ParticipantState::Running);

    // Shutdown drives both required participants to the terminal state;
    // the running one stops on the way down.
    controller.stop();
    controller.shutdown();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Shutdown
        })
        .await,
        "system ended in {:?}",
        monitor.system_state()
    );
    assert_eq!(node1_pc.state(), ParticipantState::Shutdown);
    assert_eq!(node2_pc.state(), ParticipantState::Shutdown);

    // The Error aggregate was observed exactly once.
    assert_eq!(error_observations.load(Ordering::SeqCst), 1);

    controller_participant.disconnect();
    node1.disconnect();
    node2.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_callbacks_run_in_lifecycle_order() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = lifecycle_config(registry.local_addr().port());

    let controller_participant =
        Participant::connect(config.clone(), "Controller", DOMAIN).await?;
    let node1 = Participant::connect(config.clone(), "Node1", DOMAIN).await?;
    let node2 = Participant::connect(config, "Node2", DOMAIN).await?;

    let controller = controller_participant.system_controller();
    let monitor = controller_participant.system_monitor();
    controller.set_required_participants(vec!["Node1".to_string(), "Node2".to_string()]);

    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let node1_pc = node1.participant_controller()?;
    let node2_pc = node2.participant_controller()?;
    for pc in [&node1_pc, &node2_pc] {
        let calls_init = Arc::clone(&calls);
        pc.set_init_handler(move |_| calls_init.lock().unwrap().push("init"));
        let calls_stop = Arc::clone(&calls);
        pc.set_stop_handler(move || calls_stop.lock().unwrap().push("stop"));
        let calls_shutdown = Arc::clone(&calls);
        pc.set_shutdown_handler(move || calls_shutdown.lock().unwrap().push("shutdown"));
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.participant_state("Node1") == Some(ParticipantState::Idle)
                && monitor.participant_state("Node2") == Some(ParticipantState::Idle)
        })
        .await
    );
    controller.initialize("Node1");
    controller.initialize("Node2");
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Initialized
        })
        .await
    );
    controller.run();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Running
        })
        .await
    );
    controller.stop();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Stopped
        })
        .await
    );
    controller.shutdown();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::Shutdown
        })
        .await
    );

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 6, "init, stop, shutdown on each node: {calls:?}");
    assert_eq!(calls.iter().filter(|c| **c == "init").count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == "stop").count(), 2);
    assert_eq!(calls.iter().filter(|c| **c == "shutdown").count(), 2);

    // wait_for_lifecycle_to_complete observes the terminal state.
    assert_eq!(
        node1_pc.wait_for_lifecycle_to_complete().await?,
        ParticipantState::Shutdown
    );

    controller_participant.disconnect();
    node1.disconnect();
    node2.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_coldswap_round_trip() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = lifecycle_config(registry.local_addr().port());

    let controller_participant =
        Participant::connect(config.clone(), "Controller", DOMAIN).await?;
    let node1 = Participant::connect(config, "Node1", DOMAIN).await?;

    let controller = controller_participant.system_controller();
    let monitor = controller_participant.system_monitor();
    controller.set_required_participants(vec!["Node1".to_string()]);

    let node1_pc = node1.participant_controller()?;
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.participant_state("Node1") == Some(ParticipantState::Idle)
        })
        .await
    );

    controller.prepare_coldswap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            monitor.system_state() == SystemState::ColdswapReady
        })
        .await
    );

    // Executing the swap resets the participant to Idle for re-entry.
    controller.execute_coldswap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            node1_pc.state() == ParticipantState::Idle
        })
        .await
    );

    controller_participant.disconnect();
    node1.disconnect();
    Ok(())
}
