//! FlexRay POC state machine and slot-addressed TX buffers in simple
//! mode: Config and Ready are always traversed in order, startup needs a
//! cold-start permit, and each buffer update emits exactly one frame.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use vecu_bus::config::{Config, ControllerConfig, ParticipantConfig, RegistryConfig};
use vecu_bus::services::flexray::{
    ChiCommand, FlexRayChannel, FlexRayClusterParameters, FlexRayControllerConfig,
    FlexRayNodeParameters, FlexRaySymbolPattern, PocState, TransmissionMode, TxBufferConfig,
};
use vecu_bus::Participant;

const DOMAIN: u32 = 42;

fn flexray_config(registry_port: u16) -> Config {
    let mut config = Config::default();
    config.middleware.registry.port = registry_port;
    for name in ["FrNodeA", "FrNodeB"] {
        config.simulation_setup.participants.push(ParticipantConfig {
            name: name.to_string(),
            flexray_controllers: vec![ControllerConfig {
                name: "FlexRay1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
    }
    config
}

fn controller_config() -> FlexRayControllerConfig {
    FlexRayControllerConfig {
        cluster_params: FlexRayClusterParameters::default(),
        node_params: FlexRayNodeParameters::default(),
        buffer_configs: vec![
            TxBufferConfig {
                channels: FlexRayChannel::A,
                slot_id: 40,
                offset: 0,
                repetition: 1,
                transmission_mode: TransmissionMode::SingleShot,
            },
            TxBufferConfig {
                channels: FlexRayChannel::AB,
                slot_id: 60,
                offset: 0,
                repetition: 1,
                transmission_mode: TransmissionMode::Continuous,
            },
        ],
    }
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
async fn test_poc_progression_and_tx_buffers() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = flexray_config(registry.local_addr().port());

    let node_a = Participant::connect(config.clone(), "FrNodeA", DOMAIN).await?;
    let node_b = Participant::connect(config, "FrNodeB", DOMAIN).await?;

    let fr_a = node_a.create_flexray_controller("FlexRay1")?;
    let fr_b = node_b.create_flexray_controller("FlexRay1")?;

    let poc_states: Arc<Mutex<Vec<PocState>>> = Arc::new(Mutex::new(Vec::new()));
    let poc_states_clone = Arc::clone(&poc_states);
    fr_a.add_poc_status_handler(move |event| {
        poc_states_clone.lock().unwrap().push(event.state);
    });

    // RUN before configuration or without a cold-start permit is refused.
    assert_eq!(fr_a.poc_state(), PocState::DefaultConfig);
    assert!(fr_a.execute_cmd(ChiCommand::Run).is_err());

    fr_a.configure(controller_config())?;
    assert_eq!(fr_a.poc_state(), PocState::Ready);
    assert!(fr_a.execute_cmd(ChiCommand::Run).is_err());

    fr_a.execute_cmd(ChiCommand::AllowColdstart)?;
    fr_a.execute_cmd(ChiCommand::Run)?;
    assert_eq!(fr_a.poc_state(), PocState::NormalActive);

    // Config and Ready were traversed in order on the way up.
    assert_eq!(
        *poc_states.lock().unwrap(),
        vec![
            PocState::Config,
            PocState::Ready,
            PocState::Startup,
            PocState::NormalActive
        ]
    );

    // The receiving side observes frames per buffer update.
    fr_b.configure(controller_config())?;
    let frames: Arc<Mutex<Vec<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let frames_clone = Arc::clone(&frames);
    fr_b.add_frame_handler(move |event| {
        frames_clone
            .lock()
            .unwrap()
            .push((event.frame.header.frame_id, event.frame.payload.clone()));
    });

    sleep(Duration::from_millis(300)).await;

    fr_a.update_tx_buffer(0, b"slot forty".to_vec())?;
    fr_a.update_tx_buffer(1, b"slot sixty".to_vec())?;
    // Unknown buffer index is refused
    assert!(fr_a.update_tx_buffer(9, Vec::new()).is_err());

    assert!(
        wait_until(Duration::from_secs(5), || frames.lock().unwrap().len() == 2).await,
        "one frame per buffer update"
    );
    {
        let frames = frames.lock().unwrap();
        assert_eq!(frames[0].0, 40);
        assert_eq!(frames[0].1, b"slot forty");
        assert_eq!(frames[1].0, 60);
    }

    // DEFERRED_HALT ends normal operation.
    fr_a.execute_cmd(ChiCommand::DeferredHalt)?;
    assert_eq!(fr_a.poc_state(), PocState::Halt);
    assert!(fr_a.update_tx_buffer(0, Vec::new()).is_err());

    node_a.disconnect();
    node_b.disconnect();
    Ok(())
}

#[tokio::test]
async fn test_wakeup_emits_a_symbol_and_freeze_halts() -> Result<()> {
    let registry = vecu_bus::start_registry(
        &RegistryConfig {
            port: 0,
            ..Default::default()
        },
        DOMAIN,
    )
    .await?;
    let config = flexray_config(registry.local_addr().port());

    let node_a = Participant::connect(config.clone(), "FrNodeA", DOMAIN).await?;
    let node_b = Participant::connect(config, "FrNodeB", DOMAIN).await?;

    let fr_a = node_a.create_flexray_controller("FlexRay1")?;
    let fr_b = node_b.create_flexray_controller("FlexRay1")?;

    let symbols: Arc<Mutex<Vec<FlexRaySymbolPattern>>> = Arc::new(Mutex::new(Vec::new()));
    let symbols_clone = Arc::clone(&symbols);
    fr_b.add_symbol_handler(move |event| {
        symbols_clone.lock().unwrap().push(event.pattern);
    });

    fr_a.configure(controller_config())?;
    sleep(Duration::from_millis(300)).await;

    // The wakeup pulse is visible on the link; the sender settles back in
    // Ready.
    fr_a.execute_cmd(ChiCommand::Wakeup)?;
    assert_eq!(fr_a.poc_state(), PocState::Ready);
    assert!(
        wait_until(Duration::from_secs(5), || !symbols.lock().unwrap().is_empty()).await
    );
    assert_eq!(symbols.lock().unwrap()[0], FlexRaySymbolPattern::Wus);

    // FREEZE halts from any state.
    fr_a.execute_cmd(ChiCommand::Freeze)?;
    assert_eq!(fr_a.poc_state(), PocState::Halt);

    node_a.disconnect();
    node_b.disconnect();
    Ok(())
}
