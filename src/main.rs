// iTag BLE bridge for Home Assistant

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::signal;

use hass_itag_ble::ble::DeviceAddress;
use hass_itag_ble::bluetooth::BluerBackend;
use hass_itag_ble::config;
use hass_itag_ble::entity::{BatterySensor, BeepSwitch};
use hass_itag_ble::events::{EventSink, MqttEventBus};
use hass_itag_ble::manager::SessionManager;
use hass_itag_ble::mqtt::MqttClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting iTag BLE bridge for Home Assistant");

    let config = config::load_config()?;
    info!("Configuration loaded, {} device(s)", config.devices.len());

    let (mqtt, mut commands) = MqttClient::new(config.mqtt.clone())
        .await
        .map_err(|e| anyhow::anyhow!("MQTT setup failed: {e}"))?;
    let mqtt = Arc::new(mqtt);
    info!("MQTT client connected to {}", mqtt.host());

    let backend = Arc::new(BluerBackend::new(config.bluetooth.adapter.as_deref()).await?);
    info!("BLE adapter initialized: {}", backend.adapter_name());

    let events: Arc<dyn EventSink> = Arc::new(MqttEventBus::new(mqtt.handle()));
    let manager = SessionManager::new(backend, events);

    let poll_interval = Duration::from_secs(config.battery_poll_interval_secs);
    let mut switches: HashMap<String, BeepSwitch> = HashMap::new();

    for device in &config.devices {
        let address: DeviceAddress = device.address()?;
        let session = manager.session(&address);

        session.start_watch();
        // Kick one attempt now; later ones ride on advertisements.
        let kick = session.clone();
        tokio::spawn(async move { kick.connect().await });

        let sensor = BatterySensor::new(session.clone(), mqtt.clone(), device.name.clone());
        sensor.announce().await;
        tokio::spawn(sensor.run(poll_interval));

        let switch = BeepSwitch::new(session, mqtt.clone(), device.name.clone());
        switch.announce().await;
        switches.insert(switch.command_topic(), switch);
    }

    info!("Setup complete. Watching for devices...");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            msg = commands.recv() => {
                let Some(msg) = msg else { break };
                match switches.get(&msg.topic) {
                    Some(switch) => switch.handle_command(&msg.payload).await,
                    None => warn!("command on unknown topic {}", msg.topic),
                }
            }
        }
    }

    info!("Shutting down...");
    manager.shutdown().await;

    Ok(())
}
