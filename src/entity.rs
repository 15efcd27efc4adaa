// MQTT entity adapters: battery sensor and beep switch.
//
// These only translate entity traffic (polls, commands) into session
// calls; every bit of connection logic lives in the session.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};

use crate::mqtt::MqttClient;
use crate::session::DeviceSession;

const STATE_PREFIX: &str = "hass-itag-ble";

fn device_block(mac: &str, name: Option<&str>) -> serde_json::Value {
    json!({
        "identifiers": [format!("itag_{mac}")],
        "name": name.map(str::to_string).unwrap_or_else(|| format!("iTag {mac}")),
        "manufacturer": "iTag",
    })
}

// === Battery sensor ===

pub struct BatterySensor {
    session: Arc<DeviceSession>,
    mqtt: Arc<MqttClient>,
    device_name: Option<String>,
}

impl BatterySensor {
    pub fn new(
        session: Arc<DeviceSession>,
        mqtt: Arc<MqttClient>,
        device_name: Option<String>,
    ) -> Self {
        Self {
            session,
            mqtt,
            device_name,
        }
    }

    pub fn object_id(&self) -> String {
        format!("itag_batt_{}", self.session.address().underscored())
    }

    pub fn state_topic(&self) -> String {
        format!(
            "{}/{}/battery",
            STATE_PREFIX,
            self.session.address().underscored()
        )
    }

    pub fn discovery_payload(&self) -> serde_json::Value {
        json!({
            "name": "iTag Battery",
            "unique_id": self.object_id(),
            "state_topic": self.state_topic(),
            "unit_of_measurement": "%",
            "device_class": "battery",
            "device": device_block(
                self.session.address().as_str(),
                self.device_name.as_deref(),
            ),
        })
    }

    pub async fn announce(&self) {
        if let Err(e) = self
            .mqtt
            .publish_discovery("sensor", &self.object_id(), self.discovery_payload())
            .await
        {
            warn!("battery discovery publish failed: {}", e);
        }
    }

    /// Poll loop. A failed or empty read keeps the last published value;
    /// the entity never goes into an error state over a missed poll.
    pub async fn run(self, poll_interval: Duration) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.session.read_battery().await {
                Ok(Some(level)) => {
                    if let Err(e) = self
                        .mqtt
                        .publish_state(&self.state_topic(), &level.to_string())
                        .await
                    {
                        debug!("battery state publish failed: {}", e);
                    }
                }
                Ok(None) => {
                    debug!("ITag[{}] battery poll: no value", self.session.address());
                }
                Err(e) => {
                    debug!(
                        "ITag[{}] battery poll failed, keeping last value: {}",
                        self.session.address(),
                        e
                    );
                }
            }
        }
    }
}

// === Beep switch ===

pub fn parse_switch_command(payload: &str) -> Option<bool> {
    match payload.trim().to_ascii_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

pub struct BeepSwitch {
    session: Arc<DeviceSession>,
    mqtt: Arc<MqttClient>,
    device_name: Option<String>,
}

impl BeepSwitch {
    pub fn new(
        session: Arc<DeviceSession>,
        mqtt: Arc<MqttClient>,
        device_name: Option<String>,
    ) -> Self {
        Self {
            session,
            mqtt,
            device_name,
        }
    }

    pub fn object_id(&self) -> String {
        format!("itag_beep_{}", self.session.address().underscored())
    }

    pub fn command_topic(&self) -> String {
        format!(
            "{}/{}/beep/set",
            STATE_PREFIX,
            self.session.address().underscored()
        )
    }

    pub fn state_topic(&self) -> String {
        format!(
            "{}/{}/beep/state",
            STATE_PREFIX,
            self.session.address().underscored()
        )
    }

    pub fn discovery_payload(&self) -> serde_json::Value {
        json!({
            "name": format!("iTag Beep {}", self.session.address()),
            "unique_id": self.object_id(),
            "command_topic": self.command_topic(),
            "state_topic": self.state_topic(),
            "payload_on": "ON",
            "payload_off": "OFF",
            "device": device_block(
                self.session.address().as_str(),
                self.device_name.as_deref(),
            ),
        })
    }

    pub async fn announce(&self) {
        if let Err(e) = self
            .mqtt
            .publish_discovery("switch", &self.object_id(), self.discovery_payload())
            .await
        {
            warn!("switch discovery publish failed: {}", e);
        }
        if let Err(e) = self.mqtt.subscribe(&self.command_topic()).await {
            warn!("switch command subscribe failed: {}", e);
        }
    }

    /// Handle one command payload. State is echoed optimistically: the
    /// tag gives no readback for the beeper.
    pub async fn handle_command(&self, payload: &str) {
        let Some(on) = parse_switch_command(payload) else {
            warn!(
                "ITag[{}] unknown beep command {:?}",
                self.session.address(),
                payload
            );
            return;
        };
        self.session.beep(on).await;
        let state = if on { "ON" } else { "OFF" };
        if let Err(e) = self.mqtt.publish_state(&self.state_topic(), state).await {
            debug!("switch state publish failed: {}", e);
        }
    }
}
