// MQTT client module using rumqttc

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::config::MqttConfig;

/// An incoming publish on a subscribed command topic.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    config: MqttConfig,
}

impl MqttClient {
    /// Connect and spawn the background event loop. Incoming publishes
    /// are routed to the returned receiver; everything else is logged.
    pub async fn new(
        config: MqttConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CommandMessage>), Box<dyn std::error::Error>> {
        let mut mqttoptions = MqttOptions::new("hass-itag-ble", &config.host, config.port);

        if let Some(username) = &config.username {
            mqttoptions.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        info!("Connecting to MQTT broker: {}:{}", config.host, config.port);
        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Event loop runs for the life of the process; rumqttc
        // re-establishes the broker session as long as we keep polling.
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        let message = CommandMessage {
                            topic: publish.topic.clone(),
                            payload,
                        };
                        if command_tx.send(message).is_err() {
                            warn!("command receiver dropped, stopping MQTT loop");
                            break;
                        }
                    }
                    Ok(notification) => {
                        debug!("MQTT event: {:?}", notification);
                    }
                    Err(e) => {
                        error!("MQTT event loop error: {:?}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok((MqttClient { client, config }, command_rx))
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn handle(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Publish a Home Assistant MQTT discovery config.
    pub async fn publish_discovery(
        &self,
        component: &str,
        object_id: &str,
        config_value: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let topic = format!(
            "{}/{}/{}/config",
            self.config.discovery_prefix, component, object_id
        );
        let payload = serde_json::to_string(&config_value)?;

        info!("Publishing discovery config to: {}", topic);
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload.into_bytes())
            .await?;

        Ok(())
    }

    pub async fn publish_state(
        &self,
        topic: &str,
        payload: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        debug!("Publishing state to: {}", topic);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await?;

        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), Box<dyn std::error::Error>> {
        info!("Subscribing to commands on: {}", topic);
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }
}
