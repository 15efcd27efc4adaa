// Event-bus signals emitted by device sessions.
//
// Listeners subscribe per device: topics follow the `{signal}_{ADDRESS}`
// scheme and carry no payload.

use log::debug;
use rumqttc::{AsyncClient, QoS};

use crate::ble::DeviceAddress;

pub const SIGNAL_BUTTON: &str = "itag_bt_button";
pub const SIGNAL_CONNECTED: &str = "itag_bt_connected";
pub const SIGNAL_DISCONNECTED: &str = "itag_bt_disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ButtonPressed,
    Connected,
    Disconnected,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::ButtonPressed => SIGNAL_BUTTON,
            Signal::Connected => SIGNAL_CONNECTED,
            Signal::Disconnected => SIGNAL_DISCONNECTED,
        }
    }

    pub fn topic(&self, address: &DeviceAddress) -> String {
        format!("{}_{}", self.name(), address)
    }
}

/// Where session signals go. Emission is fire-and-forget: sessions never
/// block on the bus and never observe delivery failures.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, signal: Signal, address: &DeviceAddress);
}

/// MQTT-backed sink publishing zero-payload notifications.
pub struct MqttEventBus {
    client: AsyncClient,
}

impl MqttEventBus {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl EventSink for MqttEventBus {
    fn emit(&self, signal: Signal, address: &DeviceAddress) {
        let topic = signal.topic(address);
        // Non-blocking publish; a full queue or a dead client only
        // costs us this one notification.
        if let Err(e) = self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, Vec::<u8>::new())
        {
            debug!("event publish to {} failed (ignored): {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_signal_address_scheme() {
        let addr: DeviceAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(
            Signal::ButtonPressed.topic(&addr),
            "itag_bt_button_AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            Signal::Connected.topic(&addr),
            "itag_bt_connected_AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(
            Signal::Disconnected.topic(&addr),
            "itag_bt_disconnected_AA:BB:CC:DD:EE:FF"
        );
    }
}
