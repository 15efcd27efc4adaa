// BlueZ implementation of the radio seam, using the bluer crate.
//
// One shared session/adapter plays the scanner-manager role; each
// established link is wrapped in a BluerConnection.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, AddressType, DeviceEvent, DeviceProperty, Session};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info};
use uuid::Uuid;

use crate::ble::{Advertisement, BleBackend, BleConnection, DeviceAddress};
use crate::error::{Error, Result};

pub struct BluerBackend {
    // Held so the adapter's D-Bus connection outlives every device.
    _session: Session,
    adapter: Adapter,
}

impl BluerBackend {
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        info!("Using Bluetooth adapter: {}", adapter.name());
        adapter.set_powered(true).await?;

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }
}

fn to_bluer_address(address: &DeviceAddress) -> bluer::Address {
    let mut bytes = [0u8; 6];
    for (i, part) in address.as_str().split(':').enumerate().take(6) {
        bytes[i] = u8::from_str_radix(part, 16).unwrap_or(0);
    }
    bluer::Address::new(bytes)
}

/// Connect with a couple of retries; BlueZ aborts LE connections under
/// transient conditions (le-connection-abort-by-local, stale GATT cache)
/// that clear up on the next attempt.
async fn establish(device: &bluer::Device) -> Result<()> {
    if device.is_connected().await? {
        return Ok(());
    }
    let mut retries = 2;
    loop {
        match device.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if retries > 0 => {
                debug!("connect attempt failed, retrying: {}", e);
                retries -= 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl BleBackend for BluerBackend {
    type Conn = BluerConnection;

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        // Discovery with change reporting: a known device advertising
        // again (RSSI update) is re-announced, which is what re-arms
        // auto-connect after a link loss.
        let events = self.adapter.discover_devices_with_changes().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    AdapterEvent::DeviceAdded(addr) => Some(Advertisement {
                        address: Some(addr.to_string()),
                    }),
                    _ => None,
                }
            })
            .boxed())
    }

    async fn connect_known(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<BluerConnection>> {
        let addr = to_bluer_address(address);
        if !self.adapter.device_addresses().await?.contains(&addr) {
            return Ok(None);
        }
        let device = self.adapter.device(addr)?;
        tokio::time::timeout(timeout, establish(&device))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(Some(BluerConnection { device }))
    }

    async fn connect_direct(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<BluerConnection> {
        let addr = to_bluer_address(address);
        let device = tokio::time::timeout(
            timeout,
            self.adapter.connect_device(addr, AddressType::LePublic),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))??;
        Ok(BluerConnection { device })
    }
}

pub struct BluerConnection {
    device: bluer::Device,
}

impl BluerConnection {
    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        for service in self.device.services().await? {
            for ch in service.characteristics().await? {
                if ch.uuid().await? == uuid {
                    return Ok(ch);
                }
            }
        }
        Err(Error::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl BleConnection for BluerConnection {
    type Char = Characteristic;

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn characteristics_by_uuid(&self, uuid: Uuid) -> Result<Vec<Characteristic>> {
        let mut found = Vec::new();
        for service in self.device.services().await? {
            for ch in service.characteristics().await? {
                if ch.uuid().await? == uuid {
                    found.push(ch);
                }
            }
        }
        Ok(found)
    }

    async fn write_characteristic(&self, ch: &Characteristic, payload: &[u8]) -> Result<()> {
        ch.write(payload).await?;
        Ok(())
    }

    async fn write_by_uuid(&self, uuid: Uuid, payload: &[u8]) -> Result<()> {
        let ch = self.find_characteristic(uuid).await?;
        ch.write(payload).await?;
        Ok(())
    }

    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let ch = self.find_characteristic(uuid).await?;
        Ok(ch.read().await?)
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
        let ch = self.find_characteristic(uuid).await?;
        let stream = ch.notify().await?;
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, _uuid: Uuid) -> Result<()> {
        // BlueZ ends the notify session when the notification stream is
        // dropped; there is nothing to revoke here.
        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let events = self.device.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => Some(()),
                    _ => None,
                }
            })
            .boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await?;
        Ok(())
    }
}
