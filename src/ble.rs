//! Radio seam between the session state machine and the BLE stack.
//!
//! The session only talks to [`BleBackend`] and [`BleConnection`]; the
//! BlueZ implementation lives in `bluetooth`, test doubles implement the
//! same traits in-process.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Canonical (uppercased) link-layer address of a peripheral.
///
/// Sessions are keyed by this; comparing two addresses is therefore a
/// case-insensitive MAC comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address with `:` replaced by `_`, as used in entity unique ids.
    pub fn underscored(&self) -> String {
        self.0.replace(':', "_")
    }

    /// Case-insensitive match against a raw address string.
    pub fn matches(&self, raw: &str) -> bool {
        raw.eq_ignore_ascii_case(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let valid = parts.len() == 6
            && parts
                .iter()
                .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(DeviceAddress(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One sighting reported by the shared scanner. The scanner does no
/// filtering; some transports report sightings without an address.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: Option<String>,
}

/// An established link to a peripheral, replaced wholesale on reconnect.
#[async_trait]
pub trait BleConnection: Send + Sync + 'static {
    /// Opaque handle to one discovered characteristic instance.
    type Char: Clone + Send + Sync;

    async fn is_connected(&self) -> bool;

    /// Every instance of `uuid` across all advertised services. A
    /// peripheral may expose the same characteristic under several
    /// services; callers that write must fan out over all of them.
    async fn characteristics_by_uuid(&self, uuid: Uuid) -> Result<Vec<Self::Char>>;

    async fn write_characteristic(&self, ch: &Self::Char, payload: &[u8]) -> Result<()>;

    /// Fallback write addressed by UUID alone, for peripherals whose
    /// service enumeration came back empty.
    async fn write_by_uuid(&self, uuid: Uuid, payload: &[u8]) -> Result<()>;

    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Vec<u8>>;

    /// Subscribe to notifications on `uuid`. The subscription lives as
    /// long as the returned stream.
    async fn subscribe(&self, uuid: Uuid) -> Result<BoxStream<'static, Vec<u8>>>;

    async fn unsubscribe(&self, uuid: Uuid) -> Result<()>;

    /// Yields once per link loss observed by the transport. The stream
    /// ends when the connection object is dropped.
    async fn disconnections(&self) -> Result<BoxStream<'static, ()>>;

    async fn disconnect(&self) -> Result<()>;
}

/// Shared scanner/manager plus per-device connection establishment.
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    type Conn: BleConnection;

    /// Unfiltered advertisement sightings from the shared scanner.
    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>>;

    /// Tier 1: resolve the address through the shared device cache and
    /// establish with the retry-aware helper. `Ok(None)` means the cache
    /// has no handle for this address (distinct from a failed connect).
    async fn connect_known(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<Self::Conn>>;

    /// Tier 2: direct connection bypassing the device cache.
    async fn connect_direct(&self, address: &DeviceAddress, timeout: Duration)
        -> Result<Self::Conn>;
}
