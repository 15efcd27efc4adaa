// Error taxonomy shared by the BLE backend and the device sessions.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),

    /// The session actor is gone (torn down or panicked); commands sent
    /// to it can no longer be answered.
    #[error("session closed")]
    SessionClosed,

    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Bluetooth(#[from] bluer::Error),

    /// Transport failure raised by a non-BlueZ backend (test doubles).
    #[error("transport error: {0}")]
    Transport(String),
}
