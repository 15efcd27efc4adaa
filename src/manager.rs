//! Session registry: one [`DeviceSession`] per peripheral address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::ble::{BleBackend, DeviceAddress};
use crate::events::EventSink;
use crate::session::DeviceSession;

/// Owns every session in the process, keyed by canonical address. Both
/// entities of a device share one session; teardown removes it for good.
pub struct SessionManager<B: BleBackend> {
    backend: Arc<B>,
    events: Arc<dyn EventSink>,
    sessions: Mutex<HashMap<DeviceAddress, Arc<DeviceSession>>>,
}

impl<B: BleBackend> SessionManager<B> {
    pub fn new(backend: Arc<B>, events: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The session for `address`, created on first use.
    pub fn session(&self, address: &DeviceAddress) -> Arc<DeviceSession> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions
            .entry(address.clone())
            .or_insert_with(|| {
                info!("creating session for {}", address);
                DeviceSession::spawn(
                    address.clone(),
                    Arc::clone(&self.backend),
                    Arc::clone(&self.events),
                )
            })
            .clone()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<Arc<DeviceSession>> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(address)
            .cloned()
    }

    /// Disconnect and drop the session for `address`. Returns whether a
    /// session existed.
    pub async fn teardown(&self, address: &DeviceAddress) -> bool {
        let session = {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            sessions.remove(address)
        };
        match session {
            Some(session) => {
                session.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Integration unload: tear down every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut registry = self.sessions.lock().expect("session registry poisoned");
            registry.drain().collect()
        };
        for (address, session) in sessions {
            info!("tearing down session for {}", address);
            session.disconnect().await;
        }
    }
}
