//! Per-device session slots and locking.
//!
//! One session per device. Mutating operations hold the exclusive writer
//! lock for their full duration, recovery and verification included; reads
//! take a bounded slot (1 for Telnet, which cannot multiplex; more for SSH
//! exec). Idle sessions are torn down on next acquisition and the handler
//! reconnects transparently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::handler::{DeviceHandler, HandlerRegistry};
use crate::inventory::Device;

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// The handler slot behind a session's mutex.
pub struct HandlerSlot {
    pub handler: Box<dyn DeviceHandler>,
    last_used: Instant,
}

/// One device's session state.
pub struct DeviceSession {
    device: Device,
    writer: Mutex<()>,
    read_slots: Arc<Semaphore>,
    slot: Mutex<HandlerSlot>,
    idle_timeout: Duration,
}

impl DeviceSession {
    fn new(device: Device, handler: Box<dyn DeviceHandler>) -> Self {
        let read_slots = if device.kind == "brocade-telnet" {
            1
        } else {
            4
        };
        Self {
            device,
            writer: Mutex::new(()),
            read_slots: Arc::new(Semaphore::new(read_slots)),
            slot: Mutex::new(HandlerSlot {
                handler,
                last_used: Instant::now(),
            }),
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Acquire the exclusive writer lock, or fail with `conflict` when the
    /// current writer holds it past the deadline.
    pub async fn lock_writer(&self, deadline: Duration) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(deadline, self.writer.lock())
            .await
            .map_err(|_| Error::Conflict {
                device_id: self.device.id.clone(),
                waited: deadline,
            })
    }

    /// Acquire a shared read slot.
    pub async fn acquire_read_slot(&self) -> OwnedSemaphorePermit {
        self.read_slots
            .clone()
            .acquire_owned()
            .await
            .expect("read semaphore never closed")
    }

    /// Access the handler, reaping the session first if it sat idle past
    /// the timeout. The next command reconnects transparently.
    pub async fn handler(&self) -> MutexGuard<'_, HandlerSlot> {
        let mut slot = self.slot.lock().await;
        if slot.handler.is_connected() && slot.last_used.elapsed() > self.idle_timeout {
            debug!(
                "session for {} idle for {:?}, closing",
                self.device.id,
                slot.last_used.elapsed()
            );
            let _ = slot.handler.disconnect().await;
        }
        slot.last_used = Instant::now();
        slot
    }

    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        let _ = slot.handler.disconnect().await;
    }
}

/// All device sessions, created on demand.
pub struct SessionManager {
    registry: HandlerRegistry,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionManager {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// The session for a device, constructing its handler on first use.
    pub async fn session(&self, device: &Device) -> Result<Arc<DeviceSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&device.id) {
            return Ok(session.clone());
        }
        let handler = self.registry.build(device)?;
        let session = Arc::new(DeviceSession::new(device.clone(), handler));
        sessions.insert(device.id.clone(), session.clone());
        Ok(session)
    }

    /// Disconnect and drop every session.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            id: "sw1".into(),
            kind: "brocade-telnet".into(),
            host: "192.0.2.1".into(),
            port: 23,
            protocol: "telnet".into(),
            username: "admin".into(),
            password_env: "NETWORK_PASSWORD".into(),
            enable_password_required: false,
            verify_tls: false,
            timeout_secs: 30,
            capabilities: Default::default(),
        }
    }

    #[tokio::test]
    async fn sessions_are_created_once_per_device() {
        let manager = SessionManager::new(HandlerRegistry::with_builtins());
        let a = manager.session(&device()).await.unwrap();
        let b = manager.session(&device()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn writer_lock_times_out_as_conflict() {
        let manager = SessionManager::new(HandlerRegistry::with_builtins());
        let session = manager.session(&device()).await.unwrap();

        let _held = session.lock_writer(Duration::from_millis(50)).await.unwrap();
        let err = session
            .lock_writer(Duration::from_millis(50))
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn telnet_sessions_have_one_read_slot() {
        let manager = SessionManager::new(HandlerRegistry::with_builtins());
        let session = manager.session(&device()).await.unwrap();
        let permit = session.acquire_read_slot().await;
        // the single telnet slot is now taken
        assert_eq!(session.read_slots.available_permits(), 0);
        drop(permit);
        assert_eq!(session.read_slots.available_permits(), 1);
    }
}
