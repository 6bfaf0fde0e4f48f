//! Device handlers.
//!
//! A handler owns one device's transport and translates between the
//! normalized model and vendor reality: it parses vendor output into
//! [`Vlan`]/[`Port`]/[`DeviceConfig`] values and turns model operations
//! into vendor commands. Callers never see vendor syntax.

pub mod brocade;
pub mod openwrt;
mod registry;
pub mod uci;
pub mod zyxel;

pub use brocade::BrocadeHandler;
pub use openwrt::OpenWrtHandler;
pub use registry::{HandlerRegistry, BUILTIN_KINDS};
pub use zyxel::ZyxelHandler;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ValidationError};
use crate::inventory::Device;
use crate::model::{DeviceConfig, DeviceStatus, Port, PortId, Vlan};

/// A port's membership in one VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanMembership {
    Excluded,
    Tagged,
    Untagged,
}

/// Result of one executed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    /// Normalized output: echo and prompt removed.
    pub output: String,
    /// The matched failure line, when the vendor rejected the command.
    pub failure: Option<String>,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn ok(command: impl Into<String>, output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            failure: None,
            elapsed,
        }
    }

    pub fn failed(
        command: impl Into<String>,
        output: impl Into<String>,
        failure: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            failure: Some(failure.into()),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// The uniform handler contract.
///
/// All methods suspend on network I/O. Mutating methods must only be called
/// by an executor holding the device's writer lock; the handler itself does
/// no locking.
#[async_trait]
pub trait DeviceHandler: Send {
    /// The device this handler drives.
    fn device(&self) -> &Device;

    /// Establish the session if not already connected. Connect and auth
    /// failures retry with exponential backoff inside this call.
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the session. Safe to call when already disconnected.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether a live session exists.
    fn is_connected(&self) -> bool;

    /// Reachability and firmware info.
    async fn check_health(&mut self) -> Result<DeviceStatus>;

    /// Execute a single read or exec command.
    async fn execute(&mut self, command: &str) -> Result<CommandOutput>;

    /// Execute commands back to back. The default implementation loops
    /// [`execute`](Self::execute); transports with a real batch mode
    /// override it.
    async fn execute_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            if cancel.is_cancelled() {
                break;
            }
            let out = self.execute(command).await?;
            let failed = !out.is_success();
            results.push(out);
            if failed && stop_on_error {
                break;
            }
        }
        Ok(results)
    }

    /// Execute commands inside configuration mode, entering and leaving it
    /// around the batch. Vendors without a config mode run the batch as-is.
    async fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        self.execute_batch(commands, stop_on_error, cancel).await
    }

    /// Fetch all VLANs in normalized form.
    async fn get_vlans(&mut self) -> Result<Vec<Vlan>>;

    /// Fetch all ports in normalized form.
    async fn get_ports(&mut self) -> Result<Vec<Port>>;

    /// Fetch the full normalized configuration.
    async fn get_config(&mut self) -> Result<DeviceConfig> {
        let mut config = DeviceConfig::new(self.device().id.clone());
        for vlan in self.get_vlans().await? {
            config.insert_vlan(vlan);
        }
        for port in self.get_ports().await? {
            config.insert_port(port);
        }
        Ok(config)
    }

    /// Create or converge a single VLAN.
    async fn create_vlan(&mut self, vlan: &Vlan) -> Result<()>;

    /// Delete a VLAN by id.
    async fn delete_vlan(&mut self, vlan_id: u16) -> Result<()>;

    /// Apply managed attributes of a single port.
    async fn configure_port(&mut self, port: &Port) -> Result<()>;

    /// Set one port's membership in one VLAN. Only form-driven vendors
    /// implement this; CLI vendors express membership through batches.
    async fn set_vlan_membership(
        &mut self,
        _vlan_id: u16,
        _port: &PortId,
        _membership: VlanMembership,
    ) -> Result<()> {
        Err(ValidationError::UnsupportedOnTransport {
            operation: "set_vlan_membership".into(),
            transport: self.device().kind.clone(),
        }
        .into())
    }

    /// Persist the running configuration.
    async fn save_config(&mut self) -> Result<()>;

    /// Download a named configuration file, for vendors that expose one.
    async fn get_config_file(&mut self, _path: &str) -> Result<String> {
        Err(ValidationError::UnsupportedOnTransport {
            operation: "get_config_file".into(),
            transport: self.device().kind.clone(),
        }
        .into())
    }

    /// Replace a named configuration file, for vendors that expose one.
    async fn put_config_file(&mut self, path: &str, _content: &str) -> Result<()> {
        let _ = path;
        Err(ValidationError::UnsupportedOnTransport {
            operation: "put_config_file".into(),
            transport: self.device().kind.clone(),
        }
        .into())
    }
}

impl std::fmt::Debug for dyn DeviceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("device", self.device())
            .finish()
    }
}

/// Guard shared by handlers: reject empty command strings before the wire.
pub(crate) fn require_nonempty(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand.into());
    }
    Ok(())
}
