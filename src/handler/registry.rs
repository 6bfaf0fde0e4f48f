//! Handler registry: transport kind strings to handler constructors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, ValidationError};
use crate::handler::{BrocadeHandler, DeviceHandler, OpenWrtHandler, ZyxelHandler};
use crate::inventory::Device;

/// Constructor for a device handler.
pub type HandlerConstructor =
    Arc<dyn Fn(Device) -> Result<Box<dyn DeviceHandler>> + Send + Sync>;

/// Maps inventory `type` strings to handler constructors.
///
/// Engine instances own their registry so tests can register scripted
/// handlers without touching other instances.
#[derive(Clone)]
pub struct HandlerRegistry {
    constructors: HashMap<String, HandlerConstructor>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the four built-in transports.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("brocade-telnet", |device| {
            Ok(Box::new(BrocadeHandler::new(device)))
        });
        registry.register("zyxel-cli", |device| Ok(Box::new(ZyxelHandler::cli(device))));
        registry.register("zyxel-https", |device| {
            Ok(Box::new(ZyxelHandler::hybrid(device)?))
        });
        registry.register("openwrt-ssh", |device| {
            Ok(Box::new(OpenWrtHandler::new(device)))
        });
        registry
    }

    /// Register (or replace) a constructor for a kind.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(Device) -> Result<Box<dyn DeviceHandler>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    /// Build a handler for a device.
    pub fn build(&self, device: &Device) -> Result<Box<dyn DeviceHandler>> {
        let constructor = self
            .constructors
            .get(&device.kind)
            .ok_or_else(|| ValidationError::UnknownDeviceType(device.kind.clone()))?;
        constructor(device.clone())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The transport kind strings the built-in registry understands.
pub const BUILTIN_KINDS: &[&str] = &[
    "brocade-telnet",
    "zyxel-cli",
    "zyxel-https",
    "openwrt-ssh",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: &str) -> Device {
        Device {
            id: "sw1".into(),
            kind: kind.into(),
            host: "192.0.2.1".into(),
            port: 22,
            protocol: "ssh".into(),
            username: "admin".into(),
            password_env: "NETWORK_PASSWORD".into(),
            enable_password_required: false,
            verify_tls: false,
            timeout_secs: 30,
            capabilities: Default::default(),
        }
    }

    #[test]
    fn builtins_cover_all_kinds() {
        let registry = HandlerRegistry::with_builtins();
        for kind in BUILTIN_KINDS {
            assert!(registry.contains(kind), "missing builtin {kind}");
        }
    }

    #[test]
    fn builds_builtin_handlers() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.build(&device("brocade-telnet")).is_ok());
        assert!(registry.build(&device("openwrt-ssh")).is_ok());
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let registry = HandlerRegistry::with_builtins();
        let err = registry.build(&device("procurve-ssh")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Validation(ValidationError::UnknownDeviceType(_))
        ));
    }
}
