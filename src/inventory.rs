//! Device inventory.
//!
//! The inventory is consumed, not owned: a YAML mapping from device id to
//! connection parameters and capability flags, loaded once at startup.
//! Unknown keys are warnings; an unknown device `type` is fatal because no
//! handler could ever be constructed for it.

use std::path::Path;

use indexmap::IndexMap;
use log::warn;
use serde_yaml::Value;

use crate::error::{Result, ValidationError};

/// Capability flags advertised per device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_batch: bool,
    pub supports_scp_config: bool,
    pub supports_rollback: bool,
    pub write_memory_required: bool,
}

/// One device entry. Created from inventory at startup and never mutated
/// by the engine.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    /// Transport kind string, e.g. `brocade-telnet`. Resolved against the
    /// handler registry when a session is first opened.
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    pub enable_password_required: bool,
    pub verify_tls: bool,
    pub timeout_secs: u64,
    pub capabilities: Capabilities,
}

impl Device {
    /// Resolve the password from the environment. Secrets never live in the
    /// inventory or on this struct.
    pub fn password(&self) -> String {
        std::env::var(&self.password_env).unwrap_or_default()
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

const KNOWN_DEVICE_KEYS: &[&str] = &[
    "type",
    "name",
    "host",
    "port",
    "protocol",
    "username",
    "password_env",
    "timeout",
    "enable_password_required",
    "verify_ssl",
    "capabilities",
];

const KNOWN_CAPABILITY_KEYS: &[&str] = &[
    "supports_batch",
    "supports_scp_config",
    "supports_rollback",
    "write_memory_required",
];

/// The loaded inventory.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: IndexMap<String, Device>,
}

impl Inventory {
    pub async fn from_path(path: impl AsRef<Path>, known_kinds: &[&str]) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(crate::error::TransportError::Io)?;
        Self::from_yaml(&text, known_kinds)
    }

    /// Parse an inventory document, validating device types against the
    /// registered handler kinds.
    pub fn from_yaml(text: &str, known_kinds: &[&str]) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text)
            .map_err(|e| ValidationError::Document(format!("inventory: {e}")))?;

        let defaults = doc
            .get("defaults")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();

        let devices_map = doc
            .get("devices")
            .and_then(Value::as_mapping)
            .ok_or_else(|| {
                ValidationError::Document("inventory: missing 'devices' mapping".into())
            })?;

        let mut devices = IndexMap::new();
        for (key, body) in devices_map {
            let id = key
                .as_str()
                .ok_or_else(|| {
                    ValidationError::Document("inventory: device ids must be strings".into())
                })?
                .to_string();

            let mut merged = defaults.clone();
            if let Some(map) = body.as_mapping() {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }

            let device = parse_device(&id, &merged, known_kinds)?;
            devices.insert(id, device);
        }

        Ok(Self { devices })
    }

    pub fn get(&self, device_id: &str) -> Result<&Device> {
        self.devices
            .get(device_id)
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()).into())
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &String> {
        self.devices.keys()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn insert(&mut self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn parse_device(
    id: &str,
    map: &serde_yaml::Mapping,
    known_kinds: &[&str],
) -> Result<Device> {
    for key in map.keys() {
        if let Some(name) = key.as_str() {
            if !KNOWN_DEVICE_KEYS.contains(&name) {
                warn!("inventory: device '{id}' has unrecognized key '{name}', ignoring");
            }
        }
    }

    let get_str = |key: &str| -> Option<String> {
        map.get(Value::from(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let kind = get_str("type")
        .ok_or_else(|| ValidationError::Document(format!("device '{id}' missing 'type'")))?;
    if !known_kinds.contains(&kind.as_str()) {
        return Err(ValidationError::UnknownDeviceType(kind).into());
    }

    let host = get_str("host")
        .ok_or_else(|| ValidationError::Document(format!("device '{id}' missing 'host'")))?;

    let port = map
        .get(Value::from("port"))
        .and_then(Value::as_u64)
        .map(|p| p as u16)
        .unwrap_or_else(|| default_port(&kind));

    let capabilities = parse_capabilities(id, map.get(Value::from("capabilities")))?;

    Ok(Device {
        id: id.to_string(),
        kind,
        host,
        port,
        protocol: get_str("protocol").unwrap_or_else(|| "ssh".to_string()),
        username: get_str("username").unwrap_or_else(|| "admin".to_string()),
        password_env: get_str("password_env").unwrap_or_else(|| "NETWORK_PASSWORD".to_string()),
        enable_password_required: map
            .get(Value::from("enable_password_required"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        verify_tls: map
            .get(Value::from("verify_ssl"))
            .and_then(Value::as_bool)
            .unwrap_or(true),
        timeout_secs: map
            .get(Value::from("timeout"))
            .and_then(Value::as_u64)
            .unwrap_or(30),
        capabilities,
    })
}

fn parse_capabilities(id: &str, value: Option<&Value>) -> Result<Capabilities> {
    let mut caps = Capabilities::default();
    let Some(map) = value.and_then(Value::as_mapping) else {
        return Ok(caps);
    };

    for (key, v) in map {
        let Some(name) = key.as_str() else { continue };
        if !KNOWN_CAPABILITY_KEYS.contains(&name) {
            warn!("inventory: device '{id}' has unrecognized capability '{name}', ignoring");
            continue;
        }
        let flag = v.as_bool().unwrap_or(false);
        match name {
            "supports_batch" => caps.supports_batch = flag,
            "supports_scp_config" => caps.supports_scp_config = flag,
            "supports_rollback" => caps.supports_rollback = flag,
            "write_memory_required" => caps.write_memory_required = flag,
            _ => unreachable!(),
        }
    }
    Ok(caps)
}

fn default_port(kind: &str) -> u16 {
    match kind {
        "brocade-telnet" => 23,
        "zyxel-https" => 443,
        _ => 22,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: &[&str] = &["brocade-telnet", "zyxel-cli", "zyxel-https", "openwrt-ssh"];

    const SAMPLE: &str = r#"
defaults:
  username: admin
  password_env: NETWORK_PASSWORD
  timeout: 30

devices:
  lab-brocade:
    type: brocade-telnet
    host: 192.168.254.2
    port: 23
    enable_password_required: true
    capabilities:
      supports_batch: true
      write_memory_required: true
  lab-openwrt:
    type: openwrt-ssh
    host: 192.168.254.4
    capabilities:
      supports_scp_config: true
"#;

    #[test]
    fn loads_devices_with_defaults() {
        let inv = Inventory::from_yaml(SAMPLE, KINDS).unwrap();
        assert_eq!(inv.len(), 2);

        let brocade = inv.get("lab-brocade").unwrap();
        assert_eq!(brocade.kind, "brocade-telnet");
        assert_eq!(brocade.username, "admin");
        assert!(brocade.enable_password_required);
        assert!(brocade.capabilities.write_memory_required);

        let openwrt = inv.get("lab-openwrt").unwrap();
        assert_eq!(openwrt.port, 22);
        assert!(openwrt.capabilities.supports_scp_config);
        assert!(!openwrt.capabilities.supports_batch);
    }

    #[test]
    fn unknown_type_is_fatal() {
        let yaml = "devices:\n  sw1:\n    type: procurve-ssh\n    host: 10.0.0.1\n";
        let err = Inventory::from_yaml(yaml, KINDS).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Validation(ValidationError::UnknownDeviceType(_))
        ));
    }

    #[test]
    fn unknown_device_lookup_fails() {
        let inv = Inventory::from_yaml(SAMPLE, KINDS).unwrap();
        assert!(inv.get("nonexistent").is_err());
    }
}
