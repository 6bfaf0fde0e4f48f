//! Hardware-in-the-loop safety gate.
//!
//! With HIL mode on, every write is pre-checked against a constraint
//! profile before any planner work or connection: the test VLAN allowlist,
//! the device allowlist, per-device port allowlists, protected VLANs, and a
//! ceiling on ports touched per call. Reads are never constrained.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::error::SafetyViolation;
use crate::inventory::Device;
use crate::model::PortId;

/// Environment variables read by [`HilConfig::from_env`].
pub const ENV_HIL_MODE: &str = "SWITCHCRAFT_HIL_MODE";
pub const ENV_HIL_VLAN: &str = "SWITCHCRAFT_HIL_VLAN";
pub const ENV_HIL_ALLOWED_DEVICES: &str = "SWITCHCRAFT_HIL_ALLOWED_DEVICES";

const DEFAULT_HIL_VLAN: u16 = 999;

/// HIL constraint profile.
#[derive(Debug, Clone)]
pub struct HilConfig {
    pub enabled: bool,
    /// The only VLANs a write may touch.
    pub allowed_vlans: BTreeSet<u16>,
    /// Device hosts writes may target.
    pub allowed_devices: BTreeSet<String>,
    /// Per-device-id port allowlists; a device with no entry allows any port.
    pub allowed_ports: BTreeMap<String, BTreeSet<PortId>>,
    /// VLANs that may never be touched even when otherwise allowed.
    pub protected_vlans: BTreeSet<u16>,
    /// Maximum number of distinct ports one call may change.
    pub max_ports_per_call: usize,
}

impl Default for HilConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_vlans: [DEFAULT_HIL_VLAN].into_iter().collect(),
            allowed_devices: BTreeSet::new(),
            allowed_ports: BTreeMap::new(),
            protected_vlans: [1].into_iter().collect(),
            max_ports_per_call: 2,
        }
    }
}

impl HilConfig {
    /// Build from environment variables. Returns `None` when HIL mode is
    /// not enabled.
    pub fn from_env() -> Option<Self> {
        if std::env::var(ENV_HIL_MODE).ok().as_deref() != Some("1") {
            return None;
        }

        let mut config = Self {
            enabled: true,
            ..Self::default()
        };

        if let Ok(vlan) = std::env::var(ENV_HIL_VLAN) {
            match vlan.parse::<u16>() {
                Ok(id) => config.allowed_vlans = [id].into_iter().collect(),
                Err(_) => warn!("{ENV_HIL_VLAN}='{vlan}' is not a VLAN id, keeping default"),
            }
        }

        if let Ok(devices) = std::env::var(ENV_HIL_ALLOWED_DEVICES) {
            config.allowed_devices = devices
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }

        warn!(
            "HIL mode enabled: writes restricted to VLANs {:?} on {} device(s)",
            config.allowed_vlans,
            config.allowed_devices.len()
        );
        Some(config)
    }

    /// Check a write operation. `vlans` are every VLAN id the operation
    /// touches; `ports` every port it changes membership or attributes for.
    pub fn check_write(
        &self,
        device: &Device,
        vlans: &[u16],
        ports: &[PortId],
    ) -> Result<(), SafetyViolation> {
        if !self.enabled {
            return Ok(());
        }

        if !self.allowed_devices.contains(&device.host) {
            return Err(SafetyViolation {
                constraint: "ALLOWED_DEVICES",
                message: format!(
                    "device {} ({}) is not in the HIL allowlist",
                    device.id, device.host
                ),
            });
        }

        for &vlan in vlans {
            if self.protected_vlans.contains(&vlan) {
                return Err(SafetyViolation {
                    constraint: "PROTECTED_VLAN",
                    message: format!("VLAN {vlan} is protected and cannot be modified"),
                });
            }
            if !self.allowed_vlans.contains(&vlan) {
                return Err(SafetyViolation {
                    constraint: "HIL_VLAN_ONLY",
                    message: format!(
                        "only VLANs {:?} may be modified in HIL mode, attempted {vlan}",
                        self.allowed_vlans
                    ),
                });
            }
        }

        if let Some(allowed) = self.allowed_ports.get(&device.id) {
            for port in ports {
                if !allowed.contains(port) {
                    return Err(SafetyViolation {
                        constraint: "ALLOWED_PORTS",
                        message: format!(
                            "port {port} is not in the HIL allowlist for {}",
                            device.id
                        ),
                    });
                }
            }
        }

        let distinct: BTreeSet<&PortId> = ports.iter().collect();
        if distinct.len() > self.max_ports_per_call {
            return Err(SafetyViolation {
                constraint: "MAX_PORTS",
                message: format!(
                    "{} ports changed in one call, limit is {}",
                    distinct.len(),
                    self.max_ports_per_call
                ),
            });
        }

        Ok(())
    }
}
