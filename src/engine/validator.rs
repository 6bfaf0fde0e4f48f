//! Pre-flight validation.
//!
//! Everything here runs before the wire is touched: VLAN ranges, vendor
//! reservations, protected entities, per-vendor port syntax, untagged
//! conflicts, and document integrity. A desired state that fails validation
//! never reaches a device.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationError;
use crate::model::{DesiredState, VlanAction, VLAN_ID_MAX, VLAN_ID_MIN};

/// Brocade firmware reserves these ids for internal use; creating them is
/// rejected up front rather than letting the device error mid-plan.
pub const BROCADE_RESERVED_VLANS: &[u16] = &[4087, 4090, 4093, 4094];

static BROCADE_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+/\d+/\d+$").unwrap());
static OPENWRT_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^lan\d+$").unwrap());
static ZYXEL_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+|lag\d+)$").unwrap());

/// Vendor family for validation and planning, derived from the transport
/// kind string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorFamily {
    Brocade,
    Zyxel,
    OpenWrt,
}

impl VendorFamily {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "brocade-telnet" => Some(VendorFamily::Brocade),
            "zyxel-cli" | "zyxel-https" => Some(VendorFamily::Zyxel),
            "openwrt-ssh" => Some(VendorFamily::OpenWrt),
            _ => None,
        }
    }

    fn port_pattern(&self) -> &'static Regex {
        match self {
            VendorFamily::Brocade => &BROCADE_PORT,
            VendorFamily::OpenWrt => &OPENWRT_PORT,
            VendorFamily::Zyxel => &ZYXEL_PORT,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            VendorFamily::Brocade => "brocade",
            VendorFamily::Zyxel => "zyxel",
            VendorFamily::OpenWrt => "openwrt",
        }
    }
}

/// Validate a desired state against a vendor family.
///
/// Returns advisory warnings on success; any hard violation is an error.
pub fn validate(
    desired: &DesiredState,
    family: Option<VendorFamily>,
) -> Result<Vec<String>, ValidationError> {
    let mut warnings = Vec::new();

    verify_checksum(desired)?;
    validate_vlans(desired, family, &mut warnings)?;
    validate_ports(desired, family)?;
    check_untagged_conflicts(desired)?;
    check_change_size(desired, &mut warnings);

    Ok(warnings)
}

fn verify_checksum(desired: &DesiredState) -> Result<(), ValidationError> {
    if let Some(declared) = &desired.checksum {
        if declared != &desired.computed_checksum {
            return Err(ValidationError::ChecksumMismatch {
                declared: declared.clone(),
                computed: desired.computed_checksum.clone(),
            });
        }
    }
    Ok(())
}

fn validate_vlans(
    desired: &DesiredState,
    family: Option<VendorFamily>,
    warnings: &mut Vec<String>,
) -> Result<(), ValidationError> {
    for (&id, vlan) in &desired.vlans {
        if !(VLAN_ID_MIN..=VLAN_ID_MAX).contains(&id) {
            return Err(ValidationError::VlanIdOutOfRange(id as i64));
        }

        if id == 1 && vlan.action == VlanAction::Absent {
            return Err(ValidationError::ProtectedVlan(1));
        }

        if family == Some(VendorFamily::Brocade)
            && vlan.action == VlanAction::Ensure
            && BROCADE_RESERVED_VLANS.contains(&id)
        {
            return Err(ValidationError::ReservedVlan {
                id,
                reason: "reserved by Brocade firmware".to_string(),
            });
        }

        if vlan.action == VlanAction::Ensure
            && vlan.untagged_ports.is_empty()
            && vlan.tagged_ports.is_empty()
        {
            warnings.push(format!("VLAN {id} has no ports assigned"));
        }

        for port in vlan.untagged_ports.iter().chain(vlan.tagged_ports.iter()) {
            validate_port_name(port.as_str(), family)?;
        }

        // a port tagged and untagged in the same VLAN is contradictory
        if let Some(overlap) = vlan
            .untagged_ports
            .iter()
            .find(|p| vlan.tagged_ports.contains(*p))
        {
            return Err(ValidationError::TaggedUntaggedOverlap {
                port: overlap.as_str().to_string(),
                vlan: id,
            });
        }
    }
    Ok(())
}

fn validate_ports(
    desired: &DesiredState,
    family: Option<VendorFamily>,
) -> Result<(), ValidationError> {
    for port in desired.ports.keys() {
        validate_port_name(port.as_str(), family)?;
    }
    Ok(())
}

fn validate_port_name(
    port: &str,
    family: Option<VendorFamily>,
) -> Result<(), ValidationError> {
    if port.is_empty() {
        return Err(ValidationError::InvalidPort {
            port: port.to_string(),
            device_type: family.map(|f| f.type_name()).unwrap_or("any").to_string(),
        });
    }

    let valid = match family {
        Some(f) => f.port_pattern().is_match(port),
        None => {
            BROCADE_PORT.is_match(port) || OPENWRT_PORT.is_match(port) || ZYXEL_PORT.is_match(port)
        }
    };

    if !valid {
        return Err(ValidationError::InvalidPort {
            port: port.to_string(),
            device_type: family.map(|f| f.type_name()).unwrap_or("any").to_string(),
        });
    }
    Ok(())
}

fn check_untagged_conflicts(desired: &DesiredState) -> Result<(), ValidationError> {
    let mut assignments: HashMap<&str, u16> = HashMap::new();

    for (&id, vlan) in &desired.vlans {
        if vlan.action == VlanAction::Absent {
            continue;
        }
        for port in &vlan.untagged_ports {
            if let Some(&first) = assignments.get(port.as_str()) {
                return Err(ValidationError::UntaggedConflict {
                    port: port.as_str().to_string(),
                    first,
                    second: id,
                });
            }
            assignments.insert(port.as_str(), id);
        }
    }
    Ok(())
}

fn check_change_size(desired: &DesiredState, warnings: &mut Vec<String>) {
    let entities = desired.vlans.len() + desired.ports.len();
    if entities > 20 {
        warnings.push(format!(
            "large change set ({entities} entities) - consider staging"
        ));
    }

    let total_ports: usize = desired
        .vlans
        .values()
        .map(|v| v.untagged_ports.len() + v.tagged_ports.len())
        .sum();
    if total_ports > 50 {
        warnings.push(format!(
            "many port memberships ({total_ports}) - verify before applying"
        ));
    }
}
