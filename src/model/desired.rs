//! Desired-state documents.
//!
//! A desired state is a declarative target for one device. The document
//! schema is closed: the recognized top-level keys are `device_id`,
//! `version`, `checksum`, `mode`, `vlans`, `ports` and `settings`; anything
//! else rejects the document before the wire is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ValidationError;
use crate::model::canon;
use crate::model::types::{IpInterface, PortId, PortSpeed, Scalar, Vlan};

/// How unlisted entities are treated during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Entities on the device but absent from the document are deleted.
    Full,
    /// Unlisted entities are left untouched.
    #[default]
    Patch,
}

/// Per-VLAN intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VlanAction {
    /// Create if missing, converge if different.
    #[default]
    Ensure,
    /// Delete if present.
    Absent,
}

/// Desired state for one VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredVlan {
    pub action: VlanAction,
    pub name: Option<String>,
    pub untagged_ports: BTreeSet<PortId>,
    pub tagged_ports: BTreeSet<PortId>,
    pub ip_interface: Option<IpInterface>,
}

impl DesiredVlan {
    /// Materialize as a normalized [`Vlan`] for creation and comparison.
    pub fn to_vlan(&self, id: u16) -> Vlan {
        Vlan {
            id,
            name: self.name.clone(),
            untagged_ports: self.untagged_ports.clone(),
            tagged_ports: self.tagged_ports.clone(),
            ip_interface: self.ip_interface.clone(),
        }
    }
}

/// Desired state for one port. Absent fields are not managed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DesiredPort {
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub speed: Option<PortSpeed>,
}

/// Complete desired state for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub device_id: String,
    pub version: u32,
    /// Checksum declared by the document, if any.
    pub checksum: Option<String>,
    /// Checksum computed over the document's canonical form.
    pub computed_checksum: String,
    pub mode: ApplyMode,
    pub vlans: BTreeMap<u16, DesiredVlan>,
    pub ports: BTreeMap<PortId, DesiredPort>,
    pub settings: BTreeMap<String, Scalar>,
}

const KNOWN_KEYS: &[&str] = &[
    "device_id", "version", "checksum", "mode", "vlans", "ports", "settings",
];

impl DesiredState {
    /// Parse a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ValidationError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| ValidationError::Document(e.to_string()))?;
        let json = serde_json::to_value(value)
            .map_err(|e| ValidationError::Document(e.to_string()))?;
        Self::from_value(&json)
    }

    /// Parse an already-deserialized document.
    pub fn from_value(doc: &Value) -> Result<Self, ValidationError> {
        let map = doc
            .as_object()
            .ok_or_else(|| ValidationError::Document("document is not a mapping".into()))?;

        for key in map.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::Document(format!(
                    "unrecognized top-level key '{key}'"
                )));
            }
        }

        let device_id = map
            .get("device_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::Document("missing required field 'device_id'".into()))?
            .to_string();

        let version = match map.get("version") {
            None => 1,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| ValidationError::Document("'version' must be an integer".into()))?,
        };

        let checksum = map
            .get("checksum")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mode = match map.get("mode") {
            None => ApplyMode::Patch,
            Some(Value::String(s)) => match s.as_str() {
                "full" => ApplyMode::Full,
                "patch" => ApplyMode::Patch,
                other => return Err(ValidationError::InvalidMode(other.to_string())),
            },
            Some(other) => return Err(ValidationError::InvalidMode(other.to_string())),
        };

        let vlans = match map.get("vlans") {
            None => BTreeMap::new(),
            Some(v) => parse_vlans(v)?,
        };

        let ports = match map.get("ports") {
            None => BTreeMap::new(),
            Some(v) => parse_ports(v)?,
        };

        let settings = match map.get("settings") {
            None => BTreeMap::new(),
            Some(v) => parse_settings(v)?,
        };

        Ok(Self {
            device_id,
            version,
            checksum,
            computed_checksum: canon::checksum(doc),
            mode,
            vlans,
            ports,
            settings,
        })
    }
}

fn parse_vlans(value: &Value) -> Result<BTreeMap<u16, DesiredVlan>, ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::Document("'vlans' must be a mapping".into()))?;

    let mut vlans = BTreeMap::new();
    for (key, body) in map {
        let id: i64 = key
            .parse()
            .map_err(|_| ValidationError::Document(format!("invalid VLAN key '{key}'")))?;
        let id = u16::try_from(id).map_err(|_| ValidationError::VlanIdOutOfRange(id))?;
        vlans.insert(id, parse_vlan(id, body)?);
    }
    Ok(vlans)
}

fn parse_vlan(id: u16, body: &Value) -> Result<DesiredVlan, ValidationError> {
    let empty = serde_json::Map::new();
    let map = match body {
        Value::Null => &empty,
        Value::Object(m) => m,
        _ => {
            return Err(ValidationError::Document(format!(
                "VLAN {id} body must be a mapping"
            )))
        }
    };

    let action = match map.get("action").and_then(Value::as_str) {
        None => VlanAction::Ensure,
        Some("ensure") => VlanAction::Ensure,
        Some("absent") => VlanAction::Absent,
        Some(other) => return Err(ValidationError::InvalidAction(other.to_string())),
    };

    let name = map.get("name").and_then(Value::as_str).map(str::to_string);

    let untagged_ports = expand_port_field(map.get("untagged_ports"))?;
    let tagged_ports = expand_port_field(map.get("tagged_ports"))?;

    let ip_interface = match map.get("ip_interface") {
        None | Some(Value::Null) => None,
        Some(Value::Object(ip)) => Some(IpInterface {
            address: ip
                .get("address")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            mask: ip
                .get("mask")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        Some(_) => {
            return Err(ValidationError::Document(format!(
                "VLAN {id} 'ip_interface' must be a mapping"
            )))
        }
    };

    Ok(DesiredVlan {
        action,
        name,
        untagged_ports,
        tagged_ports,
        ip_interface,
    })
}

fn parse_ports(value: &Value) -> Result<BTreeMap<PortId, DesiredPort>, ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::Document("'ports' must be a mapping".into()))?;

    let mut ports = BTreeMap::new();
    for (name, body) in map {
        let empty = serde_json::Map::new();
        let fields = match body {
            Value::Null => &empty,
            Value::Object(m) => m,
            _ => {
                return Err(ValidationError::Document(format!(
                    "port '{name}' body must be a mapping"
                )))
            }
        };

        let speed = match fields.get("speed").and_then(Value::as_str) {
            None => None,
            Some(s) => Some(PortSpeed::from_str(s)?),
        };

        ports.insert(
            PortId::new(name.clone()),
            DesiredPort {
                enabled: fields.get("enabled").and_then(Value::as_bool),
                description: fields
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                speed,
            },
        );
    }
    Ok(ports)
}

fn parse_settings(value: &Value) -> Result<BTreeMap<String, Scalar>, ValidationError> {
    let map = value
        .as_object()
        .ok_or_else(|| ValidationError::Document("'settings' must be a mapping".into()))?;

    let mut settings = BTreeMap::new();
    for (key, v) in map {
        let scalar = match v {
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) if n.is_i64() => Scalar::Int(n.as_i64().unwrap()),
            Value::String(s) => Scalar::Text(s.clone()),
            other => {
                return Err(ValidationError::Document(format!(
                    "setting '{key}' must be a scalar, got {other}"
                )))
            }
        };
        settings.insert(key.clone(), scalar);
    }
    Ok(settings)
}

/// Expand a port field that may be a list, a single string, or absent.
fn expand_port_field(value: Option<&Value>) -> Result<BTreeSet<PortId>, ValidationError> {
    let mut out = BTreeSet::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            for p in expand_port_spec(s) {
                out.insert(PortId::new(p));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let s = item.as_str().ok_or_else(|| {
                    ValidationError::Document(format!("port entry '{item}' must be a string"))
                })?;
                for p in expand_port_spec(s) {
                    out.insert(PortId::new(p));
                }
            }
        }
        Some(other) => {
            return Err(ValidationError::Document(format!(
                "port list must be a string or sequence, got {other}"
            )))
        }
    }
    Ok(out)
}

/// Expand range notation in a single port spec.
///
/// `1/1/1-4` and `1/1/1-1/1/4` expand within a module; `3-5` expands plain
/// numeric ports. Specs that do not look like a range pass through.
pub fn expand_port_spec(spec: &str) -> Vec<String> {
    let spec = spec.trim();
    let Some((head, tail)) = spec.split_once('-') else {
        return vec![spec.to_string()];
    };

    if head.contains('/') {
        // Brocade-style: "1/1/1-4" or "1/1/1-1/1/4"
        let Some((prefix, start)) = head.rsplit_once('/') else {
            return vec![spec.to_string()];
        };
        let end = if tail.contains('/') {
            // full spec on the right; modules must match for expansion
            let (end_prefix, last) = tail.rsplit_once('/').unwrap();
            if end_prefix != prefix {
                return vec![head.to_string(), tail.to_string()];
            }
            last.parse::<u32>()
        } else {
            tail.parse::<u32>()
        };
        match (start.parse::<u32>(), end) {
            (Ok(start), Ok(end)) if start <= end => {
                (start..=end).map(|n| format!("{prefix}/{n}")).collect()
            }
            _ => vec![spec.to_string()],
        }
    } else {
        // Plain numeric: "3-5"
        match (head.parse::<u32>(), tail.parse::<u32>()) {
            (Ok(start), Ok(end)) if start <= end => {
                (start..=end).map(|n| n.to_string()).collect()
            }
            _ => vec![spec.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let ds = DesiredState::from_yaml("device_id: sw1\n").unwrap();
        assert_eq!(ds.device_id, "sw1");
        assert_eq!(ds.mode, ApplyMode::Patch);
        assert!(ds.vlans.is_empty());
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let err = DesiredState::from_yaml("device_id: sw1\nextra: true\n").unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn rejects_bad_mode() {
        let err = DesiredState::from_yaml("device_id: sw1\nmode: merge\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMode(_)));
    }

    #[test]
    fn parses_vlans_with_ranges() {
        let yaml = r#"
device_id: lab-brocade
mode: full
vlans:
  100:
    name: Servers
    untagged_ports: ["1/1/5-8"]
    tagged_ports: ["1/2/1"]
  200:
    action: absent
"#;
        let ds = DesiredState::from_yaml(yaml).unwrap();
        let v100 = &ds.vlans[&100];
        assert_eq!(v100.name.as_deref(), Some("Servers"));
        assert_eq!(v100.untagged_ports.len(), 4);
        assert!(v100.untagged_ports.contains(&PortId::new("1/1/7")));
        assert_eq!(ds.vlans[&200].action, VlanAction::Absent);
    }

    #[test]
    fn expands_full_and_short_ranges() {
        assert_eq!(
            expand_port_spec("1/1/1-3"),
            vec!["1/1/1", "1/1/2", "1/1/3"]
        );
        assert_eq!(
            expand_port_spec("1/1/23-1/1/24"),
            vec!["1/1/23", "1/1/24"]
        );
        assert_eq!(expand_port_spec("3-5"), vec!["3", "4", "5"]);
        assert_eq!(expand_port_spec("lan1"), vec!["lan1"]);
        // cross-module ranges are not expanded
        assert_eq!(expand_port_spec("1/1/24-1/2/1"), vec!["1/1/24", "1/2/1"]);
    }

    #[test]
    fn rejects_invalid_speed() {
        let yaml = "device_id: sw1\nports:\n  '5':\n    speed: 1G\n";
        assert!(matches!(
            DesiredState::from_yaml(yaml).unwrap_err(),
            ValidationError::InvalidSpeed(_)
        ));
    }

    #[test]
    fn computes_checksum_over_canonical_form() {
        let a = DesiredState::from_yaml("device_id: sw1\nversion: 2\n").unwrap();
        let b = DesiredState::from_yaml("version: 2\ndevice_id: sw1\n").unwrap();
        assert_eq!(a.computed_checksum, b.computed_checksum);
    }
}
