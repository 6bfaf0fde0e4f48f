//! Shared VLAN/port/config types.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lowest and highest assignable 802.1Q VLAN IDs.
pub const VLAN_ID_MIN: u16 = 1;
pub const VLAN_ID_MAX: u16 = 4094;

/// The default VLAN, present on every device and never deletable.
pub const DEFAULT_VLAN: u16 = 1;

/// A vendor-normalized port identifier.
///
/// Brocade ports are `unit/module/port` (`1/1/24`), OpenWrt DSA ports are
/// `lanN`, Zyxel ports are bare numbers and LAGs are `lagN`. The identifier
/// is kept as its vendor string; ordering is natural (numeric runs compare
/// numerically), so `1/1/2 < 1/1/10` and `lan2 < lan10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into alternating text and numeric tokens for natural ordering.
    fn tokens(&self) -> Vec<Token<'_>> {
        let mut tokens = Vec::new();
        let s = self.0.as_str();
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits > 0 {
                let (num, tail) = rest.split_at(digits);
                tokens.push(Token::Number(num.parse().unwrap_or(u64::MAX)));
                rest = tail;
            } else {
                let text = rest.chars().take_while(|c| !c.is_ascii_digit()).count();
                let (txt, tail) = rest.split_at(text);
                tokens.push(Token::Text(txt));
                rest = tail;
            }
        }
        tokens
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Token<'a> {
    Text(&'a str),
    Number(u64),
}

impl Ord for PortId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tokens()
            .cmp(&other.tokens())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for PortId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Managed port speed settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortSpeed {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "10-half")]
    TenHalf,
    #[serde(rename = "10-full")]
    TenFull,
    #[serde(rename = "100-half")]
    HundredHalf,
    #[serde(rename = "100-full")]
    HundredFull,
    #[serde(rename = "1000-full")]
    GigFull,
    #[serde(rename = "10G")]
    TenGig,
}

impl PortSpeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortSpeed::Auto => "auto",
            PortSpeed::TenHalf => "10-half",
            PortSpeed::TenFull => "10-full",
            PortSpeed::HundredHalf => "100-half",
            PortSpeed::HundredFull => "100-full",
            PortSpeed::GigFull => "1000-full",
            PortSpeed::TenGig => "10G",
        }
    }
}

impl FromStr for PortSpeed {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(PortSpeed::Auto),
            "10-half" => Ok(PortSpeed::TenHalf),
            "10-full" => Ok(PortSpeed::TenFull),
            "100-half" => Ok(PortSpeed::HundredHalf),
            "100-full" => Ok(PortSpeed::HundredFull),
            "1000-full" => Ok(PortSpeed::GigFull),
            "10G" => Ok(PortSpeed::TenGig),
            other => Err(ValidationError::InvalidSpeed(other.to_string())),
        }
    }
}

/// Observed link state. Read-only; never part of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// Optional L3 interface attached to a VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInterface {
    pub address: String,
    pub mask: String,
}

/// A normalized VLAN.
///
/// Port sets are ordered, so structural equality is canonical equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub untagged_ports: BTreeSet<PortId>,
    #[serde(default)]
    pub tagged_ports: BTreeSet<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_interface: Option<IpInterface>,
}

impl Vlan {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            name: None,
            untagged_ports: BTreeSet::new(),
            tagged_ports: BTreeSet::new(),
            ip_interface: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_untagged<I, P>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PortId>,
    {
        self.untagged_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tagged<I, P>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PortId>,
    {
        self.tagged_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    /// All member ports, tagged and untagged.
    pub fn member_ports(&self) -> impl Iterator<Item = &PortId> {
        self.untagged_ports.iter().chain(self.tagged_ports.iter())
    }
}

impl From<u16> for PortId {
    fn from(n: u16) -> Self {
        Self(n.to_string())
    }
}

/// A normalized port.
///
/// `enabled`, `description` and `speed` are managed; `link_state` and `pvid`
/// are observations and never appear in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<PortSpeed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state: Option<LinkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvid: Option<u16>,
}

impl Port {
    pub fn new(id: impl Into<PortId>) -> Self {
        Self {
            id: id.into(),
            enabled: None,
            description: None,
            speed: None,
            link_state: None,
            pvid: None,
        }
    }
}

/// A scalar device setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// The full observed configuration of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub vlans: BTreeMap<u16, Vlan>,
    #[serde(default)]
    pub ports: BTreeMap<PortId, Port>,
    #[serde(default)]
    pub settings: BTreeMap<String, Scalar>,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            vlans: BTreeMap::new(),
            ports: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn insert_vlan(&mut self, vlan: Vlan) {
        self.vlans.insert(vlan.id, vlan);
    }

    pub fn insert_port(&mut self, port: Port) {
        self.ports.insert(port.id.clone(), port);
    }
}

/// Device health snapshot from `check_health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ordering_is_natural() {
        let mut ports = vec![
            PortId::new("1/1/10"),
            PortId::new("1/1/2"),
            PortId::new("1/2/1"),
            PortId::new("1/1/1"),
        ];
        ports.sort();
        let sorted: Vec<&str> = ports.iter().map(|p| p.as_str()).collect();
        assert_eq!(sorted, ["1/1/1", "1/1/2", "1/1/10", "1/2/1"]);
    }

    #[test]
    fn lan_ports_sort_numerically() {
        let mut ports = vec![PortId::new("lan10"), PortId::new("lan2"), PortId::new("lan1")];
        ports.sort();
        let sorted: Vec<&str> = ports.iter().map(|p| p.as_str()).collect();
        assert_eq!(sorted, ["lan1", "lan2", "lan10"]);
    }

    #[test]
    fn vlan_equality_is_set_based() {
        let a = Vlan::new(100)
            .with_name("Servers")
            .with_untagged(["1/1/5", "1/1/6"]);
        let b = Vlan::new(100)
            .with_name("Servers")
            .with_untagged(["1/1/6", "1/1/5"]);
        assert_eq!(a, b);

        let c = Vlan::new(100).with_name("Other").with_untagged(["1/1/5", "1/1/6"]);
        assert_ne!(a, c);
    }

    #[test]
    fn speed_round_trips_known_values() {
        for s in ["auto", "10-half", "100-full", "1000-full", "10G"] {
            assert_eq!(PortSpeed::from_str(s).unwrap().as_str(), s);
        }
        assert!(PortSpeed::from_str("1G").is_err());
    }
}
