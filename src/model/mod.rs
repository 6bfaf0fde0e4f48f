//! The normalized configuration model shared by all vendors.
//!
//! Handlers parse vendor output into these types and emit vendor commands
//! from them; nothing above the handler layer ever sees vendor syntax.

mod canon;
mod desired;
mod diff;
mod types;

pub use canon::{canonical_json, checksum};
pub use desired::{ApplyMode, DesiredPort, DesiredState, DesiredVlan, VlanAction};
pub use diff::{
    diff, ChangeTag, ConfigDiff, PortChange, SettingChange, VlanModify,
};
pub use types::{
    DeviceConfig, DeviceStatus, IpInterface, LinkState, Port, PortId, PortSpeed, Scalar, Vlan,
    DEFAULT_VLAN, VLAN_ID_MAX, VLAN_ID_MIN,
};
