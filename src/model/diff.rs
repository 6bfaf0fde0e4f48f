//! The differ: desired state vs observed state, no I/O.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::desired::{ApplyMode, DesiredState, VlanAction};
use crate::model::types::{DeviceConfig, PortId, PortSpeed, Scalar, Vlan, DEFAULT_VLAN};

/// Identifies which diff element produced a planned command, so partial
/// failures can be attributed and rollback can be filtered to what ran.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeTag {
    VlanCreate(u16),
    VlanModify(u16),
    VlanDelete(u16),
    PortConfigure(PortId),
    Setting(String),
    /// Mode transitions, persistence, reloads.
    Meta,
}

impl std::fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeTag::VlanCreate(id) => write!(f, "vlan-create:{id}"),
            ChangeTag::VlanModify(id) => write!(f, "vlan-modify:{id}"),
            ChangeTag::VlanDelete(id) => write!(f, "vlan-delete:{id}"),
            ChangeTag::PortConfigure(p) => write!(f, "port:{p}"),
            ChangeTag::Setting(k) => write!(f, "setting:{k}"),
            ChangeTag::Meta => f.write_str("meta"),
        }
    }
}

/// A VLAN present on both sides with differing attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanModify {
    pub before: Vlan,
    pub after: Vlan,
    pub add_untagged: Vec<PortId>,
    pub remove_untagged: Vec<PortId>,
    pub add_tagged: Vec<PortId>,
    pub remove_tagged: Vec<PortId>,
    /// New name when it differs and the desired state specifies one.
    pub rename: Option<String>,
}

impl VlanModify {
    fn compute(before: &Vlan, after: &Vlan) -> Option<Self> {
        let add_untagged: Vec<PortId> = after
            .untagged_ports
            .difference(&before.untagged_ports)
            .cloned()
            .collect();
        let remove_untagged: Vec<PortId> = before
            .untagged_ports
            .difference(&after.untagged_ports)
            .cloned()
            .collect();
        let add_tagged: Vec<PortId> = after
            .tagged_ports
            .difference(&before.tagged_ports)
            .cloned()
            .collect();
        let remove_tagged: Vec<PortId> = before
            .tagged_ports
            .difference(&after.tagged_ports)
            .cloned()
            .collect();

        let rename = match &after.name {
            Some(name) if before.name.as_ref() != Some(name) => Some(name.clone()),
            _ => None,
        };

        if add_untagged.is_empty()
            && remove_untagged.is_empty()
            && add_tagged.is_empty()
            && remove_tagged.is_empty()
            && rename.is_none()
            && before.ip_interface == after.ip_interface
        {
            return None;
        }

        Some(Self {
            before: before.clone(),
            after: after.clone(),
            add_untagged,
            remove_untagged,
            add_tagged,
            remove_tagged,
            rename,
        })
    }
}

/// A managed port attribute change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortChange {
    pub port: PortId,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub speed: Option<PortSpeed>,
    /// Previous values for rollback.
    pub before_enabled: Option<bool>,
    pub before_description: Option<String>,
    pub before_speed: Option<PortSpeed>,
}

/// A device-level setting change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub key: String,
    pub before: Option<Scalar>,
    pub after: Scalar,
}

/// The complete set of changes needed to converge a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub vlans_to_create: Vec<Vlan>,
    pub vlans_to_modify: Vec<VlanModify>,
    /// Full before-state of each VLAN scheduled for deletion.
    pub vlans_to_delete: Vec<Vlan>,
    pub ports_to_configure: Vec<PortChange>,
    pub settings_to_change: Vec<SettingChange>,
}

impl ConfigDiff {
    /// The "no-change" value: nothing to do.
    pub fn is_empty(&self) -> bool {
        self.vlans_to_create.is_empty()
            && self.vlans_to_modify.is_empty()
            && self.vlans_to_delete.is_empty()
            && self.ports_to_configure.is_empty()
            && self.settings_to_change.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.vlans_to_create.len()
            + self.vlans_to_modify.len()
            + self.vlans_to_delete.len()
            + self.ports_to_configure.len()
            + self.settings_to_change.len()
    }

    /// Human-readable change summary for previews and dry-run output.
    pub fn summarize(&self) -> String {
        if self.is_empty() {
            return "No changes needed - current state matches desired state".to_string();
        }

        let mut lines = vec![format!(
            "Changes to apply ({} total):",
            self.total_changes()
        )];

        for vlan in &self.vlans_to_create {
            lines.push(format!("  [+] Create VLAN {}", vlan.id));
            if let Some(name) = &vlan.name {
                lines.push(format!("      Name: {name}"));
            }
            if !vlan.untagged_ports.is_empty() {
                lines.push(format!("      Untagged: {}", join_ports(&vlan.untagged_ports)));
            }
            if !vlan.tagged_ports.is_empty() {
                lines.push(format!("      Tagged: {}", join_ports(&vlan.tagged_ports)));
            }
        }

        for change in &self.vlans_to_modify {
            lines.push(format!("  [~] Modify VLAN {}", change.before.id));
            if let Some(name) = &change.rename {
                lines.push(format!("      Rename to: {name}"));
            }
            push_ports(&mut lines, "Add untagged", &change.add_untagged);
            push_ports(&mut lines, "Remove untagged", &change.remove_untagged);
            push_ports(&mut lines, "Add tagged", &change.add_tagged);
            push_ports(&mut lines, "Remove tagged", &change.remove_tagged);
        }

        for vlan in &self.vlans_to_delete {
            lines.push(format!("  [-] Delete VLAN {}", vlan.id));
            if let Some(name) = &vlan.name {
                lines.push(format!("      (was: {name})"));
            }
        }

        for change in &self.ports_to_configure {
            lines.push(format!("  [~] Configure port {}", change.port));
            if let Some(enabled) = change.enabled {
                lines.push(format!("      Enabled: {enabled}"));
            }
            if let Some(desc) = &change.description {
                lines.push(format!("      Description: {desc}"));
            }
            if let Some(speed) = change.speed {
                lines.push(format!("      Speed: {}", speed.as_str()));
            }
        }

        for change in &self.settings_to_change {
            lines.push(format!("  [~] Setting {} = {}", change.key, change.after));
        }

        lines.join("\n")
    }
}

fn join_ports<'a>(ports: impl IntoIterator<Item = &'a PortId>) -> String {
    ports
        .into_iter()
        .map(|p| p.as_str().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_ports(lines: &mut Vec<String>, label: &str, ports: &[PortId]) {
    if !ports.is_empty() {
        lines.push(format!("      {label}: {}", join_ports(ports)));
    }
}

/// Compute the changes needed to take `current` to `desired`.
///
/// Pure: the caller fetches the current state; this function never performs
/// I/O. VLAN 1 is never scheduled for deletion regardless of mode.
pub fn diff(current: &DeviceConfig, desired: &DesiredState) -> ConfigDiff {
    let mut out = ConfigDiff::default();

    for (&id, desired_vlan) in &desired.vlans {
        let existing = current.vlans.get(&id);
        match desired_vlan.action {
            VlanAction::Absent => {
                if id == DEFAULT_VLAN {
                    // protected; the validator rejects this before we get here
                    continue;
                }
                if let Some(vlan) = existing {
                    out.vlans_to_delete.push(vlan.clone());
                }
            }
            VlanAction::Ensure => {
                let target = desired_vlan.to_vlan(id);
                match existing {
                    None => out.vlans_to_create.push(target),
                    Some(vlan) => {
                        if let Some(change) = VlanModify::compute(vlan, &target) {
                            out.vlans_to_modify.push(change);
                        }
                    }
                }
            }
        }
    }

    if desired.mode == ApplyMode::Full {
        for (&id, vlan) in &current.vlans {
            if id != DEFAULT_VLAN && !desired.vlans.contains_key(&id) {
                out.vlans_to_delete.push(vlan.clone());
            }
        }
    }

    for (port_id, desired_port) in &desired.ports {
        let current_port = current.ports.get(port_id);
        let mut change = PortChange {
            port: port_id.clone(),
            enabled: None,
            description: None,
            speed: None,
            before_enabled: current_port.and_then(|p| p.enabled),
            before_description: current_port.and_then(|p| p.description.clone()),
            before_speed: current_port.and_then(|p| p.speed),
        };
        let mut touched = false;

        if let Some(enabled) = desired_port.enabled {
            let now = current_port.and_then(|p| p.enabled).unwrap_or(true);
            if enabled != now {
                change.enabled = Some(enabled);
                touched = true;
            }
        }
        if let Some(desc) = &desired_port.description {
            let now = current_port
                .and_then(|p| p.description.as_deref())
                .unwrap_or("");
            if desc != now {
                change.description = Some(desc.clone());
                touched = true;
            }
        }
        if let Some(speed) = desired_port.speed {
            let now = current_port.and_then(|p| p.speed).unwrap_or(PortSpeed::Auto);
            if speed != now {
                change.speed = Some(speed);
                touched = true;
            }
        }

        if touched {
            out.ports_to_configure.push(change);
        }
    }

    let current_settings: &BTreeMap<String, Scalar> = &current.settings;
    for (key, value) in &desired.settings {
        if current_settings.get(key) != Some(value) {
            out.settings_to_change.push(SettingChange {
                key: key.clone(),
                before: current_settings.get(key).cloned(),
                after: value.clone(),
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{LinkState, Port};

    fn current_with_vlan1() -> DeviceConfig {
        let mut cfg = DeviceConfig::new("sw1");
        cfg.insert_vlan(
            Vlan::new(1)
                .with_name("DEFAULT-VLAN")
                .with_untagged(["1/1/1", "1/1/2", "1/1/3"]),
        );
        cfg
    }

    fn desired(yaml: &str) -> DesiredState {
        DesiredState::from_yaml(yaml).unwrap()
    }

    #[test]
    fn diff_of_identical_state_is_empty() {
        let cfg = current_with_vlan1();
        let ds = desired(
            "device_id: sw1\nvlans:\n  1:\n    name: DEFAULT-VLAN\n    untagged_ports: [\"1/1/1\", \"1/1/2\", \"1/1/3\"]\n",
        );
        assert!(diff(&cfg, &ds).is_empty());
    }

    #[test]
    fn missing_vlan_is_created() {
        let cfg = current_with_vlan1();
        let ds = desired("device_id: sw1\nvlans:\n  100:\n    name: Servers\n");
        let d = diff(&cfg, &ds);
        assert_eq!(d.vlans_to_create.len(), 1);
        assert_eq!(d.vlans_to_create[0].id, 100);
    }

    #[test]
    fn membership_change_is_a_modify() {
        let cfg = current_with_vlan1();
        let ds = desired(
            "device_id: sw1\nvlans:\n  1:\n    name: DEFAULT-VLAN\n    untagged_ports: [\"1/1/1\", \"1/1/2\"]\n",
        );
        let d = diff(&cfg, &ds);
        assert_eq!(d.vlans_to_modify.len(), 1);
        let m = &d.vlans_to_modify[0];
        assert!(m.add_untagged.is_empty());
        assert_eq!(m.remove_untagged, vec![PortId::new("1/1/3")]);
    }

    #[test]
    fn full_mode_schedules_extra_vlans_for_deletion() {
        let mut cfg = current_with_vlan1();
        cfg.insert_vlan(Vlan::new(254).with_name("Management"));
        let ds = desired("device_id: sw1\nmode: full\nvlans:\n  100: {name: Servers}\n");
        let d = diff(&cfg, &ds);
        assert_eq!(d.vlans_to_delete.len(), 1);
        assert_eq!(d.vlans_to_delete[0].id, 254);
    }

    #[test]
    fn vlan_1_is_never_deleted_in_full_mode() {
        let cfg = current_with_vlan1();
        let ds = desired("device_id: sw1\nmode: full\nvlans: {}\n");
        let d = diff(&cfg, &ds);
        assert!(d.vlans_to_delete.is_empty());
    }

    #[test]
    fn patch_mode_ignores_unlisted_vlans() {
        let mut cfg = current_with_vlan1();
        cfg.insert_vlan(Vlan::new(254).with_name("Management"));
        let ds = desired("device_id: sw1\nmode: patch\nvlans:\n  100: {name: Servers}\n");
        let d = diff(&cfg, &ds);
        assert!(d.vlans_to_delete.is_empty());
        assert_eq!(d.vlans_to_create.len(), 1);
    }

    #[test]
    fn port_attribute_diff_only_covers_managed_fields() {
        let mut cfg = DeviceConfig::new("sw1");
        let mut port = Port::new("1/1/5");
        port.enabled = Some(true);
        port.link_state = Some(crate::model::types::LinkState::Down);
        cfg.insert_port(port);

        let ds = desired("device_id: sw1\nports:\n  1/1/5:\n    enabled: false\n");
        let d = diff(&cfg, &ds);
        assert_eq!(d.ports_to_configure.len(), 1);
        assert_eq!(d.ports_to_configure[0].enabled, Some(false));
        assert_eq!(d.ports_to_configure[0].before_enabled, Some(true));
    }

    #[test]
    fn summary_mentions_every_change_class() {
        let cfg = current_with_vlan1();
        let ds = desired(
            "device_id: sw1\nmode: patch\nvlans:\n  100: {name: Servers}\n  1:\n    name: DEFAULT-VLAN\n    untagged_ports: [\"1/1/1\"]\n",
        );
        let d = diff(&cfg, &ds);
        let text = d.summarize();
        assert!(text.contains("[+] Create VLAN 100"));
        assert!(text.contains("[~] Modify VLAN 1"));
    }
}
