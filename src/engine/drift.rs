//! Drift detection: stored desired state vs live device state.
//!
//! Side-effect-free: the caller supplies a freshly fetched config; this
//! module only compares and reports. Nothing here corrects anything.

use serde::Serialize;

use crate::model::{ApplyMode, DesiredState, DeviceConfig, VlanAction, DEFAULT_VLAN};

/// Per-entity drift verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftVerdict {
    /// Present on both sides with matching attributes.
    InSync,
    /// Desired but not on the device.
    Missing,
    /// On the device but not desired; only meaningful in `full` mode.
    Extra,
    /// Present on both sides with differing attributes.
    Differs,
}

/// One entity's drift state.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Entity label, e.g. `vlan:100` or `port:1/1/5`.
    pub entity: String,
    pub verdict: DriftVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Drift report for one device.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub device_id: String,
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn in_sync(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.verdict == DriftVerdict::InSync)
    }

    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries
            .iter()
            .filter(|e| e.verdict != DriftVerdict::InSync)
    }
}

/// Compare a desired state against an observed config.
pub fn detect(desired: &DesiredState, current: &DeviceConfig) -> DriftReport {
    let mut entries = Vec::new();

    for (&id, desired_vlan) in &desired.vlans {
        let entity = format!("vlan:{id}");
        let existing = current.vlans.get(&id);

        match desired_vlan.action {
            VlanAction::Absent => {
                if existing.is_some() {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::Extra,
                        detail: Some("marked absent but present on device".to_string()),
                    });
                } else {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::InSync,
                        detail: None,
                    });
                }
            }
            VlanAction::Ensure => match existing {
                None => entries.push(DriftEntry {
                    entity,
                    verdict: DriftVerdict::Missing,
                    detail: None,
                }),
                Some(vlan) => {
                    let target = desired_vlan.to_vlan(id);
                    let mut details = Vec::new();
                    if let Some(name) = &target.name {
                        if vlan.name.as_ref() != Some(name) {
                            details.push(format!(
                                "name {:?} != {:?}",
                                vlan.name.as_deref().unwrap_or(""),
                                name
                            ));
                        }
                    }
                    if vlan.untagged_ports != target.untagged_ports {
                        details.push("untagged ports differ".to_string());
                    }
                    if vlan.tagged_ports != target.tagged_ports {
                        details.push("tagged ports differ".to_string());
                    }
                    entries.push(DriftEntry {
                        entity,
                        verdict: if details.is_empty() {
                            DriftVerdict::InSync
                        } else {
                            DriftVerdict::Differs
                        },
                        detail: if details.is_empty() {
                            None
                        } else {
                            Some(details.join("; "))
                        },
                    });
                }
            },
        }
    }

    if desired.mode == ApplyMode::Full {
        for &id in current.vlans.keys() {
            if id != DEFAULT_VLAN && !desired.vlans.contains_key(&id) {
                entries.push(DriftEntry {
                    entity: format!("vlan:{id}"),
                    verdict: DriftVerdict::Extra,
                    detail: None,
                });
            }
        }
    }

    for (port_id, desired_port) in &desired.ports {
        let entity = format!("port:{port_id}");
        let Some(port) = current.ports.get(port_id) else {
            entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Missing,
                detail: None,
            });
            continue;
        };

        let mut details = Vec::new();
        if let Some(enabled) = desired_port.enabled {
            if port.enabled != Some(enabled) {
                details.push(format!("enabled should be {enabled}"));
            }
        }
        if let Some(desc) = &desired_port.description {
            if port.description.as_ref() != Some(desc) {
                details.push(format!("description should be {desc:?}"));
            }
        }
        if let Some(speed) = desired_port.speed {
            if port.speed != Some(speed) {
                details.push(format!("speed should be {}", speed.as_str()));
            }
        }

        entries.push(DriftEntry {
            entity,
            verdict: if details.is_empty() {
                DriftVerdict::InSync
            } else {
                DriftVerdict::Differs
            },
            detail: if details.is_empty() {
                None
            } else {
                Some(details.join("; "))
            },
        });
    }

    DriftReport {
        device_id: desired.device_id.clone(),
        entries,
    }
}
