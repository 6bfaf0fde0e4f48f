//! Command planner: a [`ConfigDiff`] becomes a vendor [`CommandPlan`].
//!
//! Ordering rules that matter on real hardware:
//!
//! - A port can be untagged in only one VLAN at a time, so membership
//!   removals run before additions (modifications first, then deletions,
//!   then creations).
//! - Brocade ranges never span modules, and one ranged command beats two
//!   dozen per-port commands by an order of magnitude.
//! - A port moving from tagged-somewhere to untagged-somewhere-new needs
//!   `no dual-mode` first or the device refuses the change.
//!
//! Every forward command gets an inverse in `rollback_commands`, reverse
//! order, so a partial failure can be unwound from the failure point back.

use std::collections::BTreeSet;

use crate::engine::validator::VendorFamily;
use crate::error::{Result, ValidationError};
use crate::handler::brocade::group_port_ranges;
use crate::handler::openwrt::format_bridge_ports;
use crate::model::{
    ChangeTag, ConfigDiff, DeviceConfig, Port, PortId, PortSpeed, Scalar, Vlan,
};

/// A non-CLI operation for form-driven vendors.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    CreateVlan(Vlan),
    DeleteVlan(u16),
    SetMembership {
        vlan: u16,
        port: PortId,
        tagged: bool,
    },
    ClearMembership {
        vlan: u16,
        port: PortId,
    },
    ConfigurePort(Port),
}

/// The payload of one planned step.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// A literal CLI command.
    Cli(String),
    /// A handler-level operation (web form vendors).
    Op(PlannedOp),
}

/// One planned step with its originating diff element.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    pub kind: CommandKind,
    pub tag: ChangeTag,
}

impl PlannedCommand {
    pub fn cli(text: impl Into<String>, tag: ChangeTag) -> Self {
        Self {
            kind: CommandKind::Cli(text.into()),
            tag,
        }
    }

    pub fn op(op: PlannedOp, tag: ChangeTag) -> Self {
        Self {
            kind: CommandKind::Op(op),
            tag,
        }
    }

    /// The CLI text, when this step is a CLI command.
    pub fn cli_text(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::Cli(text) => Some(text),
            CommandKind::Op(_) => None,
        }
    }
}

/// An ordered plan: pre, main, post, and the rollback mirror.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPlan {
    pub pre_commands: Vec<PlannedCommand>,
    pub main_commands: Vec<PlannedCommand>,
    pub post_commands: Vec<PlannedCommand>,
    pub rollback_commands: Vec<PlannedCommand>,
}

impl CommandPlan {
    pub fn total_commands(&self) -> usize {
        self.pre_commands.len() + self.main_commands.len() + self.post_commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_commands() == 0
    }

    /// All forward CLI text in execution order, for previews.
    pub fn render(&self) -> Vec<String> {
        self.pre_commands
            .iter()
            .chain(&self.main_commands)
            .chain(&self.post_commands)
            .map(|c| match &c.kind {
                CommandKind::Cli(text) => text.clone(),
                CommandKind::Op(op) => format!("<{op:?}>"),
            })
            .collect()
    }
}

/// Build the plan for a vendor family.
///
/// `current` supplies device context the diff alone cannot know (bridge
/// name, VLAN filtering state).
pub fn plan(
    family: VendorFamily,
    diff: &ConfigDiff,
    current: &DeviceConfig,
    save_on_success: bool,
) -> Result<CommandPlan> {
    match family {
        VendorFamily::Brocade => Ok(plan_brocade(diff, current, save_on_success)),
        VendorFamily::OpenWrt => Ok(plan_openwrt(diff, current)),
        VendorFamily::Zyxel => Ok(plan_zyxel(diff)),
    }
}

// ---------------------------------------------------------------------------
// Brocade
// ---------------------------------------------------------------------------

fn plan_brocade(diff: &ConfigDiff, current: &DeviceConfig, save_on_success: bool) -> CommandPlan {
    let mut plan = CommandPlan::default();

    // Ports leaving a tagged membership while gaining an untagged one
    // elsewhere must drop dual-mode first.
    for port in dual_mode_ports(diff) {
        plan.pre_commands.push(PlannedCommand::cli(
            format!("interface ethe {port}"),
            ChangeTag::Meta,
        ));
        plan.pre_commands
            .push(PlannedCommand::cli("no dual-mode", ChangeTag::Meta));
        plan.pre_commands
            .push(PlannedCommand::cli("exit", ChangeTag::Meta));
    }

    // A port can be untagged in one VLAN at a time: ports a creation or
    // modification claims untagged must first be evicted from wherever they
    // are untagged now, unless a modification in this diff already removes
    // them there.
    for ((owner, tag), ports) in untagged_evictions(diff, current) {
        plan.main_commands
            .push(PlannedCommand::cli(format!("vlan {owner}"), tag.clone()));
        for spec in ranges(&ports) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("no untagged ethe {spec}"), tag.clone()));
        }
        plan.main_commands.push(PlannedCommand::cli("exit", tag));
    }

    // Modifications first: removals free ports for the creations below.
    for change in &diff.vlans_to_modify {
        let tag = ChangeTag::VlanModify(change.before.id);
        plan.main_commands
            .push(PlannedCommand::cli(format!("vlan {}", change.before.id), tag.clone()));
        for spec in ranges(&change.remove_untagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("no untagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.remove_tagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("no tagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.add_untagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("untagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.add_tagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("tagged ethe {spec}"), tag.clone()));
        }
        plan.main_commands.push(PlannedCommand::cli("exit", tag));
    }

    // Deletions: unbind members, then drop the VLAN.
    for vlan in &diff.vlans_to_delete {
        let tag = ChangeTag::VlanDelete(vlan.id);
        let untagged: Vec<PortId> = vlan.untagged_ports.iter().cloned().collect();
        let tagged: Vec<PortId> = vlan.tagged_ports.iter().cloned().collect();
        if !untagged.is_empty() || !tagged.is_empty() {
            plan.main_commands
                .push(PlannedCommand::cli(format!("vlan {}", vlan.id), tag.clone()));
            for spec in ranges(&untagged) {
                plan.main_commands
                    .push(PlannedCommand::cli(format!("no untagged ethe {spec}"), tag.clone()));
            }
            for spec in ranges(&tagged) {
                plan.main_commands
                    .push(PlannedCommand::cli(format!("no tagged ethe {spec}"), tag.clone()));
            }
            plan.main_commands
                .push(PlannedCommand::cli("exit", tag.clone()));
        }
        plan.main_commands
            .push(PlannedCommand::cli(format!("no vlan {}", vlan.id), tag));
    }

    // Creations.
    for vlan in &diff.vlans_to_create {
        let tag = ChangeTag::VlanCreate(vlan.id);
        let name = vlan.name.clone().unwrap_or_else(|| format!("VLAN{}", vlan.id));
        plan.main_commands.push(PlannedCommand::cli(
            format!("vlan {} name {} by port", vlan.id, name),
            tag.clone(),
        ));
        let untagged: Vec<PortId> = vlan.untagged_ports.iter().cloned().collect();
        for spec in ranges(&untagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("untagged ethe {spec}"), tag.clone()));
        }
        let tagged: Vec<PortId> = vlan.tagged_ports.iter().cloned().collect();
        for spec in ranges(&tagged) {
            plan.main_commands
                .push(PlannedCommand::cli(format!("tagged ethe {spec}"), tag.clone()));
        }
        if vlan.ip_interface.is_some() {
            plan.main_commands.push(PlannedCommand::cli(
                format!("router-interface ve {}", vlan.id),
                tag.clone(),
            ));
        }
        plan.main_commands.push(PlannedCommand::cli("exit", tag));
    }

    // Port attribute changes.
    for change in &diff.ports_to_configure {
        let tag = ChangeTag::PortConfigure(change.port.clone());
        plan.main_commands.push(PlannedCommand::cli(
            format!("interface ethe {}", change.port),
            tag.clone(),
        ));
        match change.enabled {
            Some(true) => plan
                .main_commands
                .push(PlannedCommand::cli("enable", tag.clone())),
            Some(false) => plan
                .main_commands
                .push(PlannedCommand::cli("disable", tag.clone())),
            None => {}
        }
        if let Some(desc) = &change.description {
            plan.main_commands
                .push(PlannedCommand::cli(format!("port-name {desc}"), tag.clone()));
        }
        if let Some(speed) = change.speed {
            plan.main_commands.push(PlannedCommand::cli(
                format!("speed-duplex {}", brocade_speed(speed)),
                tag.clone(),
            ));
        }
        plan.main_commands.push(PlannedCommand::cli("exit", tag));
    }

    if save_on_success && !plan.main_commands.is_empty() {
        plan.post_commands
            .push(PlannedCommand::cli("write memory", ChangeTag::Meta));
    }

    plan.rollback_commands = brocade_rollback(diff, current);
    plan
}

/// Untagged claims that require evicting a port from its current owner.
///
/// Keyed by (owning VLAN, tag of the claiming change), in deterministic
/// order. Ports already removed from the owner by a modification in the
/// same diff are skipped.
fn untagged_evictions(
    diff: &ConfigDiff,
    current: &DeviceConfig,
) -> Vec<((u16, ChangeTag), Vec<PortId>)> {
    use std::collections::BTreeMap;

    let mut already_removed: BTreeSet<(u16, &PortId)> = BTreeSet::new();
    for change in &diff.vlans_to_modify {
        for port in &change.remove_untagged {
            already_removed.insert((change.before.id, port));
        }
    }
    for vlan in &diff.vlans_to_delete {
        for port in &vlan.untagged_ports {
            already_removed.insert((vlan.id, port));
        }
    }

    let claims: Vec<(ChangeTag, Vec<PortId>)> = diff
        .vlans_to_create
        .iter()
        .map(|v| {
            (
                ChangeTag::VlanCreate(v.id),
                v.untagged_ports.iter().cloned().collect(),
            )
        })
        .chain(diff.vlans_to_modify.iter().map(|m| {
            (
                ChangeTag::VlanModify(m.before.id),
                m.add_untagged.clone(),
            )
        }))
        .collect();

    let mut evictions: BTreeMap<(u16, String), (ChangeTag, Vec<PortId>)> = BTreeMap::new();
    for (tag, ports) in claims {
        let claiming_vlan = match tag {
            ChangeTag::VlanCreate(id) | ChangeTag::VlanModify(id) => id,
            _ => continue,
        };
        for port in ports {
            let owner = current
                .vlans
                .values()
                .find(|v| v.id != claiming_vlan && v.untagged_ports.contains(&port));
            let Some(owner) = owner else { continue };
            if already_removed.contains(&(owner.id, &port)) {
                continue;
            }
            evictions
                .entry((owner.id, tag.to_string()))
                .or_insert_with(|| (tag.clone(), Vec::new()))
                .1
                .push(port);
        }
    }

    evictions
        .into_iter()
        .map(|((owner, _), (tag, ports))| ((owner, tag), ports))
        .collect()
}

/// Ports leaving a tagged set while entering an untagged set.
fn dual_mode_ports(diff: &ConfigDiff) -> Vec<PortId> {
    let mut leaving_tagged: BTreeSet<PortId> = BTreeSet::new();
    for change in &diff.vlans_to_modify {
        leaving_tagged.extend(change.remove_tagged.iter().cloned());
    }
    for vlan in &diff.vlans_to_delete {
        leaving_tagged.extend(vlan.tagged_ports.iter().cloned());
    }

    let mut gaining_untagged: BTreeSet<PortId> = BTreeSet::new();
    for change in &diff.vlans_to_modify {
        gaining_untagged.extend(change.add_untagged.iter().cloned());
    }
    for vlan in &diff.vlans_to_create {
        gaining_untagged.extend(vlan.untagged_ports.iter().cloned());
    }

    leaving_tagged.intersection(&gaining_untagged).cloned().collect()
}

fn brocade_rollback(diff: &ConfigDiff, current: &DeviceConfig) -> Vec<PlannedCommand> {
    let mut commands = Vec::new();

    // Reverse of main order: creations undo first, then deletions, then
    // modifications, then eviction restores.
    for vlan in diff.vlans_to_create.iter().rev() {
        commands.push(PlannedCommand::cli(
            format!("no vlan {}", vlan.id),
            ChangeTag::VlanCreate(vlan.id),
        ));
    }

    for ((owner, tag), ports) in untagged_evictions(diff, current).into_iter().rev() {
        commands.push(PlannedCommand::cli(format!("vlan {owner}"), tag.clone()));
        for spec in ranges(&ports) {
            commands.push(PlannedCommand::cli(format!("untagged ethe {spec}"), tag.clone()));
        }
        commands.push(PlannedCommand::cli("exit", tag));
    }

    for vlan in diff.vlans_to_delete.iter().rev() {
        let tag = ChangeTag::VlanDelete(vlan.id);
        let name = vlan.name.clone().unwrap_or_else(|| format!("VLAN{}", vlan.id));
        commands.push(PlannedCommand::cli(
            format!("vlan {} name {} by port", vlan.id, name),
            tag.clone(),
        ));
        let untagged: Vec<PortId> = vlan.untagged_ports.iter().cloned().collect();
        for spec in ranges(&untagged) {
            commands.push(PlannedCommand::cli(format!("untagged ethe {spec}"), tag.clone()));
        }
        let tagged: Vec<PortId> = vlan.tagged_ports.iter().cloned().collect();
        for spec in ranges(&tagged) {
            commands.push(PlannedCommand::cli(format!("tagged ethe {spec}"), tag.clone()));
        }
        commands.push(PlannedCommand::cli("exit", tag));
    }

    for change in diff.vlans_to_modify.iter().rev() {
        let tag = ChangeTag::VlanModify(change.before.id);
        commands.push(PlannedCommand::cli(
            format!("vlan {}", change.before.id),
            tag.clone(),
        ));
        // inverse: remove what was added, restore what was removed
        for spec in ranges(&change.add_untagged) {
            commands.push(PlannedCommand::cli(format!("no untagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.add_tagged) {
            commands.push(PlannedCommand::cli(format!("no tagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.remove_untagged) {
            commands.push(PlannedCommand::cli(format!("untagged ethe {spec}"), tag.clone()));
        }
        for spec in ranges(&change.remove_tagged) {
            commands.push(PlannedCommand::cli(format!("tagged ethe {spec}"), tag.clone()));
        }
        commands.push(PlannedCommand::cli("exit", tag));
    }

    for change in diff.ports_to_configure.iter().rev() {
        let tag = ChangeTag::PortConfigure(change.port.clone());
        commands.push(PlannedCommand::cli(
            format!("interface ethe {}", change.port),
            tag.clone(),
        ));
        if change.enabled.is_some() {
            let restore = if change.before_enabled.unwrap_or(true) {
                "enable"
            } else {
                "disable"
            };
            commands.push(PlannedCommand::cli(restore, tag.clone()));
        }
        if change.description.is_some() {
            if let Some(before) = &change.before_description {
                commands.push(PlannedCommand::cli(format!("port-name {before}"), tag.clone()));
            } else {
                commands.push(PlannedCommand::cli("no port-name", tag.clone()));
            }
        }
        if change.speed.is_some() {
            let before = change.before_speed.unwrap_or(PortSpeed::Auto);
            commands.push(PlannedCommand::cli(
                format!("speed-duplex {}", brocade_speed(before)),
                tag.clone(),
            ));
        }
        commands.push(PlannedCommand::cli("exit", tag));
    }

    commands
}

fn brocade_speed(speed: PortSpeed) -> &'static str {
    match speed {
        PortSpeed::Auto => "auto",
        PortSpeed::TenHalf => "10-half",
        PortSpeed::TenFull => "10-full",
        PortSpeed::HundredHalf => "100-half",
        PortSpeed::HundredFull => "100-full",
        PortSpeed::GigFull => "1000-full",
        PortSpeed::TenGig => "10g-full",
    }
}

fn ranges(ports: &[PortId]) -> Vec<String> {
    group_port_ranges(ports)
}

// ---------------------------------------------------------------------------
// OpenWrt
// ---------------------------------------------------------------------------

fn plan_openwrt(diff: &ConfigDiff, current: &DeviceConfig) -> CommandPlan {
    let mut plan = CommandPlan::default();

    let bridge = match current.settings.get("bridge") {
        Some(Scalar::Text(name)) => name.clone(),
        _ => "switch".to_string(),
    };

    // Bridge VLAN filtering: enable only when the flag exists and reads 0.
    let filtering = matches!(current.settings.get("vlan_filtering"), Some(Scalar::Int(0)));
    if filtering && !diff.vlans_to_create.is_empty() {
        plan.pre_commands.push(PlannedCommand::cli(
            format!("uci set network.{bridge}.vlan_filtering='1'"),
            ChangeTag::Meta,
        ));
        plan.rollback_commands.push(PlannedCommand::cli(
            format!("uci set network.{bridge}.vlan_filtering='0'"),
            ChangeTag::Meta,
        ));
    }

    for change in &diff.vlans_to_modify {
        let tag = ChangeTag::VlanModify(change.before.id);
        let section = format!("vlan{}", change.before.id);
        plan.main_commands.push(PlannedCommand::cli(
            format!(
                "uci set network.{section}.ports='{}'",
                format_bridge_ports(&change.after.untagged_ports, &change.after.tagged_ports)
            ),
            tag.clone(),
        ));
        plan.rollback_commands.push(PlannedCommand::cli(
            format!(
                "uci set network.{section}.ports='{}'",
                format_bridge_ports(&change.before.untagged_ports, &change.before.tagged_ports)
            ),
            tag,
        ));
    }

    for vlan in &diff.vlans_to_delete {
        let tag = ChangeTag::VlanDelete(vlan.id);
        let section = format!("vlan{}", vlan.id);
        plan.main_commands.push(PlannedCommand::cli(
            format!("uci delete network.{section}"),
            tag.clone(),
        ));
        for cmd in create_section_commands(&section, &bridge, vlan) {
            plan.rollback_commands
                .push(PlannedCommand::cli(cmd, tag.clone()));
        }
    }

    for vlan in &diff.vlans_to_create {
        let tag = ChangeTag::VlanCreate(vlan.id);
        let section = format!("vlan{}", vlan.id);
        for cmd in create_section_commands(&section, &bridge, vlan) {
            plan.main_commands.push(PlannedCommand::cli(cmd, tag.clone()));
        }
        plan.rollback_commands.push(PlannedCommand::cli(
            format!("uci delete network.{section}"),
            tag,
        ));
    }

    for change in &diff.ports_to_configure {
        let tag = ChangeTag::PortConfigure(change.port.clone());
        let name = change.port.as_str();
        match change.enabled {
            Some(true) => {
                plan.main_commands
                    .push(PlannedCommand::cli(format!("ip link set {name} up"), tag.clone()));
                plan.rollback_commands.push(PlannedCommand::cli(
                    format!("ip link set {name} down"),
                    tag.clone(),
                ));
            }
            Some(false) => {
                plan.main_commands
                    .push(PlannedCommand::cli(format!("ip link set {name} down"), tag.clone()));
                plan.rollback_commands.push(PlannedCommand::cli(
                    format!("ip link set {name} up"),
                    tag.clone(),
                ));
            }
            None => {}
        }
        if let Some(desc) = &change.description {
            plan.main_commands.push(PlannedCommand::cli(
                format!("uci set network.{name}.description='{desc}'"),
                tag.clone(),
            ));
            let restore = match &change.before_description {
                Some(before) => format!("uci set network.{name}.description='{before}'"),
                None => format!("uci -q delete network.{name}.description"),
            };
            plan.rollback_commands.push(PlannedCommand::cli(restore, tag));
        }
    }

    for change in &diff.settings_to_change {
        let tag = ChangeTag::Setting(change.key.clone());
        plan.main_commands.push(PlannedCommand::cli(
            format!("uci set network.{}='{}'", change.key, change.after),
            tag.clone(),
        ));
        if let Some(before) = &change.before {
            plan.rollback_commands.push(PlannedCommand::cli(
                format!("uci set network.{}='{}'", change.key, before),
                tag,
            ));
        }
    }

    if !plan.main_commands.is_empty() || !plan.pre_commands.is_empty() {
        plan.post_commands.push(PlannedCommand::cli(
            "uci commit network",
            ChangeTag::Meta,
        ));
        plan.post_commands.push(PlannedCommand::cli(
            "/etc/init.d/network reload",
            ChangeTag::Meta,
        ));
        // inverses unwind in reverse order; the rollback batch then needs
        // its own commit+reload to take effect
        plan.rollback_commands.reverse();
        plan.rollback_commands
            .push(PlannedCommand::cli("uci commit network", ChangeTag::Meta));
        plan.rollback_commands.push(PlannedCommand::cli(
            "/etc/init.d/network reload",
            ChangeTag::Meta,
        ));
    }

    plan
}

fn create_section_commands(section: &str, bridge: &str, vlan: &Vlan) -> Vec<String> {
    vec![
        format!("uci set network.{section}=bridge-vlan"),
        format!("uci set network.{section}.device='{bridge}'"),
        format!("uci set network.{section}.vlan='{}'", vlan.id),
        format!(
            "uci set network.{section}.ports='{}'",
            format_bridge_ports(&vlan.untagged_ports, &vlan.tagged_ports)
        ),
    ]
}

// ---------------------------------------------------------------------------
// Zyxel (web forms)
// ---------------------------------------------------------------------------

fn plan_zyxel(diff: &ConfigDiff) -> CommandPlan {
    let mut plan = CommandPlan::default();

    for change in &diff.vlans_to_modify {
        let id = change.before.id;
        let tag = ChangeTag::VlanModify(id);
        for port in change.remove_untagged.iter().chain(&change.remove_tagged) {
            plan.main_commands.push(PlannedCommand::op(
                PlannedOp::ClearMembership {
                    vlan: id,
                    port: port.clone(),
                },
                tag.clone(),
            ));
        }
        for port in &change.add_untagged {
            plan.main_commands.push(PlannedCommand::op(
                PlannedOp::SetMembership {
                    vlan: id,
                    port: port.clone(),
                    tagged: false,
                },
                tag.clone(),
            ));
        }
        for port in &change.add_tagged {
            plan.main_commands.push(PlannedCommand::op(
                PlannedOp::SetMembership {
                    vlan: id,
                    port: port.clone(),
                    tagged: true,
                },
                tag.clone(),
            ));
        }

        // inverse, reverse order
        for port in &change.add_untagged {
            plan.rollback_commands.push(PlannedCommand::op(
                PlannedOp::ClearMembership {
                    vlan: id,
                    port: port.clone(),
                },
                tag.clone(),
            ));
        }
        for port in &change.add_tagged {
            plan.rollback_commands.push(PlannedCommand::op(
                PlannedOp::ClearMembership {
                    vlan: id,
                    port: port.clone(),
                },
                tag.clone(),
            ));
        }
        for port in &change.remove_untagged {
            plan.rollback_commands.push(PlannedCommand::op(
                PlannedOp::SetMembership {
                    vlan: id,
                    port: port.clone(),
                    tagged: false,
                },
                tag.clone(),
            ));
        }
        for port in &change.remove_tagged {
            plan.rollback_commands.push(PlannedCommand::op(
                PlannedOp::SetMembership {
                    vlan: id,
                    port: port.clone(),
                    tagged: true,
                },
                tag.clone(),
            ));
        }
    }

    for vlan in &diff.vlans_to_delete {
        let tag = ChangeTag::VlanDelete(vlan.id);
        plan.main_commands
            .push(PlannedCommand::op(PlannedOp::DeleteVlan(vlan.id), tag.clone()));
        plan.rollback_commands
            .push(PlannedCommand::op(PlannedOp::CreateVlan(vlan.clone()), tag));
    }

    for vlan in &diff.vlans_to_create {
        let tag = ChangeTag::VlanCreate(vlan.id);
        plan.main_commands
            .push(PlannedCommand::op(PlannedOp::CreateVlan(vlan.clone()), tag.clone()));
        plan.rollback_commands
            .push(PlannedCommand::op(PlannedOp::DeleteVlan(vlan.id), tag));
    }

    for change in &diff.ports_to_configure {
        let tag = ChangeTag::PortConfigure(change.port.clone());
        let mut port = Port::new(change.port.clone());
        port.enabled = change.enabled;
        port.description = change.description.clone();
        port.speed = change.speed;
        plan.main_commands
            .push(PlannedCommand::op(PlannedOp::ConfigurePort(port), tag.clone()));

        let mut restore = Port::new(change.port.clone());
        restore.enabled = change.enabled.map(|_| change.before_enabled.unwrap_or(true));
        restore.description = change
            .description
            .as_ref()
            .map(|_| change.before_description.clone().unwrap_or_default());
        restore.speed = change.speed.map(|_| change.before_speed.unwrap_or(PortSpeed::Auto));
        plan.rollback_commands
            .push(PlannedCommand::op(PlannedOp::ConfigurePort(restore), tag));
    }

    plan.rollback_commands.reverse();
    plan
}

/// Validate that a family can express every change class in a diff.
pub fn check_plannable(family: VendorFamily, diff: &ConfigDiff) -> Result<()> {
    if family == VendorFamily::Zyxel && !diff.settings_to_change.is_empty() {
        return Err(ValidationError::UnsupportedOnTransport {
            operation: "settings".into(),
            transport: "zyxel".into(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{diff, DesiredState};

    fn brocade_fixture() -> (DeviceConfig, DesiredState) {
        let mut current = DeviceConfig::new("lab-brocade");
        current.insert_vlan(
            Vlan::new(1)
                .with_name("DEFAULT-VLAN")
                .with_untagged((1..=24).map(|n| PortId::new(format!("1/1/{n}")))),
        );
        current.insert_vlan(Vlan::new(254).with_name("Management"));

        let desired = DesiredState::from_yaml(
            r#"
device_id: lab-brocade
mode: patch
vlans:
  1:
    name: DEFAULT-VLAN
    untagged_ports: ["1/1/1-4", "1/1/9-24"]
  100:
    name: Servers
    untagged_ports: ["1/1/5-8"]
    tagged_ports: ["1/2/1"]
  254:
    name: Management
"#,
        )
        .unwrap();
        (current, desired)
    }

    #[test]
    fn brocade_create_plan_matches_canonical_sequence() {
        let (current, desired) = brocade_fixture();
        let d = diff(&current, &desired);
        let plan = plan_brocade(&d, &current, true);

        let main: Vec<&str> = plan
            .main_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert_eq!(
            main,
            vec![
                "vlan 1",
                "no untagged ethe 1/1/5 to 1/1/8",
                "exit",
                "vlan 100 name Servers by port",
                "untagged ethe 1/1/5 to 1/1/8",
                "tagged ethe 1/2/1",
                "exit",
            ]
        );

        let post: Vec<&str> = plan
            .post_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert_eq!(post, vec!["write memory"]);
    }

    #[test]
    fn brocade_rollback_inverts_in_reverse_order() {
        let (current, desired) = brocade_fixture();
        let d = diff(&current, &desired);
        let plan = plan_brocade(&d, &current, true);

        let rollback: Vec<&str> = plan
            .rollback_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert_eq!(
            rollback,
            vec![
                "no vlan 100",
                "vlan 1",
                "untagged ethe 1/1/5 to 1/1/8",
                "exit",
            ]
        );
    }

    #[test]
    fn commands_carry_attributable_tags() {
        let (current, desired) = brocade_fixture();
        let d = diff(&current, &desired);
        let plan = plan_brocade(&d, &current, false);

        assert!(plan
            .main_commands
            .iter()
            .any(|c| c.tag == ChangeTag::VlanModify(1)));
        assert!(plan
            .main_commands
            .iter()
            .any(|c| c.tag == ChangeTag::VlanCreate(100)));
    }

    #[test]
    fn dual_mode_pre_commands_target_migrating_ports() {
        let mut current = DeviceConfig::new("lab-brocade");
        current.insert_vlan(Vlan::new(50).with_tagged(["1/1/10"]));
        let desired = DesiredState::from_yaml(
            "device_id: lab-brocade\nvlans:\n  50:\n    tagged_ports: []\n  100:\n    untagged_ports: [\"1/1/10\"]\n",
        )
        .unwrap();
        let d = diff(&current, &desired);
        let plan = plan_brocade(&d, &current, false);

        let pre: Vec<&str> = plan
            .pre_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert_eq!(pre, vec!["interface ethe 1/1/10", "no dual-mode", "exit"]);
    }

    #[test]
    fn delete_unbinds_ports_before_no_vlan() {
        let mut current = DeviceConfig::new("lab-brocade");
        current.insert_vlan(
            Vlan::new(200)
                .with_name("Old")
                .with_untagged(["1/1/3"])
                .with_tagged(["1/2/2"]),
        );
        let desired =
            DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  200: {action: absent}\n")
                .unwrap();
        let d = diff(&current, &desired);
        let plan = plan_brocade(&d, &current, false);

        let main: Vec<&str> = plan
            .main_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert_eq!(
            main,
            vec![
                "vlan 200",
                "no untagged ethe 1/1/3",
                "no tagged ethe 1/2/2",
                "exit",
                "no vlan 200",
            ]
        );
        // rollback recreates from the captured before-state
        let rollback: Vec<&str> = plan
            .rollback_commands
            .iter()
            .filter_map(|c| c.cli_text())
            .collect();
        assert!(rollback.contains(&"vlan 200 name Old by port"));
    }

    #[test]
    fn openwrt_plan_enables_filtering_once() {
        let mut current = DeviceConfig::new("lab-openwrt");
        current
            .settings
            .insert("bridge".into(), Scalar::Text("br-lan".into()));
        current.settings.insert("vlan_filtering".into(), Scalar::Int(0));

        let desired = DesiredState::from_yaml(
            "device_id: lab-openwrt\nvlans:\n  100:\n    untagged_ports: [\"lan1\"]\n    tagged_ports: [\"lan4\"]\n",
        )
        .unwrap();
        let d = diff(&current, &desired);
        let plan = plan_openwrt(&d, &current);

        let pre: Vec<&str> = plan.pre_commands.iter().filter_map(|c| c.cli_text()).collect();
        assert_eq!(pre, vec!["uci set network.br-lan.vlan_filtering='1'"]);

        let main: Vec<&str> = plan.main_commands.iter().filter_map(|c| c.cli_text()).collect();
        assert!(main.contains(&"uci set network.vlan100=bridge-vlan"));
        assert!(main.contains(&"uci set network.vlan100.ports='lan4:t lan1:u*'"));

        let post: Vec<&str> = plan.post_commands.iter().filter_map(|c| c.cli_text()).collect();
        assert_eq!(post, vec!["uci commit network", "/etc/init.d/network reload"]);
    }

    #[test]
    fn openwrt_filtering_untouched_when_already_on() {
        let mut current = DeviceConfig::new("lab-openwrt");
        current
            .settings
            .insert("bridge".into(), Scalar::Text("br-lan".into()));
        current.settings.insert("vlan_filtering".into(), Scalar::Int(1));

        let desired = DesiredState::from_yaml(
            "device_id: lab-openwrt\nvlans:\n  100:\n    untagged_ports: [\"lan1\"]\n",
        )
        .unwrap();
        let d = diff(&current, &desired);
        let plan = plan_openwrt(&d, &current);
        assert!(plan.pre_commands.is_empty());
    }

    #[test]
    fn zyxel_plan_is_op_based_with_inverse_rollback() {
        let mut current = DeviceConfig::new("lab-zyxel");
        current.insert_vlan(Vlan::new(1).with_name("default"));
        let desired = DesiredState::from_yaml(
            "device_id: lab-zyxel\nvlans:\n  100:\n    name: Servers\n    untagged_ports: [\"5\"]\n",
        )
        .unwrap();
        let d = diff(&current, &desired);
        let plan = plan_zyxel(&d);

        assert_eq!(plan.main_commands.len(), 1);
        assert!(matches!(
            plan.main_commands[0].kind,
            CommandKind::Op(PlannedOp::CreateVlan(_))
        ));
        assert!(matches!(
            plan.rollback_commands[0].kind,
            CommandKind::Op(PlannedOp::DeleteVlan(100))
        ));
    }
}
