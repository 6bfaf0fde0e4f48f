//! OpenWrt DSA handler (SSH exec + SFTP).
//!
//! Modern OpenWrt models each switch port as its own netdev (`lan1`,
//! `lan2`, ...) bridged together; VLANs are `bridge-vlan` UCI sections and
//! take effect only once `vlan_filtering` is enabled on the bridge. Port
//! status comes from sysfs, not from CLI scraping.

use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TransportError, ValidationError};
use crate::handler::{require_nonempty, CommandOutput, DeviceHandler};
use crate::inventory::Device;
use crate::model::{DeviceConfig, DeviceStatus, LinkState, Port, PortId, PortSpeed, Scalar, Vlan};
use crate::platform::{openwrt_platform, VendorPlatform};
use crate::transport::exec::{shell_quote, SshExec};
use crate::transport::Backoff;

static UCI_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^network\.([\w@\[\]]+)\.(\w+)='?([^']*)'?$").unwrap());
static SECTION_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^network\.([\w@\[\]]+)=([\w-]+)$").unwrap());

/// The network config file whose blank upload bricks the device.
pub const NETWORK_CONFIG: &str = "/etc/config/network";

/// OpenWrt device handler.
pub struct OpenWrtHandler {
    device: Device,
    platform: VendorPlatform,
    exec: Option<SshExec>,
    bridge: Option<String>,
    ports: Vec<PortId>,
    vlan_filtering: Option<i64>,
}

impl OpenWrtHandler {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            platform: openwrt_platform(),
            exec: None,
            bridge: None,
            ports: Vec::new(),
            vlan_filtering: None,
        }
    }

    async fn exec(&mut self) -> Result<&SshExec> {
        if self.exec.is_none() {
            self.connect().await?;
        }
        Ok(self.exec.as_ref().expect("connected above"))
    }

    /// Bridge name, detected ports and VLAN filtering state, cached per
    /// session.
    async fn probe_system(&mut self) -> Result<()> {
        let exec = self.exec.as_ref().expect("probe after connect");

        let ports_out = exec
            .run("ls -1 /sys/class/net/ | grep -E '^lan[0-9]+$'")
            .await?;
        self.ports = ports_out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(PortId::new)
            .collect();

        let bridge_out = exec
            .run("ls -d /sys/class/net/br-lan/bridge >/dev/null 2>&1 && echo br-lan || echo switch")
            .await?;
        let bridge = bridge_out
            .stdout
            .lines()
            .last()
            .unwrap_or("switch")
            .trim()
            .to_string();

        let filtering_out = exec
            .run(&format!(
                "cat /sys/class/net/{bridge}/bridge/vlan_filtering 2>/dev/null || echo -1"
            ))
            .await?;
        self.vlan_filtering = filtering_out.stdout.trim().parse::<i64>().ok();
        self.bridge = Some(bridge);
        Ok(())
    }

    fn bridge(&self) -> &str {
        self.bridge.as_deref().unwrap_or("switch")
    }

    async fn uci_batch(&mut self, commands: &[String]) -> Result<()> {
        for command in commands {
            let out = self.execute(command).await?;
            if let Some(failure) = out.failure {
                return Err(crate::error::VendorReject {
                    device_id: self.device.id.clone(),
                    command: command.clone(),
                    pattern: failure,
                    output: out.output,
                    trail: Vec::new(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn reload_network(&mut self) -> Result<()> {
        let out = self.exec().await?.run("/etc/init.d/network reload 2>&1").await?;
        if !out.success() {
            warn!(
                "{}: network reload reported failure: {}",
                self.device.id,
                out.combined()
            );
        }
        Ok(())
    }

    /// Find the UCI section holding a VLAN id, trying the deterministic
    /// `vlan<id>` name first and falling back to a search.
    async fn find_vlan_section(&mut self, vlan_id: u16) -> Result<Option<String>> {
        let direct = format!("vlan{vlan_id}");
        let probe = self
            .exec()
            .await?
            .run(&format!("uci -q get network.{direct}"))
            .await?;
        if probe.success() {
            return Ok(Some(direct));
        }

        let search = self
            .exec()
            .await?
            .run(&format!(
                "uci show network | grep -E \"\\.vlan='?{vlan_id}'?$\" | head -1"
            ))
            .await?;
        if let Some(caps) = UCI_LINE.captures(search.stdout.trim()) {
            return Ok(Some(caps[1].to_string()));
        }
        Ok(None)
    }
}

#[async_trait]
impl DeviceHandler for OpenWrtHandler {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn connect(&mut self) -> Result<()> {
        if self.exec.is_some() {
            return Ok(());
        }
        info!(
            "connecting to OpenWrt {} at {}",
            self.device.id, self.device.host
        );

        let host = self.device.host.clone();
        let port = self.device.port;
        let username = self.device.username.clone();
        let password = self.device.password();
        let timeout = self.device.timeout();

        let exec = Backoff::default()
            .retry("ssh connect", || {
                let (host, username, password) = (host.clone(), username.clone(), password.clone());
                async move {
                    match SshExec::connect(&host, port, &username, &password, timeout).await {
                        Ok(e) => Ok(e),
                        Err(crate::error::Error::Transport(e)) => Err(e),
                        Err(other) => Err(TransportError::Io(std::io::Error::other(
                            other.to_string(),
                        ))),
                    }
                }
            })
            .await?;
        self.exec = Some(exec);
        self.probe_system().await?;
        info!("connected to {}", self.device.id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(exec) = self.exec.take() {
            let _ = exec.close().await;
        }
        self.bridge = None;
        self.ports.clear();
        self.vlan_filtering = None;
        debug!("disconnected from {}", self.device.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.exec.is_some()
    }

    async fn check_health(&mut self) -> Result<DeviceStatus> {
        let release = match self.exec().await?.run("cat /etc/openwrt_release").await {
            Ok(out) => out,
            Err(e) => {
                return Ok(DeviceStatus {
                    reachable: false,
                    error: Some(e.to_string()),
                    ..DeviceStatus::default()
                })
            }
        };
        let firmware = release
            .stdout
            .lines()
            .find(|l| l.starts_with("DISTRIB_DESCRIPTION"))
            .and_then(|l| l.split_once('='))
            .map(|(_, v)| v.trim_matches(['\'', '"']).to_string());

        let uptime_out = self.exec().await?.run("uptime").await?;
        let uptime = uptime_out
            .stdout
            .split_once("up")
            .and_then(|(_, rest)| rest.split(", load").next())
            .map(|s| s.trim().to_string());

        Ok(DeviceStatus {
            reachable: true,
            uptime,
            firmware_version: firmware,
            error: None,
        })
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        require_nonempty(command)?;
        let start = Instant::now();
        let out = self.exec().await?.run(command).await?;
        let elapsed = start.elapsed();
        let combined = out.combined();

        if !out.success() {
            return Ok(CommandOutput::failed(
                command,
                combined.clone(),
                format!("exit status {}", out.exit_code),
                elapsed,
            ));
        }
        Ok(match self.platform.detect_failure(&combined) {
            Some(line) => CommandOutput::failed(command, combined, line, elapsed),
            None => CommandOutput::ok(command, combined, elapsed),
        })
    }

    async fn get_vlans(&mut self) -> Result<Vec<Vlan>> {
        let out = self.execute("uci show network").await?;
        let mut vlans = parse_uci_vlans(&out.output);

        // A device with no VLAN sections still has its default bridge; report
        // it as VLAN 1 over all detected ports so diffs see reality.
        if vlans.is_empty() {
            let mut default = Vlan::new(1).with_name("default");
            default.untagged_ports = self.ports.iter().cloned().collect();
            vlans.push(default);
        }
        Ok(vlans)
    }

    async fn get_ports(&mut self) -> Result<Vec<Port>> {
        if self.exec.is_none() {
            self.connect().await?;
        } else if self.ports.is_empty() {
            self.probe_system().await?;
        }
        let port_ids = self.ports.clone();
        let mut ports = Vec::with_capacity(port_ids.len());

        for id in port_ids {
            let name = id.as_str().to_string();
            let state = self
                .exec()
                .await?
                .run(&format!("cat /sys/class/net/{name}/operstate"))
                .await?;
            let speed = self
                .exec()
                .await?
                .run(&format!("cat /sys/class/net/{name}/speed 2>/dev/null"))
                .await?;
            let description = self
                .exec()
                .await?
                .run(&format!("uci -q get network.{name}.description"))
                .await?;

            let mut port = Port::new(id);
            let operstate = state.stdout.trim();
            port.link_state = Some(match operstate {
                "up" => LinkState::Up,
                "down" => LinkState::Down,
                _ => LinkState::Unknown,
            });
            port.enabled = Some(operstate == "up");
            port.speed = parse_sysfs_speed(speed.stdout.trim());
            if description.success() && !description.stdout.trim().is_empty() {
                port.description = Some(description.stdout.trim().to_string());
            }
            ports.push(port);
        }
        Ok(ports)
    }

    async fn get_config(&mut self) -> Result<DeviceConfig> {
        let mut config = DeviceConfig::new(self.device.id.clone());
        for vlan in self.get_vlans().await? {
            config.insert_vlan(vlan);
        }
        for port in self.get_ports().await? {
            config.insert_port(port);
        }
        config.settings.insert(
            "bridge".to_string(),
            Scalar::Text(self.bridge().to_string()),
        );
        config.settings.insert(
            "vlan_filtering".to_string(),
            Scalar::Int(self.vlan_filtering.unwrap_or(-1)),
        );
        Ok(config)
    }

    async fn create_vlan(&mut self, vlan: &Vlan) -> Result<()> {
        let bridge = self.bridge().to_string();
        let section = format!("vlan{}", vlan.id);
        let mut commands = Vec::new();

        // Filtering is enabled only when the bridge exposes the flag and it
        // reads 0; a bridge without the attribute is left alone.
        if self.vlan_filtering == Some(0) {
            info!("enabling VLAN filtering on bridge {bridge}");
            commands.push(format!("uci set network.{bridge}.vlan_filtering='1'"));
        }

        commands.push(format!("uci set network.{section}=bridge-vlan"));
        commands.push(format!("uci set network.{section}.device='{bridge}'"));
        commands.push(format!("uci set network.{section}.vlan='{}'", vlan.id));
        commands.push(format!(
            "uci set network.{section}.ports={}",
            shell_quote(&format_bridge_ports(
                &vlan.untagged_ports,
                &vlan.tagged_ports
            ))
        ));
        commands.push("uci commit network".to_string());

        self.uci_batch(&commands).await?;
        self.reload_network().await?;
        if self.vlan_filtering == Some(0) {
            self.vlan_filtering = Some(1);
        }
        Ok(())
    }

    async fn delete_vlan(&mut self, vlan_id: u16) -> Result<()> {
        if vlan_id == 1 {
            return Err(ValidationError::ProtectedVlan(1).into());
        }
        let Some(section) = self.find_vlan_section(vlan_id).await? else {
            return Err(ValidationError::Document(format!(
                "VLAN {vlan_id} not found on {}",
                self.device.id
            ))
            .into());
        };
        self.uci_batch(&[
            format!("uci delete network.{section}"),
            "uci commit network".to_string(),
        ])
        .await?;
        self.reload_network().await
    }

    async fn configure_port(&mut self, port: &Port) -> Result<()> {
        let name = port.id.as_str().to_string();

        match port.enabled {
            Some(true) => {
                self.uci_batch(&[format!("ip link set {name} up")]).await?;
            }
            Some(false) => {
                self.uci_batch(&[format!("ip link set {name} down")]).await?;
            }
            None => {}
        }

        if let Some(desc) = &port.description {
            self.uci_batch(&[
                format!("uci set network.{name}.description={}", shell_quote(desc)),
                "uci commit network".to_string(),
            ])
            .await?;
        }

        if let Some(speed) = port.speed {
            let command = match speed {
                PortSpeed::Auto => format!("ethtool -s {name} autoneg on"),
                other => format!(
                    "ethtool -s {name} speed {} duplex {} autoneg off",
                    ethtool_speed(other),
                    ethtool_duplex(other)
                ),
            };
            // ethtool is absent on some builds; sysfs still reflects reality
            let out = self.execute(&format!("{command} 2>/dev/null")).await?;
            if !out.is_success() {
                warn!("{}: ethtool speed set failed: {}", self.device.id, out.output);
            }
        }
        Ok(())
    }

    async fn save_config(&mut self) -> Result<()> {
        self.uci_batch(&["uci commit".to_string()]).await
    }

    async fn get_config_file(&mut self, path: &str) -> Result<String> {
        self.exec().await?.download(path).await
    }

    /// Whole-file replace. An empty or whitespace-only body is rejected
    /// before any transfer: a blank network config bricks the device.
    async fn put_config_file(&mut self, path: &str, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyConfigUpload(path.to_string()).into());
        }
        self.exec().await?.upload(path, content).await?;
        self.reload_network().await
    }
}

fn ethtool_speed(speed: PortSpeed) -> &'static str {
    match speed {
        PortSpeed::TenHalf | PortSpeed::TenFull => "10",
        PortSpeed::HundredHalf | PortSpeed::HundredFull => "100",
        PortSpeed::GigFull => "1000",
        PortSpeed::TenGig => "10000",
        PortSpeed::Auto => "0",
    }
}

fn ethtool_duplex(speed: PortSpeed) -> &'static str {
    match speed {
        PortSpeed::TenHalf | PortSpeed::HundredHalf => "half",
        _ => "full",
    }
}

fn parse_sysfs_speed(raw: &str) -> Option<PortSpeed> {
    match raw.parse::<i64>() {
        Ok(n) if n >= 10000 => Some(PortSpeed::TenGig),
        Ok(n) if n >= 1000 => Some(PortSpeed::GigFull),
        Ok(n) if n >= 100 => Some(PortSpeed::HundredFull),
        Ok(n) if n > 0 => Some(PortSpeed::TenFull),
        _ => None,
    }
}

/// Render a bridge-vlan ports value: tagged ports get `:t`, untagged ports
/// get `:u*` (member plus PVID).
pub fn format_bridge_ports(untagged: &BTreeSet<PortId>, tagged: &BTreeSet<PortId>) -> String {
    let mut specs: Vec<String> = Vec::new();
    for port in tagged {
        specs.push(format!("{port}:t"));
    }
    for port in untagged {
        specs.push(format!("{port}:u*"));
    }
    specs.join(" ")
}

/// Parse VLAN sections out of `uci show network` output.
///
/// Handles both DSA `bridge-vlan` sections (`ports='lan1:t lan2'`) and
/// legacy `switch_vlan` sections (`ports='0 1t 2t 3'`), where the bare CPU
/// port number stays tagged toward the CPU.
pub fn parse_uci_vlans(output: &str) -> Vec<Vlan> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Section {
        kind: String,
        vlan: Option<u16>,
        ports: Option<String>,
        name: Option<String>,
    }

    let mut sections: BTreeMap<String, Section> = BTreeMap::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(caps) = SECTION_DECL.captures(line) {
            let entry = sections.entry(caps[1].to_string()).or_default();
            entry.kind = caps[2].to_string();
            continue;
        }
        if let Some(caps) = UCI_LINE.captures(line) {
            let entry = sections.entry(caps[1].to_string()).or_default();
            match &caps[2] {
                "vlan" => entry.vlan = caps[3].parse().ok(),
                "ports" => entry.ports = Some(caps[3].to_string()),
                "name" | "description" => entry.name = Some(caps[3].to_string()),
                _ => {}
            }
        }
    }

    let mut vlans = Vec::new();
    for (section_name, section) in sections {
        if section.kind != "bridge-vlan" && section.kind != "switch_vlan" {
            continue;
        }
        let Some(id) = section.vlan else { continue };
        let mut vlan = Vlan::new(id);
        vlan.name = section.name.or(Some(section_name));

        if let Some(ports) = section.ports {
            for spec in ports.split_whitespace() {
                if section.kind == "bridge-vlan" {
                    // lan1:t tagged, lan1:u* / lan1 untagged
                    match spec.split_once(':') {
                        Some((port, flags)) if flags.contains('t') => {
                            vlan.tagged_ports.insert(PortId::new(port));
                        }
                        Some((port, _)) => {
                            vlan.untagged_ports.insert(PortId::new(port));
                        }
                        None => {
                            vlan.untagged_ports.insert(PortId::new(spec));
                        }
                    }
                } else {
                    // swconfig numbers: trailing 't' marks tagged (CPU port included)
                    if let Some(port) = spec.strip_suffix('t') {
                        vlan.tagged_ports.insert(PortId::new(port));
                    } else {
                        vlan.untagged_ports.insert(PortId::new(spec));
                    }
                }
            }
        }
        vlans.push(vlan);
    }
    vlans
}

#[cfg(test)]
mod tests {
    use super::*;

    const UCI_SHOW: &str = "\
network.loopback=interface
network.loopback.device='lo'
network.vlan100=bridge-vlan
network.vlan100.device='br-lan'
network.vlan100.vlan='100'
network.vlan100.ports='lan1:t lan2:u* lan3'
network.@switch_vlan[0]=switch_vlan
network.@switch_vlan[0].vlan='254'
network.@switch_vlan[0].ports='0t 1 2t'
";

    #[test]
    fn parses_bridge_vlan_sections() {
        let vlans = parse_uci_vlans(UCI_SHOW);
        assert_eq!(vlans.len(), 2);

        let v100 = vlans.iter().find(|v| v.id == 100).unwrap();
        assert!(v100.tagged_ports.contains(&PortId::new("lan1")));
        assert!(v100.untagged_ports.contains(&PortId::new("lan2")));
        assert!(v100.untagged_ports.contains(&PortId::new("lan3")));
    }

    #[test]
    fn parses_switch_vlan_with_cpu_port() {
        let vlans = parse_uci_vlans(UCI_SHOW);
        let v254 = vlans.iter().find(|v| v.id == 254).unwrap();
        // CPU port 0 keeps its tagged marking
        assert!(v254.tagged_ports.contains(&PortId::new("0")));
        assert!(v254.tagged_ports.contains(&PortId::new("2")));
        assert!(v254.untagged_ports.contains(&PortId::new("1")));
    }

    #[test]
    fn bridge_ports_rendering() {
        let untagged: BTreeSet<PortId> = [PortId::new("lan2")].into_iter().collect();
        let tagged: BTreeSet<PortId> = [PortId::new("lan1")].into_iter().collect();
        assert_eq!(format_bridge_ports(&untagged, &tagged), "lan1:t lan2:u*");
    }

    #[test]
    fn sysfs_speed_mapping() {
        assert_eq!(parse_sysfs_speed("1000"), Some(PortSpeed::GigFull));
        assert_eq!(parse_sysfs_speed("100"), Some(PortSpeed::HundredFull));
        assert_eq!(parse_sysfs_speed("10000"), Some(PortSpeed::TenGig));
        assert_eq!(parse_sysfs_speed("-1"), None);
        assert_eq!(parse_sysfs_speed(""), None);
    }
}
