//! Zyxel GS1900 handler.
//!
//! The CLI (SSH) is fast and reliable but read-only. Writes go through the
//! web CGI when the device is configured with the `zyxel-https` transport;
//! on the plain `zyxel-cli` transport every write is rejected before the
//! wire is touched.
//!
//! CLI reference (GS1900-24HP):
//!
//! ```text
//! show vlan                    VLAN table with port lists
//! show interfaces <range>      interface status blocks
//! show version                 firmware info
//! ```

use std::collections::BTreeSet;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ProtocolError, Result, TransportError, ValidationError};
use crate::handler::{require_nonempty, CommandOutput, DeviceHandler};
use crate::inventory::Device;
use crate::model::{DeviceStatus, LinkState, Port, PortId, PortSpeed, Vlan};
use crate::platform::{zyxel_platform, VendorPlatform};
use crate::transport::https::{cmd, membership, ZyxelWeb};
use crate::transport::shell::{ShellConfig, SshShell};
use crate::transport::Backoff;

static LAG_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^lag(\d+)(?:-(\d+))?$").unwrap());
static IFACE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GigabitEthernet(\d+)\s+is\s+(\w+)").unwrap());
static IFACE_SPEED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+[MG]?)-speed").unwrap());

/// Port lists parsed from the VLAN table, LAGs bucketed separately.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PortList {
    pub ports: BTreeSet<PortId>,
    pub lags: BTreeSet<PortId>,
}

/// Zyxel GS1900 handler: CLI reads, optional web writes.
pub struct ZyxelHandler {
    device: Device,
    platform: VendorPlatform,
    shell: Option<SshShell>,
    web: Option<ZyxelWeb>,
}

impl ZyxelHandler {
    /// CLI-only handler; writes are rejected.
    pub fn cli(device: Device) -> Self {
        Self {
            device,
            platform: zyxel_platform(),
            shell: None,
            web: None,
        }
    }

    /// Hybrid handler: CLI reads, web writes.
    pub fn hybrid(device: Device) -> Result<Self> {
        let web = ZyxelWeb::new(
            &device.host,
            &device.username,
            &device.password(),
            device.verify_tls,
            device.timeout(),
        )?;
        Ok(Self {
            device,
            platform: zyxel_platform(),
            shell: None,
            web: Some(web),
        })
    }

    fn reject_write(&self, operation: &str) -> crate::error::Error {
        ValidationError::UnsupportedOnTransport {
            operation: operation.to_string(),
            transport: self.device.kind.clone(),
        }
        .into()
    }

    async fn shell(&mut self) -> Result<&mut SshShell> {
        if self.shell.is_none() {
            self.connect().await?;
        }
        Ok(self.shell.as_mut().expect("connected above"))
    }

    fn web(&mut self) -> Result<&mut ZyxelWeb> {
        self.web
            .as_mut()
            .ok_or_else(|| {
                ValidationError::UnsupportedOnTransport {
                    operation: "write".into(),
                    transport: "zyxel-cli".into(),
                }
                .into()
            })
    }

    /// 0-based form index for a port; LAGs sit after the physical ports.
    fn port_form_index(port: &PortId) -> Result<usize> {
        if let Some(caps) = LAG_RANGE.captures(port.as_str()) {
            let lag: usize = caps[1].parse().map_err(|_| bad_port(port))?;
            return Ok(25 + lag);
        }
        let n: usize = port.as_str().parse().map_err(|_| bad_port(port))?;
        if !(1..=26).contains(&n) {
            return Err(bad_port(port));
        }
        Ok(n - 1)
    }

    async fn set_membership(&mut self, vlan_id: u16, port: &PortId, value: u8) -> Result<()> {
        let idx = Self::port_form_index(port)?;
        let web = self.web()?;

        let page = web
            .fetch_page(cmd::VLAN_MEMBERSHIP, &[("vid", vlan_id.to_string())])
            .await?;
        let xssid = crate::transport::https::extract_xssid(&page)?;
        let current = parse_membership_page(&page);

        let mut fields = vec![
            ("XSSID".to_string(), xssid),
            ("cmd".to_string(), cmd::VLAN_MEMBERSHIP_SUBMIT.to_string()),
            ("vid".to_string(), vlan_id.to_string()),
        ];
        // 26 physical ports + 8 LAGs; untouched ports keep their current value
        for i in 0..34usize {
            let value = if i == idx {
                value.to_string()
            } else {
                current.get(&i).cloned().unwrap_or_else(|| "0".to_string())
            };
            fields.push((format!("vlanMode_{i}"), value.clone()));
            fields.push((format!("membership_{i}"), value));
        }

        web.post_form(&fields).await?;
        Ok(())
    }
}

fn bad_port(port: &PortId) -> crate::error::Error {
    ValidationError::InvalidPort {
        port: port.as_str().to_string(),
        device_type: "zyxel".to_string(),
    }
    .into()
}

#[async_trait]
impl DeviceHandler for ZyxelHandler {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn connect(&mut self) -> Result<()> {
        if self.shell.is_some() {
            return Ok(());
        }
        info!("connecting to Zyxel {} at {}", self.device.id, self.device.host);

        let config = ShellConfig {
            host: self.device.host.clone(),
            port: 22,
            username: self.device.username.clone(),
            password: self.device.password(),
            timeout: self.device.timeout(),
            legacy_algorithms: true,
        };
        let shell = Backoff::default()
            .retry("ssh shell connect", || {
                let config = config.clone();
                async move {
                    match SshShell::connect(config).await {
                        Ok(s) => Ok(s),
                        Err(crate::error::Error::Transport(e)) => Err(e),
                        Err(other) => Err(TransportError::Io(std::io::Error::other(
                            other.to_string(),
                        ))),
                    }
                }
            })
            .await?;
        self.shell = Some(shell);
        info!("connected to {} via CLI", self.device.id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(shell) = self.shell.take() {
            let _ = shell.close().await;
        }
        if let Some(web) = self.web.as_mut() {
            web.forget_session();
        }
        debug!("disconnected from {}", self.device.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shell.is_some()
    }

    async fn check_health(&mut self) -> Result<DeviceStatus> {
        match self.execute("show version").await {
            Ok(out) if out.is_success() => {
                let mut uptime = None;
                let mut firmware = None;
                for line in out.output.lines() {
                    if line.contains("System Up Time") {
                        uptime = line.split_once(':').map(|(_, v)| v.trim().to_string());
                    }
                    if line.contains("Firmware Version") {
                        firmware = line.split_once(':').map(|(_, v)| v.trim().to_string());
                    }
                }
                Ok(DeviceStatus {
                    reachable: true,
                    uptime,
                    firmware_version: firmware,
                    error: None,
                })
            }
            Ok(out) => Ok(DeviceStatus {
                reachable: true,
                error: out.failure,
                ..DeviceStatus::default()
            }),
            Err(e) => Ok(DeviceStatus {
                reachable: false,
                error: Some(e.to_string()),
                ..DeviceStatus::default()
            }),
        }
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        require_nonempty(command)?;
        let timeout = self.device.timeout();
        let start = Instant::now();
        let output = match self.shell().await?.command(command, timeout).await {
            Ok(out) => out,
            Err(e) => {
                self.shell = None;
                return Err(e);
            }
        };
        let elapsed = start.elapsed();
        Ok(match self.platform.detect_failure(&output) {
            Some(line) => CommandOutput::failed(command, output, line, elapsed),
            None => CommandOutput::ok(command, output, elapsed),
        })
    }

    /// The CLI is read-only on this firmware: configuration batches are
    /// rejected before the wire, whatever transport variant is in use.
    async fn execute_config_batch(
        &mut self,
        _commands: &[String],
        _stop_on_error: bool,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        Err(self.reject_write("execute_config_batch"))
    }

    async fn get_vlans(&mut self) -> Result<Vec<Vlan>> {
        let out = self.execute("show vlan").await?;
        if !out.is_success() {
            return Err(ProtocolError::Parse {
                context: "show vlan".into(),
                detail: out.failure.unwrap_or_default(),
            }
            .into());
        }
        Ok(parse_vlan_table(&out.output))
    }

    async fn get_ports(&mut self) -> Result<Vec<Port>> {
        let out = self.execute("show interfaces 1-26").await?;
        if !out.is_success() {
            return Err(ProtocolError::Parse {
                context: "show interfaces".into(),
                detail: out.failure.unwrap_or_default(),
            }
            .into());
        }
        Ok(parse_interfaces(&out.output))
    }

    async fn create_vlan(&mut self, vlan: &Vlan) -> Result<()> {
        if self.web.is_none() {
            return Err(self.reject_write("create_vlan"));
        }

        let name = vlan
            .name
            .clone()
            .unwrap_or_else(|| format!("VLAN{}", vlan.id));

        let xssid = {
            let web = self.web()?;
            web.fetch_xssid(cmd::VLAN_ADD).await?
        };
        let fields = vec![
            ("XSSID".to_string(), xssid),
            ("vlanlist".to_string(), vlan.id.to_string()),
            ("vlanAction".to_string(), "0".to_string()),
            ("name".to_string(), name),
            ("cmd".to_string(), cmd::VLAN_ADD_SUBMIT.to_string()),
            ("sysSubmit".to_string(), "Apply".to_string()),
        ];
        self.web()?.post_form(&fields).await?;

        for port in vlan.tagged_ports.clone() {
            self.set_membership(vlan.id, &port, membership::TAGGED)
                .await?;
        }
        for port in vlan.untagged_ports.clone() {
            self.set_membership(vlan.id, &port, membership::UNTAGGED)
                .await?;
        }
        Ok(())
    }

    async fn delete_vlan(&mut self, vlan_id: u16) -> Result<()> {
        if self.web.is_none() {
            return Err(self.reject_write("delete_vlan"));
        }
        let xssid = {
            let web = self.web()?;
            web.fetch_xssid(cmd::VLAN_ADD).await?
        };
        let fields = vec![
            ("XSSID".to_string(), xssid),
            ("vlanlist".to_string(), vlan_id.to_string()),
            ("vlanAction".to_string(), "1".to_string()),
            ("cmd".to_string(), cmd::VLAN_DELETE_SUBMIT.to_string()),
            ("sysSubmit".to_string(), "Apply".to_string()),
        ];
        self.web()?.post_form(&fields).await?;
        Ok(())
    }

    async fn configure_port(&mut self, port: &Port) -> Result<()> {
        if self.web.is_none() {
            return Err(self.reject_write("configure_port"));
        }
        // validate the port shape before any wire work
        let _ = Self::port_form_index(&port.id)?;

        let xssid = {
            let web = self.web()?;
            web.fetch_xssid(cmd::PORT_SETTINGS).await?
        };
        let mut fields = vec![
            ("XSSID".to_string(), xssid),
            ("cmd".to_string(), cmd::PORT_SETTINGS_SUBMIT.to_string()),
            ("port".to_string(), port.id.to_string()),
        ];
        if let Some(enabled) = port.enabled {
            let state = if enabled { "1" } else { "0" };
            fields.push(("state".to_string(), state.to_string()));
        }
        if let Some(desc) = &port.description {
            fields.push(("name".to_string(), desc.clone()));
        }
        if let Some(speed) = port.speed {
            fields.push(("speed".to_string(), web_speed(speed).to_string()));
        }
        self.web()?.post_form(&fields).await?;
        Ok(())
    }

    async fn set_vlan_membership(
        &mut self,
        vlan_id: u16,
        port: &PortId,
        value: crate::handler::VlanMembership,
    ) -> Result<()> {
        if self.web.is_none() {
            return Err(self.reject_write("set_vlan_membership"));
        }
        let code = match value {
            crate::handler::VlanMembership::Excluded => membership::EXCLUDED,
            crate::handler::VlanMembership::Tagged => membership::TAGGED,
            crate::handler::VlanMembership::Untagged => membership::UNTAGGED,
        };
        self.set_membership(vlan_id, port, code).await
    }

    async fn save_config(&mut self) -> Result<()> {
        // The web interface persists each applied form itself.
        Ok(())
    }
}

fn web_speed(speed: PortSpeed) -> &'static str {
    match speed {
        PortSpeed::Auto => "auto",
        PortSpeed::TenHalf => "10h",
        PortSpeed::TenFull => "10f",
        PortSpeed::HundredHalf => "100h",
        PortSpeed::HundredFull => "100f",
        PortSpeed::GigFull => "1000f",
        PortSpeed::TenGig => "10000f",
    }
}

/// Parse the `show vlan` table.
///
/// ```text
///   VID  |     VLAN Name    |        Untagged Ports        |        Tagged Ports          |  Type
/// -------+------------------+------------------------------+------------------------------+---------
///      1 |          default |                  1-26,lag1-8 |                          --- | Default
///    254 |   Management0254 |                            7 |                        25-26 | Static
/// ```
pub fn parse_vlan_table(output: &str) -> Vec<Vlan> {
    let mut vlans = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if !line.contains('|') || line.starts_with("---") || line.contains("VID") {
            continue;
        }
        let columns: Vec<&str> = line.split('|').map(str::trim).collect();
        if columns.len() < 4 {
            continue;
        }
        let Ok(id) = columns[0].parse::<u16>() else { continue };

        let untagged = parse_port_list(columns[2]);
        let tagged = parse_port_list(columns[3]);

        let mut vlan = Vlan::new(id);
        vlan.name = if columns[1].is_empty() {
            None
        } else {
            Some(columns[1].to_string())
        };
        vlan.untagged_ports = untagged.ports;
        vlan.tagged_ports = tagged.ports;
        vlans.push(vlan);
    }

    vlans
}

/// Parse `1-4,7,10-12,lag1-2` notation. `---` means empty; LAG entries land
/// in their own bucket.
pub fn parse_port_list(text: &str) -> PortList {
    let mut out = PortList::default();
    let text = text.trim();
    if text.is_empty() || text == "---" {
        return out;
    }

    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some(caps) = LAG_RANGE.captures(part) {
            let start: u16 = caps[1].parse().unwrap_or(0);
            let end: u16 = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(start);
            for n in start..=end {
                out.lags.insert(PortId::new(format!("lag{n}")));
            }
            continue;
        }

        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (a.parse::<u16>(), b.parse::<u16>()) {
                for n in start..=end {
                    out.ports.insert(PortId::new(n.to_string()));
                }
                continue;
            }
        }

        if part.chars().all(|c| c.is_ascii_digit()) {
            out.ports.insert(PortId::new(part));
        }
    }

    out
}

/// Format a port set back into compact `1-3,5,7-8` notation.
pub fn format_port_list(ports: &BTreeSet<PortId>) -> String {
    let mut nums: Vec<u16> = ports
        .iter()
        .filter_map(|p| p.as_str().parse().ok())
        .collect();
    nums.sort_unstable();

    let mut specs = Vec::new();
    let mut i = 0;
    while i < nums.len() {
        let start = nums[i];
        let mut end = start;
        while i + 1 < nums.len() && nums[i + 1] == end + 1 {
            i += 1;
            end = nums[i];
        }
        if start == end {
            specs.push(start.to_string());
        } else {
            specs.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    specs.join(",")
}

/// Parse `show interfaces <range>` blocks.
pub fn parse_interfaces(output: &str) -> Vec<Port> {
    let mut ports: Vec<Port> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = IFACE_HEADER.captures(line) {
            let mut port = Port::new(&caps[1]);
            let status = caps[2].to_lowercase();
            port.enabled = Some(status != "disabled");
            port.link_state = Some(match status.as_str() {
                "up" => LinkState::Up,
                "down" | "disabled" => LinkState::Down,
                _ => LinkState::Unknown,
            });
            ports.push(port);
            continue;
        }

        let Some(port) = ports.last_mut() else { continue };
        if let Some(caps) = IFACE_SPEED.captures(line) {
            port.speed = match &caps[1] {
                "1000M" | "1G" => Some(PortSpeed::GigFull),
                "100M" => Some(PortSpeed::HundredFull),
                "10G" | "10000M" => Some(PortSpeed::TenGig),
                "10M" => Some(PortSpeed::TenFull),
                _ => None,
            };
        }
    }

    ports
}

/// Pull the current per-port membership values out of the membership form.
fn parse_membership_page(page: &str) -> std::collections::HashMap<usize, String> {
    static MODE_FIELD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"name="vlanMode_(\d+)"\s+value="(\d+)""#).unwrap());
    static CHECKED: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"name="membership_(\d+)"[^>]*value="(\d+)"[^>]*checked"#).unwrap()
    });

    let mut values = std::collections::HashMap::new();
    for caps in MODE_FIELD.captures_iter(page) {
        if let Ok(idx) = caps[1].parse::<usize>() {
            values.insert(idx, caps[2].to_string());
        }
    }
    // checked radio buttons override the hidden fields
    for caps in CHECKED.captures_iter(page) {
        if let Ok(idx) = caps[1].parse::<usize>() {
            values.insert(idx, caps[2].to_string());
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VLAN: &str = "\
  VID  |     VLAN Name    |        Untagged Ports        |        Tagged Ports          |  Type
-------+------------------+------------------------------+------------------------------+---------
     1 |          default |                  1-26,lag1-8 |                          --- | Default
   254 |   Management0254 |                            7 |                        25-26 | Static
";

    #[test]
    fn parses_vlan_table() {
        let vlans = parse_vlan_table(SHOW_VLAN);
        assert_eq!(vlans.len(), 2);

        assert_eq!(vlans[0].id, 1);
        assert_eq!(vlans[0].name.as_deref(), Some("default"));
        assert_eq!(vlans[0].untagged_ports.len(), 26);
        assert!(vlans[0].tagged_ports.is_empty());

        assert_eq!(vlans[1].id, 254);
        assert_eq!(vlans[1].untagged_ports.len(), 1);
        assert!(vlans[1].tagged_ports.contains(&PortId::new("25")));
        assert!(vlans[1].tagged_ports.contains(&PortId::new("26")));
    }

    #[test]
    fn port_list_buckets_lags_separately() {
        let list = parse_port_list("1-4,7,10-12,lag1-2");
        assert_eq!(list.ports.len(), 8);
        assert!(list.ports.contains(&PortId::new("11")));
        assert_eq!(list.lags.len(), 2);
        assert!(list.lags.contains(&PortId::new("lag1")));
    }

    #[test]
    fn empty_marker_parses_to_nothing() {
        assert_eq!(parse_port_list("---"), PortList::default());
        assert_eq!(parse_port_list(""), PortList::default());
    }

    #[test]
    fn port_list_formatting_rebuilds_ranges() {
        let ports: BTreeSet<PortId> = ["1", "2", "3", "5", "7", "8"]
            .iter()
            .map(|p| PortId::new(*p))
            .collect();
        assert_eq!(format_port_list(&ports), "1-3,5,7-8");
    }

    const SHOW_IFACES: &str = "\
GigabitEthernet7 is up
  Hardware is Gigabit Ethernet
  Auto-duplex, Auto-speed
GigabitEthernet25 is down
  Hardware is Gigabit Ethernet
  Full-duplex, 1000M-speed
  1520 packets input, 0 input errors
";

    #[test]
    fn parses_interface_blocks() {
        let ports = parse_interfaces(SHOW_IFACES);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].id, PortId::new("7"));
        assert_eq!(ports[0].link_state, Some(LinkState::Up));
        assert_eq!(ports[1].speed, Some(PortSpeed::GigFull));
        assert_eq!(ports[1].link_state, Some(LinkState::Down));
    }

    #[test]
    fn form_index_maps_ports_and_lags() {
        assert_eq!(ZyxelHandler::port_form_index(&PortId::new("1")).unwrap(), 0);
        assert_eq!(ZyxelHandler::port_form_index(&PortId::new("26")).unwrap(), 25);
        assert_eq!(
            ZyxelHandler::port_form_index(&PortId::new("lag1")).unwrap(),
            26
        );
        assert!(ZyxelHandler::port_form_index(&PortId::new("27")).is_err());
        assert!(ZyxelHandler::port_form_index(&PortId::new("1/1/1")).is_err());
    }

    #[test]
    fn membership_page_parsing_prefers_checked_state() {
        let page = r#"
<input type="hidden" name="vlanMode_0" value="0">
<input type="hidden" name="vlanMode_1" value="2">
<input type="radio" name="membership_1" value="3" checked>
"#;
        let values = parse_membership_page(page);
        assert_eq!(values.get(&0).map(String::as_str), Some("0"));
        assert_eq!(values.get(&1).map(String::as_str), Some("3"));
    }
}
