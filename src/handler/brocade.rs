//! Brocade FastIron handler (Telnet).
//!
//! Command reference (FCX624-E, firmware 08.0.30):
//!
//! ```text
//! show vlan                  VLAN blocks with port membership
//! show interfaces brief      port status table
//! skip-page-display          disable --More-- pagination
//! configure terminal / end   config mode
//! write memory               persist running config
//! ```
//!
//! Port naming is `unit/module/port`; `show vlan` abbreviates ports to bare
//! numbers under a `(U1/M2)` module prefix that has to be folded back in.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result, TransportError};
use crate::handler::{require_nonempty, CommandOutput, DeviceHandler};
use crate::inventory::Device;
use crate::model::{DeviceStatus, LinkState, Port, PortId, PortSpeed, Vlan};
use crate::platform::{brocade_platform, VendorPlatform};
use crate::transport::telnet::TelnetSession;
use crate::transport::Backoff;

static VLAN_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PORT-VLAN\s+(\d+)(?:,\s*Name\s+(\S+))?").unwrap());
static MODULE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(U(\d+)/M(\d+)\)").unwrap());
static PORT_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+/\d+/\d+)\s+(.*)$").unwrap());
static CONFIG_BLOCKED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)in use by(?: session)?\s+#?(\d+)").unwrap());

/// Brocade FastIron device handler over Telnet.
pub struct BrocadeHandler {
    device: Device,
    platform: VendorPlatform,
    session: Option<TelnetSession>,
}

impl BrocadeHandler {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            platform: brocade_platform(),
            session: None,
        }
    }

    async fn session(&mut self) -> Result<&mut TelnetSession> {
        if self.session.is_none() {
            self.connect().await?;
        }
        Ok(self.session.as_mut().expect("connected above"))
    }

    fn classify(&self, command: &str, output: String, elapsed: Duration) -> CommandOutput {
        match self.platform.detect_failure(&output) {
            Some(line) => CommandOutput::failed(command, output, line, elapsed),
            None => CommandOutput::ok(command, output, elapsed),
        }
    }

}

#[async_trait]
impl DeviceHandler for BrocadeHandler {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        info!("connecting to Brocade {} at {}", self.device.id, self.device.host);

        let host = self.device.host.clone();
        let port = self.device.port;
        let timeout = self.device.timeout();
        let mut session = Backoff::default()
            .retry("telnet connect", || {
                let host = host.clone();
                async move {
                    match TelnetSession::connect(&host, port, timeout).await {
                        Ok(s) => Ok(s),
                        Err(crate::error::Error::Transport(e)) => Err(e),
                        Err(other) => {
                            // non-transport failures do not retry
                            Err(TransportError::Io(std::io::Error::other(other.to_string())))
                        }
                    }
                }
            })
            .await?;

        if self.device.enable_password_required {
            session.enable(&self.device.password()).await?;
        }

        // Pagination off before anything else; a paged read deadlocks batches.
        for command in &self.platform.on_open_commands {
            session.command(command, Duration::from_secs(5)).await?;
        }

        self.session = Some(session);
        info!("connected to {}", self.device.id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            let _ = session.close().await;
        }
        debug!("disconnected from {}", self.device.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn check_health(&mut self) -> Result<DeviceStatus> {
        match self.execute("show version").await {
            Ok(out) if out.is_success() => {
                let mut uptime = None;
                let mut firmware = None;
                for line in out.output.lines() {
                    let lower = line.to_lowercase();
                    if lower.contains("uptime") {
                        uptime = Some(line.trim().to_string());
                    }
                    if line.contains("SW:") || lower.contains("software") {
                        firmware = Some(line.trim().to_string());
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
        let output = match self.session().await?.command(command, timeout).await {
            Ok(out) => out,
            Err(e) => {
                // a dead telnet socket poisons the whole session
                self.session = None;
                return Err(e);
            }
        };
        Ok(self.classify(command, output, start.elapsed()))
    }

    /// Write the whole batch at once and wait for the privileged prompt;
    /// per-command attribution comes from the command echoes in the output.
    async fn execute_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        for command in commands {
            require_nonempty(command)?;
        }
        if commands.is_empty() || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let timeout = self.device.timeout().max(Duration::from_secs(300));
        let start = Instant::now();
        let raw = match self.session().await?.batch(commands, timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                self.session = None;
                return Err(e);
            }
        };
        let elapsed = start.elapsed();

        let mut results = Vec::with_capacity(commands.len());
        for (command, chunk) in split_batch_output(commands, &raw) {
            let out = self.classify(&command, chunk, elapsed);
            let failed = !out.is_success();
            results.push(out);
            if failed && stop_on_error {
                break;
            }
        }
        Ok(results)
    }

    /// Wrap the batch in `configure terminal` / `end` so the single write
    /// always returns the session to the privileged prompt the batch reader
    /// waits for.
    async fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let enter = self.platform.config_enter.expect("brocade has config mode");
        let exit = self.platform.config_exit.expect("brocade has config mode");
        let mut wrapped = Vec::with_capacity(commands.len() + 2);
        wrapped.push(enter.to_string());
        wrapped.extend(commands.iter().cloned());
        wrapped.push(exit.to_string());

        let mut results = self.execute_batch(&wrapped, stop_on_error, cancel).await?;

        // a stale console holding config mode blocks the whole batch;
        // kill it and run the batch once more
        if let Some(first) = results.first() {
            if let Some(caps) = CONFIG_BLOCKED.captures(&first.output) {
                let console = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "0".to_string());
                warn!(
                    "{}: config mode held by stale console {console}, killing it",
                    self.device.id
                );
                self.execute(&format!("kill console {console}")).await?;
                results = self.execute_batch(&wrapped, stop_on_error, cancel).await?;
            }
        }

        // strip the wrapper commands so results align with the input
        if results.first().map(|r| r.command == enter).unwrap_or(false) {
            results.remove(0);
        }
        if results.last().map(|r| r.command == exit).unwrap_or(false) {
            results.pop();
        }
        Ok(results)
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
        Ok(parse_vlans(&out.output))
    }

    async fn get_ports(&mut self) -> Result<Vec<Port>> {
        let out = self.execute("show interfaces brief").await?;
        if !out.is_success() {
            return Err(ProtocolError::Parse {
                context: "show interfaces brief".into(),
                detail: out.failure.unwrap_or_default(),
            }
            .into());
        }
        Ok(parse_interfaces_brief(&out.output))
    }

    async fn create_vlan(&mut self, vlan: &Vlan) -> Result<()> {
        let name = vlan
            .name
            .clone()
            .unwrap_or_else(|| format!("VLAN{}", vlan.id));
        let mut commands = vec![format!("vlan {} name {} by port", vlan.id, name)];

        let untagged: Vec<PortId> = vlan.untagged_ports.iter().cloned().collect();
        for spec in group_port_ranges(&untagged) {
            commands.push(format!("untagged ethe {spec}"));
        }
        let tagged: Vec<PortId> = vlan.tagged_ports.iter().cloned().collect();
        for spec in group_port_ranges(&tagged) {
            commands.push(format!("tagged ethe {spec}"));
        }
        if vlan.ip_interface.is_some() {
            commands.push(format!("router-interface ve {}", vlan.id));
        }
        commands.push("exit".to_string());

        run_config(self, &commands).await
    }

    async fn delete_vlan(&mut self, vlan_id: u16) -> Result<()> {
        run_config(self, &[format!("no vlan {vlan_id}")]).await
    }

    async fn configure_port(&mut self, port: &Port) -> Result<()> {
        let mut commands = vec![format!("interface ethe {}", port.id)];
        match port.enabled {
            Some(true) => commands.push("enable".to_string()),
            Some(false) => commands.push("disable".to_string()),
            None => {}
        }
        if let Some(desc) = &port.description {
            commands.push(format!("port-name {desc}"));
        }
        if let Some(speed) = port.speed {
            commands.push(format!("speed-duplex {}", speed_duplex(speed)));
        }
        commands.push("exit".to_string());

        run_config(self, &commands).await
    }

    async fn save_config(&mut self) -> Result<()> {
        let out = self.execute("write memory").await?;
        if let Some(failure) = out.failure {
            return Err(crate::error::VendorReject {
                device_id: self.device.id.clone(),
                command: "write memory".into(),
                pattern: failure,
                output: out.output,
                trail: Vec::new(),
            }
            .into());
        }
        Ok(())
    }
}

async fn run_config(handler: &mut BrocadeHandler, commands: &[String]) -> Result<()> {
    let cancel = CancellationToken::new();
    let results = handler
        .execute_config_batch(commands, true, &cancel)
        .await?;
    if let Some(failed) = results.iter().find(|r| !r.is_success()) {
        return Err(crate::error::VendorReject {
            device_id: handler.device.id.clone(),
            command: failed.command.clone(),
            pattern: failed.failure.clone().unwrap_or_default(),
            output: failed.output.clone(),
            trail: Vec::new(),
        }
        .into());
    }
    Ok(())
}

fn speed_duplex(speed: PortSpeed) -> &'static str {
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

/// Parse `show vlan` blocks.
///
/// ```text
/// PORT-VLAN 254, Name Management, Priority level0, Spanning tree Off
///  Untagged Ports: (U1/M1)   1   2   3   4
///    Tagged Ports: (U1/M2)   1   2
/// ```
pub fn parse_vlans(output: &str) -> Vec<Vlan> {
    let mut vlans: Vec<Vlan> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = VLAN_HEADER.captures(line.trim_start()) {
            let id: u16 = caps[1].parse().unwrap_or(0);
            let mut vlan = Vlan::new(id);
            vlan.name = caps.get(2).map(|m| m.as_str().to_string());
            vlans.push(vlan);
            continue;
        }

        let Some(vlan) = vlans.last_mut() else { continue };

        if let Some(rest) = line.split("Untagged Ports:").nth(1) {
            for port in parse_port_line(rest) {
                vlan.untagged_ports.insert(port);
            }
        } else if let Some(rest) = line.split("Tagged Ports:").nth(1) {
            for port in parse_port_line(rest) {
                vlan.tagged_ports.insert(port);
            }
        }
    }

    vlans
}

/// Parse one membership line: a `(U1/M2)` prefix followed by bare port
/// numbers, possibly with `N to M` ranges.
fn parse_port_line(text: &str) -> Vec<PortId> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    let (unit, module) = match MODULE_PREFIX.captures(text) {
        Some(caps) => (
            caps[1].parse::<u16>().unwrap_or(1),
            caps[2].parse::<u16>().unwrap_or(1),
        ),
        None => (1, 1),
    };
    let stripped = MODULE_PREFIX.replace_all(text, " ");

    let tokens: Vec<&str> = stripped.split_whitespace().collect();
    let mut ports = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if let Ok(start) = tokens[i].parse::<u16>() {
            if tokens.get(i + 1) == Some(&"to") {
                if let Some(end) = tokens.get(i + 2).and_then(|t| t.parse::<u16>().ok()) {
                    for n in start..=end {
                        ports.push(PortId::new(format!("{unit}/{module}/{n}")));
                    }
                    i += 3;
                    continue;
                }
            }
            ports.push(PortId::new(format!("{unit}/{module}/{start}")));
        }
        i += 1;
    }
    ports
}

/// Parse `show interfaces brief`.
///
/// ```text
/// Port       Link    State   Dupl Speed Trunk Tag Pvid Pri MAC             Name
/// 1/1/1      Down    None    None None  None  No  254  0   748e.f87d.cf80
/// 1/2/2      Up      Forward Full 10G   None  Yes N/A  0   748e.f87d.cf80
/// ```
pub fn parse_interfaces_brief(output: &str) -> Vec<Port> {
    let mut ports = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        let Some(caps) = PORT_ROW.captures(line) else { continue };
        let columns: Vec<&str> = caps[2].split_whitespace().collect();
        if columns.len() < 7 {
            continue;
        }

        let mut port = Port::new(&caps[1]);
        let link = columns[0].to_lowercase();
        port.enabled = Some(link != "disable" && link != "disabled");
        port.link_state = Some(match link.as_str() {
            "up" => LinkState::Up,
            "down" | "disable" | "disabled" => LinkState::Down,
            _ => LinkState::Unknown,
        });
        port.speed = parse_speed(columns[3]);
        // Pvid column; N/A on pure trunk ports
        port.pvid = columns.get(6).and_then(|v| v.parse().ok());
        ports.push(port);
    }

    ports
}

fn parse_speed(column: &str) -> Option<PortSpeed> {
    match column {
        "10G" => Some(PortSpeed::TenGig),
        "1G" | "1000M" => Some(PortSpeed::GigFull),
        "100M" => Some(PortSpeed::HundredFull),
        "10M" => Some(PortSpeed::TenFull),
        _ => None,
    }
}

/// Collapse sorted ports into `A to B` range specs, one spec per module.
///
/// Brocade rejects ranges spanning modules, and one ranged command is an
/// order of magnitude faster than per-port commands.
pub fn group_port_ranges(ports: &[PortId]) -> Vec<String> {
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    struct Parsed(u16, u16, u16);

    let mut parsed: Vec<Parsed> = ports
        .iter()
        .filter_map(|p| {
            let mut it = p.as_str().split('/');
            Some(Parsed(
                it.next()?.parse().ok()?,
                it.next()?.parse().ok()?,
                it.next()?.parse().ok()?,
            ))
        })
        .collect();
    parsed.sort();

    let mut specs: Vec<String> = Vec::new();
    let mut i = 0;
    while i < parsed.len() {
        let Parsed(unit, module, start) = parsed[i];
        let mut end = start;
        let mut j = i + 1;
        while j < parsed.len() {
            let Parsed(u, m, p) = parsed[j];
            if u == unit && m == module && p == end + 1 {
                end = p;
                j += 1;
            } else {
                break;
            }
        }
        if start == end {
            specs.push(format!("{unit}/{module}/{start}"));
        } else {
            specs.push(format!("{unit}/{module}/{start} to {unit}/{module}/{end}"));
        }
        i = j;
    }
    specs
}

/// Attribute combined batch output back to individual commands by their
/// echoes.
fn split_batch_output(commands: &[String], raw: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut echo_positions: Vec<Option<usize>> = Vec::with_capacity(commands.len());
    let mut cursor = 0;

    for command in commands {
        let found = lines[cursor.min(lines.len())..]
            .iter()
            .position(|l| l.contains(command.as_str()))
            .map(|offset| cursor + offset);
        if let Some(pos) = found {
            cursor = pos + 1;
        }
        echo_positions.push(found);
    }

    let mut out = Vec::with_capacity(commands.len());
    for (i, command) in commands.iter().enumerate() {
        let chunk = match echo_positions[i] {
            Some(start) => {
                let end = echo_positions[i + 1..]
                    .iter()
                    .flatten()
                    .next()
                    .copied()
                    .unwrap_or(lines.len());
                lines[start + 1..end].join("\n")
            }
            None => String::new(),
        };
        out.push((command.clone(), chunk.trim().to_string()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VLAN: &str = "\
Total PORT-VLAN entries: 2
Maximum PORT-VLAN entries: 64

Legend: [Stk=Stack-Id, S=Slot]

PORT-VLAN 1, Name DEFAULT-VLAN, Priority level0, Spanning tree Off
 Untagged Ports: (U1/M1)   1   2   3   4   5   6   7   8
 Untagged Ports: (U1/M1)   9  10  11  12
   Tagged Ports: None
   Uplink Ports: None
 DualMode Ports: None

PORT-VLAN 254, Name Management, Priority level0, Spanning tree Off
 Untagged Ports: (U1/M1)  17 to 20
   Tagged Ports: (U1/M2)   1   2
   Uplink Ports: None
";

    #[test]
    fn parses_vlan_blocks_with_module_prefixes() {
        let vlans = parse_vlans(SHOW_VLAN);
        assert_eq!(vlans.len(), 2);

        let default = &vlans[0];
        assert_eq!(default.id, 1);
        assert_eq!(default.name.as_deref(), Some("DEFAULT-VLAN"));
        assert_eq!(default.untagged_ports.len(), 12);
        assert!(default.untagged_ports.contains(&PortId::new("1/1/12")));
        assert!(default.tagged_ports.is_empty());

        let mgmt = &vlans[1];
        assert_eq!(mgmt.id, 254);
        // "17 to 20" expands
        assert_eq!(mgmt.untagged_ports.len(), 4);
        assert!(mgmt.untagged_ports.contains(&PortId::new("1/1/18")));
        // module 2 prefix folds into the port id
        assert!(mgmt.tagged_ports.contains(&PortId::new("1/2/1")));
        assert!(mgmt.tagged_ports.contains(&PortId::new("1/2/2")));
    }

    const SHOW_INT_BRIEF: &str = "\
Port       Link    State   Dupl Speed Trunk Tag Pvid Pri MAC             Name
1/1/1      Down    None    None None  None  No  254  0   748e.f87d.cf80
1/1/2      Up      Forward Full 1G    None  No  1    0   748e.f87d.cf81
1/2/2      Up      Forward Full 10G   None  Yes N/A  0   748e.f87d.cf99  uplink
";

    #[test]
    fn parses_interface_table() {
        let ports = parse_interfaces_brief(SHOW_INT_BRIEF);
        assert_eq!(ports.len(), 3);

        assert_eq!(ports[0].id, PortId::new("1/1/1"));
        assert_eq!(ports[0].link_state, Some(LinkState::Down));
        assert_eq!(ports[0].pvid, Some(254));
        assert_eq!(ports[0].speed, None);

        assert_eq!(ports[1].speed, Some(PortSpeed::GigFull));
        assert_eq!(ports[1].pvid, Some(1));

        assert_eq!(ports[2].speed, Some(PortSpeed::TenGig));
        assert_eq!(ports[2].pvid, None);
        assert_eq!(ports[2].link_state, Some(LinkState::Up));
    }

    #[test]
    fn groups_contiguous_ports_per_module() {
        let ports: Vec<PortId> = ["1/1/5", "1/1/6", "1/1/7", "1/1/8", "1/2/1", "1/1/10"]
            .iter()
            .map(|p| PortId::new(*p))
            .collect();
        let specs = group_port_ranges(&ports);
        assert_eq!(specs, vec!["1/1/5 to 1/1/8", "1/1/10", "1/2/1"]);
    }

    #[test]
    fn single_port_has_no_range_syntax() {
        let specs = group_port_ranges(&[PortId::new("1/1/3")]);
        assert_eq!(specs, vec!["1/1/3"]);
    }

    #[test]
    fn batch_output_attribution_follows_echoes() {
        let commands = vec![
            "vlan 100 name Servers by port".to_string(),
            "untagged ethe 1/1/5 to 1/1/8".to_string(),
            "exit".to_string(),
        ];
        let raw = "\
FCX624 Router(config)#vlan 100 name Servers by port
FCX624 Router(config-vlan-100)#untagged ethe 1/1/5 to 1/1/8
Added untagged port(s) ethe 1/1/5 to 1/1/8 to port-vlan 100.
FCX624 Router(config-vlan-100)#exit
FCX624 Router(config)#";
        let chunks = split_batch_output(&commands, raw);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].1.contains("Added untagged"));
        assert!(chunks[0].1.is_empty());
    }

    #[test]
    fn stale_console_pattern_extracts_session() {
        let caps = CONFIG_BLOCKED
            .captures("Configuration mode is in use by session #2")
            .unwrap();
        assert_eq!(&caps[1], "2");
    }
}
