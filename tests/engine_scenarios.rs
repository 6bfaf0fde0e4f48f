//! End-to-end engine scenarios against a scripted device.
//!
//! The mock handler interprets the Brocade-style command stream the planner
//! emits and mutates an in-memory device state, so applies are verified the
//! same way the engine verifies real hardware: re-fetch and diff. Every
//! wire write lands in a log the tests assert against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use switchcraft::audit::AuditFilter;
use switchcraft::error::{ErrorKind, Result, ValidationError};
use switchcraft::handler::{CommandOutput, DeviceHandler, HandlerRegistry};
use switchcraft::hil::HilConfig;
use switchcraft::model::{DeviceStatus, Port, PortId, Vlan};
use switchcraft::{
    ApplyOptions, AuditLog, Capabilities, ConfigEngine, DesiredState, Device, DeviceConfig,
    Inventory,
};

// ---------------------------------------------------------------------------
// Scripted mock device
// ---------------------------------------------------------------------------

struct MockState {
    config: DeviceConfig,
    wire_log: Vec<String>,
    connects: usize,
    /// command substring -> injected failure line, consumed on first match
    fail_once: HashMap<String, String>,
    /// cancel this token after N successful config commands
    cancel_after: Option<(usize, CancellationToken)>,
    applied_commands: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            config: DeviceConfig::new("lab-brocade"),
            wire_log: Vec::new(),
            connects: 0,
            fail_once: HashMap::new(),
            cancel_after: None,
            applied_commands: 0,
        }
    }
}

type SharedState = Arc<Mutex<MockState>>;

struct MockHandler {
    device: Device,
    state: SharedState,
    connected: bool,
}

enum Context {
    None,
    Vlan(u16),
    Interface,
}

fn expand_spec(spec: &str) -> Vec<PortId> {
    let tokens: Vec<&str> = spec.split_whitespace().collect();
    let mut ports = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens.get(i + 1) == Some(&"to") {
            let start = tokens[i];
            let end = tokens[i + 2];
            let (prefix, s) = start.rsplit_once('/').unwrap();
            let (_, e) = end.rsplit_once('/').unwrap();
            for n in s.parse::<u16>().unwrap()..=e.parse::<u16>().unwrap() {
                ports.push(PortId::new(format!("{prefix}/{n}")));
            }
            i += 3;
        } else {
            ports.push(PortId::new(tokens[i]));
            i += 1;
        }
    }
    ports
}

/// Interpret one config-mode command against the scripted state.
fn apply_command(
    config: &mut DeviceConfig,
    ctx: &mut Context,
    command: &str,
) -> std::result::Result<(), String> {
    if let Some(rest) = command.strip_prefix("vlan ") {
        if let Some((id, name_part)) = rest.split_once(" name ") {
            let id: u16 = id.trim().parse().map_err(|_| "Invalid input".to_string())?;
            let name = name_part
                .strip_suffix(" by port")
                .unwrap_or(name_part)
                .trim()
                .to_string();
            let vlan = config.vlans.entry(id).or_insert_with(|| Vlan::new(id));
            vlan.name = Some(name);
            *ctx = Context::Vlan(id);
            return Ok(());
        }
        let id: u16 = rest.trim().parse().map_err(|_| "Invalid input".to_string())?;
        if !config.vlans.contains_key(&id) {
            return Err(format!("Error: vlan {id} does not exist"));
        }
        *ctx = Context::Vlan(id);
        return Ok(());
    }

    if let Some(id) = command.strip_prefix("no vlan ") {
        let id: u16 = id.trim().parse().map_err(|_| "Invalid input".to_string())?;
        config.vlans.remove(&id);
        return Ok(());
    }

    if command.starts_with("interface ethe ") {
        *ctx = Context::Interface;
        return Ok(());
    }

    if command == "exit" {
        *ctx = Context::None;
        return Ok(());
    }

    match ctx {
        Context::Vlan(id) => {
            let id = *id;
            let vlan = config
                .vlans
                .get_mut(&id)
                .ok_or_else(|| "Error: no vlan context".to_string())?;
            if let Some(spec) = command.strip_prefix("no untagged ethe ") {
                for port in expand_spec(spec) {
                    vlan.untagged_ports.remove(&port);
                }
            } else if let Some(spec) = command.strip_prefix("no tagged ethe ") {
                for port in expand_spec(spec) {
                    vlan.tagged_ports.remove(&port);
                }
            } else if let Some(spec) = command.strip_prefix("untagged ethe ") {
                vlan.untagged_ports.extend(expand_spec(spec));
            } else if let Some(spec) = command.strip_prefix("tagged ethe ") {
                vlan.tagged_ports.extend(expand_spec(spec));
            }
            // anything else in vlan context is a silent no-op
            Ok(())
        }
        // interface sub-commands (no dual-mode, enable, port-name, stp)
        // have no observable effect on the modeled state
        _ => Ok(()),
    }
}

#[async_trait]
impl DeviceHandler for MockHandler {
    fn device(&self) -> &Device {
        &self.device
    }

    async fn connect(&mut self) -> Result<()> {
        self.state.lock().unwrap().connects += 1;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn check_health(&mut self) -> Result<DeviceStatus> {
        Ok(DeviceStatus {
            reachable: true,
            ..DeviceStatus::default()
        })
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.wire_log.push(command.to_string());
        Ok(CommandOutput::ok(command, "", Duration::ZERO))
    }

    async fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>> {
        if !self.connected {
            self.connect().await?;
        }
        let mut results = Vec::new();
        let mut ctx = Context::None;

        for command in commands {
            if cancel.is_cancelled() {
                break;
            }
            let mut state = self.state.lock().unwrap();
            state.wire_log.push(command.clone());

            if let Some(key) = state
                .fail_once
                .keys()
                .find(|k| command.contains(k.as_str()))
                .cloned()
            {
                let failure = state.fail_once.remove(&key).unwrap();
                results.push(CommandOutput::failed(
                    command,
                    failure.clone(),
                    failure,
                    Duration::ZERO,
                ));
                if stop_on_error {
                    return Ok(results);
                }
                continue;
            }

            match apply_command(&mut state.config, &mut ctx, command) {
                Ok(()) => {
                    state.applied_commands += 1;
                    results.push(CommandOutput::ok(command, "", Duration::ZERO));
                    if let Some((after, token)) = &state.cancel_after {
                        if state.applied_commands >= *after {
                            token.cancel();
                        }
                    }
                }
                Err(failure) => {
                    results.push(CommandOutput::failed(
                        command,
                        failure.clone(),
                        failure,
                        Duration::ZERO,
                    ));
                    if stop_on_error {
                        return Ok(results);
                    }
                }
            }
        }
        Ok(results)
    }

    async fn get_vlans(&mut self) -> Result<Vec<Vlan>> {
        if !self.connected {
            self.connect().await?;
        }
        Ok(self.state.lock().unwrap().config.vlans.values().cloned().collect())
    }

    async fn get_ports(&mut self) -> Result<Vec<Port>> {
        Ok(self.state.lock().unwrap().config.ports.values().cloned().collect())
    }

    async fn create_vlan(&mut self, vlan: &Vlan) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wire_log.push(format!("create vlan {}", vlan.id));
        state.config.insert_vlan(vlan.clone());
        Ok(())
    }

    async fn delete_vlan(&mut self, vlan_id: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if vlan_id == 1 {
            return Err(ValidationError::ProtectedVlan(1).into());
        }
        state.wire_log.push(format!("no vlan {vlan_id}"));
        state.config.vlans.remove(&vlan_id);
        Ok(())
    }

    async fn configure_port(&mut self, port: &Port) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wire_log.push(format!("configure port {}", port.id));
        state.config.insert_port(port.clone());
        Ok(())
    }

    async fn save_config(&mut self) -> Result<()> {
        self.state.lock().unwrap().wire_log.push("write memory".into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test rig
// ---------------------------------------------------------------------------

fn lab_device() -> Device {
    Device {
        id: "lab-brocade".into(),
        kind: "brocade-telnet".into(),
        host: "192.168.254.2".into(),
        port: 23,
        protocol: "telnet".into(),
        username: "admin".into(),
        password_env: "NETWORK_PASSWORD".into(),
        enable_password_required: true,
        verify_tls: false,
        timeout_secs: 30,
        capabilities: Capabilities {
            supports_batch: true,
            write_memory_required: true,
            ..Capabilities::default()
        },
    }
}

/// Engine wired to a scripted device, plus handles on its state and audit.
struct Rig {
    engine: ConfigEngine,
    state: SharedState,
    _dir: tempfile::TempDir,
}

fn rig_with(config: DeviceConfig) -> Rig {
    let state: SharedState = Arc::new(Mutex::new(MockState {
        config,
        ..MockState::default()
    }));

    let mut registry = HandlerRegistry::with_builtins();
    let shared = state.clone();
    registry.register("brocade-telnet", move |device| {
        Ok(Box::new(MockHandler {
            device,
            state: shared.clone(),
            connected: false,
        }))
    });

    let mut inventory = Inventory::default();
    inventory.insert(lab_device());

    let dir = tempfile::tempdir().unwrap();
    let audit = AuditLog::new(dir.path().join("audit.log"));
    let engine = ConfigEngine::with_registry(inventory, audit, registry);

    Rig {
        engine,
        state,
        _dir: dir,
    }
}

/// The stock lab switch: VLAN 1 holding 1/1/1-24 untagged, plus VLAN 254.
fn stock_config() -> DeviceConfig {
    let mut config = DeviceConfig::new("lab-brocade");
    config.insert_vlan(
        Vlan::new(1)
            .with_name("DEFAULT-VLAN")
            .with_untagged((1..=24).map(|n| PortId::new(format!("1/1/{n}")))),
    );
    config.insert_vlan(Vlan::new(254).with_name("Management"));
    config
}

fn wire_log(rig: &Rig) -> Vec<String> {
    rig.state.lock().unwrap().wire_log.clone()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_vlan_on_brocade_emits_canonical_plan_and_converges() {
    let rig = rig_with(stock_config());
    let desired = DesiredState::from_yaml(
        r#"
device_id: lab-brocade
mode: patch
vlans:
  100:
    name: Servers
    untagged_ports: ["1/1/5-8"]
    tagged_ports: ["1/2/1"]
"#,
    )
    .unwrap();

    let report = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();
    assert!(!report.no_change);

    // canonical wire sequence: evict from VLAN 1, create VLAN 100, persist
    let log = wire_log(&rig);
    let expected_core = [
        "vlan 1",
        "no untagged ethe 1/1/5 to 1/1/8",
        "exit",
        "vlan 100 name Servers by port",
        "untagged ethe 1/1/5 to 1/1/8",
        "tagged ethe 1/2/1",
        "exit",
    ];
    let mut cursor = 0;
    for cmd in expected_core {
        let offset = log[cursor..]
            .iter()
            .position(|l| l == cmd)
            .unwrap_or_else(|| panic!("{cmd:?} missing (in order) from wire log {log:?}"));
        cursor += offset + 1;
    }
    assert!(log.contains(&"write memory".to_string()));

    // post diff is empty: re-apply is a no-op
    let writes_before = wire_log(&rig).len();
    let second = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();
    assert!(second.no_change);
    assert_eq!(wire_log(&rig).len(), writes_before);
}

#[tokio::test]
async fn dual_mode_refusal_recovers_automatically() {
    let mut config = DeviceConfig::new("lab-brocade");
    config.insert_vlan(Vlan::new(1).with_name("DEFAULT-VLAN"));
    config.insert_vlan(Vlan::new(50).with_name("Storage").with_tagged(["1/1/10"]));
    let rig = rig_with(config);

    rig.state.lock().unwrap().fail_once.insert(
        "untagged ethe 1/1/10".into(),
        "Error: Please disable dual mode".into(),
    );

    let desired = DesiredState::from_yaml(
        r#"
device_id: lab-brocade
vlans:
  50:
    name: Storage
    tagged_ports: []
  100:
    name: Servers
    untagged_ports: ["1/1/10"]
"#,
    )
    .unwrap();

    let report = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();

    // the recovery fix ran on the wire and was recorded once
    let log = wire_log(&rig);
    assert!(log.contains(&"interface ethe 1/1/10".to_string()));
    assert!(log.contains(&"no dual-mode".to_string()));
    assert_eq!(report.recovery_trail.len(), 1);
    assert_eq!(report.recovery_trail[0].action, "disable-dual-mode");
    assert!(report.recovery_trail[0].succeeded);

    // final state matches desired
    let state = rig.state.lock().unwrap();
    let v100 = &state.config.vlans[&100];
    assert!(v100.untagged_ports.contains(&PortId::new("1/1/10")));
    assert!(state.config.vlans[&50].tagged_ports.is_empty());
    drop(state);

    // the operation still reports success, with the recovery in the record
    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].recovery_attempts.len(), 1);
}

#[tokio::test]
async fn empty_config_upload_is_rejected_before_any_transfer() {
    // real OpenWrt handler: the guard fires before any connection
    let mut inventory = Inventory::default();
    inventory.insert(Device {
        id: "lab-openwrt".into(),
        kind: "openwrt-ssh".into(),
        host: "192.0.2.4".into(),
        port: 22,
        protocol: "ssh".into(),
        username: "root".into(),
        password_env: "NETWORK_PASSWORD".into(),
        enable_password_required: false,
        verify_tls: false,
        timeout_secs: 5,
        capabilities: Capabilities {
            supports_scp_config: true,
            ..Capabilities::default()
        },
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = ConfigEngine::new(inventory, AuditLog::new(dir.path().join("audit.log")));

    let err = engine
        .put_config_file(
            "lab-openwrt",
            "/etc/config/network",
            "   \n",
            ApplyOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let records = engine.audit().recent(&AuditFilter::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].operation, "put_config_file");
}

#[tokio::test]
async fn vlan_1_deletion_is_rejected_without_wire_activity() {
    let rig = rig_with(stock_config());

    // via the single-op surface
    let err = rig
        .engine
        .delete_vlan("lab-brocade", 1, ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("VLAN 1"));

    // via a desired-state document
    let desired =
        DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  1: {action: absent}\n").unwrap();
    let err = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(wire_log(&rig).is_empty());
    assert_eq!(rig.state.lock().unwrap().connects, 0);

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.success));
}

#[tokio::test]
async fn hil_violation_blocks_before_any_connection() {
    let mut rig = rig_with(stock_config());
    rig.engine.set_hil(Some(HilConfig {
        enabled: true,
        allowed_devices: ["192.168.254.9".to_string()].into_iter().collect(),
        ..HilConfig::default()
    }));

    let desired =
        DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  100: {name: Servers}\n")
            .unwrap();
    let err = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SafetyViolation);

    // no connection was opened and nothing hit the wire
    assert_eq!(rig.state.lock().unwrap().connects, 0);
    assert!(wire_log(&rig).is_empty());

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error.as_deref().unwrap().contains("safety-violation"));
}

#[tokio::test]
async fn hil_allows_the_test_vlan_on_allowed_devices() {
    let mut rig = rig_with(stock_config());
    rig.engine.set_hil(Some(HilConfig {
        enabled: true,
        allowed_devices: ["192.168.254.2".to_string()].into_iter().collect(),
        ..HilConfig::default()
    }));

    let desired =
        DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  999: {name: HIL-TEST-999}\n")
            .unwrap();
    let report = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();
    assert!(!report.no_change);
    assert!(rig.state.lock().unwrap().config.vlans.contains_key(&999));
}

#[tokio::test]
async fn cancellation_mid_batch_rolls_back_executed_commands() {
    let rig = rig_with(stock_config());
    let cancel = CancellationToken::new();

    // the scripted device cancels the caller's token after three applied
    // config commands, i.e. after VLAN 100's block completes
    rig.state.lock().unwrap().cancel_after = Some((3, cancel.clone()));

    let before = rig.state.lock().unwrap().config.clone();
    let desired = DesiredState::from_yaml(
        r#"
device_id: lab-brocade
vlans:
  100:
    name: A
    tagged_ports: ["1/2/1"]
  101:
    name: B
    tagged_ports: ["1/2/1"]
  102:
    name: C
    tagged_ports: ["1/2/1"]
"#,
    )
    .unwrap();

    let options = ApplyOptions {
        cancel: cancel.clone(),
        ..ApplyOptions::default()
    };
    let err = rig.engine.apply_config(&desired, options).await.unwrap_err();
    assert!(matches!(
        err,
        switchcraft::Error::Cancelled { rolled_back: true, .. }
    ));

    // rollback removed the partially created VLAN; post-state == pre-state
    assert_eq!(rig.state.lock().unwrap().config, before);
    let log = wire_log(&rig);
    assert!(log.contains(&"no vlan 100".to_string()));
    assert!(!log.iter().any(|l| l.contains("vlan 102")));

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error.as_deref().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn dry_run_never_writes_but_still_audits() {
    let rig = rig_with(stock_config());
    let desired = DesiredState::from_yaml(
        "device_id: lab-brocade\nvlans:\n  100:\n    name: Servers\n    tagged_ports: [\"1/2/1\"]\n",
    )
    .unwrap();

    let options = ApplyOptions {
        dry_run: true,
        ..ApplyOptions::default()
    };
    let report = rig.engine.apply_config(&desired, options).await.unwrap();

    assert!(report.dry_run);
    assert!(report.commands.iter().all(|c| c.starts_with("[DRY-RUN]")));
    // the current-state fetch happened, but nothing was written
    assert!(wire_log(&rig).is_empty());
    assert!(!rig.state.lock().unwrap().config.vlans.contains_key(&100));

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].dry_run);
    assert!(records[0].success);
}

#[tokio::test]
async fn fatal_rejection_rolls_back_and_surfaces_vendor_reject() {
    let rig = rig_with(stock_config());
    rig.state.lock().unwrap().fail_once.insert(
        "tagged ethe 1/2/1".into(),
        "Invalid input -> tagged ethe 1/2/1".into(),
    );

    let desired = DesiredState::from_yaml(
        r#"
device_id: lab-brocade
vlans:
  100:
    name: Servers
    tagged_ports: ["1/2/1"]
"#,
    )
    .unwrap();

    let err = rig
        .engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VendorReject);

    // the partial creation was rolled back
    let state = rig.state.lock().unwrap();
    assert!(!state.config.vlans.contains_key(&100));
    drop(state);

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
}

#[tokio::test]
async fn every_call_leaves_exactly_one_audit_record() {
    let rig = rig_with(stock_config());
    let desired =
        DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  100: {name: Servers}\n")
            .unwrap();

    // success, no-op, validation failure
    rig.engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();
    rig.engine
        .apply_config(&desired, ApplyOptions::default())
        .await
        .unwrap();
    let bad =
        DesiredState::from_yaml("device_id: lab-brocade\nvlans:\n  0: {name: nope}\n").unwrap();
    let _ = rig
        .engine
        .apply_config(&bad, ApplyOptions::default())
        .await
        .unwrap_err();

    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn drift_detection_is_read_only() {
    let rig = rig_with(stock_config());
    let desired = DesiredState::from_yaml(
        "device_id: lab-brocade\nvlans:\n  100: {name: Servers}\n  254: {name: Management}\n",
    )
    .unwrap();

    let report = rig.engine.detect_drift(&desired).await.unwrap();
    assert!(!report.in_sync());
    let drifted: Vec<&str> = report.drifted().map(|e| e.entity.as_str()).collect();
    assert_eq!(drifted, vec!["vlan:100"]);

    // reads only: nothing written, no audit record
    assert!(wire_log(&rig).is_empty());
    let records = rig
        .engine
        .audit()
        .recent(&AuditFilter::default())
        .await
        .unwrap();
    assert!(records.is_empty());
}
