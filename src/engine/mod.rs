//! The configuration engine.
//!
//! One entry point per workflow stage, composed leaf-first: parse →
//! validate → safety gate → fetch → diff → plan → execute → audit. Nothing
//! touches the wire until validation and the HIL gate pass, and every call
//! that gets past them leaves exactly one audit record.

pub mod drift;
pub mod executor;
pub mod planner;
pub mod recovery;
pub mod validator;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::info;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{Error, ErrorKind, RecoveryAttempt, Result, TransportError, ValidationError};
use crate::handler::HandlerRegistry;
use crate::hil::HilConfig;
use crate::inventory::Inventory;
use crate::model::{diff, ConfigDiff, DesiredState, DeviceConfig, Port, PortId, Vlan, VlanAction};
use crate::session::SessionManager;

use drift::DriftReport;
use executor::{ExecuteOptions, ExecuteReport, Outcome};
use validator::VendorFamily;

/// Options for one engine call.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub rollback_on_error: bool,
    /// Persist after success (Brocade `write memory`).
    pub save_on_success: bool,
    pub actor: Option<String>,
    pub cancel: CancellationToken,
    /// How long to wait for the writer lock before `conflict`.
    pub lock_timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            rollback_on_error: true,
            save_on_success: true,
            actor: None,
            cancel: CancellationToken::new(),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub device_id: String,
    pub dry_run: bool,
    /// The device already matched the desired state.
    pub no_change: bool,
    pub diff_summary: String,
    pub commands: Vec<String>,
    pub warnings: Vec<String>,
    pub recovery_trail: Vec<RecoveryAttempt>,
    pub rollback_performed: bool,
}

/// The device-agnostic configuration engine.
pub struct ConfigEngine {
    inventory: Inventory,
    sessions: SessionManager,
    audit: AuditLog,
    hil: Option<HilConfig>,
}

impl ConfigEngine {
    /// Engine over the built-in handler registry, HIL gate from env.
    pub fn new(inventory: Inventory, audit: AuditLog) -> Self {
        Self::with_registry(inventory, audit, HandlerRegistry::with_builtins())
    }

    /// Engine over a custom registry (tests register scripted handlers).
    pub fn with_registry(inventory: Inventory, audit: AuditLog, registry: HandlerRegistry) -> Self {
        Self {
            inventory,
            sessions: SessionManager::new(registry),
            audit,
            hil: HilConfig::from_env(),
        }
    }

    /// Replace the HIL constraint profile (None disables the gate).
    pub fn set_hil(&mut self, hil: Option<HilConfig>) {
        self.hil = hil;
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Apply a desired state document to its device.
    pub async fn apply_config(
        &self,
        desired: &DesiredState,
        options: ApplyOptions,
    ) -> Result<ApplyReport> {
        let started = Instant::now();
        let mut record = AuditRecord::new(&desired.device_id, "apply_config");
        record.dry_run = options.dry_run;
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());
        record.parameters = json!({
            "mode": if desired.mode == crate::model::ApplyMode::Full { "full" } else { "patch" },
            "version": desired.version,
            "vlans": desired.vlans.len(),
            "ports": desired.ports.len(),
        });

        let device = match self.inventory.get(&desired.device_id) {
            Ok(device) => device.clone(),
            Err(e) => return self.fail(record, started, e).await,
        };
        let family = VendorFamily::from_kind(&device.kind);

        // Validation never touches the wire.
        let warnings = match validator::validate(desired, family) {
            Ok(w) => w,
            Err(e) => return self.fail(record, started, e.into()).await,
        };

        // Safety gate before any planner work or connection.
        if let Some(hil) = &self.hil {
            let vlans: Vec<u16> = desired.vlans.keys().copied().collect();
            let ports = desired_ports(desired);
            if let Err(v) = hil.check_write(&device, &vlans, &ports) {
                return self.fail(record, started, v.into()).await;
            }
        }

        let session = match self.sessions.session(&device).await {
            Ok(s) => s,
            Err(e) => return self.fail(record, started, e).await,
        };
        let _writer = match session.lock_writer(options.lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => return self.fail(record, started, e).await,
        };
        let mut slot = session.handler().await;

        // Current state; the diff is computed against reality, dry-run
        // included.
        let before = match slot.handler.get_config().await {
            Ok(config) => config,
            Err(e) => return self.fail(record, started, e).await,
        };
        record.before_state = serde_json::to_value(&before).ok();

        let changes = diff(&before, desired);
        let diff_summary = changes.summarize();

        if changes.is_empty() {
            record.success = true;
            record.after_state = record.before_state.clone();
            record.duration_ms = started.elapsed().as_millis() as u64;
            self.audit.append_or_warn(&record).await;
            info!("{}: no changes needed", desired.device_id);
            return Ok(ApplyReport {
                device_id: desired.device_id.clone(),
                dry_run: options.dry_run,
                no_change: true,
                diff_summary,
                commands: Vec::new(),
                warnings,
                recovery_trail: Vec::new(),
                rollback_performed: false,
            });
        }

        // The full diff may touch VLANs the document never named (full-mode
        // deletions); gate those too.
        if let Some(hil) = &self.hil {
            let vlans = diff_vlans(&changes);
            let ports = diff_ports(&changes);
            if let Err(v) = hil.check_write(&device, &vlans, &ports) {
                return self.fail(record, started, v.into()).await;
            }
        }

        let Some(family) = family else {
            let e: Error = ValidationError::UnknownDeviceType(device.kind.clone()).into();
            return self.fail(record, started, e).await;
        };
        if let Err(e) = planner::check_plannable(family, &changes) {
            return self.fail(record, started, e).await;
        }
        let plan = match planner::plan(family, &changes, &before, options.save_on_success) {
            Ok(plan) => plan,
            Err(e) => return self.fail(record, started, e).await,
        };
        info!(
            "{}: {} changes -> {} commands{}",
            desired.device_id,
            changes.total_changes(),
            plan.total_commands(),
            if options.dry_run { " (dry run)" } else { "" }
        );

        let exec_options = ExecuteOptions {
            dry_run: options.dry_run,
            stop_on_error: true,
            rollback_on_error: options.rollback_on_error,
            cancel: options.cancel.clone(),
            ..ExecuteOptions::default()
        };
        let exec_report =
            executor::execute_plan(slot.handler.as_mut(), &plan, desired, &exec_options).await;

        self.conclude(
            record,
            started,
            &desired.device_id,
            diff_summary,
            warnings,
            exec_report,
        )
        .await
    }

    /// Preview: validate, diff and plan without executing.
    pub async fn preview(&self, desired: &DesiredState) -> Result<String> {
        let device = self.inventory.get(&desired.device_id)?.clone();
        let family = VendorFamily::from_kind(&device.kind);
        let warnings = validator::validate(desired, family)?;

        let session = self.sessions.session(&device).await?;
        let _slot_permit = session.acquire_read_slot().await;
        let mut slot = session.handler().await;
        let before = slot.handler.get_config().await?;
        drop(slot);

        let changes = diff(&before, desired);
        let mut summary = changes.summarize();
        if !warnings.is_empty() {
            summary.push_str("\n\nWarnings:\n");
            for warning in &warnings {
                summary.push_str(&format!("  - {warning}\n"));
            }
        }
        Ok(summary)
    }

    /// Drift report: stored desired state vs freshly fetched device state.
    pub async fn detect_drift(&self, desired: &DesiredState) -> Result<DriftReport> {
        let device = self.inventory.get(&desired.device_id)?.clone();
        let session = self.sessions.session(&device).await?;
        let _slot_permit = session.acquire_read_slot().await;
        let mut slot = session.handler().await;
        let current = slot.handler.get_config().await?;
        drop(slot);
        Ok(drift::detect(desired, &current))
    }

    /// Fetch a device's current normalized configuration.
    pub async fn get_config(&self, device_id: &str) -> Result<DeviceConfig> {
        let device = self.inventory.get(device_id)?.clone();
        let session = self.sessions.session(&device).await?;
        let _slot_permit = session.acquire_read_slot().await;
        let mut slot = session.handler().await;
        slot.handler.get_config().await
    }

    /// Create or converge a single VLAN.
    pub async fn create_vlan(
        &self,
        device_id: &str,
        vlan: &Vlan,
        options: ApplyOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let mut record = AuditRecord::new(device_id, "create_vlan");
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());
        record.parameters = json!({"vlan_id": vlan.id, "name": vlan.name});

        let device = match self.inventory.get(device_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.fail_unit(record, started, e).await,
        };
        if let Some(hil) = &self.hil {
            let ports: Vec<PortId> = vlan.member_ports().cloned().collect();
            if let Err(v) = hil.check_write(&device, &[vlan.id], &ports) {
                return self.fail_unit(record, started, v.into()).await;
            }
        }

        let result = async {
            let session = self.sessions.session(&device).await?;
            let _writer = session.lock_writer(options.lock_timeout).await?;
            let mut slot = session.handler().await;
            slot.handler.create_vlan(vlan).await
        }
        .await;
        self.finish_unit(record, started, result).await
    }

    /// Delete a VLAN. VLAN 1 is rejected before any wire activity.
    pub async fn delete_vlan(
        &self,
        device_id: &str,
        vlan_id: u16,
        options: ApplyOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let mut record = AuditRecord::new(device_id, "delete_vlan");
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());
        record.parameters = json!({"vlan_id": vlan_id});

        if vlan_id == 1 {
            let e: Error = ValidationError::ProtectedVlan(1).into();
            return self.fail_unit(record, started, e).await;
        }
        let device = match self.inventory.get(device_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.fail_unit(record, started, e).await,
        };
        if let Some(hil) = &self.hil {
            if let Err(v) = hil.check_write(&device, &[vlan_id], &[]) {
                return self.fail_unit(record, started, v.into()).await;
            }
        }

        let result = async {
            let session = self.sessions.session(&device).await?;
            let _writer = session.lock_writer(options.lock_timeout).await?;
            let mut slot = session.handler().await;
            slot.handler.delete_vlan(vlan_id).await
        }
        .await;
        self.finish_unit(record, started, result).await
    }

    /// Apply managed attributes of one port.
    pub async fn configure_port(
        &self,
        device_id: &str,
        port: &Port,
        options: ApplyOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let mut record = AuditRecord::new(device_id, "configure_port");
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());
        record.parameters = json!({"port": port.id.as_str()});

        let device = match self.inventory.get(device_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.fail_unit(record, started, e).await,
        };
        if let Some(hil) = &self.hil {
            if let Err(v) = hil.check_write(&device, &[], std::slice::from_ref(&port.id)) {
                return self.fail_unit(record, started, v.into()).await;
            }
        }

        let result = async {
            let session = self.sessions.session(&device).await?;
            let _writer = session.lock_writer(options.lock_timeout).await?;
            let mut slot = session.handler().await;
            slot.handler.configure_port(port).await
        }
        .await;
        self.finish_unit(record, started, result).await
    }

    /// Persist the device's running configuration.
    pub async fn save_config(&self, device_id: &str, options: ApplyOptions) -> Result<()> {
        let started = Instant::now();
        let mut record = AuditRecord::new(device_id, "save_config");
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());

        let device = match self.inventory.get(device_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.fail_unit(record, started, e).await,
        };
        let result = async {
            let session = self.sessions.session(&device).await?;
            let _writer = session.lock_writer(options.lock_timeout).await?;
            let mut slot = session.handler().await;
            slot.handler.save_config().await
        }
        .await;
        self.finish_unit(record, started, result).await
    }

    /// Replace a device configuration file (OpenWrt whole-file edits).
    ///
    /// Empty or whitespace-only content is rejected by the handler before
    /// any transfer; the rejection still leaves an audit record.
    pub async fn put_config_file(
        &self,
        device_id: &str,
        path: &str,
        content: &str,
        options: ApplyOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let mut record = AuditRecord::new(device_id, "put_config_file");
        record.actor = options.actor.clone().unwrap_or_else(|| "system".into());
        record.parameters = json!({"path": path, "bytes": content.len()});

        let device = match self.inventory.get(device_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.fail_unit(record, started, e).await,
        };
        let result = async {
            let session = self.sessions.session(&device).await?;
            let _writer = session.lock_writer(options.lock_timeout).await?;
            let mut slot = session.handler().await;
            slot.handler.put_config_file(path, content).await
        }
        .await;
        self.finish_unit(record, started, result).await
    }

    /// Run a raw read command on a device.
    pub async fn execute(&self, device_id: &str, command: &str) -> Result<String> {
        if command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand.into());
        }
        let device = self.inventory.get(device_id)?.clone();
        let session = self.sessions.session(&device).await?;
        let _slot_permit = session.acquire_read_slot().await;
        let mut slot = session.handler().await;
        let out = slot.handler.execute(command).await?;
        match out.failure {
            Some(pattern) => Err(crate::error::VendorReject {
                device_id: device_id.to_string(),
                command: command.to_string(),
                pattern,
                output: out.output,
                trail: Vec::new(),
            }
            .into()),
            None => Ok(out.output),
        }
    }

    /// Close every open session.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }

    /// Record a pre-execution failure and surface it.
    async fn fail(
        &self,
        mut record: AuditRecord,
        started: Instant,
        error: Error,
    ) -> Result<ApplyReport> {
        record.success = false;
        record.error = Some(format!("{}: {error}", error.kind()));
        record.duration_ms = started.elapsed().as_millis() as u64;
        self.audit.append_or_warn(&record).await;
        Err(error)
    }

    async fn fail_unit(
        &self,
        record: AuditRecord,
        started: Instant,
        error: Error,
    ) -> Result<()> {
        self.fail(record, started, error).await.map(|_| ())
    }

    async fn finish_unit(
        &self,
        mut record: AuditRecord,
        started: Instant,
        result: Result<()>,
    ) -> Result<()> {
        record.duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => record.success = true,
            Err(e) => {
                record.success = false;
                record.error = Some(format!("{}: {e}", e.kind()));
            }
        }
        self.audit.append_or_warn(&record).await;
        result
    }

    /// Translate an execution report into the audit record and the caller's
    /// result.
    async fn conclude(
        &self,
        mut record: AuditRecord,
        started: Instant,
        device_id: &str,
        diff_summary: String,
        warnings: Vec<String>,
        exec: ExecuteReport,
    ) -> Result<ApplyReport> {
        record.recovery_attempts = exec.recovery_trail.clone();
        record.after_state = exec
            .after_state
            .as_ref()
            .and_then(|c| serde_json::to_value(c).ok());
        record.duration_ms = started.elapsed().as_millis() as u64;

        match exec.outcome {
            Outcome::Success => {
                record.success = true;
                self.audit.append_or_warn(&record).await;
                Ok(ApplyReport {
                    device_id: device_id.to_string(),
                    dry_run: exec.dry_run,
                    no_change: false,
                    diff_summary,
                    commands: exec.commands_executed,
                    warnings,
                    recovery_trail: exec.recovery_trail,
                    rollback_performed: exec.rollback_performed,
                })
            }
            Outcome::Failed { kind, message } => {
                // Cancellation before the first wire write aborts cleanly
                // with no audit record.
                if kind == ErrorKind::Cancelled && !exec.wire_writes {
                    return Err(Error::Cancelled {
                        device_id: device_id.to_string(),
                        rolled_back: false,
                    });
                }

                record.success = false;
                record.error = Some(format!("{kind}: {message}"));
                self.audit.append_or_warn(&record).await;

                Err(failure_to_error(
                    kind,
                    message,
                    device_id,
                    exec.recovery_trail,
                    exec.rollback_performed,
                ))
            }
        }
    }
}

fn failure_to_error(
    kind: ErrorKind,
    message: String,
    device_id: &str,
    trail: Vec<RecoveryAttempt>,
    rolled_back: bool,
) -> Error {
    match kind {
        ErrorKind::Cancelled => Error::Cancelled {
            device_id: device_id.to_string(),
            rolled_back,
        },
        ErrorKind::RollbackFailed => Error::RollbackFailed {
            device_id: device_id.to_string(),
            reason: message,
            trail,
        },
        ErrorKind::VendorReject => crate::error::VendorReject {
            device_id: device_id.to_string(),
            command: String::new(),
            pattern: message.clone(),
            output: message,
            trail,
        }
        .into(),
        ErrorKind::Transport => TransportError::Session(message).into(),
        ErrorKind::SafetyViolation => crate::error::SafetyViolation {
            constraint: "EXECUTION",
            message,
        }
        .into(),
        ErrorKind::Conflict => Error::Conflict {
            device_id: device_id.to_string(),
            waited: Duration::ZERO,
        },
        ErrorKind::Validation => ValidationError::Document(message).into(),
        ErrorKind::Protocol => crate::error::ProtocolError::VerifyMismatch(message).into(),
    }
}

/// Every port a desired document touches.
fn desired_ports(desired: &DesiredState) -> Vec<PortId> {
    let mut ports: BTreeSet<PortId> = BTreeSet::new();
    for vlan in desired.vlans.values() {
        if vlan.action == VlanAction::Absent {
            continue;
        }
        ports.extend(vlan.untagged_ports.iter().cloned());
        ports.extend(vlan.tagged_ports.iter().cloned());
    }
    ports.extend(desired.ports.keys().cloned());
    ports.into_iter().collect()
}

fn diff_vlans(changes: &ConfigDiff) -> Vec<u16> {
    let mut vlans: BTreeSet<u16> = BTreeSet::new();
    vlans.extend(changes.vlans_to_create.iter().map(|v| v.id));
    vlans.extend(changes.vlans_to_modify.iter().map(|m| m.before.id));
    vlans.extend(changes.vlans_to_delete.iter().map(|v| v.id));
    vlans.into_iter().collect()
}

fn diff_ports(changes: &ConfigDiff) -> Vec<PortId> {
    let mut ports: BTreeSet<PortId> = BTreeSet::new();
    for vlan in &changes.vlans_to_create {
        ports.extend(vlan.member_ports().cloned());
    }
    for change in &changes.vlans_to_modify {
        ports.extend(change.add_untagged.iter().cloned());
        ports.extend(change.remove_untagged.iter().cloned());
        ports.extend(change.add_tagged.iter().cloned());
        ports.extend(change.remove_tagged.iter().cloned());
    }
    for change in &changes.ports_to_configure {
        ports.insert(change.port.clone());
    }
    ports.into_iter().collect()
}
