//! # Switchcraft
//!
//! Async multi-vendor network switch configuration engine.
//!
//! Switchcraft hides three incompatible management surfaces — a Telnet CLI
//! (Brocade FastIron), a legacy SSH CLI plus web CGI (Zyxel GS1900), and a
//! file-based Linux config system (OpenWrt/UCI) — behind one normalized
//! vocabulary of VLANs, ports and device configs, with declarative applies,
//! drift detection, automatic recovery from known failure patterns, and an
//! append-only audit trail.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use switchcraft::{ApplyOptions, AuditLog, ConfigEngine, DesiredState, Inventory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), switchcraft::Error> {
//!     let inventory = Inventory::from_path(
//!         "configs/devices.yaml",
//!         switchcraft::handler::BUILTIN_KINDS,
//!     )
//!     .await?;
//!     let engine = ConfigEngine::new(inventory, AuditLog::new("audit.log"));
//!
//!     let desired = DesiredState::from_yaml(
//!         "device_id: lab-brocade\nvlans:\n  100:\n    name: Servers\n    untagged_ports: [\"1/1/5-8\"]\n",
//!     )?;
//!     let report = engine.apply_config(&desired, ApplyOptions::default()).await?;
//!     println!("{}", report.diff_summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! - [`transport`]: fragile interactive sessions with per-vendor quirks
//!   (pager dismissal, legacy SSH algorithms, obfuscated web logins).
//! - [`handler`]: vendor parsing and command emission behind one
//!   [`DeviceHandler`](handler::DeviceHandler) contract.
//! - [`model`]: the normalized types and the pure differ.
//! - [`engine`]: validate → diff → plan → execute → audit, with per-device
//!   writer locks, recovery and rollback.

pub mod audit;
pub mod engine;
pub mod error;
pub mod handler;
pub mod hil;
pub mod inventory;
pub mod model;
pub mod platform;
pub mod session;
pub mod transport;

pub use audit::{AuditFilter, AuditLog, AuditRecord};
pub use engine::drift::{DriftReport, DriftVerdict};
pub use engine::executor::ExecuteOptions;
pub use engine::planner::{CommandKind, CommandPlan, PlannedCommand};
pub use engine::{ApplyOptions, ApplyReport, ConfigEngine};
pub use error::{Error, ErrorKind, Result};
pub use handler::{CommandOutput, DeviceHandler, HandlerRegistry};
pub use hil::HilConfig;
pub use inventory::{Capabilities, Device, Inventory};
pub use model::{
    ApplyMode, DesiredState, DeviceConfig, Port, PortId, PortSpeed, Vlan, VlanAction,
};
