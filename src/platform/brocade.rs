//! Brocade FastIron platform definition.
//!
//! Prompt examples:
//!
//! ```text
//! telnet@FCX624-ADV Router>        user mode
//! FCX624 Router#                   privileged mode
//! FCX624 Router(config)#           config mode
//! FCX624 Router(config-vlan-100)#  config sub-mode
//! ```
//!
//! `skip-page-display` must run immediately after enable; without it the
//! `--More--` pager truncates every long listing and deadlocks batch reads.

use super::VendorPlatform;

pub fn brocade_platform() -> VendorPlatform {
    VendorPlatform::new("brocade-fastiron")
        .with_error("^invalid input")
        .with_error("^error")
        .with_error("^ambiguous input")
        .with_error("^incomplete command")
        .with_error("please disable dual mode")
        .with_error("port is in spanning-tree")
        .with_benign(r"\d+\s+(input|output)\s+errors")
        .with_benign(r"errors,")
        .with_on_open("skip-page-display")
        .with_config_mode("configure terminal", "end")
}
