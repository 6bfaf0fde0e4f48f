//! OpenWrt platform definition.
//!
//! OpenWrt commands run over SSH exec and report failure via exit status;
//! the patterns here catch `uci` complaints that still exit zero in some
//! BusyBox builds.

use super::VendorPlatform;

pub fn openwrt_platform() -> VendorPlatform {
    VendorPlatform::new("openwrt")
        .with_error("^uci: entry not found")
        .with_error("^uci: invalid")
        .with_error("^uci: parse error")
        .with_error("command failed:")
        .with_error("^ash: .* not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uci_complaints_are_errors() {
        let p = openwrt_platform();
        assert!(p.detect_failure("uci: Entry not found").is_some());
        assert!(p.detect_failure("uci: Parse error (invalid character)").is_some());
    }

    #[test]
    fn ordinary_uci_output_passes() {
        let p = openwrt_platform();
        let out = "network.vlan100=bridge-vlan\nnetwork.vlan100.vlan='100'";
        assert!(p.detect_failure(out).is_none());
    }
}
