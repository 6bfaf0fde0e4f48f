//! Zyxel GS1900 platform definition.
//!
//! The CLI is Cisco-flavoured but read-only; writes go through the web
//! interface. Error wording drifts between firmware revisions, so the
//! pattern list is additive data rather than a closed set.

use super::VendorPlatform;

pub fn zyxel_platform() -> VendorPlatform {
    VendorPlatform::new("zyxel-gs1900")
        .with_error("^invalid")
        .with_error("^unknown command")
        .with_error(r"^error[:\s]")
        .with_error("^incomplete command")
        .with_error("not found$")
        .with_error("already a member")
        .with_benign(r"\d+\s+(input\s+)?errors")
        .with_benign("errors,")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_has_no_config_mode() {
        let p = zyxel_platform();
        assert!(p.config_enter.is_none());
        assert!(p.on_open_commands.is_empty());
    }

    #[test]
    fn statistics_lines_pass() {
        let p = zyxel_platform();
        let stats = "  1520 packets input, 0 input errors\n  842 packets output, 0 errors, 0 collisions";
        assert!(p.detect_failure(stats).is_none());
    }

    #[test]
    fn structural_errors_fail() {
        let p = zyxel_platform();
        assert!(p.detect_failure("Unknown command: shw vlan").is_some());
        assert!(p.detect_failure("Invalid port range").is_some());
        assert!(p.detect_failure("Error: VLAN does not exist").is_some());
    }
}
