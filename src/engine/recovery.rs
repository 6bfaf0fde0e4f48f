//! Recognized failure patterns and their recovery actions.
//!
//! Matching is case-insensitive substring over command output. Wording
//! drifts between firmware revisions, so the table is data: new variants
//! are added as patterns, not code.

use crate::model::PortId;

/// What the executor should do about a recognized failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Disable dual-mode on the offending port, then retry the command.
    DisableDualMode,
    /// The change is already in place; treat as success and continue.
    AlreadyApplied,
    /// Disable spanning-tree on the port, retry, re-enable afterwards.
    DisableStp,
    /// Syntax-level rejection; retrying the same bytes cannot help.
    Fatal,
    /// The session died; reconnect once and resume from the failed command.
    Reconnect,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::DisableDualMode => "disable-dual-mode",
            RecoveryAction::AlreadyApplied => "already-applied",
            RecoveryAction::DisableStp => "disable-stp",
            RecoveryAction::Fatal => "fatal",
            RecoveryAction::Reconnect => "reconnect",
        }
    }
}

/// Pattern table, in match priority order.
const PATTERNS: &[(&str, RecoveryAction)] = &[
    ("please disable dual mode", RecoveryAction::DisableDualMode),
    ("already a member", RecoveryAction::AlreadyApplied),
    ("port is in spanning-tree", RecoveryAction::DisableStp),
    ("invalid input", RecoveryAction::Fatal),
    ("unrecognized command", RecoveryAction::Fatal),
    ("connection closed", RecoveryAction::Reconnect),
];

/// Classify a failure output. Returns the matched pattern and its action.
pub fn classify(output: &str) -> Option<(&'static str, RecoveryAction)> {
    let lower = output.to_lowercase();
    PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(pattern, action)| (*pattern, action.clone()))
}

/// Pull a port reference out of failure output or the failed command, for
/// recoveries that must target an interface.
pub fn extract_port(output: &str, command: &str) -> Option<PortId> {
    static PORT: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\b(\d+/\d+/\d+)\b").unwrap());

    PORT.captures(output)
        .or_else(|| PORT.captures(command))
        .map(|caps| PortId::new(caps[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_patterns() {
        let (pattern, action) =
            classify("Error: Please disable dual mode on port 1/1/10").unwrap();
        assert_eq!(pattern, "please disable dual mode");
        assert_eq!(action, RecoveryAction::DisableDualMode);

        let (_, action) = classify("Port 5 is already a member of VLAN 100").unwrap();
        assert_eq!(action, RecoveryAction::AlreadyApplied);

        let (_, action) = classify("Invalid input -> untagged ethe 9/9/9").unwrap();
        assert_eq!(action, RecoveryAction::Fatal);

        let (_, action) = classify("Connection closed by foreign host").unwrap();
        assert_eq!(action, RecoveryAction::Reconnect);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(classify("PLEASE DISABLE DUAL MODE").is_some());
        assert!(classify("Already A Member").is_some());
    }

    #[test]
    fn unknown_output_is_unclassified() {
        assert!(classify("something completely unexpected").is_none());
    }

    #[test]
    fn extracts_port_from_output_then_command() {
        let port = extract_port("Please disable dual mode on 1/1/10", "untagged ethe 1/1/5");
        assert_eq!(port, Some(PortId::new("1/1/10")));

        let port = extract_port("Please disable dual mode", "untagged ethe 1/1/5 to 1/1/8");
        assert_eq!(port, Some(PortId::new("1/1/5")));

        assert_eq!(extract_port("no ports here", "no ports here either"), None);
    }
}
