//! Vendor platform definitions.
//!
//! A platform captures what makes a vendor's CLI recognizable: prompt
//! shapes, the output patterns that mean a command failed, the patterns
//! that merely look like failures (interface counters love the word
//! "error"), and the commands to run right after connecting.

mod brocade;
mod openwrt;
mod zyxel;

pub use brocade::brocade_platform;
pub use openwrt::openwrt_platform;
pub use zyxel::zyxel_platform;

use regex::Regex;

/// Vendor-specific CLI behavior shared by handler and executor.
#[derive(Debug, Clone)]
pub struct VendorPlatform {
    /// Platform name (e.g. "brocade-fastiron").
    pub name: &'static str,

    /// Patterns that mark a command as failed. Matched per line,
    /// case-insensitively, anchored to the line start.
    pub error_patterns: Vec<&'static str>,

    /// Patterns that defuse an error match on the same line. Statistics
    /// output ("0 input errors") must never classify as failure.
    pub benign_patterns: Vec<&'static str>,

    /// Commands issued once after connecting (pager suppression etc).
    pub on_open_commands: Vec<&'static str>,

    /// Command entering configuration mode, when the vendor has one.
    pub config_enter: Option<&'static str>,

    /// Command leaving configuration mode.
    pub config_exit: Option<&'static str>,
}

impl VendorPlatform {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            error_patterns: Vec::new(),
            benign_patterns: Vec::new(),
            on_open_commands: Vec::new(),
            config_enter: None,
            config_exit: None,
        }
    }

    pub fn with_error(mut self, pattern: &'static str) -> Self {
        self.error_patterns.push(pattern);
        self
    }

    pub fn with_benign(mut self, pattern: &'static str) -> Self {
        self.benign_patterns.push(pattern);
        self
    }

    pub fn with_on_open(mut self, command: &'static str) -> Self {
        self.on_open_commands.push(command);
        self
    }

    pub fn with_config_mode(mut self, enter: &'static str, exit: &'static str) -> Self {
        self.config_enter = Some(enter);
        self.config_exit = Some(exit);
        self
    }

    /// Scan output for a structural failure marker.
    ///
    /// Returns the offending line when one is found. A line matching any
    /// benign pattern is skipped before error patterns are consulted.
    pub fn detect_failure(&self, output: &str) -> Option<String> {
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let benign = self
                .benign_patterns
                .iter()
                .any(|p| regex_for(p).is_match(line));
            if benign {
                continue;
            }

            for pattern in &self.error_patterns {
                if regex_for(pattern).is_match(line) {
                    return Some(line.to_string());
                }
            }
        }
        None
    }
}

fn regex_for(pattern: &str) -> Regex {
    // patterns are static literals; compile cost is dwarfed by the wire
    Regex::new(&format!("(?i){pattern}")).expect("platform pattern must compile")
}
