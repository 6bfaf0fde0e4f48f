//! Prompt pattern helpers.

use regex::bytes::Regex;

/// Compile a prompt pattern, anchoring it to the end of output if the
/// pattern does not anchor itself.
pub fn compile_prompt(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.ends_with('$') {
        Regex::new(pattern)
    } else {
        Regex::new(&format!(r"{pattern}\s*$"))
    }
}

/// Remove the echoed command from the head of raw output and the trailing
/// prompt line from its tail, leaving only the command's own output.
pub fn strip_echo_and_prompt(raw: &str, command: &str, prompt: &Regex) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();

    if let Some(first) = lines.first() {
        if first.contains(command) {
            lines.remove(0);
        }
    }
    if let Some(last) = lines.last() {
        if prompt.is_match(last.as_bytes()) {
            lines.pop();
        }
    }

    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_adds_anchor_when_missing() {
        let p = compile_prompt(r"Router[>#]").unwrap();
        assert!(p.is_match(b"some output\r\nRouter# "));
        assert!(!p.is_match(b"Router# more output after"));
    }

    #[test]
    fn strip_removes_echo_and_prompt() {
        let prompt = compile_prompt(r"Router[>#]").unwrap();
        let raw = "show vlan\r\nPORT-VLAN 1, Name DEFAULT-VLAN\r\nRouter#";
        let clean = strip_echo_and_prompt(raw, "show vlan", &prompt);
        assert_eq!(clean, "PORT-VLAN 1, Name DEFAULT-VLAN");
    }

    #[test]
    fn strip_keeps_output_without_echo() {
        let prompt = compile_prompt(r"GS1900#").unwrap();
        let raw = "VID | Name\n  1 | default\nGS1900# ";
        let clean = strip_echo_and_prompt(raw, "show vlan", &prompt);
        assert!(clean.contains("default"));
        assert!(!clean.contains("GS1900#"));
    }
}
