//! On-disk UCI document model.
//!
//! `/etc/config/network` is plain text: `config <type> ['<name>']` headers
//! with indented `option`/`list` lines, sections separated by blank lines.
//! Whole-file edits parse the file, mutate sections, and render it back
//! byte-compatibly so a round trip through the engine never reformats
//! untouched sections into something the device chokes on.

use crate::error::{ProtocolError, Result};

/// One `config` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UciSection {
    pub kind: String,
    pub name: Option<String>,
    pub options: Vec<(String, String)>,
    pub lists: Vec<(String, String)>,
}

impl UciSection {
    pub fn new(kind: impl Into<String>, name: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            name,
            options: Vec::new(),
            lists: Vec::new(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.options.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.options.push((key.to_string(), value));
        }
    }
}

/// A parsed UCI file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UciDocument {
    pub sections: Vec<UciSection>,
}

impl UciDocument {
    /// Parse UCI text. Unknown line shapes are a protocol error: guessing
    /// at config file contents is how devices get bricked.
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: Vec<UciSection> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("config ") {
                let mut parts = rest.splitn(2, char::is_whitespace);
                let kind = parts.next().unwrap_or_default().to_string();
                let name = parts
                    .next()
                    .map(|n| unquote(n.trim()).to_string())
                    .filter(|n| !n.is_empty());
                sections.push(UciSection::new(kind, name));
            } else if let Some(rest) = line.strip_prefix("option ") {
                let (key, value) = split_kv(rest, lineno)?;
                let section = sections.last_mut().ok_or_else(|| orphan(lineno))?;
                section.options.push((key, value));
            } else if let Some(rest) = line.strip_prefix("list ") {
                let (key, value) = split_kv(rest, lineno)?;
                let section = sections.last_mut().ok_or_else(|| orphan(lineno))?;
                section.lists.push((key, value));
            } else {
                return Err(ProtocolError::Parse {
                    context: "UCI document".into(),
                    detail: format!("unrecognized line {}: '{line}'", lineno + 1),
                }
                .into());
            }
        }

        Ok(Self { sections })
    }

    /// Render back to on-disk format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match &section.name {
                Some(name) => out.push_str(&format!("config {} '{}'\n", section.kind, name)),
                None => out.push_str(&format!("config {}\n", section.kind)),
            }
            for (k, v) in &section.options {
                out.push_str(&format!("\toption {k} '{v}'\n"));
            }
            for (k, v) in &section.lists {
                out.push_str(&format!("\tlist {k} '{v}'\n"));
            }
        }
        out
    }

    pub fn find(&self, kind: &str, name: &str) -> Option<&UciSection> {
        self.sections
            .iter()
            .find(|s| s.kind == kind && s.name.as_deref() == Some(name))
    }

    pub fn find_mut(&mut self, kind: &str, name: &str) -> Option<&mut UciSection> {
        self.sections
            .iter_mut()
            .find(|s| s.kind == kind && s.name.as_deref() == Some(name))
    }

    pub fn remove(&mut self, kind: &str, name: &str) -> bool {
        let before = self.sections.len();
        self.sections
            .retain(|s| !(s.kind == kind && s.name.as_deref() == Some(name)));
        self.sections.len() != before
    }
}

fn split_kv(rest: &str, lineno: usize) -> Result<(String, String)> {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let key = parts.next().unwrap_or_default().to_string();
    let value = parts
        .next()
        .map(|v| unquote(v.trim()).to_string())
        .ok_or_else(|| ProtocolError::Parse {
            context: "UCI document".into(),
            detail: format!("option without value at line {}", lineno + 1),
        })?;
    Ok((key, value))
}

fn orphan(lineno: usize) -> crate::error::Error {
    ProtocolError::Parse {
        context: "UCI document".into(),
        detail: format!("option before any config section at line {}", lineno + 1),
    }
    .into()
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "config interface 'loopback'\n\
\toption device 'lo'\n\
\toption proto 'static'\n\
\n\
config device\n\
\toption name 'br-lan'\n\
\toption type 'bridge'\n\
\tlist ports 'lan1'\n\
\tlist ports 'lan2'\n\
\n\
config bridge-vlan 'vlan100'\n\
\toption device 'br-lan'\n\
\toption vlan '100'\n\
\toption ports 'lan1:u* lan2:t'\n";

    #[test]
    fn parses_sections_options_and_lists() {
        let doc = UciDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.sections.len(), 3);

        let bridge = &doc.sections[1];
        assert_eq!(bridge.kind, "device");
        assert!(bridge.name.is_none());
        assert_eq!(bridge.option("name"), Some("br-lan"));
        assert_eq!(bridge.lists.len(), 2);

        let vlan = doc.find("bridge-vlan", "vlan100").unwrap();
        assert_eq!(vlan.option("vlan"), Some("100"));
    }

    #[test]
    fn render_matches_on_disk_format() {
        let doc = UciDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.render(), SAMPLE);
    }

    #[test]
    fn mutation_survives_render() {
        let mut doc = UciDocument::parse(SAMPLE).unwrap();
        doc.find_mut("bridge-vlan", "vlan100")
            .unwrap()
            .set_option("ports", "lan1:u* lan3:t");
        assert!(doc.remove("interface", "loopback"));

        let rendered = doc.render();
        assert!(rendered.contains("option ports 'lan1:u* lan3:t'"));
        assert!(!rendered.contains("loopback"));
    }

    #[test]
    fn orphan_option_is_rejected() {
        assert!(UciDocument::parse("\toption device 'lo'\n").is_err());
    }

    #[test]
    fn garbage_lines_are_rejected() {
        assert!(UciDocument::parse("config device\nwhat is this\n").is_err());
    }
}
