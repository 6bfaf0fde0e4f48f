//! Accumulation buffer for interactive session output.
//!
//! Prompt detection only searches the tail of the buffer; a full scan over a
//! large `show running-config` would be wasted work when the prompt can only
//! appear at the end.

use regex::bytes::Regex;

const DEFAULT_SEARCH_WINDOW: usize = 1024;

/// Buffer that accumulates raw session output and answers prompt queries.
///
/// ANSI escape sequences are stripped on the way in; Telnet IAC negotiation
/// bytes are dropped by [`OutputBuffer::push_telnet`].
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    search_window: usize,
}

impl OutputBuffer {
    pub fn new(search_window: usize) -> Self {
        Self {
            data: Vec::with_capacity(4096),
            search_window,
        }
    }

    /// Append cleaned output.
    pub fn push(&mut self, chunk: &[u8]) {
        let cleaned = strip_ansi_escapes::strip(chunk);
        self.data.extend_from_slice(&cleaned);
    }

    /// Append output from a Telnet stream, dropping IAC command sequences.
    pub fn push_telnet(&mut self, chunk: &[u8]) {
        self.push(&strip_iac(chunk));
    }

    /// Whether the pattern matches within the tail window.
    pub fn tail_matches(&self, pattern: &Regex) -> bool {
        let start = self.data.len().saturating_sub(self.search_window);
        pattern.is_match(&self.data[start..])
    }

    /// Whether the pattern matches anywhere in the buffer.
    pub fn contains(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.data)
    }

    /// The buffered output as text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Drain the buffer, returning its contents as text.
    pub fn take_text(&mut self) -> String {
        let text = self.text();
        self.data.clear();
        text
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Remove every occurrence of a pattern from the buffered bytes.
    ///
    /// Used to scrub `--More--` markers after the pager is dismissed, so the
    /// marker text never reaches parsers.
    pub fn scrub(&mut self, pattern: &Regex) {
        let replaced = pattern.replace_all(&self.data, &b""[..]);
        self.data = replaced.into_owned();
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_WINDOW)
    }
}

/// Drop Telnet IAC (0xFF) command sequences from a chunk.
fn strip_iac(chunk: &[u8]) -> Vec<u8> {
    const IAC: u8 = 0xFF;
    const SB: u8 = 0xFA;
    const SE: u8 = 0xF0;

    let mut out = Vec::with_capacity(chunk.len());
    let mut i = 0;
    while i < chunk.len() {
        if chunk[i] != IAC {
            out.push(chunk[i]);
            i += 1;
            continue;
        }
        // IAC IAC is an escaped 0xFF data byte
        if chunk.get(i + 1) == Some(&IAC) {
            out.push(IAC);
            i += 2;
            continue;
        }
        match chunk.get(i + 1) {
            Some(&SB) => {
                // skip subnegotiation until IAC SE
                let mut j = i + 2;
                while j + 1 < chunk.len() && !(chunk[j] == IAC && chunk[j + 1] == SE) {
                    j += 1;
                }
                i = j + 2;
            }
            Some(_) => i += 3, // IAC <cmd> <option>
            None => i += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_plain_output() {
        let mut buf = OutputBuffer::default();
        buf.push(b"show vlan\r\n");
        buf.push(b"PORT-VLAN 1\r\n");
        assert!(buf.text().contains("PORT-VLAN 1"));
    }

    #[test]
    fn strips_ansi_sequences() {
        let mut buf = OutputBuffer::default();
        buf.push(b"\x1b[32mup\x1b[0m");
        assert_eq!(buf.text(), "up");
    }

    #[test]
    fn strips_telnet_negotiation() {
        let mut buf = OutputBuffer::default();
        // IAC DO ECHO followed by real data
        buf.push_telnet(&[0xFF, 0xFD, 0x01, b'R', b'o', b'u', b't', b'e', b'r', b'>']);
        assert_eq!(buf.text(), "Router>");
    }

    #[test]
    fn tail_search_is_windowed() {
        let mut buf = OutputBuffer::new(16);
        buf.push(b"Router#");
        buf.push(&[b'x'; 64]);
        let prompt = Regex::new(r"Router#").unwrap();
        assert!(!buf.tail_matches(&prompt));
        assert!(buf.contains(&prompt));

        buf.push(b"\r\nRouter#");
        assert!(buf.tail_matches(&prompt));
    }

    #[test]
    fn scrub_removes_pager_markers() {
        let mut buf = OutputBuffer::default();
        buf.push(b"line one\r\n--More--line two\r\n");
        buf.scrub(&Regex::new(r"--More--").unwrap());
        assert_eq!(buf.text(), "line one\r\nline two\r\n");
    }

    #[test]
    fn take_text_drains() {
        let mut buf = OutputBuffer::default();
        buf.push(b"data");
        assert_eq!(buf.take_text(), "data");
        assert!(buf.is_empty());
    }
}
