//! Telnet transport for Brocade FastIron switches.
//!
//! FastIron telnet sessions are fragile: the device needs settling time
//! after connect, paginates with `--More--` unless told otherwise, and
//! echoes every command. The session reads until the prompt pattern appears
//! at the tail of the buffer, dismissing the pager with a space as it goes.
//!
//! Batch mode writes all commands separated by CRLF and waits once for the
//! privileged prompt to return at column 0; it does not wait per command.

use std::time::Duration;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Result, TransportError};
use crate::transport::buffer::OutputBuffer;
use crate::transport::prompt::strip_echo_and_prompt;

/// Matches user (`>`), privileged (`#`) and config-mode prompts.
static PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^.{0,63}?(?:\([^)]{1,32}\))?[>#]\s*$").unwrap());

/// Privileged exec prompt at column 0, outside config mode.
static PRIV_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^[\w.\-@ ]{0,63}#\s*$").unwrap());

static MORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)--More--").unwrap());

static ENABLE_PASSWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)password:\s*$").unwrap());

/// Delay after connect before the banner is readable.
const BANNER_SETTLE: Duration = Duration::from_millis(1500);
/// Per-read poll interval while waiting for the prompt.
const READ_SLICE: Duration = Duration::from_millis(500);

/// An interactive Telnet session.
pub struct TelnetSession {
    stream: TcpStream,
    buffer: OutputBuffer,
    timeout: Duration,
}

impl TelnetSession {
    /// Connect and wait for the first prompt.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        debug!("telnet connect to {host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|source| TransportError::ConnectionFailed {
                host: host.to_string(),
                port,
                source,
            })?;

        let mut session = Self {
            stream,
            buffer: OutputBuffer::default(),
            timeout,
        };

        tokio::time::sleep(BANNER_SETTLE).await;
        session.read_until(&PROMPT, timeout).await?;
        session.buffer.clear();
        Ok(session)
    }

    /// Enter privileged mode. Devices without an enable password go straight
    /// to the `#` prompt after `enable`.
    pub async fn enable(&mut self, password: &str) -> Result<()> {
        self.send_line("enable").await?;
        self.read_until_any(&[&*PRIV_PROMPT, &*ENABLE_PASSWORD], self.timeout)
            .await?;

        if self.buffer.contains(&ENABLE_PASSWORD) {
            self.buffer.clear();
            self.send_line(password).await?;
            self.read_until(&PRIV_PROMPT, self.timeout).await?;
        }

        if !self.buffer.tail_matches(&PRIV_PROMPT) {
            return Err(TransportError::AuthenticationFailed {
                user: "enable".to_string(),
            }
            .into());
        }
        self.buffer.clear();
        Ok(())
    }

    /// Execute one command, returning output with echo and prompt stripped.
    pub async fn command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.buffer.clear();
        self.send_line(command).await?;
        self.read_until(&PROMPT, timeout).await?;
        let raw = self.buffer.take_text();
        Ok(strip_echo_and_prompt(&raw, command, &PROMPT))
    }

    /// Write a batch of commands in one go and wait for the privileged
    /// prompt to return, returning the combined raw output.
    pub async fn batch(&mut self, commands: &[String], timeout: Duration) -> Result<String> {
        self.buffer.clear();
        let mut payload = commands.join("\r\n");
        payload.push_str("\r\n");
        self.send_raw(payload.as_bytes()).await?;
        self.read_until(&PRIV_PROMPT, timeout).await?;
        Ok(self.buffer.take_text())
    }

    pub async fn close(mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("telnet send: {line}");
        self.send_raw(format!("{line}\r\n").as_bytes()).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(TransportError::Io)?;
        Ok(())
    }

    async fn read_until(&mut self, pattern: &Regex, timeout: Duration) -> Result<()> {
        self.read_until_any(&[pattern], timeout).await
    }

    /// Read chunks until any pattern matches the buffer tail, dismissing the
    /// pager whenever `--More--` shows up.
    async fn read_until_any(&mut self, patterns: &[&Regex], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 8192];

        loop {
            if patterns.iter().any(|p| self.buffer.tail_matches(p)) {
                return Ok(());
            }

            if self.buffer.tail_matches(&MORE) {
                self.send_raw(b" ").await?;
                self.buffer.scrub(&MORE);
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }

            match tokio::time::timeout(remaining.min(READ_SLICE), self.stream.read(&mut chunk))
                .await
            {
                Ok(Ok(0)) => return Err(TransportError::Disconnected.into()),
                Ok(Ok(n)) => self.buffer.push_telnet(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e).into()),
                Err(_) => {
                    // slice elapsed without data; loop re-checks the deadline
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_matches_all_modes() {
        assert!(PROMPT.is_match(b"telnet@FCX624-ADV Router>"));
        assert!(PROMPT.is_match(b"FCX624 Router#"));
        assert!(PROMPT.is_match(b"FCX624 Router(config)#"));
        assert!(PROMPT.is_match(b"FCX624 Router(config-vlan-100)#"));
        assert!(!PROMPT.is_match(b"Untagged Ports: (U1/M1) 1 2 3"));
    }

    #[test]
    fn privileged_prompt_excludes_config_mode() {
        assert!(PRIV_PROMPT.is_match(b"FCX624 Router#"));
        assert!(PRIV_PROMPT.is_match(b"output above\r\nFCX624 Router# "));
        assert!(!PRIV_PROMPT.is_match(b"FCX624 Router(config)#"));
        assert!(!PRIV_PROMPT.is_match(b"FCX624 Router>"));
    }

    #[test]
    fn more_marker_is_case_insensitive() {
        assert!(MORE.is_match(b"--More--"));
        assert!(MORE.is_match(b"--MORE--"));
    }
}
