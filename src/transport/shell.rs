//! Interactive SSH shell transport for Zyxel GS1900 switches.
//!
//! GS1900 firmware ships OpenSSH 6.2: modern key exchange is absent, so the
//! client must offer the legacy group-exchange algorithms or the handshake
//! dies before authentication. Commands run over an interactive shell (the
//! firmware has no exec channel worth using); pagination is dismissed with a
//! space and scrubbed from the buffer.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio::time::Instant;

use crate::error::{Result, TransportError};
use crate::transport::buffer::OutputBuffer;
use crate::transport::prompt::strip_echo_and_prompt;

static PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[\w\-]{1,32}[#>] ?$").unwrap());
static MORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--More--").unwrap());

const BANNER_SETTLE: Duration = Duration::from_millis(1200);
const READ_SLICE: Duration = Duration::from_millis(400);

/// Connection parameters for the shell.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    /// Offer legacy kex/cipher algorithms first (required for OpenSSH <= 6.2).
    pub legacy_algorithms: bool,
}

/// An interactive SSH shell session.
pub struct SshShell {
    handle: Handle<AcceptingHandler>,
    channel: Channel<Msg>,
    buffer: OutputBuffer,
    timeout: Duration,
}

impl SshShell {
    /// Connect, authenticate, open a PTY shell and wait for the prompt.
    pub async fn connect(config: ShellConfig) -> Result<Self> {
        debug!("ssh shell connect to {}:{}", config.host, config.port);

        let mut preferred = russh::Preferred::default();
        if config.legacy_algorithms {
            preferred.kex = Cow::Borrowed(&[
                russh::kex::DH_G14_SHA1,
                russh::kex::DH_G1_SHA1,
                russh::kex::CURVE25519,
            ]);
            preferred.cipher = Cow::Borrowed(&[
                russh::cipher::AES_128_CTR,
                russh::cipher::AES_256_CTR,
            ]);
        }

        let ssh_config = Arc::new(client::Config {
            preferred,
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            config.timeout,
            client::connect(
                ssh_config,
                (config.host.as_str(), config.port),
                AcceptingHandler,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(TransportError::Ssh)?;

        let authenticated = handle
            .authenticate_password(&config.username, &config.password)
            .await
            .map_err(TransportError::Ssh)?;
        if !authenticated {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            }
            .into());
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;
        channel
            .request_pty(true, "vt100", 511, 24, 0, 0, &[])
            .await
            .map_err(TransportError::Ssh)?;
        channel
            .request_shell(true)
            .await
            .map_err(TransportError::Ssh)?;

        let mut shell = Self {
            handle,
            channel,
            buffer: OutputBuffer::default(),
            timeout: config.timeout,
        };

        // The banner sometimes ends in a "Press ENTER" gate rather than a
        // prompt; a newline flushes through either.
        tokio::time::sleep(BANNER_SETTLE).await;
        shell.send_raw(b"\r\n").await?;
        shell.read_until_prompt(shell.timeout).await?;
        shell.buffer.clear();
        Ok(shell)
    }

    /// Execute one command, returning output with echo and prompt stripped.
    pub async fn command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.buffer.clear();
        trace!("ssh shell send: {command}");
        self.send_raw(format!("{command}\r\n").as_bytes()).await?;
        self.read_until_prompt(timeout).await?;
        let raw = self.buffer.take_text();
        Ok(strip_echo_and_prompt(&raw, command, &PROMPT))
    }

    pub async fn close(self) -> Result<()> {
        let _ = self.channel.eof().await;
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        Ok(())
    }

    async fn read_until_prompt(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.buffer.tail_matches(&PROMPT) {
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

            match tokio::time::timeout(remaining.min(READ_SLICE), self.channel.wait()).await {
                Ok(Some(ChannelMsg::Data { ref data })) => self.buffer.push(data),
                Ok(Some(ChannelMsg::ExtendedData { ref data, .. })) => self.buffer.push(data),
                Ok(Some(ChannelMsg::Close)) | Ok(Some(ChannelMsg::Eof)) | Ok(None) => {
                    return Err(TransportError::Disconnected.into());
                }
                Ok(Some(_)) => {}
                Err(_) => {
                    // slice elapsed without data; loop re-checks the deadline
                }
            }
        }
    }
}

/// Accepts any host key. Lab switches regenerate keys on factory reset and
/// firmware speaking OpenSSH 6.2 predates the key types in known_hosts
/// tooling; pinning is handled at the inventory level by host address.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_matches_zyxel_cli() {
        assert!(PROMPT.is_match(b"GS1900# "));
        assert!(PROMPT.is_match(b"GS1900#"));
        assert!(PROMPT.is_match(b"banner text\r\nGS1900> "));
        assert!(!PROMPT.is_match(b"  1 |          default |"));
    }

    #[test]
    fn prompt_rejects_mid_line_hash() {
        assert!(!PROMPT.is_match(b"interface # comment trailing"));
    }
}
