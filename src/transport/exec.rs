//! SSH exec transport for OpenWrt devices.
//!
//! OpenWrt has a real shell, so every command runs as its own exec channel
//! with a proper exit status; there is no prompt to scrape. Whole-file
//! configuration edits go over SFTP on the same session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, TransportError, ValidationError};

/// Output of one exec'd command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, stderr last, for error reporting.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.trim_end().to_string()
        } else {
            format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end())
                .trim()
                .to_string()
        }
    }
}

/// One SSH session running commands via exec channels.
pub struct SshExec {
    handle: Handle<AcceptingHandler>,
    timeout: Duration,
}

impl SshExec {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self> {
        debug!("ssh exec connect to {host}:{port}");
        let config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(config, (host, port), AcceptingHandler),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(TransportError::Ssh)?;

        let authenticated = handle
            .authenticate_password(username, password)
            .await
            .map_err(TransportError::Ssh)?;
        if !authenticated {
            return Err(TransportError::AuthenticationFailed {
                user: username.to_string(),
            }
            .into());
        }

        Ok(Self { handle, timeout })
    }

    /// Run one command on a fresh exec channel.
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        trace!("ssh exec: {command}");
        let work = async {
            let mut channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(TransportError::Ssh)?;
            channel
                .exec(true, command)
                .await
                .map_err(TransportError::Ssh)?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok::<_, crate::error::Error>(ExecOutput {
                exit_code: exit_code.unwrap_or(u32::MAX),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    /// Download a remote file as text.
    pub async fn download(&self, path: &str) -> Result<String> {
        let sftp = self.open_sftp().await?;
        let mut file = sftp
            .open(path)
            .await
            .map_err(|e| TransportError::Transfer(format!("open {path}: {e}")))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .await
            .map_err(|e| TransportError::Transfer(format!("read {path}: {e}")))?;
        Ok(content)
    }

    /// Replace a remote file's contents.
    ///
    /// A blank `/etc/config/network` bricks the device, so empty or
    /// whitespace-only uploads are rejected before any transfer starts.
    pub async fn upload(&self, path: &str, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyConfigUpload(path.to_string()).into());
        }

        let sftp = self.open_sftp().await?;
        let mut file = sftp
            .create(path)
            .await
            .map_err(|e| TransportError::Transfer(format!("create {path}: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| TransportError::Transfer(format!("write {path}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| TransportError::Transfer(format!("flush {path}: {e}")))?;
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }

    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(TransportError::Ssh)?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Transfer(format!("sftp subsystem: {e}")).into())
    }
}

/// Accepts any host key; see the note on the shell transport.
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

/// Escape a value for single-quoted shell interpolation.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output_merges_streams() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "partial\n".into(),
            stderr: "uci: Entry not found\n".into(),
        };
        assert_eq!(out.combined(), "partial\nuci: Entry not found");
        assert!(!out.success());
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
