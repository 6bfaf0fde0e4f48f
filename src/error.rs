//! Error types for switchcraft.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Surface taxonomy for user-visible failures.
///
/// Every [`Error`] maps to exactly one kind; the kind string is stable and
/// suitable for matching by callers, the display message is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Connect/auth/timeout/disconnect at the transport layer.
    Transport,
    /// Unexpected prompt or unparseable device output.
    Protocol,
    /// Input failed schema checks before any wire I/O.
    Validation,
    /// The device returned a recognized error pattern.
    VendorReject,
    /// A HIL or protected-entity guard triggered.
    SafetyViolation,
    /// Another writer held the device lock past the deadline.
    Conflict,
    /// Recovery and rollback both failed.
    RollbackFailed,
    /// The caller cancelled or the deadline expired.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::VendorReject => "vendor-reject",
            ErrorKind::SafetyViolation => "safety-violation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RollbackFailed => "rollback-failed",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the executor's recovery trail.
///
/// Accumulated across attempts and carried on both successful and failed
/// results so the audit record always shows what the executor did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// The output pattern that was matched.
    pub pattern: String,
    /// The action taken (e.g. "disable-dual-mode", "reconnect").
    pub action: String,
    /// The command whose failure triggered the attempt.
    pub command: String,
    /// Whether the retry after the action succeeded.
    pub succeeded: bool,
}

/// Main error type for switchcraft operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level errors (connect, auth, disconnect, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol-level errors (unexpected prompt, parse failure).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Input failed schema checks before any wire I/O.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The device returned a recognized error pattern.
    #[error("{0}")]
    VendorReject(#[from] VendorReject),

    /// A HIL or protected-entity guard triggered.
    #[error("{0}")]
    Safety(#[from] SafetyViolation),

    /// Another writer held the device lock past the deadline.
    #[error("writer lock on '{device_id}' not acquired within {waited:?}")]
    Conflict { device_id: String, waited: Duration },

    /// Recovery was exhausted and rollback also failed.
    #[error("rollback failed on '{device_id}': {reason}")]
    RollbackFailed {
        device_id: String,
        reason: String,
        trail: Vec<RecoveryAttempt>,
    },

    /// The caller cancelled or the deadline expired.
    #[error("operation on '{device_id}' cancelled (rolled_back: {rolled_back})")]
    Cancelled { device_id: String, rolled_back: bool },
}

impl Error {
    /// The stable taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Validation(_) => ErrorKind::Validation,
            Error::VendorReject(_) => ErrorKind::VendorReject,
            Error::Safety(_) => ErrorKind::SafetyViolation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The recovery trail, when the failure carries one.
    pub fn recovery_trail(&self) -> &[RecoveryAttempt] {
        match self {
            Error::RollbackFailed { trail, .. } => trail,
            Error::VendorReject(r) => &r.trail,
            _ => &[],
        }
    }
}

/// Transport layer errors (TCP/SSH/HTTPS connection and authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to open the TCP connection.
    #[error("connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error.
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication rejected by the device.
    #[error("authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// HTTPS request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SFTP subsystem or transfer failure.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// Session-level failure reported without a finer-grained cause.
    #[error("session failure: {0}")]
    Session(String),

    /// The peer closed the connection unexpectedly.
    #[error("connection disconnected")]
    Disconnected,

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a fresh connect attempt could plausibly succeed.
    ///
    /// Auth failures are permanent (retrying the same password is pointless);
    /// everything else is worth the backoff loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::AuthenticationFailed { .. })
    }
}

/// Protocol layer errors (prompt handling, output parsing).
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The expected prompt never appeared.
    #[error("prompt not seen on '{device_id}' within {timeout:?}")]
    PromptTimeout { device_id: String, timeout: Duration },

    /// Device output did not match the expected grammar.
    #[error("failed to parse {context}: {detail}")]
    Parse { context: String, detail: String },

    /// A required token was missing from a device page.
    #[error("missing {token} token in device response")]
    MissingToken { token: String },

    /// The device refused the management login flow.
    #[error("device login flow rejected: {0}")]
    LoginRejected(String),

    /// Re-fetching after apply did not converge to the desired state.
    #[error("post-apply verification found residual differences: {0}")]
    VerifyMismatch(String),
}

/// Validation errors raised before any wire I/O.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid VLAN ID {0}: must be between 1 and 4094")]
    VlanIdOutOfRange(i64),

    #[error("VLAN {id} is reserved: {reason}")]
    ReservedVlan { id: u16, reason: String },

    #[error("cannot delete VLAN {0}: default VLAN is protected")]
    ProtectedVlan(u16),

    #[error("invalid port name '{port}' for {device_type}")]
    InvalidPort { port: String, device_type: String },

    #[error("port {port} assigned untagged to both VLAN {first} and VLAN {second}")]
    UntaggedConflict { port: String, first: u16, second: u16 },

    #[error("port {port} cannot be both tagged and untagged in VLAN {vlan}")]
    TaggedUntaggedOverlap { port: String, vlan: u16 },

    #[error("checksum mismatch: document declares {declared}, canonical form is {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("invalid speed '{0}': valid values are auto, 10-half, 10-full, 100-half, 100-full, 1000-full, 10G")]
    InvalidSpeed(String),

    #[error("invalid mode '{0}': must be 'full' or 'patch'")]
    InvalidMode(String),

    #[error("invalid action '{0}' for VLAN: must be 'ensure' or 'absent'")]
    InvalidAction(String),

    #[error("empty command rejected")]
    EmptyCommand,

    #[error("refusing to upload empty configuration file to {0}")]
    EmptyConfigUpload(String),

    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),

    #[error("operation '{operation}' is not supported on transport '{transport}'")]
    UnsupportedOnTransport {
        operation: String,
        transport: String,
    },

    #[error("malformed desired-state document: {0}")]
    Document(String),
}

/// A recognized vendor error pattern in command output.
#[derive(Error, Debug)]
#[error("device '{device_id}' rejected '{command}': {pattern}")]
pub struct VendorReject {
    pub device_id: String,
    pub command: String,
    /// The matched error pattern.
    pub pattern: String,
    /// The full output around the failure.
    pub output: String,
    /// Recovery attempts made before surfacing.
    pub trail: Vec<RecoveryAttempt>,
}

/// A HIL or protected-entity constraint violation.
#[derive(Error, Debug)]
#[error("HIL constraint violation [{constraint}]: {message}")]
pub struct SafetyViolation {
    /// The constraint that triggered (e.g. "ALLOWED_DEVICES").
    pub constraint: &'static str,
    pub message: String,
}

/// Result type alias using switchcraft's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
