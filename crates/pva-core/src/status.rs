//! Operation status reporting.
//!
//! Every channel and RPC response carries a [`Status`]: OK, ERROR (the
//! operation failed but the connection is fine), or FATAL (the failure is
//! not recoverable for this request).

use serde::{Deserialize, Serialize};

use crate::error::PvaError;

/// Severity of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Severity {
    Ok = 0,
    Error = 1,
    Fatal = 2,
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Severity::Ok),
            1 => Ok(Severity::Error),
            2 => Ok(Severity::Fatal),
            _ => Err(format!("unknown status severity: {v}")),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Ok => "OK",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// Outcome of a protocol operation, sent back to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub severity: Severity,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status { severity: Severity::Ok, message: String::new() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Status { severity: Severity::Error, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Status { severity: Severity::Fatal, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    /// Maps an error to the status reported to the peer. A [`PvaError::Status`]
    /// passes through unchanged; anything else becomes FATAL with the error
    /// text as the message.
    pub fn from_error(err: &PvaError) -> Status {
        match err {
            PvaError::Status(status) => status.clone(),
            other => Status::fatal(other.to_string()),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::ok()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            f.write_str("OK")
        } else {
            write!(f, "{}: {}", self.severity, self.message)
        }
    }
}

impl From<Status> for PvaError {
    fn from(status: Status) -> Self {
        PvaError::Status(status)
    }
}
