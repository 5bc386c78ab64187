//! Core types shared between the verifier and the executor.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Operations permitted when no other allow-list is configured.
pub const DEFAULT_ALLOWED_OPERATIONS: [&str; 2] = ["start", "restart"];

/// Claims carried by a verified token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// libvirt domain name
    #[serde(rename = "vm", default)]
    pub vm_name: String,
    /// Requested lifecycle operation
    #[serde(default)]
    pub operation: String,
}

impl Claims {
    /// Decode claims from an already verified token payload.
    ///
    /// Wrong field types, missing fields and empty strings are all
    /// `BadRequest`.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        let claims: Claims = serde_json::from_value(payload)
            .map_err(|e| Error::bad_request(format!("malformed claims: {}", e)))?;
        claims.validate()?;
        Ok(claims)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vm_name.is_empty() {
            return Err(Error::bad_request("missing vm claim"));
        }
        if self.operation.is_empty() {
            return Err(Error::bad_request("missing operation claim"));
        }
        Ok(())
    }
}

/// Immutable set of operation names the service will execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    operations: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }

    /// Sorted view, for logging.
    pub fn operations(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.operations.iter().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_OPERATIONS)
    }
}

/// Raw result of one hypervisor CLI run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn exited_successfully(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of one or more invocations, as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub succeeded: bool,
    pub error_text: String,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error_text: String::new(),
        }
    }

    pub fn failure(error_text: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_text: error_text.into(),
        }
    }

    /// Fold a later step into this one. Failure of either step fails the
    /// whole; error texts are joined with CRLF.
    pub fn and_then_step(self, next: CommandResult) -> CommandResult {
        if self.succeeded && next.succeeded {
            return CommandResult::success();
        }
        CommandResult::failure(format!("{}\r\n{}", self.error_text, next.error_text))
    }

    pub fn into_result(self) -> Result<()> {
        if self.succeeded {
            Ok(())
        } else {
            Err(Error::ExecutionFailure(self.error_text))
        }
    }
}

/// How a finished invocation is judged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureDetection {
    /// stderr contains "error" or "fail" (case-sensitive)
    #[default]
    StderrMarkers,
    /// non-zero exit status
    ExitStatus,
}

impl FailureDetection {
    pub fn classify(&self, output: &CommandOutput) -> CommandResult {
        let failed = match self {
            FailureDetection::StderrMarkers => {
                output.stderr.contains("error") || output.stderr.contains("fail")
            }
            FailureDetection::ExitStatus => !output.exited_successfully(),
        };

        if failed {
            CommandResult::failure(output.stderr.clone())
        } else {
            CommandResult::success()
        }
    }
}

impl fmt::Display for FailureDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureDetection::StderrMarkers => write!(f, "stderr-markers"),
            FailureDetection::ExitStatus => write!(f, "exit-status"),
        }
    }
}

impl FromStr for FailureDetection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stderr-markers" => Ok(FailureDetection::StderrMarkers),
            "exit-status" => Ok(FailureDetection::ExitStatus),
            other => Err(format!(
                "unknown failure detection '{}' (expected stderr-markers or exit-status)",
                other
            )),
        }
    }
}
