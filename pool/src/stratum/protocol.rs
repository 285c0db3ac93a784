//! Stratum v1 message types (Ergo flavour)
//!
//! Newline-delimited JSON. Requests carry `id`, `method`, `params`;
//! responses always carry both `result` and `error`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

/// Fixed block version sent in every `mining.notify`.
pub const BLOCK_VERSION: &str = "00000002";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Some miners send "2.0", most send nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default)]
    pub params: Value,
}

impl StratumRequest {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Positional string parameter, `None` when missing or not a string.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.as_array()?.get(index)?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumResponse {
    pub id: Value,

    pub result: Value,

    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { id, result, error: None }
    }

    /// Rejections answer `result: false` so that miners counting
    /// accepted/rejected shares see a boolean.
    pub fn error(id: Value, error: StratumError) -> Self {
        Self { id, result: Value::Bool(false), error: Some(error) }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumError {
    pub code: i32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StratumError {
    pub const UNKNOWN: i32 = -1;
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    /// Source exceeded its invalid-share allowance
    pub const BANNED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Job not found")
    }

    pub fn internal_validation() -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal validation error")
    }
}

/// Server-initiated message (`id: null`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumNotification {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl StratumNotification {
    pub fn set_difficulty(difficulty: u64) -> Self {
        Self {
            id: Value::Null,
            method: "mining.set_difficulty".to_string(),
            params: json!([difficulty]),
        }
    }

    /// `mining.notify` for Ergo miners:
    /// `[jobId, height, msg, "", "", version, bShare, "", cleanJobs]`.
    pub fn notify(job_id: &str, height: u64, msg: &str, share_target: &str, clean_jobs: bool) -> Self {
        Self {
            id: Value::Null,
            method: "mining.notify".to_string(),
            params: json!([
                job_id,
                height,
                msg,
                "",
                "",
                BLOCK_VERSION,
                share_target,
                "",
                clean_jobs
            ]),
        }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

/// Parsed `mining.submit` params: `[worker, jobId, extranonce2, ...]`.
/// The worker slot must be present but the session's authorized login is
/// what shares are credited to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub job_id: String,
    pub extranonce2: String,
}

impl SubmitParams {
    pub fn from_request(req: &StratumRequest) -> Result<Self, ProtocolError> {
        let (Some(_), Some(job_id), Some(extranonce2)) =
            (req.param_str(0), req.param_str(1), req.param_str(2))
        else {
            return Err(ProtocolError::InvalidParams(
                "expected [worker, jobId, extranonce2]".to_string(),
            ));
        };
        Ok(Self {
            job_id: job_id.to_string(),
            extranonce2: extranonce2.to_ascii_lowercase(),
        })
    }
}
