use thiserror::Error;

use crate::stratum::protocol::StratumError;

/// Malformed or unknown stratum message. The message is rejected, the
/// connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

/// Authorization failure. The miner is told why and disconnected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid address")]
    InvalidAddress,

    #[error("missing credentials")]
    MissingCredentials,
}

/// Share rejection. Counts against the per-source limiter, connection kept.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShareError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("job not found")]
    JobNotFound,

    #[error("invalid extranonce2")]
    InvalidExtraNonce2,

    #[error("invalid nonce size")]
    InvalidNonceSize,

    #[error("duplicate share")]
    Duplicate,

    #[error("low difficulty share")]
    LowDifficulty,

    #[error("too many invalid shares")]
    Banned,
}

/// Unexpected failure inside the hashing worker. The share is rejected,
/// the session is unaffected.
#[derive(Debug, Error)]
#[error("validation worker failed: {0}")]
pub struct ValidationIntegrityError(pub String);

/// Node call failure.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node request timed out")]
    Timeout,

    #[error("node connection failed: {0}")]
    Connection(String),

    #[error("node returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("node response could not be decoded: {0}")]
    Decode(String),
}

impl NodeError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NodeError::Timeout
        } else if e.is_decode() {
            NodeError::Decode(e.to_string())
        } else {
            NodeError::Connection(e.to_string())
        }
    }
}

/// Outcome of the single payment send attempt that is not a success.
#[derive(Debug, Error)]
pub enum SendError {
    /// The wallet answered with an explicit error; nothing was sent.
    #[error("wallet rejected payment (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// Timeout or transport failure; the payment may or may not have gone out.
    #[error("payment outcome unknown: {0}")]
    Ambiguous(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("amount out of range: {0}")]
    AmountOverflow(u64),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store call timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("no shares in PPLNS window for block {0}")]
    EmptyWindow(u64),

    #[error("block {0} not found")]
    UnknownBlock(u64),

    #[error("node unavailable: {0}")]
    Node(#[from] NodeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PaymentError {
    /// At least one payment is in the UNKNOWN state; automation stops.
    #[error("{0} payment(s) in UNKNOWN state, payouts halted")]
    Halted(u64),

    #[error("payment {0} is not in UNKNOWN state")]
    NotUnknown(i64),

    #[error("wallet error: {0}")]
    Wallet(#[from] NodeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a whole confirmer or payout cycle (per-block and per-batch
/// failures are logged and do not end up here).
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a payout cycle is already running")]
    AlreadyRunning,

    #[error("node unavailable: {0}")]
    Node(#[from] NodeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl From<&ShareError> for StratumError {
    fn from(e: &ShareError) -> Self {
        match e {
            ShareError::Unauthorized => StratumError::new(StratumError::UNAUTHORIZED, "Unauthorized"),
            ShareError::JobNotFound => StratumError::job_not_found(),
            ShareError::InvalidExtraNonce2 => {
                StratumError::new(StratumError::INVALID_PARAMS, "Invalid extraNonce2")
            }
            ShareError::InvalidNonceSize => {
                StratumError::new(StratumError::INVALID_PARAMS, "Invalid nonce size")
            }
            ShareError::Duplicate => StratumError::new(StratumError::DUPLICATE_SHARE, "Duplicate share"),
            ShareError::LowDifficulty => {
                StratumError::new(StratumError::LOW_DIFFICULTY, "Low difficulty share")
            }
            ShareError::Banned => StratumError::new(StratumError::BANNED, "Too many invalid shares"),
        }
    }
}

impl From<&AuthError> for StratumError {
    fn from(e: &AuthError) -> Self {
        match e {
            AuthError::InvalidAddress => StratumError::new(StratumError::UNAUTHORIZED, "Invalid address"),
            AuthError::MissingCredentials => {
                StratumError::invalid_params("Missing address")
            }
        }
    }
}

impl From<&ProtocolError> for StratumError {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed(m) => StratumError::new(StratumError::PARSE_ERROR, m.clone()),
            ProtocolError::UnknownMethod(_) => {
                StratumError::new(StratumError::INVALID_METHOD, "Unknown method")
            }
            ProtocolError::InvalidParams(m) => StratumError::invalid_params(m.clone()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
