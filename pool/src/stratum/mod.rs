pub mod connection;
pub mod guard;
pub mod protocol;
pub mod server;

// Re-exports
pub use connection::{ConnectionSettings, MinerSession, SessionState};
pub use guard::{GuardConfig, SourceGuard};
pub use protocol::{StratumError, StratumNotification, StratumRequest, StratumResponse, SubmitParams};
pub use server::{StratumServer, StratumSettings};
