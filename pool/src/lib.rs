pub mod blockchain;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod payout;
pub mod pplns;
pub mod session;
pub mod shares;
pub mod storage;
pub mod stratum;
pub mod vardiff;
