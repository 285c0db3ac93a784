pub mod manager;
pub mod maturity;
pub mod scheduler;
pub mod wallet;

pub use manager::{PayoutConfig, PayoutManager, PayoutReport, NANO_ERG};
pub use maturity::{MaturityReport, MaturityTracker};
pub use scheduler::{CycleReport, PayoutScheduler, ScheduleConfig};
pub use wallet::PoolWallet;
