//! Share validation and processing.

pub mod autolykos;
pub mod processor;
pub mod validator;

pub use autolykos::ValidationResult;
pub use processor::{proven_work, BlockIdRetry, BlockOutcome, FoundBlock, ShareProcessor};
pub use validator::{ShareValidator, ShareWork};
