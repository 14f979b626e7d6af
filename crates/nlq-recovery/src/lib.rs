//! SQL execution error recovery.
//!
//! Raw driver error messages are classified into a fixed taxonomy, each kind
//! mapped to a retry strategy. The retry policy bounds regeneration and
//! backoff, and the ledger keeps every execution attempt for inspection.

pub mod classifier;
pub mod error;
pub mod feedback;
pub mod ledger;
pub mod policy;

pub use classifier::{ClassifiedError, ErrorLocation, RetryStrategy, SqlErrorClassifier, SqlErrorKind};
pub use error::RecoveryError;
pub use feedback::{build_feedback, clarification_question};
pub use ledger::{AttemptOutcome, RetryAttempt, RetryLedger};
pub use policy::{GiveUpReason, RetryDecision, RetryPolicy};
