//! Shared foundation for the nlq workspace.
//!
//! Configuration, the top-level error type, value types shared by every
//! crate, and token estimation.

pub mod config;
pub mod error;
pub mod tokens;
pub mod types;

pub use config::NlqConfig;
pub use error::{NlqError, Result};
pub use tokens::{BpeCounter, HeuristicCounter, ModelFamily, TokenCounter};
pub use types::*;
