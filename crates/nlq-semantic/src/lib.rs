//! Token-budgeted semantic context for SQL generation.
//!
//! Five metadata modules (data source, table structure, table relations,
//! dictionary, knowledge) are fetched from their providers, ranked by
//! priority and relevance, and packed greedily into one context string that
//! never exceeds the available budget.

pub mod aggregator;
pub mod budget;
pub mod error;
pub mod module;

pub use aggregator::{pack, AggregationResult, ModuleCandidate, SemanticAggregator, SkipReason};
pub use budget::TokenBudget;
pub use error::SemanticError;
pub use module::{
    keyword_overlap, ModuleContent, ModuleKind, ModuleProvider, Priority, PriorityMap,
    StaticModuleProvider,
};
