//! Dual-history conversation context.
//!
//! Every session keeps two parallel transcripts: a remote-safe one that may
//! be sent to an externally hosted model, and a local-full one that carries
//! query results and never leaves the trust boundary. Token pressure on the
//! remote transcript triggers summarization.

pub mod error;
pub mod redaction;
pub mod store;
pub mod summarizer;
pub mod transcript;

pub use error::ContextError;
pub use redaction::{RedactionDecision, RedactionGate};
pub use store::{ContextStore, SummaryOutcome};
pub use summarizer::{ExtractiveSummarizer, TranscriptSummarizer};
pub use transcript::{
    AnalysisTurn, ClarificationTurn, DualTranscript, LocalMessage, LocalPayload, RemoteMessage,
    SqlTurn, TurnKind,
};
