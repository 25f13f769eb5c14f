//! Shared data model for Claude Nexus Proxy.
//!
//! This crate has no I/O of its own: it defines the row shapes that
//! `nexus-storage` persists and that every other component (hasher, linker,
//! capture, worker) passes around, plus the error taxonomy from the design's
//! error-handling section.

pub mod credential;
pub mod error;
pub mod request;

pub use credential::Credential;
pub use error::NexusError;
pub use request::{
    AnalysisStatus, ConversationAnalysis, Request, RequestType, StreamingChunk,
    TaskToolInvocation, Usage,
};
