//! Background worker that leases pending `conversation_analyses` rows and
//! summarizes each conversation with an external LLM (spec §4.7).

mod error;
mod llm;
mod parse;
mod prompt;
mod store;
mod worker;

pub use error::{AnalysisError, AnalysisResult};
pub use llm::{AnalysisLlm, GeminiClient, LlmResponse};
pub use parse::extract_json;
pub use prompt::{assemble_transcript, build_prompt, SYSTEM_PROMPT};
pub use store::AnalysisStore;
pub use worker::{run, WorkerConfig};
