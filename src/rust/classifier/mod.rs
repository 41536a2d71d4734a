mod client;
mod error;
mod gemini;
mod labels;
mod schema;

pub use client::{repair_prompt, Attempt, Classifier, GenerationBackend, GenerationRequest, Outcome};
pub use error::{BackendError, ClassifyError, ValidationError, Violation};
pub use gemini::{GeminiBackend, DEFAULT_BASE_URL};
pub use labels::{IssueCategory, Label, RelevanceLabel};
pub use schema::{
    repair_instructions, response_schema, truncate_evidence, validate, Decision,
    MAX_EVIDENCE_CHARS, MAX_EVIDENCE_ITEMS, MAX_REASONING_CHARS,
};
