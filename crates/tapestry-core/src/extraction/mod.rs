//! Extraction — staged utterance-to-delta transformation and the
//! language-model capability it runs on.

mod llm;
mod pipeline;
mod prompts;
mod repair;

pub use llm::{
    AnthropicModel, LanguageModel, LlmCapability, LlmError, MockLanguageModel, TokenBudget,
};
pub use pipeline::{ExtractionConfig, ExtractionPipeline};
pub use repair::repair_llm_json;
