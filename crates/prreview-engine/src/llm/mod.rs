pub mod client;
pub mod ollama;
pub mod parse;
pub mod prompts;

pub use client::{ClientSettings, InferenceOutcome, ResilientClient};
pub use ollama::OllamaBackend;
