//! Analysis pipeline for prreview: chunking, prompting, resilient inference,
//! normalization, heuristic fallback and run orchestration.

pub mod chunk;
pub mod llm;
pub mod pipeline;
pub mod static_rules;

pub use pipeline::{Orchestrator, PipelineContext, RunSummary};
