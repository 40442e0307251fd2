//! Core domain model and contracts for prreview.

pub mod inference;
pub mod job;
pub mod model;
pub mod protocol;
pub mod util;

pub use inference::{GenerateRequest, InferenceBackend, InferenceError};
pub use job::{JobError, ReviewJob};
pub use model::*;
pub use protocol::*;
