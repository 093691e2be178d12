pub mod admission;
pub mod detector;
pub mod merger;
pub mod service;

pub use admission::{has_new_entrant, rebuild, TOP_SLOTS};
pub use detector::{DetectionOutcome, DetectionScheduler, DetectionState, DetectionTicket, StepResult};
pub use merger::{merge_candidates, token_from_quote, undiscovered_names};
pub use service::{IntelligencePipeline, IterationReport};
