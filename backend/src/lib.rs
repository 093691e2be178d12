pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod intake;
pub mod market_data;
pub mod pipeline;
pub mod projection;
pub mod ranking;
pub mod retry;
pub mod shutdown;
pub mod types;

pub use config::AppConfig;
pub use error::{PipelineError, PipelineResult};
