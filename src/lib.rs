pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{CacheConfig, LlamaConfig, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use models::*;
pub use services::{AppContext, MetricsSnapshot, Orchestrator};
