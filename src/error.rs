//! 流水线统一错误类型

use serde::Serialize;
use thiserror::Error;

/// 流水线错误
///
/// 只有 `Storage` 会从 `generate_test` 向外传播，其余失败都在流水线内部降级处理。
#[derive(Debug, Error, Serialize)]
pub enum PipelineError {
    /// 持久化层不可恢复的错误
    #[error("Storage error: {0}")]
    Storage(String),

    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),

    /// 缓存错误
    #[error("Cache error: {0}")]
    Cache(String),

    /// LLM 调用错误
    #[error("LLM error: {0}")]
    Llm(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Storage(format!("{:#}", err))
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
