//! 流水线配置
//! 默认值 + 可选 TOML 文件 + `SHUATI__*` 环境变量覆盖

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 推理服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub health_timeout_ms: u64,   // 存活探测，独立于生成请求
    pub request_timeout_ms: u64,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5:7b-instruct".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            health_timeout_ms: 2000,
            request_timeout_ms: 60000,
        }
    }
}

impl LlamaConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 共享缓存层的 SQLite 文件，None 时只使用进程内缓存
    pub shared_path: Option<PathBuf>,
    pub memory_capacity: usize,
    pub memory_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared_path: None,
            memory_capacity: 256,
            memory_ttl_secs: 600,
        }
    }
}

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub generation_enabled: bool,
    pub strict_validation: bool,
    pub default_previous_year_ratio: f64,
    pub max_generation_retries: u32,
    pub base_temperature: f32,
    pub temperature_step: f32,
    pub style_reference_limit: usize,
    pub exclusion_summary_limit: usize,
    pub cache_ttl_secs: u64,
    pub pregen_ttl_secs: u64,
    pub database_path: PathBuf,
    pub llama: LlamaConfig,
    pub cache: CacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_enabled: true,
            strict_validation: true,
            default_previous_year_ratio: 0.5,
            max_generation_retries: 2,
            base_temperature: 0.7,
            temperature_step: 0.1,
            style_reference_limit: 5,
            exclusion_summary_limit: 20,
            cache_ttl_secs: 3600,
            pregen_ttl_secs: 1800,
            database_path: crate::utils::get_database_path(),
            llama: LlamaConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// 加载配置：`.env` -> 可选 TOML 文件 -> 环境变量
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(PipelineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHUATI")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: PipelineConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !(0.0..=1.0).contains(&self.default_previous_year_ratio) {
            return Err(PipelineError::Config(format!(
                "default_previous_year_ratio must be within [0, 1], got {}",
                self.default_previous_year_ratio
            )));
        }
        if self.cache.memory_capacity == 0 {
            return Err(PipelineError::Config(
                "cache.memory_capacity must be greater than 0".to_string(),
            ));
        }
        if self.llama.base_url.trim().is_empty() {
            return Err(PipelineError::Config("llama.base_url is empty".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn pregen_ttl(&self) -> Duration {
        Duration::from_secs(self.pregen_ttl_secs)
    }

    /// 第 `attempt` 次（从 0 开始）生成的温度
    pub fn temperature_for_attempt(&self, attempt: u32) -> f32 {
        (self.base_temperature + self.temperature_step * attempt as f32).min(1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_generation_retries, 2);
        assert_eq!(config.style_reference_limit, 5);
    }

    #[test]
    fn test_temperature_increases_per_attempt() {
        let config = PipelineConfig::default();
        assert!(config.temperature_for_attempt(1) > config.temperature_for_attempt(0));
        assert!(config.temperature_for_attempt(2) > config.temperature_for_attempt(1));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "generation_enabled = false\ndefault_previous_year_ratio = 0.8\n\n[llama]\nmodel = \"llama3.1:8b\"\n"
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert!(!config.generation_enabled);
        assert_eq!(config.default_previous_year_ratio, 0.8);
        assert_eq!(config.llama.model, "llama3.1:8b");
        // 未出现的字段保持默认值
        assert_eq!(config.llama.health_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let config = PipelineConfig {
            default_previous_year_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = PipelineConfig::load(Some(Path::new("/nonexistent/shuati.toml")));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
