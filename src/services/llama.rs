//! 本地推理服务客户端
//! 提供存活探测、JSON 约束生成和文本嵌入，生成失败一律降级为 None

use crate::config::LlamaConfig;
use crate::utils::json::parse_llm_json;
use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// 题目生成能力，流水线只依赖这一接口
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    /// 存活探测，使用独立的短超时
    async fn is_available(&self) -> bool;

    /// 请求 JSON 输出并尽力解析，任何失败返回 None
    async fn generate_json(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Option<Value>;
}

/// 文本嵌入能力
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Generate 请求
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

/// Generate 响应
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// 推理服务客户端
#[derive(Clone)]
pub struct LlamaClient {
    config: LlamaConfig,
    http_client: Arc<reqwest::Client>,
}

impl LlamaClient {
    pub fn new(config: LlamaConfig) -> Self {
        Self {
            config,
            http_client: Arc::new(reqwest::Client::new()),
        }
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// 健康检查
    pub async fn is_healthy(&self) -> bool {
        let url = self.url("/");
        match self
            .http_client
            .get(&url)
            .timeout(self.config.health_timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("[llama] health check failed: {}", e);
                false
            }
        }
    }

    /// 生成原始文本，`json_mode` 时要求服务端约束 JSON 输出
    pub async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String, Error> {
        let start_time = Instant::now();
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            system: system_prompt.filter(|s| !s.is_empty()),
            format: json_mode.then_some("json"),
            stream: false,
            options: GenerateOptions { temperature },
        };

        let response = self
            .http_client
            .post(self.url("/api/generate"))
            .timeout(self.config.request_timeout())
            .json(&request)
            .send()
            .await
            .context("generate request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::msg(format!("generate returned HTTP {}", status)));
        }

        let body = response
            .json::<GenerateResponse>()
            .await
            .context("generate response is not valid JSON")?;

        debug!(
            "[llama] generated {} tokens in {}ms",
            body.eval_count,
            start_time.elapsed().as_millis()
        );
        Ok(body.response)
    }

    /// 获取文本嵌入向量
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, Error> {
        let response = self
            .http_client
            .post(self.url("/api/embeddings"))
            .timeout(self.config.request_timeout())
            .json(&EmbedRequest {
                model: &self.config.embedding_model,
                prompt: text,
            })
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::msg(format!("embedding returned HTTP {}", status)));
        }

        let body = response.json::<EmbedResponse>().await?;
        if body.embedding.is_empty() {
            return Err(Error::msg("Failed to parse embedding response"));
        }
        Ok(body.embedding)
    }
}

#[async_trait]
impl QuestionGenerator for LlamaClient {
    async fn is_available(&self) -> bool {
        self.is_healthy().await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
    ) -> Option<Value> {
        let text = match self
            .generate(prompt, Some(system_prompt), temperature, true)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!("[llama] generation failed: {:#}", e);
                return None;
            }
        };

        let parsed = parse_llm_json(&text);
        if parsed.is_none() {
            warn!(
                "[llama] no parseable JSON in response ({} chars)",
                text.chars().count()
            );
        }
        parsed
    }
}

#[async_trait]
impl TextEmbedder for LlamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_text(text).await
    }
}
