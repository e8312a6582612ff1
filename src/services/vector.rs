//! 语义检索
//! 为 AI 出题提供风格参考题，向量服务不可用时上层应降级为无参考

use crate::models::Question;
use crate::services::llama::TextEmbedder;
use anyhow::{Error, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 相似题目命中
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarQuestion {
    pub question_id: i64,
    pub topic_id: i64,
    pub question_text: String,
    pub score: f32,
}

/// 相似题检索接口
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// 按语义相似度降序返回，`topic_filter` 限定知识点
    async fn search_similar(
        &self,
        query: &str,
        topic_filter: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SimilarQuestion>>;
}

/// 空检索，总是返回无结果
pub struct NoopVectorSearch;

#[async_trait]
impl VectorSearch for NoopVectorSearch {
    async fn search_similar(
        &self,
        _query: &str,
        _topic_filter: Option<i64>,
        _limit: usize,
    ) -> Result<Vec<SimilarQuestion>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
struct IndexedQuestion {
    question_id: i64,
    topic_id: i64,
    question_text: String,
    embedding: Vec<f32>,
}

/// 基于嵌入向量的内存索引
pub struct EmbeddingIndex {
    embedder: Arc<dyn TextEmbedder>,
    entries: RwLock<Vec<IndexedQuestion>>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 为题目生成嵌入并写入索引，已存在的题目会被替换
    pub async fn index_questions(&self, questions: &[Question]) -> Result<usize> {
        let mut fresh = Vec::with_capacity(questions.len());
        for q in questions {
            let embedding = self.embedder.embed(&q.question_text).await?;
            fresh.push(IndexedQuestion {
                question_id: q.id,
                topic_id: q.topic_id,
                question_text: q.question_text.clone(),
                embedding,
            });
        }

        let count = fresh.len();
        let mut entries = self.entries.write().await;
        entries.retain(|e| !fresh.iter().any(|f| f.question_id == e.question_id));
        entries.extend(fresh);
        info!("[vector] indexed {} questions ({} total)", count, entries.len());
        Ok(count)
    }
}

#[async_trait]
impl VectorSearch for EmbeddingIndex {
    async fn search_similar(
        &self,
        query: &str,
        topic_filter: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SimilarQuestion>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates: Vec<IndexedQuestion> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|e| topic_filter.map_or(true, |t| e.topic_id == t))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        // 打分是纯计算，放到阻塞线程池
        let hits = tokio::task::spawn_blocking(move || {
            let mut scored: Vec<SimilarQuestion> = candidates
                .into_iter()
                .map(|e| SimilarQuestion {
                    score: cosine_similarity(&query_embedding, &e.embedding),
                    question_id: e.question_id,
                    topic_id: e.topic_id,
                    question_text: e.question_text,
                })
                .collect();
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(limit);
            scored
        })
        .await
        .map_err(|e| Error::msg(format!("similarity scoring task failed: {}", e)))?;

        debug!("[vector] {} hits for query", hits.len());
        Ok(hits)
    }
}

/// 余弦相似度，维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
