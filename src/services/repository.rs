//! 题库访问与回退链
//!
//! `QuestionStore` 是持久化层需要提供的窄接口；`QuestionRepository` 在其上实现
//! 过采样后随机抽样，以及知识点无题时的三级回退：同科目 -> 同考试 -> 全局题库。

use crate::models::{FallbackSource, Question, TestHistoryRecord, TopicHierarchy};
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;

/// 过采样下限
const MIN_OVERSAMPLE: usize = 50;
/// 过采样倍数
const OVERSAMPLE_FACTOR: usize = 3;

/// 题库查询范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankScope {
    Topic(i64),
    Subject(i64),
    Exam(i64),
    Global,
}

/// 题库查询条件
#[derive(Debug, Clone, PartialEq)]
pub struct BankFilter {
    pub scope: BankScope,
    pub exclude_ids: Vec<i64>,
}

/// 持久化层接口，全部为异步调用，只在基础设施故障时返回错误
#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn fetch_topic_hierarchy(&self, topic_id: i64) -> Result<Option<TopicHierarchy>>;

    async fn fetch_bank_questions(&self, filter: &BankFilter, limit: usize) -> Result<Vec<Question>>;

    /// 按时间从早到晚返回
    async fn fetch_user_test_history(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> Result<Vec<TestHistoryRecord>>;

    /// 单个事务写入，任一失败整体回滚；返回带正式 id 的题目
    async fn insert_questions(&self, batch: &[Question]) -> Result<Vec<Question>>;
}

/// 打开独立的持久化会话
///
/// 后台任务的生命周期长于发起它的请求，必须通过这里拿到自己的会话。
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn QuestionStore>>;
}

/// 一次题库抓取的结果
#[derive(Debug, Clone)]
pub struct BankFetch {
    pub questions: Vec<Question>,
    /// 实际提供题目的范围，补题时沿用
    pub scope: BankScope,
    pub fallback: Option<FallbackSource>,
}

/// 题库访问
#[derive(Clone)]
pub struct QuestionRepository {
    store: Arc<dyn QuestionStore>,
}

impl QuestionRepository {
    pub fn new(store: Arc<dyn QuestionStore>) -> Self {
        Self { store }
    }

    pub async fn topic_hierarchy(&self, topic_id: i64) -> Result<Option<TopicHierarchy>> {
        self.store.fetch_topic_hierarchy(topic_id).await
    }

    pub async fn user_history(&self, user_id: i64, topic_id: i64) -> Result<Vec<TestHistoryRecord>> {
        self.store.fetch_user_test_history(user_id, topic_id).await
    }

    pub async fn insert_questions(&self, batch: &[Question]) -> Result<Vec<Question>> {
        self.store.insert_questions(batch).await
    }

    /// 从指定范围取题：先过采样再均匀抽样，避免固定排序带来的偏差
    pub async fn fetch_bank_questions(
        &self,
        scope: BankScope,
        count: usize,
        exclude_ids: &HashSet<i64>,
    ) -> Result<Vec<Question>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let limit = (count * OVERSAMPLE_FACTOR).max(MIN_OVERSAMPLE);
        let mut exclude: Vec<i64> = exclude_ids.iter().copied().collect();
        exclude.sort_unstable();
        let filter = BankFilter {
            scope,
            exclude_ids: exclude,
        };

        let mut pool = self.store.fetch_bank_questions(&filter, limit).await?;
        // 持久化层可能不支持排除条件，这里再保证一次
        pool.retain(|q| !exclude_ids.contains(&q.id));

        let mut rng = rand::thread_rng();
        pool.shuffle(&mut rng);
        pool.truncate(count);
        debug!("[repository] {:?}: sampled {} of requested {}", scope, pool.len(), count);
        Ok(pool)
    }

    /// 先查知识点本身，为空时依次回退
    pub async fn fetch_with_fallback(
        &self,
        hierarchy: &TopicHierarchy,
        count: usize,
        exclude_ids: &HashSet<i64>,
    ) -> Result<BankFetch> {
        let primary = BankScope::Topic(hierarchy.topic_id);
        let questions = self.fetch_bank_questions(primary, count, exclude_ids).await?;
        if !questions.is_empty() || count == 0 {
            return Ok(BankFetch {
                questions,
                scope: primary,
                fallback: None,
            });
        }

        let chain = [
            (BankScope::Subject(hierarchy.subject_id), FallbackSource::SimilarTopics),
            (BankScope::Exam(hierarchy.exam_id), FallbackSource::SameExam),
            (BankScope::Global, FallbackSource::GlobalPool),
        ];

        for (scope, source) in chain {
            let questions = self.fetch_bank_questions(scope, count, exclude_ids).await?;
            if !questions.is_empty() {
                info!(
                    "[repository] topic {} has no bank questions, fallback {} supplied {}",
                    hierarchy.topic_id,
                    source.as_str(),
                    questions.len()
                );
                return Ok(BankFetch {
                    questions,
                    scope,
                    fallback: Some(source),
                });
            }
        }

        Ok(BankFetch {
            questions: Vec::new(),
            scope: primary,
            fallback: None,
        })
    }
}
