//! 后台预生成
//!
//! 预生成任务脱离发起请求独立运行：每个任务通过 `SessionFactory` 打开自己的持久化会话，
//! 队列中的任务按提交顺序串行执行，同一 (知识点, 用户) 的重复提交不会交错写缓存。

use crate::models::{PregenStatus, PregenStatusRecord, TestOutcome};
use crate::services::orchestrator::{
    pregen_status_key, AppContext, CacheMode, Orchestrator, TestRequest,
};
use anyhow::Error;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// 队列容量
const QUEUE_CAPACITY: usize = 100;

/// 预生成任务
#[derive(Debug, Clone, PartialEq)]
pub struct PregenJob {
    pub job_id: String,
    pub topic_id: i64,
    pub user_id: i64,
    pub count: usize,
}

impl PregenJob {
    pub fn new(topic_id: i64, user_id: i64, count: usize) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            topic_id,
            user_id,
            count,
        }
    }
}

/// 预生成队列
pub struct PregenQueue {
    sender: mpsc::Sender<PregenJob>,
    worker: JoinHandle<()>,
}

impl PregenQueue {
    /// 启动后台 worker
    pub fn spawn(ctx: Arc<AppContext>) -> Self {
        Self::with_capacity(ctx, QUEUE_CAPACITY)
    }

    pub fn with_capacity(ctx: Arc<AppContext>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<PregenJob>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_job(ctx.clone(), job).await;
            }
            info!("[pregen] queue closed");
        });

        Self { sender, worker }
    }

    /// 入队，不等待空位。队列满或已关闭时丢弃任务并记录日志，返回是否入队成功
    pub fn submit(&self, job: PregenJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    "[pregen] queue full, dropping job {} for topic {} user {}",
                    job.job_id, job.topic_id, job.user_id
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!("[pregen] queue closed, dropping job {}", job.job_id);
                false
            }
        }
    }

    /// 关闭入口并等待已入队任务执行完
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            error!("[pregen] worker terminated abnormally: {}", e);
        }
    }
}

/// 执行一个预生成任务，任何失败只更新状态记录
pub(crate) async fn run_job(ctx: Arc<AppContext>, job: PregenJob) {
    let status_key = pregen_status_key(job.topic_id, job.user_id);

    ctx.metrics.pregen_started();
    write_status(&ctx, &status_key, &job, PregenStatus::Started, None).await;

    let result = execute(ctx.clone(), &job).await;
    match result {
        Ok(questions) => {
            info!(
                "[pregen] job {} cached {} questions for topic {} user {}",
                job.job_id, questions, job.topic_id, job.user_id
            );
            ctx.metrics.pregen_finished(true);
            write_status(&ctx, &status_key, &job, PregenStatus::Completed, None).await;
        }
        Err(e) => {
            warn!("[pregen] job {} failed: {:#}", job.job_id, e);
            ctx.metrics.pregen_finished(false);
            write_status(
                &ctx,
                &status_key,
                &job,
                PregenStatus::Failed,
                Some(format!("{:#}", e)),
            )
            .await;
        }
    }
}

async fn execute(ctx: Arc<AppContext>, job: &PregenJob) -> Result<usize, Error> {
    // 独立会话，不借用发起请求的事务范围
    let store = ctx.sessions.open().await?;
    let orchestrator = Orchestrator::new(ctx, store);
    let request = TestRequest {
        topic_id: job.topic_id,
        user_id: job.user_id,
        count: job.count,
        previous_year_ratio: None,
        exclude_ids: Vec::new(),
    };

    let outcome = orchestrator
        .run_pipeline(&request, CacheMode::Refresh)
        .await?;

    match outcome {
        TestOutcome::NotFound { topic_id } => {
            Err(Error::msg(format!("topic {} not found", topic_id)))
        }
        TestOutcome::Ready(test) | TestOutcome::Degraded { test, .. } => {
            if test.questions.is_empty() {
                Err(Error::msg("no questions available"))
            } else if test.metadata.insufficient_questions {
                // 供给不足的结果带 error 标记写入缓存，之后不会命中
                Err(Error::msg(format!(
                    "insufficient supply: {} of {} questions",
                    test.questions.len(),
                    job.count
                )))
            } else {
                Ok(test.questions.len())
            }
        }
    }
}

async fn write_status(
    ctx: &AppContext,
    key: &str,
    job: &PregenJob,
    status: PregenStatus,
    error: Option<String>,
) {
    let record = PregenStatusRecord {
        status,
        job_id: job.job_id.clone(),
        updated_at: Utc::now(),
        error,
    };
    ctx.cache.set_json(key, &record, ctx.config.pregen_ttl()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::services::cache::TieredCache;
    use crate::services::llama::QuestionGenerator;
    use crate::services::repository::{QuestionStore, SessionFactory};
    use crate::services::vector::NoopVectorSearch;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    struct OfflineGenerator;

    #[async_trait]
    impl QuestionGenerator for OfflineGenerator {
        async fn is_available(&self) -> bool {
            false
        }

        async fn generate_json(&self, _p: &str, _s: &str, _t: f32) -> Option<Value> {
            None
        }
    }

    struct BrokenSessions;

    #[async_trait]
    impl SessionFactory for BrokenSessions {
        async fn open(&self) -> anyhow::Result<Arc<dyn QuestionStore>> {
            Err(Error::msg("database locked"))
        }
    }

    /// 打开会话时阻塞，直到测试放行
    struct GatedSessions {
        entered: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl SessionFactory for GatedSessions {
        async fn open(&self) -> anyhow::Result<Arc<dyn QuestionStore>> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await?;
            Err(Error::msg("database locked"))
        }
    }

    fn context_with(sessions: Arc<dyn SessionFactory>) -> Arc<AppContext> {
        Arc::new(AppContext::new(
            PipelineConfig::default(),
            Arc::new(TieredCache::memory_only(16, Duration::from_secs(60))),
            Arc::new(OfflineGenerator),
            Arc::new(NoopVectorSearch),
            sessions,
        ))
    }

    fn context() -> Arc<AppContext> {
        context_with(Arc::new(BrokenSessions))
    }

    #[tokio::test]
    async fn test_session_failure_marks_job_failed() {
        let ctx = context();
        let queue = PregenQueue::spawn(ctx.clone());
        let job = PregenJob::new(3, 4, 5);
        let job_id = job.job_id.clone();
        assert!(queue.submit(job));
        queue.shutdown().await;

        let record: PregenStatusRecord = ctx
            .cache
            .get_json(&pregen_status_key(3, 4))
            .await
            .unwrap();
        assert_eq!(record.status, PregenStatus::Failed);
        assert_eq!(record.job_id, job_id);
        assert!(record.error.unwrap().contains("database locked"));
        assert_eq!(ctx.metrics.pregen_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_job_without_waiting() {
        let sessions = Arc::new(GatedSessions {
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        let ctx = context_with(sessions.clone());
        let queue = PregenQueue::with_capacity(ctx.clone(), 1);

        // worker 卡在第一个任务上，第二个占满通道
        assert!(queue.submit(PregenJob::new(1, 1, 5)));
        sessions.entered.notified().await;
        assert!(queue.submit(PregenJob::new(2, 1, 5)));
        assert!(!queue.submit(PregenJob::new(3, 1, 5)));

        sessions.gate.add_permits(2);
        tokio::time::timeout(Duration::from_secs(5), queue.shutdown())
            .await
            .expect("worker should drain after the gate opens");

        assert_eq!(ctx.metrics.pregen_started.load(Ordering::Relaxed), 2);
        assert!(ctx
            .cache
            .get_json::<PregenStatusRecord>(&pregen_status_key(3, 1))
            .await
            .is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = PregenJob::new(1, 1, 10);
        let b = PregenJob::new(1, 1, 10);
        assert_ne!(a.job_id, b.job_id);
    }
}
