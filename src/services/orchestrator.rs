//! 组卷流水线
//!
//! 缓存检查 -> 题库抓取 -> AI 出题 -> 入库 -> 补题 -> 自适应选题 -> 格式化。
//! 只有知识点不存在是对外的失败，持久化层读取故障作为 `PipelineError::Storage` 返回，
//! LLM、向量检索、缓存、入库的故障全部在内部降级并记录在元数据中。

use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::models::{
    CachedTest, CachedTestMeta, DegradeReason, Difficulty, DifficultyCounts,
    GeneratedTest, PerformanceProfile, PregenStatusRecord, PublicQuestion, Question,
    QuestionDraft, QuestionSource, TestMetadata, TestOutcome, TopicHierarchy,
    CACHE_SCHEMA_VERSION,
};
use crate::services::cache::{CacheMetricsSnapshot, TieredCache};
use crate::services::llama::QuestionGenerator;
use crate::services::pregen::{self, PregenJob, PregenQueue};
use crate::services::prompt::QuestionPrompt;
use crate::services::repository::{QuestionRepository, QuestionStore, SessionFactory};
use crate::services::selector::AdaptiveSelector;
use crate::services::validator::QualityValidator;
use crate::services::vector::VectorSearch;
use crate::utils::truncate_chars;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 风格参考题干的最大长度
const STYLE_REFERENCE_CHARS: usize = 200;
/// 排除列表中单条摘要的最大长度
const EXCLUSION_SUMMARY_CHARS: usize = 80;

/// 组卷缓存键
pub fn test_cache_key(topic_id: i64, user_id: i64) -> String {
    format!("test:{}:{}", topic_id, user_id)
}

/// 预生成状态键
pub fn pregen_status_key(topic_id: i64, user_id: i64) -> String {
    format!("test:{}:{}:pregen-status", topic_id, user_id)
}

/// 流水线累计指标
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub tests_generated: AtomicU64,
    pub ai_generated_questions: AtomicU64,
    pub ai_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub pregen_started: AtomicU64,
    pub pregen_completed: AtomicU64,
    pub pregen_failed: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

impl PipelineMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_test(&self, elapsed_ms: u64) {
        Self::incr(&self.tests_generated);
        self.total_latency_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub(crate) fn pregen_started(&self) {
        Self::incr(&self.pregen_started);
    }

    pub(crate) fn pregen_finished(&self, ok: bool) {
        if ok {
            Self::incr(&self.pregen_completed);
        } else {
            Self::incr(&self.pregen_failed);
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tests_generated: u64,
    pub ai_generated_questions: u64,
    pub ai_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pregen_started: u64,
    pub pregen_completed: u64,
    pub pregen_failed: u64,
    pub average_latency_ms: f64,
    pub cache: CacheMetricsSnapshot,
}

/// 应用上下文：流水线依赖的全部外部句柄，由调用方显式注入
#[derive(Clone)]
pub struct AppContext {
    pub config: PipelineConfig,
    pub cache: Arc<TieredCache>,
    pub generator: Arc<dyn QuestionGenerator>,
    pub vector: Arc<dyn VectorSearch>,
    pub sessions: Arc<dyn SessionFactory>,
    pub metrics: Arc<PipelineMetrics>,
}

impl AppContext {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<TieredCache>,
        generator: Arc<dyn QuestionGenerator>,
        vector: Arc<dyn VectorSearch>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            cache,
            generator,
            vector,
            sessions,
            metrics: Arc::new(PipelineMetrics::default()),
        }
    }
}

/// 一次组卷请求
#[derive(Debug, Clone, PartialEq)]
pub struct TestRequest {
    pub topic_id: i64,
    pub user_id: i64,
    pub count: usize,
    pub previous_year_ratio: Option<f64>,
    pub exclude_ids: Vec<i64>,
}

/// 缓存使用方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheMode {
    /// 先读缓存，结果按常规 TTL 写回
    ReadThrough,
    /// 跳过读取，结果按预生成 TTL 写回
    Refresh,
}

struct AiBatch {
    questions: Vec<Question>,
    reasons: Vec<DegradeReason>,
    failed: bool,
}

/// 组卷编排器
pub struct Orchestrator {
    ctx: Arc<AppContext>,
    repo: QuestionRepository,
    pregen: Option<PregenQueue>,
}

impl Orchestrator {
    /// `store` 是请求作用域内的会话，后台预生成不会复用它
    pub fn new(ctx: Arc<AppContext>, store: Arc<dyn QuestionStore>) -> Self {
        Self {
            ctx,
            repo: QuestionRepository::new(store),
            pregen: None,
        }
    }

    /// 预生成任务交给独立队列串行执行
    pub fn with_pregen(mut self, queue: PregenQueue) -> Self {
        self.pregen = Some(queue);
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// 组卷入口
    pub async fn generate_test(
        &self,
        topic_id: i64,
        user_id: i64,
        question_count: usize,
        previous_year_ratio: Option<f64>,
        exclude_ids: &[i64],
    ) -> PipelineResult<TestOutcome> {
        let request = TestRequest {
            topic_id,
            user_id,
            count: question_count,
            previous_year_ratio,
            exclude_ids: exclude_ids.to_vec(),
        };
        self.run_pipeline(&request, CacheMode::ReadThrough).await
    }

    /// 后台预生成，调用方不等待结果
    pub async fn pre_generate(&self, topic_id: i64, user_id: i64, question_count: usize) {
        let job = PregenJob::new(topic_id, user_id, question_count);
        match &self.pregen {
            Some(queue) => {
                queue.submit(job);
            }
            None => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    pregen::run_job(ctx, job).await;
                });
            }
        }
    }

    /// 查询预生成状态
    pub async fn pregen_status(&self, topic_id: i64, user_id: i64) -> Option<PregenStatusRecord> {
        self.ctx
            .cache
            .get_json(&pregen_status_key(topic_id, user_id))
            .await
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let m = &self.ctx.metrics;
        let tests_generated = m.tests_generated.load(Ordering::Relaxed);
        let total_latency = m.total_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            tests_generated,
            ai_generated_questions: m.ai_generated_questions.load(Ordering::Relaxed),
            ai_failures: m.ai_failures.load(Ordering::Relaxed),
            cache_hits: m.cache_hits.load(Ordering::Relaxed),
            cache_misses: m.cache_misses.load(Ordering::Relaxed),
            pregen_started: m.pregen_started.load(Ordering::Relaxed),
            pregen_completed: m.pregen_completed.load(Ordering::Relaxed),
            pregen_failed: m.pregen_failed.load(Ordering::Relaxed),
            average_latency_ms: if tests_generated == 0 {
                0.0
            } else {
                total_latency as f64 / tests_generated as f64
            },
            cache: self.ctx.cache.metrics(),
        }
    }

    /// 等待队列中的预生成任务全部结束
    pub async fn shutdown(self) {
        if let Some(queue) = self.pregen {
            queue.shutdown().await;
        }
    }

    pub(crate) async fn run_pipeline(
        &self,
        request: &TestRequest,
        mode: CacheMode,
    ) -> PipelineResult<TestOutcome> {
        let start_time = Instant::now();
        let config = &self.ctx.config;
        let count = request.count;
        let key = test_cache_key(request.topic_id, request.user_id);
        let explicit_exclude: HashSet<i64> = request.exclude_ids.iter().copied().collect();

        // 1. 缓存检查
        if mode == CacheMode::ReadThrough {
            if let Some(cached) = self.cached_test(&key, count, &explicit_exclude).await {
                PipelineMetrics::incr(&self.ctx.metrics.cache_hits);
                let elapsed_ms = start_time.elapsed().as_millis() as u64;
                self.ctx.metrics.record_test(elapsed_ms);
                let mut metadata = base_metadata(&cached.questions, count, elapsed_ms);
                metadata.cached = true;
                metadata.fallback_used = cached.metadata.fallback_source.is_some();
                metadata.fallback_source = cached.metadata.fallback_source;
                info!(
                    "[pipeline] topic {} user {}: served {} questions from cache",
                    request.topic_id,
                    request.user_id,
                    cached.questions.len()
                );
                return Ok(TestOutcome::Ready(format_test(&cached.questions, metadata)));
            }
            PipelineMetrics::incr(&self.ctx.metrics.cache_misses);
        }

        // 2. 题库抓取
        let hierarchy = match self.repo.topic_hierarchy(request.topic_id).await? {
            Some(h) => h,
            None => {
                warn!("[pipeline] topic {} not found", request.topic_id);
                return Ok(TestOutcome::NotFound {
                    topic_id: request.topic_id,
                });
            }
        };

        let history = self
            .repo
            .user_history(request.user_id, request.topic_id)
            .await?;
        let profile = PerformanceProfile::from_history(&history);
        let mut seen = explicit_exclude.clone();
        seen.extend(history.iter().flat_map(|r| r.question_ids.iter().copied()));

        let mut reasons = Vec::new();
        let generating = if config.generation_enabled {
            let available = self.ctx.generator.is_available().await;
            if !available {
                warn!("[pipeline] LLM unavailable, using question bank only");
                reasons.push(DegradeReason::LlmUnavailable);
            }
            available
        } else {
            false
        };

        let ratio = request
            .previous_year_ratio
            .unwrap_or(config.default_previous_year_ratio)
            .clamp(0.0, 1.0);
        let bank_target = if generating {
            ((count as f64) * ratio).round() as usize
        } else {
            count
        }
        .min(count);
        let ai_target = if generating { count - bank_target } else { 0 };

        let mut fetch = self
            .repo
            .fetch_with_fallback(&hierarchy, bank_target, &seen)
            .await?;
        debug!(
            "[pipeline] bank target {} got {}, ai target {}",
            bank_target,
            fetch.questions.len(),
            ai_target
        );

        // 3./4. AI 出题并入库
        let mut ai_failed = false;
        let mut ai_questions = Vec::new();
        if ai_target > 0 {
            let batch = self
                .generate_ai(&hierarchy, ai_target, &fetch.questions, &profile)
                .await;
            ai_failed = batch.failed;
            reasons.extend(batch.reasons);
            ai_questions = batch.questions;
        }

        let primary_supplied = !fetch.questions.is_empty();
        let mut pool = std::mem::take(&mut fetch.questions);
        pool.extend(ai_questions);

        // 5. 补题
        if pool.len() < count {
            let need = count - pool.len();
            let mut exclude = seen.clone();
            exclude.extend(pool.iter().map(|q| q.id));

            let extra = if !primary_supplied && fetch.fallback.is_none() {
                // 主范围没有供题，回退链也还没跑过，按完整回退链补
                let refill = self
                    .repo
                    .fetch_with_fallback(&hierarchy, need, &exclude)
                    .await?;
                fetch.scope = refill.scope;
                fetch.fallback = refill.fallback;
                refill.questions
            } else {
                self.repo
                    .fetch_bank_questions(fetch.scope, need, &exclude)
                    .await?
            };
            debug!("[pipeline] backfill supplied {} of {}", extra.len(), need);
            pool.extend(extra);
        }

        // 最后一次兜底：放开历史排除，只排除已选和显式排除的题目
        if pool.len() < count {
            let need = count - pool.len();
            let mut exclude = explicit_exclude.clone();
            exclude.extend(pool.iter().map(|q| q.id));
            let extra = self
                .repo
                .fetch_bank_questions(fetch.scope, need, &exclude)
                .await?;
            if !extra.is_empty() {
                debug!("[pipeline] safety fetch supplied {} previously seen", extra.len());
            }
            pool.extend(extra);
        }

        let insufficient = pool.len() < count;
        if insufficient {
            warn!(
                "[pipeline] topic {}: only {} of {} questions available",
                request.topic_id,
                pool.len(),
                count
            );
            reasons.push(DegradeReason::InsufficientSupply);
        }

        // 6. 自适应选题
        let selected = AdaptiveSelector::select(pool, &profile, count);

        // 7. 格式化
        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        let mut metadata = base_metadata(&selected, count, elapsed_ms);
        metadata.fallback_used = fetch.fallback.is_some();
        metadata.fallback_source = fetch.fallback;
        metadata.insufficient_questions = insufficient;
        metadata.ai_generation_failed = ai_failed;
        metadata.degraded = reasons.clone();

        if !selected.is_empty() {
            let ttl = match mode {
                CacheMode::ReadThrough => config.cache_ttl(),
                CacheMode::Refresh => config.pregen_ttl(),
            };
            self.store_cached(&key, &selected, &metadata, ttl).await;
        }

        self.ctx.metrics.record_test(elapsed_ms);
        info!(
            "[pipeline] topic {} user {}: {} questions ({} bank, {} ai) in {}ms",
            request.topic_id,
            request.user_id,
            metadata.total_questions,
            metadata.bank_count,
            metadata.ai_count,
            elapsed_ms
        );

        let test = format_test(&selected, metadata);
        if reasons.is_empty() {
            Ok(TestOutcome::Ready(test))
        } else {
            Ok(TestOutcome::Degraded { test, reasons })
        }
    }

    async fn cached_test(
        &self,
        key: &str,
        count: usize,
        exclude: &HashSet<i64>,
    ) -> Option<CachedTest> {
        let mut cached: CachedTest = self.ctx.cache.get_json(key).await?;
        if cached.version != CACHE_SCHEMA_VERSION {
            debug!("[pipeline] ignoring cache entry {} with version {}", key, cached.version);
            return None;
        }
        if cached.metadata.error {
            return None;
        }
        cached.questions.retain(|q| !exclude.contains(&q.id));
        if count == 0 || cached.questions.len() < count {
            return None;
        }
        cached.questions.truncate(count);
        Some(cached)
    }

    async fn store_cached(
        &self,
        key: &str,
        questions: &[Question],
        metadata: &TestMetadata,
        ttl: Duration,
    ) {
        let entry = CachedTest {
            version: CACHE_SCHEMA_VERSION,
            questions: questions.to_vec(),
            metadata: CachedTestMeta {
                generated_at: Utc::now(),
                bank_count: metadata.bank_count,
                ai_count: metadata.ai_count,
                fallback_source: metadata.fallback_source,
                error: metadata.insufficient_questions,
            },
        };
        self.ctx.cache.set_json(key, &entry, ttl).await;
    }

    async fn generate_ai(
        &self,
        hierarchy: &TopicHierarchy,
        target: usize,
        bank_pool: &[Question],
        profile: &PerformanceProfile,
    ) -> AiBatch {
        let config = &self.ctx.config;
        let metrics = &self.ctx.metrics;
        let mut reasons = Vec::new();

        let query = format!("{} {}", hierarchy.subject_name, hierarchy.topic_name);
        let style_references: Vec<String> = match self
            .ctx
            .vector
            .search_similar(&query, Some(hierarchy.topic_id), config.style_reference_limit)
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .take(config.style_reference_limit)
                .map(|h| truncate_chars(&h.question_text, STYLE_REFERENCE_CHARS))
                .collect(),
            Err(e) => {
                warn!("[pipeline] vector search failed, no style references: {:#}", e);
                reasons.push(DegradeReason::VectorSearchUnavailable);
                Vec::new()
            }
        };

        let exclusions: Vec<String> = bank_pool
            .iter()
            .take(config.exclusion_summary_limit)
            .map(|q| truncate_chars(&q.question_text, EXCLUSION_SUMMARY_CHARS))
            .collect();

        let prompt = QuestionPrompt::generate_questions(
            hierarchy,
            target,
            difficulty_hint(profile),
            &style_references,
            &exclusions,
        );

        let mut response = None;
        for attempt in 0..=config.max_generation_retries {
            let temperature = config.temperature_for_attempt(attempt);
            response = self
                .ctx
                .generator
                .generate_json(&prompt, QuestionPrompt::system(), temperature)
                .await;
            if response.is_some() {
                break;
            }
            warn!(
                "[pipeline] generation attempt {} (temperature {:.2}) produced no output",
                attempt + 1,
                temperature
            );
        }

        let failed = |mut reasons: Vec<DegradeReason>, reason: DegradeReason| {
            PipelineMetrics::incr(&metrics.ai_failures);
            reasons.push(reason);
            AiBatch {
                questions: Vec::new(),
                reasons,
                failed: true,
            }
        };

        let value = match response {
            Some(v) => v,
            None => return failed(reasons, DegradeReason::LlmNoOutput),
        };

        let drafts: Vec<QuestionDraft> = match &value {
            Value::Array(items) => items.iter().map(QuestionDraft::from_value).collect(),
            Value::Object(_) => vec![QuestionDraft::from_value(&value)],
            _ => Vec::new(),
        };
        let batch = QualityValidator::validate_batch(drafts, config.strict_validation);
        for (idx, error) in &batch.invalid {
            debug!("[pipeline] rejected generated question #{}: {}", idx, error);
        }

        // 与本次题库题目及彼此之间去重
        let mut fresh_texts: HashSet<String> = bank_pool
            .iter()
            .map(|q| q.question_text.to_lowercase())
            .collect();
        let candidates: Vec<Question> = batch
            .valid
            .into_iter()
            .filter_map(|d| d.into_question(hierarchy.topic_id))
            .filter(|q| fresh_texts.insert(q.question_text.to_lowercase()))
            .take(target)
            .collect();
        if candidates.is_empty() {
            warn!(
                "[pipeline] all {} generated questions failed validation",
                batch.invalid.len()
            );
            return failed(reasons, DegradeReason::LlmRejectedAll);
        }

        match self.repo.insert_questions(&candidates).await {
            Ok(saved) => {
                metrics
                    .ai_generated_questions
                    .fetch_add(saved.len() as u64, Ordering::Relaxed);
                info!(
                    "[pipeline] persisted {} generated questions for topic {}",
                    saved.len(),
                    hierarchy.topic_id
                );
                AiBatch {
                    questions: saved,
                    reasons,
                    failed: false,
                }
            }
            Err(e) => {
                warn!("[pipeline] failed to persist generated questions, dropping batch: {:#}", e);
                failed(reasons, DegradeReason::PersistFailed)
            }
        }
    }
}

fn difficulty_hint(profile: &PerformanceProfile) -> Option<Difficulty> {
    if profile.tests_taken == 0 {
        None
    } else if profile.average_score < 0.4 {
        Some(Difficulty::Easy)
    } else if profile.average_score >= 0.7 {
        Some(Difficulty::Hard)
    } else {
        None
    }
}

fn base_metadata(questions: &[Question], requested: usize, elapsed_ms: u64) -> TestMetadata {
    let bank_count = questions.iter().filter(|q| q.source.is_bank()).count();
    TestMetadata {
        requested_count: requested,
        total_questions: questions.len(),
        bank_count,
        ai_count: questions
            .iter()
            .filter(|q| q.source == QuestionSource::AiGenerated)
            .count(),
        cached: false,
        generation_time_ms: elapsed_ms,
        fallback_used: false,
        fallback_source: None,
        insufficient_questions: false,
        ai_generation_failed: false,
        degraded: Vec::new(),
        difficulty_distribution: DifficultyCounts::from_questions(questions),
    }
}

/// 去掉答案与解析等内部字段
fn format_test(questions: &[Question], metadata: TestMetadata) -> GeneratedTest {
    GeneratedTest {
        questions: questions.iter().map(PublicQuestion::from).collect(),
        metadata,
    }
}
