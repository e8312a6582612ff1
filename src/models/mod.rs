//! 组卷流水线的数据模型
//! 题目、题目层级、用户历史、组卷结果与缓存条目

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 缓存条目结构版本，读取时版本不一致视为未命中
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// 选项键，固定为 A-D
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionKey {
    A,
    B,
    C,
    D,
}

impl OptionKey {
    pub const ALL: [OptionKey; 4] = [OptionKey::A, OptionKey::B, OptionKey::C, OptionKey::D];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKey::A => "A",
            OptionKey::B => "B",
            OptionKey::C => "C",
            OptionKey::D => "D",
        }
    }

    /// 解析 "A" / "b" / "C)" / "D." 之类的写法
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().count() > 3 {
            return None;
        }
        match trimmed.chars().next()?.to_ascii_uppercase() {
            'A' => Some(OptionKey::A),
            'B' => Some(OptionKey::B),
            'C' => Some(OptionKey::C),
            'D' => Some(OptionKey::D),
            _ => None,
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 难度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" | "简单" => Some(Difficulty::Easy),
            "medium" | "中等" => Some(Difficulty::Medium),
            "hard" | "困难" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

/// 题目来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionSource {
    PreviousYear,
    AiGenerated,
    Imported,
}

impl QuestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionSource::PreviousYear => "previous_year",
            QuestionSource::AiGenerated => "ai_generated",
            QuestionSource::Imported => "imported",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "previous_year" => Some(QuestionSource::PreviousYear),
            "ai_generated" => Some(QuestionSource::AiGenerated),
            "imported" => Some(QuestionSource::Imported),
            _ => None,
        }
    }

    /// 题库题（非本次生成）
    pub fn is_bank(&self) -> bool {
        !matches!(self, QuestionSource::AiGenerated)
    }
}

/// 题目数据结构（含答案，仅在流水线内部流转）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub topic_id: i64,
    pub question_text: String,
    pub options: BTreeMap<OptionKey, String>,
    pub correct_answer: OptionKey,
    pub explanation: String,
    pub difficulty: Difficulty,
    pub source: QuestionSource,
    pub rating_avg: f64,
    pub rating_count: u32,
}

/// 尚未校验的题目草稿，来自 LLM 输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuestionDraft {
    pub question_text: Option<String>,
    pub options: BTreeMap<String, String>,
    pub correct_answer: Option<String>,
    pub explanation: Option<String>,
    pub difficulty: Option<String>,
}

impl QuestionDraft {
    /// 宽松地从 JSON 对象读取草稿
    ///
    /// 接受 `question` / `question_text` 字段；选项可以是 `{"A": ..}` 对象，
    /// 也可以是按 A-D 顺序排列的数组。
    pub fn from_value(value: &serde_json::Value) -> Self {
        let text_field = |names: &[&str]| {
            names.iter().find_map(|name| {
                value
                    .get(*name)
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
            })
        };

        let mut options = BTreeMap::new();
        match value.get("options") {
            Some(serde_json::Value::Object(map)) => {
                for (key, option) in map {
                    let text = match option {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        other => other.to_string(),
                    };
                    options.insert(key.trim().to_ascii_uppercase(), text);
                }
            }
            Some(serde_json::Value::Array(items)) => {
                for (idx, option) in items.iter().enumerate().take(26) {
                    let key = ((b'A' + idx as u8) as char).to_string();
                    let text = option
                        .as_str()
                        .map(|s| s.trim().to_string())
                        .unwrap_or_else(|| option.to_string());
                    options.insert(key, text);
                }
            }
            _ => {}
        }

        Self {
            question_text: text_field(&["question", "question_text"]),
            options,
            correct_answer: text_field(&["correct_answer", "answer"]),
            explanation: text_field(&["explanation"]),
            difficulty: text_field(&["difficulty"]),
        }
    }

    /// 转为正式题目，结构不合法时返回 None（调用方应先经过校验器）
    pub fn into_question(self, topic_id: i64) -> Option<Question> {
        let mut options = BTreeMap::new();
        for key in OptionKey::ALL {
            options.insert(key, self.options.get(key.as_str())?.clone());
        }
        let correct_answer = OptionKey::parse(self.correct_answer.as_deref()?)?;
        Some(Question {
            id: 0,
            topic_id,
            question_text: self.question_text?,
            options,
            correct_answer,
            explanation: self.explanation.unwrap_or_default(),
            difficulty: self
                .difficulty
                .as_deref()
                .and_then(Difficulty::parse)
                .unwrap_or(Difficulty::Medium),
            source: QuestionSource::AiGenerated,
            rating_avg: 0.0,
            rating_count: 0,
        })
    }
}

/// 考试 / 科目 / 知识点层级
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicHierarchy {
    pub exam_id: i64,
    pub exam_name: String,
    pub subject_id: i64,
    pub subject_name: String,
    pub topic_id: i64,
    pub topic_name: String,
}

/// 用户测试历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestHistoryRecord {
    pub id: i64,
    pub user_id: i64,
    pub topic_id: i64,
    /// 0.0 - 1.0
    pub score: f64,
    pub question_ids: Vec<i64>,
    pub taken_at: DateTime<Utc>,
}

/// 成绩趋势
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// 用户表现画像，按需从历史计算，不落库
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    pub average_score: f64,
    pub trend: Trend,
    pub tests_taken: usize,
}

/// 返回给用户的题目（不含答案与解析）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub topic_id: i64,
    pub question_text: String,
    pub options: BTreeMap<OptionKey, String>,
    pub difficulty: Difficulty,
    pub source: QuestionSource,
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            topic_id: q.topic_id,
            question_text: q.question_text.clone(),
            options: q.options.clone(),
            difficulty: q.difficulty,
            source: q.source,
        }
    }
}

/// 回退链命中的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    /// 同科目下的其他知识点
    SimilarTopics,
    /// 同考试下的其他科目
    SameExam,
    /// 全局题库
    GlobalPool,
}

impl FallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackSource::SimilarTopics => "similar_topics",
            FallbackSource::SameExam => "same_exam",
            FallbackSource::GlobalPool => "global_pool",
        }
    }
}

/// 可恢复的降级原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    LlmUnavailable,
    LlmNoOutput,
    LlmRejectedAll,
    VectorSearchUnavailable,
    PersistFailed,
    InsufficientSupply,
}

/// 各难度题量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyCounts {
    pub easy: usize,
    pub medium: usize,
    pub hard: usize,
}

impl DifficultyCounts {
    pub fn from_questions<'a, I>(questions: I) -> Self
    where
        I: IntoIterator<Item = &'a Question>,
    {
        let mut counts = Self::default();
        for q in questions {
            match q.difficulty {
                Difficulty::Easy => counts.easy += 1,
                Difficulty::Medium => counts.medium += 1,
                Difficulty::Hard => counts.hard += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.easy + self.medium + self.hard
    }
}

/// 组卷元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub requested_count: usize,
    pub total_questions: usize,
    pub bank_count: usize,
    pub ai_count: usize,
    pub cached: bool,
    pub generation_time_ms: u64,
    pub fallback_used: bool,
    pub fallback_source: Option<FallbackSource>,
    pub insufficient_questions: bool,
    pub ai_generation_failed: bool,
    pub degraded: Vec<DegradeReason>,
    pub difficulty_distribution: DifficultyCounts,
}

/// 组卷结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub questions: Vec<PublicQuestion>,
    pub metadata: TestMetadata,
}

/// generate_test 的结果：成功、降级成功、或知识点不存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Ready(GeneratedTest),
    Degraded {
        test: GeneratedTest,
        reasons: Vec<DegradeReason>,
    },
    NotFound {
        topic_id: i64,
    },
}

impl TestOutcome {
    pub fn test(&self) -> Option<&GeneratedTest> {
        match self {
            TestOutcome::Ready(test) | TestOutcome::Degraded { test, .. } => Some(test),
            TestOutcome::NotFound { .. } => None,
        }
    }

    pub fn into_test(self) -> Option<GeneratedTest> {
        match self {
            TestOutcome::Ready(test) | TestOutcome::Degraded { test, .. } => Some(test),
            TestOutcome::NotFound { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TestOutcome::NotFound { .. })
    }
}

/// 预生成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PregenStatus {
    None,
    Started,
    Completed,
    Failed,
}

/// 预生成状态条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PregenStatusRecord {
    pub status: PregenStatus,
    pub job_id: String,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// 缓存条目附带的生成信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTestMeta {
    pub generated_at: DateTime<Utc>,
    pub bank_count: usize,
    pub ai_count: usize,
    pub fallback_source: Option<FallbackSource>,
    /// 生成过程出现过 AI 失败，此类条目不作为命中使用
    pub error: bool,
}

/// 缓存的组卷结果（含答案，仅内部使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTest {
    pub version: u32,
    pub questions: Vec<Question>,
    pub metadata: CachedTestMeta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_key_parse() {
        assert_eq!(OptionKey::parse("A"), Some(OptionKey::A));
        assert_eq!(OptionKey::parse(" b "), Some(OptionKey::B));
        assert_eq!(OptionKey::parse("C)"), Some(OptionKey::C));
        assert_eq!(OptionKey::parse("E"), None);
        assert_eq!(OptionKey::parse("Delta"), None);
    }

    #[test]
    fn test_draft_from_array_options() {
        let value = json!({
            "question": "Which gas do plants absorb during photosynthesis?",
            "options": ["Oxygen", "Carbon dioxide", "Nitrogen", "Helium"],
            "correct_answer": "b",
            "explanation": "Plants take in carbon dioxide and release oxygen.",
            "difficulty": "easy"
        });
        let draft = QuestionDraft::from_value(&value);
        assert_eq!(draft.options.get("B").map(String::as_str), Some("Carbon dioxide"));

        let question = draft.into_question(7).unwrap();
        assert_eq!(question.topic_id, 7);
        assert_eq!(question.correct_answer, OptionKey::B);
        assert_eq!(question.difficulty, Difficulty::Easy);
        assert_eq!(question.source, QuestionSource::AiGenerated);
    }

    #[test]
    fn test_public_question_has_no_answer() {
        let value = json!({
            "question": "What is 2 + 2 in base ten arithmetic?",
            "options": {"A": "3", "B": "4", "C": "5", "D": "22"},
            "correct_answer": "B",
            "explanation": "Two plus two equals four in base ten."
        });
        let question = QuestionDraft::from_value(&value).into_question(1).unwrap();
        let public = PublicQuestion::from(&question);
        let rendered = serde_json::to_value(&public).unwrap();
        assert!(rendered.get("correct_answer").is_none());
        assert!(rendered.get("explanation").is_none());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = TestOutcome::NotFound { topic_id: 9 };
        let rendered = serde_json::to_value(&outcome).unwrap();
        assert_eq!(rendered["status"], "not_found");
        assert_eq!(rendered["topic_id"], 9);
    }
}
