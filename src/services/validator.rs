//! 生成题目的质量校验
//! 结构 -> 选项 -> 答案 -> 解析 -> 内容 -> 语言，结构类问题直接短路返回

use crate::models::{OptionKey, QuestionDraft};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

const MIN_OPTION_CHARS: usize = 2;
const MIN_EXPLANATION_CHARS: usize = 20;
const MIN_QUESTION_CHARS: usize = 15;

/// "以上都对" 类选项，只有作为正确答案时才允许
const CATCH_ALL_OPTIONS: &[&str] = &[
    "all of the above",
    "none of the above",
    "both of the above",
    "neither of the above",
    "all of these",
    "none of these",
    "以上都对",
    "以上都不对",
    "以上皆是",
    "以上皆非",
];

/// 模型夹带的自我评论
const META_PHRASES: &[&str] = &[
    "as an ai",
    "as a language model",
    "i apologize",
    "i'm sorry",
    "i am sorry",
    "i cannot",
    "i can't",
    "here is a question",
    "here's a question",
    "作为一个ai",
    "作为人工智能",
    "抱歉",
];

static RE_DOUBLED_QUESTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?？]\s*[?？]").expect("static regex"));

/// 校验结果
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

/// 批量校验结果
#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    pub valid: Vec<QuestionDraft>,
    /// (原始下标, 汇总后的错误信息)
    pub invalid: Vec<(usize, String)>,
}

/// 题目质量校验器
pub struct QualityValidator;

impl QualityValidator {
    /// 校验单道题目
    pub fn validate(draft: &QuestionDraft, strict: bool) -> ValidationReport {
        let errors = Self::check_required(draft);
        if !errors.is_empty() {
            return ValidationReport::from_errors(errors);
        }

        let errors = Self::check_options(draft);
        if !errors.is_empty() {
            return ValidationReport::from_errors(errors);
        }

        let errors = Self::check_answer(draft);
        if !errors.is_empty() {
            return ValidationReport::from_errors(errors);
        }

        let mut errors = Vec::new();
        if strict {
            errors.extend(Self::check_explanation(draft));
        }
        errors.extend(Self::check_content(draft));
        errors.extend(Self::check_language(draft));
        ValidationReport::from_errors(errors)
    }

    /// 批量校验，拆分为合格 / 不合格
    pub fn validate_batch(drafts: Vec<QuestionDraft>, strict: bool) -> BatchValidation {
        let mut result = BatchValidation::default();
        for (idx, draft) in drafts.into_iter().enumerate() {
            let report = Self::validate(&draft, strict);
            if report.is_valid {
                result.valid.push(draft);
            } else {
                result.invalid.push((idx, report.errors.join("; ")));
            }
        }
        result
    }

    fn check_required(draft: &QuestionDraft) -> Vec<String> {
        let mut errors = Vec::new();
        if is_blank(draft.question_text.as_deref()) {
            errors.push("Missing required field: question".to_string());
        }
        if draft.options.is_empty() {
            errors.push("Missing required field: options".to_string());
        }
        if is_blank(draft.correct_answer.as_deref()) {
            errors.push("Missing required field: correct_answer".to_string());
        }
        errors
    }

    fn check_options(draft: &QuestionDraft) -> Vec<String> {
        let expected: HashSet<&str> = OptionKey::ALL.iter().map(|k| k.as_str()).collect();
        let actual: HashSet<&str> = draft.options.keys().map(String::as_str).collect();
        if draft.options.len() != 4 || actual != expected {
            let mut keys: Vec<&str> = actual.into_iter().collect();
            keys.sort_unstable();
            return vec![format!(
                "Options must be exactly A, B, C, D (got: {})",
                keys.join(", ")
            )];
        }

        let correct = draft.correct_answer.as_deref().and_then(OptionKey::parse);
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for key in OptionKey::ALL {
            let text = draft.options.get(key.as_str()).map(|s| s.trim()).unwrap_or("");
            if text.chars().count() < MIN_OPTION_CHARS {
                errors.push(format!(
                    "Option {} is too short (minimum {} characters)",
                    key, MIN_OPTION_CHARS
                ));
                continue;
            }

            let normalized = text.to_lowercase();
            let is_catch_all = CATCH_ALL_OPTIONS
                .iter()
                .any(|phrase| normalized.trim_end_matches('.') == *phrase);
            if is_catch_all && correct != Some(key) {
                errors.push(format!("Option {} is a trivial catch-all option", key));
            }

            if !seen.insert(normalized) {
                errors.push(format!("Option {} duplicates another option", key));
            }
        }

        errors
    }

    fn check_answer(draft: &QuestionDraft) -> Vec<String> {
        let raw = draft.correct_answer.as_deref().unwrap_or("");
        match OptionKey::parse(raw) {
            Some(key) if draft.options.contains_key(key.as_str()) => Vec::new(),
            Some(key) => vec![format!("Correct answer {} is not among the options", key)],
            None => vec![format!(
                "Correct answer must be one of A, B, C, D (got: {})",
                raw.trim()
            )],
        }
    }

    fn check_explanation(draft: &QuestionDraft) -> Vec<String> {
        let explanation = draft.explanation.as_deref().unwrap_or("").trim();
        if explanation.chars().count() < MIN_EXPLANATION_CHARS {
            vec![format!(
                "Explanation is missing or shorter than {} characters",
                MIN_EXPLANATION_CHARS
            )]
        } else {
            Vec::new()
        }
    }

    fn check_content(draft: &QuestionDraft) -> Vec<String> {
        let text = draft.question_text.as_deref().unwrap_or("").trim();
        let mut errors = Vec::new();

        if text.chars().count() < MIN_QUESTION_CHARS {
            errors.push(format!(
                "Question text is shorter than {} characters",
                MIN_QUESTION_CHARS
            ));
        }
        if text.ends_with("...") || text.ends_with('…') {
            errors.push("Question text ends with an unterminated ellipsis".to_string());
        } else if !ends_with_terminal_punctuation(text) {
            errors.push("Question text must end with terminal punctuation".to_string());
        }
        if !brackets_balanced(text) {
            errors.push("Question text has an unterminated bracket or parenthesis".to_string());
        }

        errors
    }

    fn check_language(draft: &QuestionDraft) -> Vec<String> {
        let mut errors = Vec::new();
        let question = draft.question_text.as_deref().unwrap_or("");

        let mut corpus = question.to_lowercase();
        for option in draft.options.values() {
            corpus.push('\n');
            corpus.push_str(&option.to_lowercase());
        }
        if let Some(explanation) = &draft.explanation {
            corpus.push('\n');
            corpus.push_str(&explanation.to_lowercase());
        }
        if let Some(phrase) = META_PHRASES.iter().find(|p| corpus.contains(*p)) {
            errors.push(format!("Contains meta-commentary phrase: \"{}\"", phrase));
        }

        if is_shouting(question) {
            errors.push("Question text is written in all caps".to_string());
        }
        if RE_DOUBLED_QUESTION.is_match(question) {
            errors.push("Question text contains doubled question marks".to_string());
        }

        errors
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|s| s.trim().is_empty()).unwrap_or(true)
}

fn ends_with_terminal_punctuation(text: &str) -> bool {
    matches!(
        text.chars().last(),
        Some('.' | '?' | '!' | ':' | '。' | '？' | '！' | '：')
    )
}

fn brackets_balanced(text: &str) -> bool {
    let mut stack = Vec::new();
    for c in text.chars() {
        match c {
            '(' => stack.push(')'),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            '（' => stack.push('）'),
            ')' | ']' | '}' | '）' => {
                if stack.pop() != Some(c) {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

fn is_shouting(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    letters.len() >= 10 && letters.iter().all(|c| c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn well_formed() -> QuestionDraft {
        let mut options = BTreeMap::new();
        options.insert("A".to_string(), "Mitochondria".to_string());
        options.insert("B".to_string(), "Ribosome".to_string());
        options.insert("C".to_string(), "Golgi apparatus".to_string());
        options.insert("D".to_string(), "Lysosome".to_string());
        QuestionDraft {
            question_text: Some("Which organelle produces most of a cell's ATP?".to_string()),
            options,
            correct_answer: Some("A".to_string()),
            explanation: Some("Mitochondria carry out oxidative phosphorylation.".to_string()),
            difficulty: Some("easy".to_string()),
        }
    }

    #[test]
    fn test_well_formed_passes_strict() {
        let report = QualityValidator::validate(&well_formed(), true);
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_missing_option_d() {
        let mut draft = well_formed();
        draft.options.remove("D");
        let report = QualityValidator::validate(&draft, true);
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("exactly A, B, C, D"));
    }

    #[test]
    fn test_duplicate_option_text() {
        let mut draft = well_formed();
        draft.options.insert("C".to_string(), "ribosome".to_string());
        let report = QualityValidator::validate(&draft, true);
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicates")));
    }

    #[test]
    fn test_missing_required_short_circuits() {
        let mut draft = well_formed();
        draft.question_text = Some("   ".to_string());
        draft.options.clear();
        let report = QualityValidator::validate(&draft, false);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.starts_with("Missing required field")));
    }

    #[test]
    fn test_answer_outside_options() {
        let mut draft = well_formed();
        draft.correct_answer = Some("E".to_string());
        let report = QualityValidator::validate(&draft, true);
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("one of A, B, C, D"));
    }

    #[test]
    fn test_catch_all_allowed_only_as_answer() {
        let mut draft = well_formed();
        draft.options.insert("D".to_string(), "All of the above".to_string());
        assert!(!QualityValidator::validate(&draft, true).is_valid);

        draft.correct_answer = Some("D".to_string());
        assert!(QualityValidator::validate(&draft, true).is_valid);
    }

    #[test]
    fn test_explanation_only_enforced_when_strict() {
        let mut draft = well_formed();
        draft.explanation = Some("Too short.".to_string());
        assert!(!QualityValidator::validate(&draft, true).is_valid);
        assert!(QualityValidator::validate(&draft, false).is_valid);
    }

    #[test]
    fn test_content_checks() {
        let mut draft = well_formed();
        draft.question_text = Some("Which organelle (the powerhouse produces ATP?".to_string());
        let report = QualityValidator::validate(&draft, false);
        assert!(report.errors.iter().any(|e| e.contains("bracket")));

        draft.question_text = Some("Which organelle produces most ATP and...".to_string());
        let report = QualityValidator::validate(&draft, false);
        assert!(report.errors.iter().any(|e| e.contains("ellipsis")));

        draft.question_text = Some("Which organelle makes ATP".to_string());
        let report = QualityValidator::validate(&draft, false);
        assert!(report.errors.iter().any(|e| e.contains("terminal punctuation")));
    }

    #[test]
    fn test_language_checks() {
        let mut draft = well_formed();
        draft.explanation =
            Some("As an AI, I think mitochondria are responsible for ATP.".to_string());
        assert!(!QualityValidator::validate(&draft, true).is_valid);

        let mut draft = well_formed();
        draft.question_text = Some("WHICH ORGANELLE PRODUCES ATP?".to_string());
        assert!(!QualityValidator::validate(&draft, true).is_valid);

        let mut draft = well_formed();
        draft.question_text = Some("Which organelle produces ATP??".to_string());
        assert!(!QualityValidator::validate(&draft, true).is_valid);
    }

    #[test]
    fn test_validate_batch_partitions() {
        let mut bad = well_formed();
        bad.options.remove("B");
        let batch = QualityValidator::validate_batch(vec![well_formed(), bad], true);
        assert_eq!(batch.valid.len(), 1);
        assert_eq!(batch.invalid.len(), 1);
        assert_eq!(batch.invalid[0].0, 1);
        assert!(batch.invalid[0].1.contains("exactly A, B, C, D"));
    }
}
