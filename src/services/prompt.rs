//! 出题提示词

use crate::models::{Difficulty, TopicHierarchy};

/// AI 出题提示词构建器
pub struct QuestionPrompt;

impl QuestionPrompt {
    /// 系统提示词，约束角色与输出格式
    pub fn system() -> &'static str {
        r#"You are an expert exam question writer. You write original multiple-choice questions that match the style and difficulty of real past exam papers.
Respond with JSON only. Do not add commentary, apologies, or Markdown."#
    }

    /// 构建用户提示词
    ///
    /// `style_references` 为风格参考题干，`exclusions` 为已出现过的题目摘要
    pub fn generate_questions(
        hierarchy: &TopicHierarchy,
        count: usize,
        difficulty_hint: Option<Difficulty>,
        style_references: &[String],
        exclusions: &[String],
    ) -> String {
        let difficulty_instruction = match difficulty_hint {
            Some(Difficulty::Easy) => "Mostly easy questions that test recall of core facts",
            Some(Difficulty::Medium) => "Mostly medium questions that require applying a concept",
            Some(Difficulty::Hard) => "Mostly hard questions that combine several concepts",
            None => "A balanced mix of easy, medium and hard questions",
        };

        let references = if style_references.is_empty() {
            "(none available)".to_string()
        } else {
            numbered(style_references)
        };

        let avoid = if exclusions.is_empty() {
            "(none)".to_string()
        } else {
            numbered(exclusions)
        };

        format!(
            r#"Write {count} new multiple-choice questions for the following syllabus item.

## Exam: {exam}
## Subject: {subject}
## Topic: {topic}

## Difficulty:
{difficulty}

## Style references (match tone and length, do not copy):
{references}

## Already used, do not repeat or paraphrase:
{avoid}

## Requirements:
1. Each question has exactly four options keyed "A", "B", "C", "D"
2. Exactly one option is correct, and distractors are plausible
3. Options are distinct, and "all of the above" style options are avoided
4. The question text is a complete sentence ending with "?" or "."
5. The explanation states why the correct option is right in at least one full sentence
6. "difficulty" is one of "easy", "medium", "hard"

## Output format (JSON):
{{
  "questions": [
    {{
      "question": "question text",
      "options": {{"A": "...", "B": "...", "C": "...", "D": "..."}},
      "correct_answer": "A",
      "explanation": "why A is correct",
      "difficulty": "medium"
    }}
  ]
}}"#,
            count = count,
            exam = hierarchy.exam_name,
            subject = hierarchy.subject_name,
            topic = hierarchy.topic_name,
            difficulty = difficulty_instruction,
            references = references,
            avoid = avoid,
        )
    }
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}
