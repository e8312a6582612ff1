//! LLM 输出的 JSON 提取
//!
//! 即使请求了 JSON 格式，本地模型仍可能包裹代码块或附带说明文字，按三级策略依次尝试：
//! 1. 整体直接解析
//! 2. 去掉 Markdown 代码块围栏后解析
//! 3. 扫描第一个括号配平的 `{..}` / `[..]` 片段解析

use log::debug;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static RE_CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)```").expect("static regex"));

/// 从模型原始输出中提取 JSON 值
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    // 策略1: 直接解析
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // 策略2: 代码块
    if let Some(caps) = RE_CODE_FENCE.captures(trimmed) {
        if let Some(inner) = caps.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(inner.as_str().trim()) {
                debug!("[json] parsed from fenced code block");
                return Some(value);
            }
        }
    }

    // 策略3: 括号配平扫描
    let value = scan_balanced(trimmed);
    if value.is_some() {
        debug!("[json] parsed from balanced span");
    }
    value
}

/// `{"questions": [...]}` 形式自动拆包
pub fn unwrap_questions(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("questions") {
            Some(inner @ Value::Array(_)) => inner,
            Some(other) => {
                map.insert("questions".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    }
}

/// 提取 + 拆包
pub fn parse_llm_json(text: &str) -> Option<Value> {
    extract_json(text).map(unwrap_questions)
}

fn scan_balanced(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(offset) = text[start..].find(|c: char| c == '{' || c == '[') {
        let open = start + offset;
        if let Some(end) = matching_close(bytes, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[open..=end]) {
                return Some(value);
            }
        }
        start = open + 1;
    }

    None
}

/// 返回与 `open` 处括号配对的结束位置，字符串内的括号不计
fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }

    None
}
