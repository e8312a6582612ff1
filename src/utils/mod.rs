//! 通用工具：数据目录与文本截断

pub mod json;

use std::path::PathBuf;

pub fn get_app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("shuati"))
        .unwrap_or_else(|| PathBuf::from(".").join("data"))
}

pub fn get_database_path() -> PathBuf {
    let mut path = get_app_data_dir();
    path.push("shuati.db");
    path
}

pub fn get_log_path() -> PathBuf {
    let mut path = get_app_data_dir();
    path.push("shuati.log");
    path
}

/// 按字符截断，超出部分以 "..." 结尾
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("  abcdef  ", 3), "abc...");
        assert_eq!(truncate_chars("函数的单调性", 2), "函数...");
    }

    #[test]
    fn test_data_file_names() {
        assert!(get_database_path().ends_with("shuati.db"));
        assert!(get_log_path().ends_with("shuati.log"));
        assert_eq!(get_log_path().parent(), Some(get_app_data_dir().as_path()));
    }
}
