// 数据库服务模块
// 提供 SQLite 题库、知识点层级和用户测试历史的读写

use crate::models::{
    Difficulty, OptionKey, Question, QuestionSource, TestHistoryRecord, TopicHierarchy,
};
use crate::services::repository::{BankFilter, BankScope, QuestionStore, SessionFactory};
use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const QUESTION_COLUMNS: &str = "q.id, q.topic_id, q.question_text, q.options, q.correct_answer, \
     q.explanation, q.difficulty, q.source, q.rating_avg, q.rating_count";

/// 数据库服务
#[derive(Clone)]
pub struct DatabaseService {
    pool: Arc<Mutex<Connection>>,
}

impl DatabaseService {
    /// 打开（必要时创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        // 确保数据目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;
        let service = Self {
            pool: Arc::new(Mutex::new(conn)),
        };
        service.initialize()?;
        Ok(service)
    }

    /// 内存数据库，仅用于测试和一次性运行
    pub fn open_in_memory() -> Result<Self> {
        let service = Self {
            pool: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        service.initialize()?;
        Ok(service)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.pool
            .lock()
            .map_err(|_| Error::msg("database connection poisoned"))
    }

    /// 初始化数据库表结构
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS exams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exam_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY (exam_id) REFERENCES exams(id)
            );

            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY (subject_id) REFERENCES subjects(id)
            );

            CREATE TABLE IF NOT EXISTS questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic_id INTEGER NOT NULL,
                question_text TEXT NOT NULL,
                options TEXT NOT NULL,
                correct_answer TEXT NOT NULL CHECK(correct_answer IN ('A', 'B', 'C', 'D')),
                explanation TEXT NOT NULL DEFAULT '',
                difficulty TEXT NOT NULL CHECK(difficulty IN ('easy', 'medium', 'hard')),
                source TEXT NOT NULL,
                rating_avg REAL NOT NULL DEFAULT 0,
                rating_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (topic_id) REFERENCES topics(id)
            );

            CREATE TABLE IF NOT EXISTS test_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                topic_id INTEGER NOT NULL,
                score REAL NOT NULL,
                question_ids TEXT NOT NULL,
                taken_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subjects_exam ON subjects(exam_id);
            CREATE INDEX IF NOT EXISTS idx_topics_subject ON topics(subject_id);
            CREATE INDEX IF NOT EXISTS idx_questions_topic ON questions(topic_id);
            CREATE INDEX IF NOT EXISTS idx_questions_difficulty ON questions(difficulty);
            CREATE INDEX IF NOT EXISTS idx_history_user_topic ON test_history(user_id, topic_id);
        ",
        )?;

        Ok(())
    }

    // ==================== 层级管理 ====================

    pub fn create_exam(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO exams (name) VALUES (?)", rusqlite::params![name])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_subject(&self, exam_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subjects (exam_id, name) VALUES (?, ?)",
            rusqlite::params![exam_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_topic(&self, subject_id: i64, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO topics (subject_id, name) VALUES (?, ?)",
            rusqlite::params![subject_id, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 获取知识点完整层级
    pub fn get_topic_hierarchy(&self, topic_id: i64) -> Result<Option<TopicHierarchy>> {
        let conn = self.conn()?;
        let hierarchy = conn
            .query_row(
                "SELECT e.id, e.name, s.id, s.name, t.id, t.name
                 FROM topics t
                 JOIN subjects s ON s.id = t.subject_id
                 JOIN exams e ON e.id = s.exam_id
                 WHERE t.id = ?",
                rusqlite::params![topic_id],
                |row| {
                    Ok(TopicHierarchy {
                        exam_id: row.get(0)?,
                        exam_name: row.get(1)?,
                        subject_id: row.get(2)?,
                        subject_name: row.get(3)?,
                        topic_id: row.get(4)?,
                        topic_name: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(hierarchy)
    }

    // ==================== 题目 ====================

    /// 添加单道题目，返回新 id
    pub fn add_question(&self, question: &Question) -> Result<i64> {
        let conn = self.conn()?;
        Self::insert_question_row(&conn, question)?;
        Ok(conn.last_insert_rowid())
    }

    /// 批量添加题目（单事务）
    pub fn add_questions_batch(&self, questions: &[Question]) -> Result<Vec<Question>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut saved = Vec::with_capacity(questions.len());
        for question in questions {
            Self::insert_question_row(&tx, question)?;
            let mut stored = question.clone();
            stored.id = tx.last_insert_rowid();
            saved.push(stored);
        }

        tx.commit()?;
        Ok(saved)
    }

    fn insert_question_row(conn: &Connection, question: &Question) -> Result<()> {
        let options = serde_json::to_string(&question.options)?;
        conn.execute(
            "INSERT INTO questions
             (topic_id, question_text, options, correct_answer, explanation,
              difficulty, source, rating_avg, rating_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                question.topic_id,
                question.question_text,
                options,
                question.correct_answer.as_str(),
                question.explanation,
                question.difficulty.as_str(),
                question.source.as_str(),
                question.rating_avg,
                question.rating_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// 获取单道题目
    pub fn get_question(&self, id: i64) -> Result<Option<Question>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM questions q WHERE q.id = ?", QUESTION_COLUMNS);
        let question = conn
            .query_row(&sql, rusqlite::params![id], Self::row_to_question)
            .optional()?;
        Ok(question)
    }

    /// 按范围取题，排除给定 id
    pub fn get_bank_questions(&self, filter: &BankFilter, limit: usize) -> Result<Vec<Question>> {
        let conn = self.conn()?;

        let mut params: Vec<SqlValue> = Vec::new();
        let mut sql = format!("SELECT {} FROM questions q", QUESTION_COLUMNS);
        match filter.scope {
            BankScope::Topic(topic_id) => {
                sql.push_str(" WHERE q.topic_id = ?");
                params.push(SqlValue::Integer(topic_id));
            }
            BankScope::Subject(subject_id) => {
                sql.push_str(
                    " JOIN topics t ON t.id = q.topic_id WHERE t.subject_id = ?",
                );
                params.push(SqlValue::Integer(subject_id));
            }
            BankScope::Exam(exam_id) => {
                sql.push_str(
                    " JOIN topics t ON t.id = q.topic_id
                      JOIN subjects s ON s.id = t.subject_id
                      WHERE s.exam_id = ?",
                );
                params.push(SqlValue::Integer(exam_id));
            }
            BankScope::Global => sql.push_str(" WHERE 1 = 1"),
        }

        if !filter.exclude_ids.is_empty() {
            let placeholders = vec!["?"; filter.exclude_ids.len()].join(", ");
            sql.push_str(&format!(" AND q.id NOT IN ({})", placeholders));
            params.extend(filter.exclude_ids.iter().map(|id| SqlValue::Integer(*id)));
        }

        sql.push_str(" ORDER BY RANDOM() LIMIT ?");
        params.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), Self::row_to_question)?;

        let mut questions = Vec::new();
        for row in rows {
            questions.push(row?);
        }
        Ok(questions)
    }

    /// 记录一次评分，更新滚动平均（题目创建后唯一允许的修改）
    pub fn record_rating(&self, question_id: i64, rating: f64) -> Result<(f64, u32)> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE questions
             SET rating_avg = (rating_avg * rating_count + ?) / (rating_count + 1),
                 rating_count = rating_count + 1
             WHERE id = ?",
            rusqlite::params![rating, question_id],
        )?;
        let aggregate = conn.query_row(
            "SELECT rating_avg, rating_count FROM questions WHERE id = ?",
            rusqlite::params![question_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(aggregate)
    }

    // ==================== 测试历史 ====================

    /// 记录一次测试成绩
    pub fn record_test_result(
        &self,
        user_id: i64,
        topic_id: i64,
        score: f64,
        question_ids: &[i64],
        taken_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO test_history (user_id, topic_id, score, question_ids, taken_at)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                user_id,
                topic_id,
                score,
                serde_json::to_string(question_ids)?,
                taken_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_test_history(&self, user_id: i64, topic_id: i64) -> Result<Vec<TestHistoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, topic_id, score, question_ids, taken_at
             FROM test_history WHERE user_id = ? AND topic_id = ?
             ORDER BY taken_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(rusqlite::params![user_id, topic_id], |row| {
            let ids: String = row.get(4)?;
            let taken_at: String = row.get(5)?;
            Ok(TestHistoryRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                topic_id: row.get(2)?,
                score: row.get(3)?,
                question_ids: serde_json::from_str(&ids).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?,
                taken_at: parse_timestamp(5, &taken_at)?,
            })
        })?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    // ==================== 辅助方法 ====================

    /// 从数据库行转换为 Question
    fn row_to_question(row: &Row) -> Result<Question, rusqlite::Error> {
        let options_raw: String = row.get(3)?;
        let options: BTreeMap<OptionKey, String> =
            serde_json::from_str(&options_raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
            })?;

        let answer: String = row.get(4)?;
        let difficulty: String = row.get(6)?;
        let source: String = row.get(7)?;

        Ok(Question {
            id: row.get(0)?,
            topic_id: row.get(1)?,
            question_text: row.get(2)?,
            options,
            correct_answer: OptionKey::parse(&answer)
                .ok_or_else(|| invalid_text(4, "correct_answer", &answer))?,
            explanation: row.get(5)?,
            difficulty: Difficulty::parse(&difficulty)
                .ok_or_else(|| invalid_text(6, "difficulty", &difficulty))?,
            source: QuestionSource::parse(&source)
                .ok_or_else(|| invalid_text(7, "source", &source))?,
            rating_avg: row.get(8)?,
            rating_count: row.get(9)?,
        })
    }
}

fn invalid_text(column: usize, field: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", field, value).into(),
    )
}

fn parse_timestamp(column: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// SQLite 调用是阻塞的，放到 blocking 线程池执行
async fn blocking<T, F>(db: &DatabaseService, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&DatabaseService) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db)).await?
}

#[async_trait]
impl QuestionStore for DatabaseService {
    async fn fetch_topic_hierarchy(&self, topic_id: i64) -> Result<Option<TopicHierarchy>> {
        blocking(self, move |db| db.get_topic_hierarchy(topic_id)).await
    }

    async fn fetch_bank_questions(&self, filter: &BankFilter, limit: usize) -> Result<Vec<Question>> {
        let filter = filter.clone();
        blocking(self, move |db| db.get_bank_questions(&filter, limit)).await
    }

    async fn fetch_user_test_history(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> Result<Vec<TestHistoryRecord>> {
        blocking(self, move |db| db.get_test_history(user_id, topic_id)).await
    }

    async fn insert_questions(&self, batch: &[Question]) -> Result<Vec<Question>> {
        let batch = batch.to_vec();
        blocking(self, move |db| db.add_questions_batch(&batch)).await
    }
}

/// 每次打开一个新连接的会话工厂
#[derive(Debug, Clone)]
pub struct SqliteSessions {
    db_path: PathBuf,
}

impl SqliteSessions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for SqliteSessions {
    async fn open(&self) -> Result<Arc<dyn QuestionStore>> {
        let path = self.db_path.clone();
        let db = tokio::task::spawn_blocking(move || DatabaseService::open(&path)).await??;
        Ok(Arc::new(db))
    }
}
