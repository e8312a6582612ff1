//! 两级缓存
//! 优先访问共享层（多进程共用的 SQLite 缓存文件），不可用时透明退回进程内 LRU。
//! 同一个键的并发写入不加锁，后写覆盖先写。

use crate::config::CacheConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use lru::LruCache;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 缓存层接口
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn invalidate(&self, key: &str) -> Result<()>;
}

/// 共享缓存层：写入同一个 SQLite 文件的所有进程共享条目
pub struct SqliteCacheTier {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheTier {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache db {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
        ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("cache connection poisoned"))?;
            f(&guard)
        })
        .await?
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl CacheTier for SqliteCacheTier {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache_entries WHERE key = ?",
                    rusqlite::params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((value, expires_at)) if expires_at > now_millis() => Ok(Some(value)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM cache_entries WHERE key = ?",
                        rusqlite::params![key],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = now_millis() + ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)",
                rusqlite::params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE key = ?",
                rusqlite::params![key],
            )?;
            Ok(())
        })
        .await
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// 进程内有界 LRU，TTL 取调用方 TTL 与自身上限的较小值
pub struct MemoryTier {
    ttl: Duration,
    inner: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryTier {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock().ok()?;
        let mut expired = false;
        let result = match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };
        if expired {
            guard.pop(key);
        }
        result
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.put(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl.min(self.ttl),
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.pop(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 分层命中统计
#[derive(Debug, Default)]
pub struct CacheMetrics {
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,
    shared_errors: AtomicU64,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub shared_errors: u64,
    pub memory_hits: u64,
    pub memory_misses: u64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            shared_misses: self.shared_misses.load(Ordering::Relaxed),
            shared_errors: self.shared_errors.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
        }
    }
}

/// 两级缓存
pub struct TieredCache {
    shared: Option<Arc<dyn CacheTier>>,
    memory: MemoryTier,
    metrics: CacheMetrics,
}

impl TieredCache {
    pub fn new(shared: Option<Arc<dyn CacheTier>>, memory: MemoryTier) -> Self {
        Self {
            shared,
            memory,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn memory_only(capacity: usize, ttl: Duration) -> Self {
        Self::new(None, MemoryTier::new(capacity, ttl))
    }

    /// 按配置构建；共享层打不开时只记录告警，退回进程内缓存
    pub fn from_config(config: &CacheConfig) -> Self {
        let memory = MemoryTier::new(
            config.memory_capacity,
            Duration::from_secs(config.memory_ttl_secs),
        );
        let shared = config.shared_path.as_deref().and_then(|path| {
            match SqliteCacheTier::open(path) {
                Ok(tier) => Some(Arc::new(tier) as Arc<dyn CacheTier>),
                Err(e) => {
                    warn!("[cache] shared tier unavailable, using in-process only: {:#}", e);
                    None
                }
            }
        });
        Self::new(shared, memory)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(shared) = &self.shared {
            match shared.get(key).await {
                Ok(Some(value)) => {
                    self.metrics.shared_hits.fetch_add(1, Ordering::Relaxed);
                    debug!("[cache] {} hit: {}", shared.name(), key);
                    return Some(value);
                }
                Ok(None) => {
                    self.metrics.shared_misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("[cache] {} get failed for {}: {:#}", shared.name(), key, e);
                }
            }
        }

        match self.memory.get(key) {
            Some(value) => {
                self.metrics.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!("[cache] memory hit: {}", key);
                Some(value)
            }
            None => {
                self.metrics.memory_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(shared) = &self.shared {
            match shared.set(key, value, ttl).await {
                Ok(()) => {
                    // 共享层写成功后清掉进程内旧值
                    self.memory.invalidate(key);
                    return;
                }
                Err(e) => {
                    self.metrics.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("[cache] {} set failed for {}: {:#}", shared.name(), key, e);
                }
            }
        }
        self.memory.set(key, value, ttl);
    }

    pub async fn invalidate(&self, key: &str) {
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.invalidate(key).await {
                self.metrics.shared_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[cache] {} invalidate failed for {}: {:#}", shared.name(), key, e);
            }
        }
        self.memory.invalidate(key);
    }

    /// 读取并反序列化，格式不符视为未命中
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[cache] discarding undecodable entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => warn!("[cache] failed to encode entry {}: {}", key, e),
        }
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}
