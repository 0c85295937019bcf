use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::{error, info};

use crate::comm::config::{get_global_config_manager, DbGroupConfig};
use crate::db::cache::TableCache;
use crate::db::dsn::{build_mysql_url, parse_dsn, redact_dsn};
use crate::db::error::{DbError, Result};
use crate::db::model::{DbModel, TableMeta};
use crate::db::stmt::Stmt;
use crate::db::value::{decode_row, fmt_args, Row};
use crate::{HealthCheck, HealthStatus};

lazy_static::lazy_static! {
    /// 按配置分组缓存的数据库句柄 / Db handles cached by config group
    static ref GROUPS: RwLock<HashMap<String, Db>> = RwLock::new(HashMap::new());
}

/// 连接池参数 / Pool settings
///
/// sqlx 在建池时固定这些参数，因此需在 `Db::open_with` 时一次给出。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_open: u32,
    /// 保持的最少空闲连接 / Connections kept warm
    pub min_idle: u32,
    pub conn_max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 10,
            min_idle: 0,
            conn_max_lifetime: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn max_open(mut self, n: u32) -> Self {
        self.max_open = n.max(1);
        self
    }

    pub fn min_idle(mut self, n: u32) -> Self {
        self.min_idle = n;
        self
    }

    pub fn conn_max_lifetime(mut self, d: Duration) -> Self {
        self.conn_max_lifetime = d;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn acquire_timeout(mut self, d: Duration) -> Self {
        self.acquire_timeout = d;
        self
    }

    /// 从分组配置生成，缺省项取默认值
    pub fn from_group(cfg: &DbGroupConfig) -> Self {
        let mut pc = Self::default();
        if let Some(n) = cfg.max_open {
            pc = pc.max_open(n);
        }
        if let Some(n) = cfg.min_idle {
            pc = pc.min_idle(n);
        }
        if let Some(s) = cfg.conn_max_lifetime {
            pc = pc.conn_max_lifetime(Duration::from_secs(s));
        }
        if let Some(s) = cfg.acquire_timeout {
            pc = pc.acquire_timeout(Duration::from_secs(s));
        }
        // 最小空闲不能超过上限
        pc.min_idle = pc.min_idle.min(pc.max_open);
        pc
    }
}

/// 写操作结果 / Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// 表绑定：元信息与可选的行缓存
pub(crate) struct TableBinding {
    pub(crate) meta: TableMeta,
    pub(crate) cache: Option<TableCache>,
}

struct Inner {
    pool: MySqlPool,
    label: String,
    echo_sql: AtomicBool,
    cache_enabled: AtomicBool,
    bindings: RwLock<HashMap<String, TableBinding>>,
}

/// 数据库句柄：连接池、表绑定与行缓存
/// Database handle owning the pool, table bindings and row caches
///
/// 克隆开销很小（内部为 `Arc`），可在任务间共享。
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("label", &self.inner.label)
            .field("echo_sql", &self.echo_sql())
            .field("cache_enabled", &self.cache_enabled())
            .finish()
    }
}

impl Db {
    /// 以默认池参数打开 / Open with default pool settings
    pub fn open(dsn: &str) -> Result<Self> {
        Self::open_with(dsn, PoolConfig::default())
    }

    /// 创建懒连接池，首次使用前不进行网络 I/O；需在 tokio 运行时内调用
    /// Build a lazy pool; no network I/O happens until first use.
    /// Must be called inside a tokio runtime.
    pub fn open_with(dsn: &str, cfg: PoolConfig) -> Result<Self> {
        let options = parse_dsn(dsn)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_open)
            .min_connections(cfg.min_idle)
            .max_lifetime(Some(cfg.conn_max_lifetime))
            .idle_timeout(Some(cfg.idle_timeout))
            .acquire_timeout(cfg.acquire_timeout)
            .connect_lazy_with(options);
        let label = redact_dsn(dsn);
        info!(
            target: "dbx",
            "mysql pool initialized (lazy) for '{}' maxOpen={} minIdle={}",
            label, cfg.max_open, cfg.min_idle
        );
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                label,
                echo_sql: AtomicBool::new(true),
                cache_enabled: AtomicBool::new(true),
                bindings: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// 按配置分组创建 / Build from `database.<group>.*`
    ///
    /// 读取配置键 / Reads config keys:
    /// - `dsn` 或 `url`，否则 `host/port/user/pass/name`
    /// - `maxOpen/minIdle/connMaxLifetime/acquireTimeout/echoSql/cache`
    pub fn from_config(group: &str) -> Result<Self> {
        let mgr = get_global_config_manager().map_err(|e| DbError::Config(e.to_string()))?;
        let cfg = mgr
            .database_group(group)
            .map_err(|e| DbError::Config(format!("{} (group={})", e, group)))?;
        let dsn = match cfg.dsn.clone().or_else(|| cfg.url.clone()) {
            Some(d) => d,
            None => build_mysql_url(
                cfg.host.as_deref().unwrap_or("127.0.0.1"),
                &cfg.port.unwrap_or(3306).to_string(),
                cfg.user.as_deref().unwrap_or("root"),
                cfg.pass.as_deref().unwrap_or(""),
                cfg.name.as_deref().unwrap_or("mysql"),
            ),
        };
        let db = Self::open_with(&dsn, PoolConfig::from_group(&cfg))?;
        db.set_echo_sql(cfg.echo_sql.unwrap_or(true));
        db.enable_cache(cfg.cache.unwrap_or(true));
        Ok(db)
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.inner.pool
    }

    /// 脱敏后的连接标识 / Redacted connection label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// 两个句柄是否指向同一连接池
    pub fn ptr_eq(&self, other: &Db) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 关闭连接池，之后的操作返回 PoolClosed
    pub async fn close(&self) {
        self.inner.pool.close().await;
        info!(target: "dbx", "mysql pool closed for '{}'", self.inner.label);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// 执行 `SELECT 1` 验证连接可用 / runs `SELECT 1`
    pub async fn ping(&self) -> Result<()> {
        self.execute_stmt(Stmt::new("SELECT 1")).await.map(|_| ())
    }

    /// 是否输出执行的 SQL / Toggle statement echo on `dbx::sql`
    pub fn set_echo_sql(&self, on: bool) {
        self.inner.echo_sql.store(on, Ordering::Relaxed);
    }

    pub fn echo_sql(&self) -> bool {
        self.inner.echo_sql.load(Ordering::Relaxed)
    }

    /// 行缓存总开关；关闭时丢弃已缓存的数据
    /// Global row-cache switch; turning it off drops cached rows
    pub fn enable_cache(&self, on: bool) {
        self.inner.cache_enabled.store(on, Ordering::Relaxed);
        if !on {
            for binding in self.inner.bindings.write().values_mut() {
                if let Some(cache) = binding.cache.as_mut() {
                    cache.invalidate();
                }
            }
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.inner.cache_enabled.load(Ordering::Relaxed)
    }

    /// 绑定结构体到 `T::table_name()`；重复绑定会替换并丢弃旧缓存
    /// Bind a struct to its table; re-binding replaces the old binding and cache
    pub fn bind<T: DbModel>(&self, cache: bool) {
        self.bind_meta(TableMeta::of::<T>(), cache);
    }

    pub fn bind_meta(&self, meta: TableMeta, cache: bool) {
        info!(
            target: "dbx",
            "bind table '{}' pk='{}' columns={} cache={}",
            meta.table,
            meta.pk,
            meta.columns.len(),
            cache
        );
        let key = meta.table.to_lowercase();
        let binding = TableBinding {
            cache: cache.then(|| TableCache::new(meta.clone())),
            meta,
        };
        self.inner.bindings.write().insert(key, binding);
    }

    pub fn is_bound(&self, table: &str) -> bool {
        self.inner.bindings.read().contains_key(&table.to_lowercase())
    }

    pub(crate) fn meta_of(&self, table: &str) -> Option<TableMeta> {
        self.inner
            .bindings
            .read()
            .get(&table.to_lowercase())
            .map(|b| b.meta.clone())
    }

    /// 该表的缓存是否生效（总开关与绑定均开启）
    pub(crate) fn cache_active(&self, table: &str) -> bool {
        self.cache_enabled()
            && self
                .inner
                .bindings
                .read()
                .get(&table.to_lowercase())
                .map(|b| b.cache.is_some())
                .unwrap_or(false)
    }

    /// 读已载入的缓存；未启用或未载入时返回 None
    pub(crate) fn read_cache<R>(&self, table: &str, f: impl FnOnce(&TableCache) -> R) -> Option<R> {
        if !self.cache_enabled() {
            return None;
        }
        let guard = self.inner.bindings.read();
        let cache = guard.get(&table.to_lowercase())?.cache.as_ref()?;
        if !cache.is_loaded() {
            return None;
        }
        Some(f(cache))
    }

    /// 读取缓存状态（不要求已载入）/ Inspect a cache whether or not it is loaded
    pub(crate) fn inspect_cache<R>(&self, table: &str, f: impl FnOnce(&TableCache) -> R) -> Option<R> {
        if !self.cache_enabled() {
            return None;
        }
        let guard = self.inner.bindings.read();
        let cache = guard.get(&table.to_lowercase())?.cache.as_ref()?;
        Some(f(cache))
    }

    /// 修改缓存；未启用时返回 None
    pub(crate) fn write_cache<R>(&self, table: &str, f: impl FnOnce(&mut TableCache) -> R) -> Option<R> {
        if !self.cache_enabled() {
            return None;
        }
        let mut guard = self.inner.bindings.write();
        let cache = guard.get_mut(&table.to_lowercase())?.cache.as_mut()?;
        Some(f(cache))
    }

    /// 执行写语句并记录日志 / Run a write statement with logging
    pub(crate) async fn execute_stmt(&self, mut stmt: Stmt) -> Result<ExecResult> {
        let start = Instant::now();
        let res = stmt.builder().build().execute(&self.inner.pool).await;
        match res {
            Ok(done) => {
                let out = ExecResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id: done.last_insert_id(),
                };
                self.echo(&stmt, start, || format!("affected={}", out.rows_affected));
                Ok(out)
            }
            Err(e) => {
                self.log_failure(&stmt, &e);
                Err(DbError::from(e))
            }
        }
    }

    /// 执行查询并解码为有序行 / Run a query and decode ordered rows
    pub(crate) async fn fetch_stmt(&self, mut stmt: Stmt) -> Result<Vec<Row>> {
        let start = Instant::now();
        let res = stmt.builder().build().fetch_all(&self.inner.pool).await;
        match res {
            Ok(rows) => {
                let rows: Vec<Row> = rows.iter().map(decode_row).collect();
                self.echo(&stmt, start, || format!("rows={}", rows.len()));
                Ok(rows)
            }
            Err(e) => {
                self.log_failure(&stmt, &e);
                Err(DbError::from(e))
            }
        }
    }

    fn echo(&self, stmt: &Stmt, start: Instant, outcome: impl FnOnce() -> String) {
        if !self.echo_sql() {
            return;
        }
        let elapsed = start.elapsed();
        info!(
            target: "dbx::sql",
            "[{:.3}ms] {} {} {}",
            elapsed.as_secs_f64() * 1000.0,
            stmt.sql(),
            fmt_args(stmt.args()),
            outcome()
        );
    }

    fn log_failure(&self, stmt: &Stmt, e: &sqlx::Error) {
        error!(
            target: "dbx::error",
            "{} {} : {}",
            stmt.sql(),
            fmt_args(stmt.args()),
            e
        );
    }
}

/// 为数据库句柄实现通用健康检查接口
/// Implement generic HealthCheck interface for the Db handle
#[async_trait]
impl HealthCheck for Db {
    async fn check_health(&self) -> HealthStatus {
        let component = format!("mysql_pool:{}", self.inner.label);
        match sqlx::query("SELECT 1").execute(&self.inner.pool).await {
            Ok(_) => HealthStatus {
                component,
                healthy: true,
                message: Some("OK".to_string()),
                timestamp: chrono::Utc::now(),
            },
            Err(e) => HealthStatus {
                component,
                healthy: false,
                message: Some(format!("SQLx error: {}", e)),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

/// 数据库管理器：按配置分组懒加载并缓存 `Db`
/// Database manager: lazily builds and caches `Db` handles per config group
pub struct DatabaseManager;

impl DatabaseManager {
    /// 获取分组句柄，首次调用时按配置创建
    pub fn get(group: &str) -> Result<Db> {
        if let Some(db) = GROUPS.read().get(group).cloned() {
            return Ok(db);
        }
        let db = Db::from_config(group)?;
        let mut w = GROUPS.write();
        // 并发创建时保留先写入的句柄
        Ok(w.entry(group.to_string()).or_insert(db).clone())
    }

    /// 手动注册分组句柄，替换已有的 / Register a handle, replacing any previous one
    pub fn register(group: &str, db: Db) {
        GROUPS.write().insert(group.to_string(), db);
    }

    pub fn remove(group: &str) -> Option<Db> {
        GROUPS.write().remove(group)
    }

    pub fn groups() -> Vec<String> {
        let mut names: Vec<String> = GROUPS.read().keys().cloned().collect();
        names.sort();
        names
    }
}
