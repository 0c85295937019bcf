use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::cache::{Agg, Order};
use crate::db::cond::{compile, Clause, Pred};
use crate::db::connection::{Db, ExecResult};
use crate::db::error::{DbError, Result};
use crate::db::model::{entity_values, ColumnDef, Entity, TableMeta};
use crate::db::stmt::Stmt;
use crate::db::value::{as_i64, is_blank_pk, pk_key, quote_ident, PkKey, Record, Row};

/// MySQL 不支持单独的 OFFSET，需要配一个最大 LIMIT
const MAX_LIMIT: &str = "18446744073709551615";

const RELOAD_ATTEMPTS: usize = 3;

/// 有序的列值对 / Ordered column-value pairs
///
/// ```ignore
/// db.table("user").where_m(dbx::m!["name" => "jet"]).update_m(dbx::m!["gid" => 10]).await?;
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct M(Vec<(String, Value)>);

impl M {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, col: impl Into<String>, val: Value) {
        self.0.push((col.into(), val));
    }

    pub fn set(mut self, col: impl Into<String>, val: impl Into<Value>) -> Self {
        self.push(col, val.into());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.0.iter()
    }

    fn has_column(&self, col: &str) -> bool {
        self.0.iter().any(|(c, _)| c.eq_ignore_ascii_case(col))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for M {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        M(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// 构造 `M`：`m!["gid" => 10, "name" => "jet"]`
#[macro_export]
macro_rules! m {
    () => {
        $crate::db::query::M::new()
    };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut m = $crate::db::query::M::new();
        $( m.push($k, $crate::serde_json::json!($v)); )+
        m
    }};
}

#[derive(Debug, Clone, PartialEq)]
enum OrderBy {
    Col(String, Order),
    Raw(String),
}

/// 写操作后的缓存同步方式
enum CacheSync {
    /// 按主键重读 / re-read rows by pk
    Keys(Vec<PkKey>),
    /// 移除 / drop rows
    Remove(Vec<PkKey>),
    Reload,
}

/// 表查询构建器 / Table query builder
///
/// 特性 / Features:
/// - 链式条件、排序、分页 / chained conditions, ordering, paging
/// - 绑定了缓存的表在条件可求值时直接读内存 / cached tables answer evaluable reads from memory
/// - 写操作先落库再同步缓存 / writes hit the database first, then sync the cache
pub struct TableQuery {
    db: Db,
    table: String,
    meta: Option<TableMeta>,
    clauses: Vec<Clause>,
    select: Option<Vec<String>>,
    order: Option<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    allow_full: bool,
    error: Option<DbError>,
}

impl Db {
    /// 以表名开始一次查询 / Start a query on a table
    pub fn table(&self, name: &str) -> TableQuery {
        TableQuery {
            db: self.clone(),
            table: name.to_string(),
            meta: self.meta_of(name),
            clauses: Vec::new(),
            select: None,
            order: None,
            limit: None,
            offset: None,
            allow_full: false,
            error: None,
        }
    }

    /// 整表载入缓存，返回行数；载入期间有写入时重试
    /// Load the whole table into its cache; retried when a write races the load
    pub(crate) async fn reload_table(&self, meta: &TableMeta) -> Result<usize> {
        for _ in 0..RELOAD_ATTEMPTS {
            let Some(epoch) = self.inspect_cache(&meta.table, |c| c.epoch()) else {
                return Ok(0);
            };
            let stmt = Stmt::new(format!(
                "SELECT * FROM {} ORDER BY {}",
                quote_ident(&meta.table),
                quote_ident(meta.pk)
            ));
            let rows: Vec<Record> = self.fetch_stmt(stmt).await?.iter().map(Row::to_record).collect();
            if let Some(n) = self
                .write_cache(&meta.table, |c| c.apply_snapshot(epoch, rows))
                .flatten()
            {
                return Ok(n);
            }
            debug!(target: "dbx::cache", "'{}' changed while loading, retrying", meta.table);
        }
        warn!(target: "dbx::cache", "'{}' kept changing while loading; cache left unloaded", meta.table);
        Ok(0)
    }

    async fn refresh_keys(&self, meta: &TableMeta, keys: &[PkKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let Some(epoch) = self.inspect_cache(&meta.table, |c| c.epoch()) else {
            return Ok(());
        };
        let mut stmt = Stmt::new(format!(
            "SELECT * FROM {} WHERE {} IN (",
            quote_ident(&meta.table),
            quote_ident(meta.pk)
        ));
        let pk_ty = meta.col_type(meta.pk);
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                stmt.push(", ");
            }
            stmt.bind(&key.to_value(), pk_ty);
        }
        stmt.push(")");
        let rows = self.fetch_stmt(stmt).await?;
        self.write_cache(&meta.table, |c| {
            if !c.is_loaded() {
                return;
            }
            // 回读期间有其他写入，结果可能过期
            if c.epoch() != epoch {
                c.invalidate();
                return;
            }
            for key in keys {
                c.remove(key);
            }
            for row in &rows {
                c.put(row.to_record());
            }
        });
        Ok(())
    }

    /// 写后同步缓存；未载入的缓存留待下次读取时载入，同步失败则使其失效
    async fn sync_cache(&self, meta: &TableMeta, sync: CacheSync) {
        // 写入已落地，作废此前发起的载入
        self.write_cache(&meta.table, |c| c.bump_epoch());
        if self.read_cache(&meta.table, |_| ()).is_none() {
            return;
        }
        let res = match sync {
            CacheSync::Keys(keys) => self.refresh_keys(meta, &keys).await,
            CacheSync::Remove(keys) => {
                self.write_cache(&meta.table, |c| {
                    for key in &keys {
                        c.remove(key);
                    }
                });
                Ok(())
            }
            CacheSync::Reload => self.reload_table(meta).await.map(|_| ()),
        };
        if let Err(e) = res {
            warn!(target: "dbx", "cache sync failed for '{}': {}; invalidating", meta.table, e);
            self.write_cache(&meta.table, |c| c.invalidate());
        }
    }
}

impl TableQuery {
    /// 原生条件片段，多次调用以 AND 连接
    /// Raw condition with `?` placeholders; repeated calls are AND-ed
    pub fn where_(mut self, cond: &str, args: Vec<Value>) -> Self {
        self.clauses.push(Clause::Raw {
            sql: cond.to_string(),
            args,
        });
        self
    }

    /// 等值条件 / Equality pairs
    pub fn where_m(mut self, m: M) -> Self {
        for (col, val) in m.0 {
            let col = self.resolve(&col);
            if val.is_null() {
                self.clauses.push(Clause::Raw {
                    sql: format!("{} IS NULL", quote_ident(&col)),
                    args: Vec::new(),
                });
            } else {
                self.clauses.push(Clause::Eq { col, val });
            }
        }
        self
    }

    /// 主键等值，需要已绑定 / Equality on the bound primary key
    pub fn where_pk(mut self, val: impl Into<Value>) -> Self {
        match &self.meta {
            Some(meta) => {
                let col = meta.pk.to_string();
                self.clauses.push(Clause::Eq {
                    col,
                    val: val.into(),
                });
            }
            None => {
                self.error.get_or_insert(DbError::Unbound(self.table.clone()));
            }
        }
        self
    }

    /// 选择列，默认 `*` / Select columns, default `*`
    pub fn select(mut self, cols: &[&str]) -> Self {
        self.select = Some(cols.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, col: &str, dir: Order) -> Self {
        self.order = Some(OrderBy::Col(col.to_string(), dir));
        self
    }

    /// 原生排序表达式 / Raw ORDER BY expression
    pub fn order_by_raw(mut self, expr: &str) -> Self {
        self.order = Some(OrderBy::Raw(expr.to_string()));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// 允许无条件的 UPDATE / DELETE
    pub fn allow_full_table(mut self) -> Self {
        self.allow_full = true;
        self
    }

    // ---- 读 / reads ----

    /// 查询一条，无结果返回 `NotFound` / Fetch one row
    pub async fn one<T: DeserializeOwned>(self) -> Result<T> {
        self.limit(1)
            .all::<T>()
            .await?
            .into_iter()
            .next()
            .ok_or(DbError::NotFound)
    }

    /// 查询全部 / Fetch all rows
    pub async fn all<T: DeserializeOwned>(mut self) -> Result<Vec<T>> {
        self.take_error()?;
        self.fetch_records()
            .await?
            .into_iter()
            .map(|r| serde_json::from_value(Value::Object(r)).map_err(DbError::from))
            .collect()
    }

    pub async fn count(mut self) -> Result<i64> {
        self.take_error()?;
        if let Some(preds) = self.cache_plan().await? {
            if let Some(n) = self.db.read_cache(&self.table, |c| c.count(&preds)) {
                return Ok(n);
            }
        }
        let stmt = self.build_count()?;
        self.fetch_i64(stmt).await
    }

    pub async fn sum(self, col: &str) -> Result<i64> {
        self.aggregate(Agg::Sum, col).await
    }

    pub async fn max(self, col: &str) -> Result<i64> {
        self.aggregate(Agg::Max, col).await
    }

    pub async fn min(self, col: &str) -> Result<i64> {
        self.aggregate(Agg::Min, col).await
    }

    async fn aggregate(mut self, agg: Agg, col: &str) -> Result<i64> {
        self.take_error()?;
        let known = self.meta.as_ref().and_then(|m| m.column(col)).map(|c| c.name);
        if let Some(name) = known {
            if let Some(preds) = self.cache_plan().await? {
                if let Some(v) = self.db.read_cache(&self.table, |c| c.aggregate(&preds, name, agg)) {
                    return Ok(v);
                }
            }
        }
        let stmt = self.build_aggregate(agg, col)?;
        self.fetch_i64(stmt).await
    }

    // ---- 写 / writes ----

    /// 插入一条；自增主键为 0 或 null 时由数据库生成
    /// Insert one entity; a blank auto-increment pk is generated by the database
    pub async fn insert<T: Entity>(mut self, item: &T) -> Result<ExecResult> {
        self.take_error()?;
        let meta = self.entity_meta::<T>();
        let vals = entity_values(item)?;
        let pk_val = pk_of(&meta, &vals);
        let skip_pk = meta.auto_increment && is_blank_pk(&pk_val);
        let (cols, row) = split_columns(&meta, vals, skip_pk);
        let stmt = build_insert("INSERT", &meta.table, &cols, &[row]);
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        let key = if skip_pk {
            Some(PkKey::Int(res.last_insert_id as i64))
        } else {
            pk_key(&pk_val)
        };
        self.db
            .sync_cache(&meta, CacheSync::Keys(key.into_iter().collect()))
            .await;
        Ok(res)
    }

    /// `REPLACE INTO` 全部列 / Replace with all columns
    pub async fn replace<T: Entity>(mut self, item: &T) -> Result<ExecResult> {
        self.take_error()?;
        let meta = self.entity_meta::<T>();
        let vals = entity_values(item)?;
        let pk_val = pk_of(&meta, &vals);
        let (cols, row) = split_columns(&meta, vals, false);
        let stmt = build_insert("REPLACE", &meta.table, &cols, &[row]);
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        let key = if is_blank_pk(&pk_val) {
            Some(PkKey::Int(res.last_insert_id as i64))
        } else {
            pk_key(&pk_val)
        };
        self.db
            .sync_cache(&meta, CacheSync::Keys(key.into_iter().collect()))
            .await;
        Ok(res)
    }

    /// 单条多行 INSERT；空切片不访问数据库
    /// Single multi-row INSERT; an empty slice does nothing
    pub async fn insert_many<T: Entity>(mut self, items: &[T]) -> Result<ExecResult> {
        self.take_error()?;
        if items.is_empty() {
            return Ok(ExecResult::default());
        }
        let meta = self.entity_meta::<T>();
        let rows = items
            .iter()
            .map(|item| entity_values(item))
            .collect::<Result<Vec<_>>>()?;
        let pks: Vec<Value> = rows.iter().map(|r| pk_of(&meta, r)).collect();
        let any_blank = pks.iter().any(is_blank_pk);
        let skip_pk = meta.auto_increment && pks.iter().all(is_blank_pk);

        let mut cols = Vec::new();
        let mut values = Vec::with_capacity(rows.len());
        for r in rows {
            let (c, v) = split_columns(&meta, r, skip_pk);
            cols = c;
            values.push(v);
        }
        let stmt = build_insert("INSERT", &meta.table, &cols, &values);
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        // 生成的主键不保证连续，整表重载
        let sync = if any_blank {
            CacheSync::Reload
        } else {
            CacheSync::Keys(pks.iter().filter_map(pk_key).collect())
        };
        self.db.sync_cache(&meta, sync).await;
        Ok(res)
    }

    /// 按主键更新全部非主键列 / Update all non-pk columns by pk
    pub async fn update<T: Entity>(mut self, item: &T) -> Result<ExecResult> {
        self.take_error()?;
        let meta = self.entity_meta::<T>();
        let vals = entity_values(item)?;
        let pk_val = pk_of(&meta, &vals);
        let stmt = build_update_entity(&meta, &vals, &pk_val)?;
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        self.db
            .sync_cache(&meta, CacheSync::Keys(pk_key(&pk_val).into_iter().collect()))
            .await;
        Ok(res)
    }

    /// 按条件更新指定列 / Update the given columns where conditions hold
    pub async fn update_m(mut self, set: M) -> Result<ExecResult> {
        self.take_error()?;
        if set.is_empty() {
            return Err(DbError::InvalidArgument("update_m 至少需要一列".to_string()));
        }
        self.guard_full_table("UPDATE")?;
        let sets_pk = self.meta.as_ref().map(|m| set.has_column(m.pk)).unwrap_or(true);
        let keys = if sets_pk { None } else { self.affected_keys() };
        let stmt = self.build_update_m(&set)?;
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        if let Some(meta) = &self.meta {
            let sync = keys.map(CacheSync::Keys).unwrap_or(CacheSync::Reload);
            self.db.sync_cache(meta, sync).await;
        }
        Ok(res)
    }

    /// 按条件删除 / Delete where conditions hold
    pub async fn delete(mut self) -> Result<ExecResult> {
        self.take_error()?;
        self.guard_full_table("DELETE")?;
        let keys = self.affected_keys();
        let stmt = self.build_delete()?;
        self.begin_write();
        let res = self.db.execute_stmt(stmt).await?;
        if let Some(meta) = &self.meta {
            let sync = keys.map(CacheSync::Remove).unwrap_or(CacheSync::Reload);
            self.db.sync_cache(meta, sync).await;
        }
        Ok(res)
    }

    /// 从数据库重新载入该表缓存，返回行数；未启用缓存时返回 0
    /// Reload the table cache from the database; 0 when the cache is off
    pub async fn load_cache(mut self) -> Result<usize> {
        self.take_error()?;
        let meta = self
            .meta
            .clone()
            .ok_or_else(|| DbError::Unbound(self.table.clone()))?;
        if !self.db.cache_active(&self.table) {
            debug!(target: "dbx::cache", "cache disabled for '{}', skip load", self.table);
            return Ok(0);
        }
        let n = self.db.reload_table(&meta).await?;
        info!(target: "dbx::cache", "loaded {} rows into cache of '{}'", n, meta.table);
        Ok(n)
    }

    // ---- 内部 / internals ----

    /// 写语句发出前标记，使进行中的缓存载入失效
    fn begin_write(&self) {
        self.db.write_cache(&self.table, |c| c.bump_epoch());
    }

    fn take_error(&mut self) -> Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resolve(&self, col: &str) -> String {
        match &self.meta {
            Some(m) => m.resolve(col).to_string(),
            None => col.to_string(),
        }
    }

    /// 标识符加反引号，表达式原样输出
    fn col_sql(&self, col: &str) -> String {
        if is_ident(col) {
            quote_ident(&self.resolve(col))
        } else {
            col.to_string()
        }
    }

    fn entity_meta<T: Entity>(&self) -> TableMeta {
        let mut meta = TableMeta::of::<T>();
        meta.table = self.table.clone();
        meta
    }

    fn guard_full_table(&self, op: &'static str) -> Result<()> {
        if self.clauses.is_empty() && !self.allow_full {
            return Err(DbError::Unsafe(op));
        }
        Ok(())
    }

    /// 可由缓存回答时返回谓词（必要时先载入）
    async fn cache_plan(&self) -> Result<Option<Vec<Pred>>> {
        let Some(meta) = &self.meta else {
            return Ok(None);
        };
        if !self.db.cache_active(&self.table) {
            return Ok(None);
        }
        let Some(preds) = compile(&self.clauses, meta) else {
            return Ok(None);
        };
        if self.db.read_cache(&self.table, |_| ()).is_none() {
            self.db.reload_table(meta).await?;
        }
        Ok(Some(preds))
    }

    /// 缓存排序键：`Some(None)` 不排序，外层 None 表示无法在内存中排序
    fn cache_order(&self, meta: &TableMeta) -> Option<Option<(String, Order)>> {
        match &self.order {
            None => Some(None),
            Some(OrderBy::Col(col, dir)) => meta.column(col).map(|c| Some((c.name.to_string(), *dir))),
            Some(OrderBy::Raw(expr)) => {
                let mut parts = expr.split_whitespace();
                let col = parts.next()?.trim_matches('`');
                let dir = match parts.next().map(|s| s.to_ascii_uppercase()) {
                    None => Order::Asc,
                    Some(s) if s == "ASC" => Order::Asc,
                    Some(s) if s == "DESC" => Order::Desc,
                    Some(_) => return None,
                };
                if parts.next().is_some() {
                    return None;
                }
                meta.column(col).map(|c| Some((c.name.to_string(), dir)))
            }
        }
    }

    async fn fetch_records(&self) -> Result<Vec<Record>> {
        let order = match (&self.select, &self.meta) {
            (None, Some(meta)) => self.cache_order(meta),
            _ => None,
        };
        if let Some(order) = order {
            if let Some(preds) = self.cache_plan().await? {
                let hit = self.db.read_cache(&self.table, |c| {
                    c.select(
                        &preds,
                        order.as_ref().map(|(col, dir)| (col.as_str(), *dir)),
                        self.offset,
                        self.limit,
                    )
                });
                if let Some(rows) = hit {
                    debug!(target: "dbx::cache", "cache hit on '{}': {} rows", self.table, rows.len());
                    return Ok(rows);
                }
            }
        }
        let stmt = self.build_select()?;
        Ok(self.db.fetch_stmt(stmt).await?.iter().map(Row::to_record).collect())
    }

    async fn fetch_i64(&self, stmt: Stmt) -> Result<i64> {
        let rows = self.db.fetch_stmt(stmt).await?;
        Ok(rows
            .first()
            .and_then(|r| r.values().first())
            .and_then(as_i64)
            .unwrap_or(0))
    }

    /// 写操作影响的主键（缓存已载入且条件可求值时）
    fn affected_keys(&self) -> Option<Vec<PkKey>> {
        if self.limit.is_some() {
            return None;
        }
        let meta = self.meta.as_ref()?;
        let preds = compile(&self.clauses, meta)?;
        self.db.read_cache(&self.table, |c| c.matching_keys(&preds))
    }

    fn push_where(&self, stmt: &mut Stmt) -> Result<()> {
        if self.clauses.is_empty() {
            return Ok(());
        }
        stmt.push(" WHERE ");
        let wrap = self.clauses.len() > 1;
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                stmt.push(" AND ");
            }
            match clause {
                Clause::Raw { sql, args } => {
                    if wrap {
                        stmt.push("(");
                    }
                    stmt.push_fragment(sql, args)?;
                    if wrap {
                        stmt.push(")");
                    }
                }
                Clause::Eq { col, val } => {
                    let ty = self.meta.as_ref().and_then(|m| m.col_type(col));
                    stmt.push(format!("{} = ", self.col_sql(col)));
                    stmt.bind(val, ty);
                }
            }
        }
        Ok(())
    }

    fn push_order(&self, stmt: &mut Stmt) {
        match &self.order {
            Some(OrderBy::Col(col, dir)) => {
                stmt.push(format!(" ORDER BY {} {}", self.col_sql(col), dir.as_sql()));
            }
            Some(OrderBy::Raw(expr)) => {
                stmt.push(format!(" ORDER BY {}", expr));
            }
            None => {}
        }
    }

    fn push_limit(&self, stmt: &mut Stmt) {
        let tail = match (self.limit, self.offset) {
            (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!(" LIMIT {}", l),
            (None, Some(o)) => format!(" LIMIT {} OFFSET {}", MAX_LIMIT, o),
            (None, None) => return,
        };
        stmt.push(tail);
    }

    pub(crate) fn build_select(&self) -> Result<Stmt> {
        let cols = match &self.select {
            Some(cols) if !cols.is_empty() => cols
                .iter()
                .map(|c| self.col_sql(c))
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        };
        let mut stmt = Stmt::new(format!("SELECT {} FROM {}", cols, quote_ident(&self.table)));
        self.push_where(&mut stmt)?;
        self.push_order(&mut stmt);
        self.push_limit(&mut stmt);
        Ok(stmt)
    }

    pub(crate) fn build_count(&self) -> Result<Stmt> {
        let mut stmt = Stmt::new(format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table)));
        self.push_where(&mut stmt)?;
        Ok(stmt)
    }

    /// 聚合结果转为整数，空集得 0
    pub(crate) fn build_aggregate(&self, agg: Agg, col: &str) -> Result<Stmt> {
        let mut stmt = Stmt::new(format!(
            "SELECT CAST(IFNULL({}({}),0) AS SIGNED) FROM {}",
            agg.as_sql(),
            self.col_sql(col),
            quote_ident(&self.table)
        ));
        self.push_where(&mut stmt)?;
        Ok(stmt)
    }

    pub(crate) fn build_update_m(&self, set: &M) -> Result<Stmt> {
        let mut stmt = Stmt::new(format!("UPDATE {} SET ", quote_ident(&self.table)));
        for (i, (col, val)) in set.iter().enumerate() {
            if i > 0 {
                stmt.push(", ");
            }
            let ty = self.meta.as_ref().and_then(|m| m.col_type(col));
            stmt.push(format!("{} = ", quote_ident(&self.resolve(col))));
            stmt.bind(val, ty);
        }
        self.push_where(&mut stmt)?;
        self.push_write_tail(&mut stmt)?;
        Ok(stmt)
    }

    pub(crate) fn build_delete(&self) -> Result<Stmt> {
        let mut stmt = Stmt::new(format!("DELETE FROM {}", quote_ident(&self.table)));
        self.push_where(&mut stmt)?;
        self.push_write_tail(&mut stmt)?;
        Ok(stmt)
    }

    /// UPDATE / DELETE 只接受 ORDER BY 与 LIMIT
    fn push_write_tail(&self, stmt: &mut Stmt) -> Result<()> {
        if self.offset.is_some() {
            return Err(DbError::InvalidArgument(
                "UPDATE/DELETE 不支持 offset".to_string(),
            ));
        }
        self.push_order(stmt);
        self.push_limit(stmt);
        Ok(())
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn pk_of(meta: &TableMeta, vals: &[(&'static str, Value)]) -> Value {
    vals.iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(meta.pk))
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null)
}

/// 按列声明拆出列与值，可跳过主键
fn split_columns(
    meta: &TableMeta,
    vals: Vec<(&'static str, Value)>,
    skip_pk: bool,
) -> (Vec<ColumnDef>, Vec<Value>) {
    meta.columns
        .iter()
        .zip(vals)
        .filter(|(c, _)| !(skip_pk && c.name.eq_ignore_ascii_case(meta.pk)))
        .map(|(c, (_, v))| (*c, v))
        .unzip()
}

pub(crate) fn build_insert(verb: &str, table: &str, cols: &[ColumnDef], rows: &[Vec<Value>]) -> Stmt {
    let names: Vec<String> = cols.iter().map(|c| quote_ident(c.name)).collect();
    let mut stmt = Stmt::new(format!(
        "{} INTO {} ({}) VALUES ",
        verb,
        quote_ident(table),
        names.join(", ")
    ));
    for (r, row) in rows.iter().enumerate() {
        if r > 0 {
            stmt.push(", ");
        }
        stmt.push("(");
        for (i, (col, val)) in cols.iter().zip(row).enumerate() {
            if i > 0 {
                stmt.push(", ");
            }
            stmt.bind(val, Some(col.ty));
        }
        stmt.push(")");
    }
    stmt
}

pub(crate) fn build_update_entity(
    meta: &TableMeta,
    vals: &[(&'static str, Value)],
    pk_val: &Value,
) -> Result<Stmt> {
    if is_blank_pk(pk_val) {
        return Err(DbError::InvalidArgument(format!(
            "更新 {} 需要主键 {} 的值",
            meta.table, meta.pk
        )));
    }
    let mut stmt = Stmt::new(format!("UPDATE {} SET ", quote_ident(&meta.table)));
    let mut first = true;
    for (col, (_, val)) in meta.columns.iter().zip(vals) {
        if col.name.eq_ignore_ascii_case(meta.pk) {
            continue;
        }
        if !first {
            stmt.push(", ");
        }
        stmt.push(format!("{} = ", quote_ident(col.name)));
        stmt.bind(val, Some(col.ty));
        first = false;
    }
    if first {
        return Err(DbError::InvalidArgument(format!(
            "表 {} 除主键外没有可更新的列",
            meta.table
        )));
    }
    stmt.push(format!(" WHERE {} = ", quote_ident(meta.pk)));
    stmt.bind(pk_val, meta.col_type(meta.pk));
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    const DSN: &str = "root@tcp(127.0.0.1:1)/test";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        uid: i64,
        gid: i64,
        name: String,
    }

    crate::impl_table_meta!(User, "user", "uid", [("uid", Int64), ("gid", Int64), ("name", Text)]);

    fn rec(uid: i64, gid: i64, name: &str) -> Record {
        match json!({"uid": uid, "gid": gid, "name": name}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    /// 绑定并预载缓存，之后关闭连接池：能回答的查询只能来自内存
    async fn cached_db() -> Db {
        let db = Db::open(DSN).unwrap();
        db.set_echo_sql(false);
        db.bind::<User>(true);
        db.write_cache("user", |c| {
            c.replace_all(vec![
                rec(1, 10, "jet"),
                rec(2, 10, "Ann"),
                rec(3, 20, "bob"),
                rec(4, 30, "cat"),
            ])
        });
        db.close().await;
        db
    }

    #[test]
    fn test_m_macro_keeps_order() {
        let m = crate::m!["gid" => 10, "name" => "jet"];
        let pairs: Vec<_> = m.iter().cloned().collect();
        assert_eq!(pairs, vec![("gid".to_string(), json!(10)), ("name".to_string(), json!("jet"))]);
        assert!(crate::m![].is_empty());
        assert_eq!(M::new().set("a", 1).len(), 1);
    }

    #[tokio::test]
    async fn test_select_sql() {
        let db = Db::open(DSN).unwrap();
        db.bind::<User>(false);
        let q = db
            .table("user")
            .where_("uid>?", crate::args![1])
            .where_m(crate::m!["NAME" => "jet"])
            .select(&["uid", "COUNT(*)"])
            .order_by("GID", Order::Desc)
            .limit(10)
            .offset(5);
        let s = q.build_select().unwrap();
        assert_eq!(
            s.sql(),
            "SELECT `uid`, COUNT(*) FROM `user` WHERE (uid>?) AND `name` = ? ORDER BY `gid` DESC LIMIT 10 OFFSET 5"
        );
        assert_eq!(s.args(), &[json!(1), json!("jet")]);

        let s = db.table("user").offset(3).build_select().unwrap();
        assert_eq!(s.sql(), format!("SELECT * FROM `user` LIMIT {} OFFSET 3", MAX_LIMIT));
    }

    #[tokio::test]
    async fn test_null_equality_becomes_is_null() {
        let db = Db::open(DSN).unwrap();
        let s = db
            .table("user")
            .where_m(crate::m!["name" => Value::Null])
            .build_select()
            .unwrap();
        assert_eq!(s.sql(), "SELECT * FROM `user` WHERE `name` IS NULL");
        assert!(s.args().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_and_count_sql() {
        let db = Db::open(DSN).unwrap();
        let q = db.table("user").where_("gid=?", crate::args![10]);
        assert_eq!(
            q.build_aggregate(Agg::Sum, "uid").unwrap().sql(),
            "SELECT CAST(IFNULL(SUM(`uid`),0) AS SIGNED) FROM `user` WHERE gid=?"
        );
        assert_eq!(
            q.build_count().unwrap().sql(),
            "SELECT COUNT(*) FROM `user` WHERE gid=?"
        );
    }

    #[tokio::test]
    async fn test_write_sql() {
        let db = Db::open(DSN).unwrap();
        db.bind::<User>(false);
        let s = db
            .table("user")
            .where_("uid>?", crate::args![3])
            .build_update_m(&crate::m!["GID" => 10])
            .unwrap();
        assert_eq!(s.sql(), "UPDATE `user` SET `gid` = ? WHERE uid>?");
        assert_eq!(s.args(), &[json!(10), json!(3)]);

        let s = db.table("user").where_pk(2).build_delete().unwrap();
        assert_eq!(s.sql(), "DELETE FROM `user` WHERE `uid` = ?");

        assert!(db.table("user").where_pk(2).offset(1).build_delete().is_err());

        let meta = TableMeta::of::<User>();
        let u = User { uid: 0, gid: 1, name: "x".into() };
        let vals = entity_values(&u).unwrap();
        let (cols, row) = split_columns(&meta, vals, true);
        let s = build_insert("INSERT", "user", &cols, &[row.clone(), row]);
        assert_eq!(
            s.sql(),
            "INSERT INTO `user` (`gid`, `name`) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(s.args().len(), 4);
    }

    #[tokio::test]
    async fn test_update_entity_sql() {
        let meta = TableMeta::of::<User>();
        let u = User { uid: 7, gid: 2, name: "y".into() };
        let vals = entity_values(&u).unwrap();
        let s = build_update_entity(&meta, &vals, &json!(7)).unwrap();
        assert_eq!(s.sql(), "UPDATE `user` SET `gid` = ?, `name` = ? WHERE `uid` = ?");
        assert_eq!(s.args(), &[json!(2), json!("y"), json!(7)]);
        assert!(build_update_entity(&meta, &vals, &json!(0)).is_err());
    }

    #[tokio::test]
    async fn test_unconditional_writes_are_refused() {
        let db = Db::open(DSN).unwrap();
        let err = db.table("user").delete().await.unwrap_err();
        assert!(matches!(err, DbError::Unsafe("DELETE")));
        let err = db.table("user").update_m(crate::m!["gid" => 1]).await.unwrap_err();
        assert!(matches!(err, DbError::Unsafe("UPDATE")));
        let err = db.table("user").where_pk(1).count().await.unwrap_err();
        assert!(matches!(err, DbError::Unbound(_)));
        assert_eq!(
            db.table("user").allow_full_table().build_delete().unwrap().sql(),
            "DELETE FROM `user`"
        );
    }

    #[tokio::test]
    async fn test_reads_served_from_cache() {
        let db = cached_db().await;

        let users: Vec<User> = db.table("user").where_("uid>?", crate::args![1]).all().await.unwrap();
        assert_eq!(users.iter().map(|u| u.uid).collect::<Vec<_>>(), vec![2, 3, 4]);

        let u: User = db.table("user").where_pk(3).one().await.unwrap();
        assert_eq!(u.name, "bob");

        // 字符串比较忽略大小写
        let u: User = db.table("user").where_m(crate::m!["Name" => "ann"]).one().await.unwrap();
        assert_eq!(u.uid, 2);

        let err = db.table("user").where_pk(99).one::<User>().await.unwrap_err();
        assert!(err.is_not_found());

        let top: Vec<User> = db
            .table("user")
            .order_by_raw("gid DESC")
            .limit(2)
            .all()
            .await
            .unwrap();
        assert_eq!(top.iter().map(|u| u.uid).collect::<Vec<_>>(), vec![4, 3]);

        assert_eq!(db.table("user").where_("gid=?", crate::args![10]).count().await.unwrap(), 2);
        assert_eq!(db.table("user").sum("gid").await.unwrap(), 70);
        assert_eq!(db.table("user").max("uid").await.unwrap(), 4);
        assert_eq!(db.table("user").where_("uid>?", crate::args![1]).min("gid").await.unwrap(), 10);
        assert_eq!(db.table("user").where_("uid>?", crate::args![100]).sum("gid").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_evaluable_reads_go_to_database() {
        let db = cached_db().await;
        // 连接池已关闭，走数据库即失败
        assert!(db
            .table("user")
            .where_("uid=? OR gid=?", crate::args![1, 2])
            .count()
            .await
            .is_err());
        assert!(db.table("user").select(&["uid"]).all::<Value>().await.is_err());
        assert!(db.table("user").order_by_raw("RAND()").all::<User>().await.is_err());
    }

    #[tokio::test]
    async fn test_load_cache_requires_binding() {
        let db = Db::open(DSN).unwrap();
        let err = db.table("nobody").load_cache().await.unwrap_err();
        assert!(matches!(err, DbError::Unbound(_)));
        db.bind::<User>(false);
        assert_eq!(db.table("user").load_cache().await.unwrap(), 0);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Event {
        id: i64,
        #[serde(rename = "createDate")]
        create_date: chrono::NaiveDateTime,
    }

    crate::impl_table_meta!(Event, "event", "id", [("id", Int64), ("createDate", Timestamp)]);

    #[tokio::test]
    async fn test_cached_timestamp_filters_accept_space_separated_args() {
        let db = Db::open(DSN).unwrap();
        db.set_echo_sql(false);
        db.bind::<Event>(true);
        db.write_cache("event", |c| {
            c.replace_all(vec![
                match json!({"id": 1, "createDate": "2024-05-01T10:20:30"}) {
                    Value::Object(m) => m,
                    _ => unreachable!(),
                },
                match json!({"id": 2, "createDate": "2024-05-02T08:00:00"}) {
                    Value::Object(m) => m,
                    _ => unreachable!(),
                },
            ])
        });
        db.close().await;

        let later: Vec<Event> = db
            .table("event")
            .where_("createDate > ?", crate::args!["2024-05-01 23:00:00"])
            .all()
            .await
            .unwrap();
        assert_eq!(later.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);

        let n = db
            .table("event")
            .where_m(crate::m!["createDate" => "2024-05-01 10:20:30"])
            .count()
            .await
            .unwrap();
        assert_eq!(n, 1);

        // 无法解析的时间参数只能交给数据库（连接池已关闭）
        assert!(db
            .table("event")
            .where_("createDate > ?", crate::args!["soon"])
            .count()
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_write_in_flight_discards_pending_load() {
        let db = Db::open(DSN).unwrap();
        db.set_echo_sql(false);
        db.bind::<User>(true);
        db.close().await;

        // 载入在发起 SELECT 前记下 epoch
        let epoch = db.inspect_cache("user", |c| c.epoch()).unwrap();
        // 同时一个写入发出（连接池已关闭，语句本身失败）
        let u = User { uid: 0, gid: 1, name: "new".into() };
        assert!(db.table("user").insert(&u).await.is_err());
        assert!(db
            .table("user")
            .where_("gid=?", crate::args![1])
            .delete()
            .await
            .is_err());

        // 载入结果返回时已过期，不得标记为已载入
        let applied = db
            .write_cache("user", |c| c.apply_snapshot(epoch, vec![rec(1, 1, "old")]))
            .flatten();
        assert_eq!(applied, None);
        assert!(db.read_cache("user", |_| ()).is_none());

        let epoch = db.inspect_cache("user", |c| c.epoch()).unwrap();
        let applied = db
            .write_cache("user", |c| c.apply_snapshot(epoch, vec![rec(1, 1, "old")]))
            .flatten();
        assert_eq!(applied, Some(1));
    }
}
