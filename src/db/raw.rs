use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::db::connection::{Db, ExecResult};
use crate::db::error::{DbError, Result};
use crate::db::stmt::Stmt;
use crate::db::value::Row;

/// 原生 SQL：不经过行缓存，写入后如需刷新缓存请调用 `load_cache`
/// Native SQL; bypasses the row cache
impl Db {
    /// 执行写语句 / Execute a statement
    ///
    /// ```ignore
    /// let r = db.exec("UPDATE user SET gid=? WHERE uid>?", dbx::args![10, 3]).await?;
    /// println!("{}", r.rows_affected);
    /// ```
    pub async fn exec(&self, sql: &str, args: Vec<Value>) -> Result<ExecResult> {
        let stmt = Stmt::raw(sql, &args)?;
        self.execute_stmt(stmt).await
    }

    /// 查询多行 / Fetch all rows
    pub async fn query(&self, sql: &str, args: Vec<Value>) -> Result<Vec<Row>> {
        let stmt = Stmt::raw(sql, &args)?;
        self.fetch_stmt(stmt).await
    }

    /// 查询首行，无结果时返回 `NotFound`
    pub async fn query_row(&self, sql: &str, args: Vec<Value>) -> Result<Row> {
        self.query(sql, args)
            .await?
            .into_iter()
            .next()
            .ok_or(DbError::NotFound)
    }

    /// 取首行首列 / First column of the first row
    pub async fn query_scalar<T: DeserializeOwned>(&self, sql: &str, args: Vec<Value>) -> Result<T> {
        let row = self.query_row(sql, args).await?;
        if row.is_empty() {
            return Err(DbError::NotFound);
        }
        row.get(0)
    }
}
