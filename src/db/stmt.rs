use std::fmt::Display;

use serde_json::Value;
use sqlx::{MySql, QueryBuilder};

use crate::db::error::{DbError, Result};
use crate::db::model::ColType;
use crate::db::value::push_value;

/// 待执行语句：QueryBuilder 加上已绑定参数的副本（用于日志）
/// A statement ready to run: a QueryBuilder plus a copy of its arguments for logging
pub struct Stmt {
    qb: QueryBuilder<'static, MySql>,
    args: Vec<Value>,
}

impl Stmt {
    pub fn new(init: impl Into<String>) -> Self {
        Self {
            qb: QueryBuilder::new(init),
            args: Vec::new(),
        }
    }

    /// 由原生 SQL 与参数构建，`?` 与参数一一对应
    /// Build from raw SQL; each `?` outside quotes takes one argument
    pub fn raw(sql: &str, args: &[Value]) -> Result<Self> {
        let mut stmt = Self::new(String::new());
        stmt.push_fragment(sql, args)?;
        Ok(stmt)
    }

    pub fn push(&mut self, sql: impl Display) -> &mut Self {
        self.qb.push(sql);
        self
    }

    pub fn bind(&mut self, v: &Value, ty: Option<ColType>) -> &mut Self {
        push_value(&mut self.qb, v, ty);
        self.args.push(v.clone());
        self
    }

    /// 追加带 `?` 占位的片段 / Append a fragment with `?` placeholders
    pub fn push_fragment(&mut self, sql: &str, args: &[Value]) -> Result<&mut Self> {
        let pieces = split_placeholders(sql);
        if pieces.len() - 1 != args.len() {
            return Err(DbError::InvalidArgument(format!(
                "占位符数量 {} 与参数数量 {} 不一致: {}",
                pieces.len() - 1,
                args.len(),
                sql
            )));
        }
        for (i, piece) in pieces.iter().enumerate() {
            self.qb.push(piece);
            if let Some(v) = args.get(i) {
                self.bind(v, None);
            }
        }
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        self.qb.sql()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub(crate) fn builder(&mut self) -> &mut QueryBuilder<'static, MySql> {
        &mut self.qb
    }
}

/// 按引号外的 `?` 切分 SQL / Split SQL on `?` outside quotes and comments
pub fn split_placeholders(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) => {
                if c == b'\\' && q != b'`' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                b'\'' | b'"' | b'`' => quote = Some(c),
                b'?' => {
                    pieces.push(&sql[start..i]);
                    start = i + 1;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    // 行注释
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    pieces.push(&sql[start.min(sql.len())..]);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_skips_quoted_marks() {
        assert_eq!(split_placeholders("uid>?"), vec!["uid>", ""]);
        assert_eq!(
            split_placeholders("name = 'what?' AND uid = ?"),
            vec!["name = 'what?' AND uid = ", ""]
        );
        assert_eq!(split_placeholders("a = \"it\\\"s?\""), vec!["a = \"it\\\"s?\""]);
        assert_eq!(split_placeholders("`we?ird` = ?"), vec!["`we?ird` = ", ""]);
        assert_eq!(split_placeholders("x = ? -- why?\n AND y = ?").len(), 3);
    }

    #[test]
    fn test_raw_binds_in_order() {
        let s = Stmt::raw("SELECT uid FROM user WHERE uid=? AND gid=?", &[json!(2), json!(3)]).unwrap();
        assert_eq!(s.sql(), "SELECT uid FROM user WHERE uid=? AND gid=?");
        assert_eq!(s.args(), &[json!(2), json!(3)]);
    }

    #[test]
    fn test_raw_rejects_arg_mismatch() {
        assert!(Stmt::raw("SELECT 1 WHERE a=?", &[]).is_err());
        assert!(Stmt::raw("SELECT 1", &[json!(1)]).is_err());
    }

    #[test]
    fn test_builder_push_and_bind() {
        let mut s = Stmt::new("UPDATE `user` SET ");
        s.push("`gid` = ").bind(&json!(10), Some(ColType::Int64));
        s.push(" WHERE ").push_fragment("uid>?", &[json!(3)]).unwrap();
        assert_eq!(s.sql(), "UPDATE `user` SET `gid` = ? WHERE uid>?");
        assert_eq!(s.args().len(), 2);
    }
}
