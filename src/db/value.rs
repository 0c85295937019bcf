use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, MySql, QueryBuilder, Row as _, TypeInfo};

use crate::db::error::{DbError, Result};
use crate::db::model::ColType;

/// 缓存中的一行（列名 → 值）/ A cached row (column → value)
pub type Record = serde_json::Map<String, Value>;

const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// 构造绑定参数列表 / Build a list of bind arguments
///
/// ```ignore
/// db.query("SELECT uid FROM user WHERE uid > ? AND gid = ?", dbx::args![1, 10]).await?;
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::serde_json::Value>::new()
    };
    ($($v:expr),+ $(,)?) => {
        vec![$($crate::serde_json::json!($v)),+]
    };
}

/// 查询结果行：保留列顺序
/// A result row that keeps column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// 按下标取值并反序列化 / Get the value at `idx`
    pub fn get<T: DeserializeOwned>(&self, idx: usize) -> Result<T> {
        let v = self.values.get(idx).ok_or_else(|| {
            DbError::InvalidArgument(format!("列下标越界: {} (共 {} 列)", idx, self.values.len()))
        })?;
        Ok(serde_json::from_value(v.clone())?)
    }

    /// 按列名取值（忽略大小写）/ Get a value by column name, case-insensitively
    pub fn get_by_name<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::InvalidArgument(format!("列不存在: {}", name)))?;
        self.get(idx)
    }

    /// 按列顺序扫描为元组/序列，如 `(i64, String)`
    /// Scan the row positionally, e.g. into `(i64, String)`
    pub fn scan<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Array(self.values.clone()))?)
    }

    /// 按列名反序列化为结构体 / Deserialize the row into a struct by column name
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.to_record()))?)
    }

    pub fn to_record(&self) -> Record {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    pub fn into_json(self) -> Value {
        Value::Object(self.columns.into_iter().zip(self.values).collect())
    }
}

/// 主键键值，用于缓存排序与定位
/// Primary key value used to order and address cached rows
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PkKey {
    Int(i64),
    Str(String),
}

impl PkKey {
    pub fn to_value(&self) -> Value {
        match self {
            PkKey::Int(i) => Value::from(*i),
            PkKey::Str(s) => Value::String(s.clone()),
        }
    }
}

pub fn pk_key(v: &Value) -> Option<PkKey> {
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(PkKey::Int(i)),
            None => Some(PkKey::Str(n.to_string())),
        },
        Value::String(s) => match s.parse::<i64>() {
            Ok(i) => Some(PkKey::Int(i)),
            Err(_) => Some(PkKey::Str(s.clone())),
        },
        _ => None,
    }
}

/// 主键是否为“空”（0、空串或 null），此时插入交由自增生成
pub fn is_blank_pk(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Number(n) => n.as_i64() == Some(0) || n.as_u64() == Some(0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// 比较两个 JSON 值：数字按数值、字符串忽略大小写按字典序（同 MySQL 默认排序规则），null 不可比较
/// Compare two JSON values; numbers numerically, strings case-insensitively
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(_), Value::String(s)) => as_f64(a)?.partial_cmp(&s.trim().parse::<f64>().ok()?),
        (Value::String(s), Value::Number(_)) => s.trim().parse::<f64>().ok()?.partial_cmp(&as_f64(b)?),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => as_f64(a)?.partial_cmp(&as_f64(b)?),
        _ => None,
    }
}

/// 数值化（聚合与比较用）/ Numeric view of a value, for aggregates
pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => as_f64(v).map(|f| f as i64),
    }
}

/// 解析常见的时间字符串 / Parse common datetime spellings
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, DATETIME_FMT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// 反引号包裹标识符 / Backtick-quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// 绑定一个 JSON 值；时间列的字符串会尽量转换为 DATETIME
/// Bind a JSON value; strings for timestamp columns become DATETIME when parseable
pub fn push_value(qb: &mut QueryBuilder<'_, MySql>, v: &Value, ty: Option<ColType>) {
    match v {
        Value::Null => {
            qb.push_bind(Option::<String>::None);
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i);
            } else if let Some(u) = n.as_u64() {
                qb.push_bind(u);
            } else if let Some(f) = n.as_f64() {
                qb.push_bind(f);
            } else {
                qb.push_bind(n.to_string());
            }
        }
        Value::String(s) => {
            if ty == Some(ColType::Timestamp) {
                if let Some(dt) = parse_datetime(s) {
                    qb.push_bind(dt);
                    return;
                }
            }
            qb.push_bind(s.clone());
        }
        Value::Array(_) | Value::Object(_) => {
            qb.push_bind(v.to_string());
        }
    }
}

/// 日志用参数描述 / Argument list rendering for logs
pub fn fmt_args(args: &[Value]) -> String {
    let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// 将一行转换为有序的 Row，尽量覆盖常见类型
/// Convert a row into an ordered Row, covering common MySQL types
pub fn decode_row(row: &MySqlRow) -> Row {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for col in row.columns() {
        columns.push(col.name().to_string());
        values.push(decode_value(row, col.ordinal(), col.type_info().name()));
    }
    Row { columns, values }
}

fn decode_value(row: &MySqlRow, i: usize, type_name: &str) -> Value {
    match type_name {
        "BOOLEAN" => {
            if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
                return v.map(Value::from).unwrap_or(Value::Null);
            }
        }
        "JSON" => {
            if let Ok(v) = row.try_get::<Option<sqlx::types::Json<Value>>, _>(i) {
                return v.map(|j| j.0).unwrap_or(Value::Null);
            }
        }
        _ => {}
    }
    row.try_get::<Option<i64>, _>(i)
        .map(|v| v.map(Value::from))
        .or_else(|_| row.try_get::<Option<u64>, _>(i).map(|v| v.map(Value::from)))
        .or_else(|_| row.try_get::<Option<f64>, _>(i).map(|v| v.map(Value::from)))
        // try timestamps before raw strings
        .or_else(|_| {
            row.try_get::<Option<NaiveDateTime>, _>(i)
                .map(|v| v.map(|dt| Value::String(dt.format(DATETIME_FMT).to_string())))
        })
        .or_else(|_| {
            row.try_get::<Option<DateTime<Utc>>, _>(i).map(|v| {
                v.map(|dt| Value::String(dt.naive_utc().format(DATETIME_FMT).to_string()))
            })
        })
        .or_else(|_| {
            row.try_get::<Option<NaiveDate>, _>(i)
                .map(|v| v.map(|d| Value::String(d.format("%Y-%m-%d").to_string())))
        })
        .or_else(|_| row.try_get::<Option<String>, _>(i).map(|v| v.map(Value::String)))
        .or_else(|_| {
            row.try_get::<Option<Vec<u8>>, _>(i)
                .map(|v| v.map(|b| Value::String(String::from_utf8_lossy(&b).into_owned())))
        })
        .ok()
        .flatten()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_accessors() {
        let row = Row::new(
            vec!["uid".into(), "name".into()],
            vec![json!(2), json!("name-2")],
        );
        assert_eq!(row.get::<i64>(0).unwrap(), 2);
        assert_eq!(row.get_by_name::<String>("NAME").unwrap(), "name-2");
        let (uid, name): (i64, String) = row.scan().unwrap();
        assert_eq!((uid, name.as_str()), (2, "name-2"));
        assert!(row.get::<i64>(5).is_err());
        assert_eq!(row.into_json(), json!({"uid": 2, "name": "name-2"}));
    }

    #[test]
    fn test_compare_values_mixed() {
        assert_eq!(compare_values(&json!(3), &json!(1)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!(1.5), &json!(2)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("10"), &json!(9)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("abc"), &json!("abd")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("JET"), &json!("jet")), Some(Ordering::Equal));
        assert_eq!(compare_values(&json!(null), &json!(1)), None);
        assert_eq!(compare_values(&json!("abc"), &json!(1)), None);
    }

    #[test]
    fn test_pk_key_normalizes_numeric_strings() {
        assert_eq!(pk_key(&json!(5)), Some(PkKey::Int(5)));
        assert_eq!(pk_key(&json!("5")), Some(PkKey::Int(5)));
        assert_eq!(pk_key(&json!("ab")), Some(PkKey::Str("ab".into())));
        assert_eq!(pk_key(&json!(null)), None);
        assert!(PkKey::Int(2) < PkKey::Int(10));
    }

    #[test]
    fn test_blank_pk() {
        assert!(is_blank_pk(&json!(0)));
        assert!(is_blank_pk(&json!(null)));
        assert!(is_blank_pk(&json!("")));
        assert!(!is_blank_pk(&json!(3)));
    }

    #[test]
    fn test_parse_datetime_variants() {
        let a = parse_datetime("2024-05-01T10:20:30.5").unwrap();
        let b = parse_datetime("2024-05-01 10:20:30.5").unwrap();
        assert_eq!(a, b);
        assert!(parse_datetime("2024-05-01T10:20:30+00:00").is_some());
        assert_eq!(
            parse_datetime("2024-05-01").unwrap().format("%H:%M:%S").to_string(),
            "00:00:00"
        );
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_push_value_uses_placeholders() {
        let mut qb = QueryBuilder::<MySql>::new("SELECT * FROM t WHERE a = ");
        push_value(&mut qb, &json!(1), None);
        qb.push(" AND b = ");
        push_value(&mut qb, &json!("2024-05-01 00:00:00"), Some(ColType::Timestamp));
        assert_eq!(qb.sql(), "SELECT * FROM t WHERE a = ? AND b = ?");
    }

    #[test]
    fn test_quote_ident_and_args_macro() {
        assert_eq!(quote_ident("user"), "`user`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        let a = crate::args![1, "x", true];
        assert_eq!(a, vec![json!(1), json!("x"), json!(true)]);
        assert!(crate::args![].is_empty());
        assert_eq!(fmt_args(&a), "[1, \"x\", true]");
    }
}
