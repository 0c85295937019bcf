use std::cmp::Ordering;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::db::model::{ColType, TableMeta};
use crate::db::value::{as_f64, compare_values, parse_datetime, Record};

lazy_static! {
    static ref AND_SPLIT: Regex = Regex::new(r"(?i)\s+AND\s+").unwrap();
    static ref SIMPLE_PRED: Regex =
        Regex::new(r"^`?([A-Za-z_][A-Za-z0-9_]*)`?\s*(<=|>=|<>|!=|=|<|>)\s*\?$").unwrap();
    static ref TAUTOLOGY: Regex = Regex::new(r"(?i)^(1|1\s*=\s*1|TRUE)$").unwrap();
}

/// 查询条件片段 / A where-clause fragment
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// 原生 SQL 片段（`?` 占位）/ raw SQL with `?` placeholders
    Raw { sql: String, args: Vec<Value> },
    /// 等值条件 / column equality
    Eq { col: String, val: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" => Op::Eq,
            "!=" | "<>" => Op::Ne,
            ">" => Op::Gt,
            ">=" => Op::Ge,
            "<" => Op::Lt,
            "<=" => Op::Le,
            _ => return None,
        })
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

/// 可在内存中求值的谓词 / A predicate the row cache can evaluate
#[derive(Debug, Clone, PartialEq)]
pub struct Pred {
    pub col: String,
    pub ty: ColType,
    pub op: Op,
    pub val: Value,
}

impl Pred {
    pub fn matches(&self, rec: &Record) -> bool {
        let Some(v) = lookup(rec, &self.col) else {
            return false;
        };
        let ord = match self.ty {
            // 缓存中的时间为 `T` 分隔，参数常为空格分隔，按时间值比较
            ColType::Timestamp => match (datetime_of(v), datetime_of(&self.val)) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
            _ => compare_values(v, &self.val),
        };
        ord.map(|ord| self.op.accepts(ord)).unwrap_or(false)
    }
}

fn datetime_of(v: &Value) -> Option<chrono::NaiveDateTime> {
    match v {
        Value::String(s) => parse_datetime(s),
        _ => None,
    }
}

/// 参数能否按 MySQL 的比较规则在内存中求值
/// Whether the cache compares `val` against a `ty` column the way MySQL does
///
/// MySQL 在字符串与数字比较时按数值转换（`'abc' = 0` 为真），这类条件交给数据库。
fn comparable(ty: ColType, val: &Value) -> bool {
    match (ty, val) {
        (_, Value::Null) => true,
        (ColType::Int64 | ColType::Float64 | ColType::Bool, Value::Number(_) | Value::Bool(_)) => true,
        (ColType::Int64 | ColType::Float64 | ColType::Bool, Value::String(_)) => as_f64(val).is_some(),
        (ColType::Text, Value::String(_)) => true,
        (ColType::Timestamp, Value::String(s)) => parse_datetime(s).is_some(),
        _ => false,
    }
}

/// 按列名取值，先精确后忽略大小写
pub fn lookup<'a>(rec: &'a Record, col: &str) -> Option<&'a Value> {
    rec.get(col).or_else(|| {
        rec.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(col))
            .map(|(_, v)| v)
    })
}

/// 将条件编译为谓词列表；无法在内存中求值时返回 None
/// Compile clauses into predicates; None when the cache cannot evaluate them
pub fn compile(clauses: &[Clause], meta: &TableMeta) -> Option<Vec<Pred>> {
    let mut preds = Vec::new();
    for clause in clauses {
        match clause {
            Clause::Eq { col, val } => {
                let col = meta.column(col)?;
                if !comparable(col.ty, val) {
                    return None;
                }
                preds.push(Pred {
                    col: col.name.to_string(),
                    ty: col.ty,
                    op: Op::Eq,
                    val: val.clone(),
                });
            }
            Clause::Raw { sql, args } => {
                let mut args = args.iter();
                for part in AND_SPLIT.split(strip_parens(sql.trim())) {
                    let part = strip_parens(part.trim());
                    if TAUTOLOGY.is_match(part) {
                        continue;
                    }
                    let caps = SIMPLE_PRED.captures(part)?;
                    let col = meta.column(&caps[1])?;
                    let op = Op::parse(&caps[2])?;
                    let val = args.next()?.clone();
                    if !comparable(col.ty, &val) {
                        return None;
                    }
                    preds.push(Pred {
                        col: col.name.to_string(),
                        ty: col.ty,
                        op,
                        val,
                    });
                }
                if args.next().is_some() {
                    return None;
                }
            }
        }
    }
    Some(preds)
}

pub fn matches_all(preds: &[Pred], rec: &Record) -> bool {
    preds.iter().all(|p| p.matches(rec))
}

fn strip_parens(s: &str) -> &str {
    let mut s = s;
    while s.starts_with('(') && s.ends_with(')') && balanced(&s[1..s.len() - 1]) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
