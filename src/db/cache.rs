use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

use crate::db::cond::{lookup, matches_all, Pred};
use crate::db::model::TableMeta;
use crate::db::value::{as_f64, compare_values, pk_key, PkKey, Record};

/// 排序方向 / Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    Sum,
    Max,
    Min,
}

impl Agg {
    pub fn as_sql(self) -> &'static str {
        match self {
            Agg::Sum => "SUM",
            Agg::Max => "MAX",
            Agg::Min => "MIN",
        }
    }
}

/// 整表行缓存，按主键有序
/// Whole-table row cache, ordered by primary key
///
/// 仅适合小表（十万行以内），读取时一次性 `SELECT *` 载入。
///
/// `epoch` 在每次写入的前后递增；载入或回读在发起查询前记下 epoch，
/// 结果返回时 epoch 已变化则丢弃结果并失效。
#[derive(Debug)]
pub struct TableCache {
    meta: TableMeta,
    rows: BTreeMap<PkKey, Record>,
    loaded: bool,
    epoch: u64,
}

impl TableCache {
    pub fn new(meta: TableMeta) -> Self {
        Self {
            meta,
            rows: BTreeMap::new(),
            loaded: false,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 标记有写入发生 / Record that a write is in flight or has landed
    pub fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// 用 `epoch` 时刻发起的整表查询结果替换缓存；期间有写入则失效并返回 None
    /// Apply a full snapshot taken at `epoch`; a write since then invalidates instead
    pub fn apply_snapshot(&mut self, epoch: u64, rows: Vec<Record>) -> Option<usize> {
        if self.epoch != epoch {
            self.invalidate();
            return None;
        }
        self.replace_all(rows);
        Some(self.len())
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 整表替换 / Replace the whole table
    pub fn replace_all(&mut self, rows: Vec<Record>) {
        self.rows.clear();
        for rec in rows {
            self.put(rec);
        }
        self.loaded = true;
    }

    /// 写入一行；没有主键的行被忽略
    pub fn put(&mut self, rec: Record) -> Option<PkKey> {
        let key = lookup(&rec, self.meta.pk).and_then(pk_key)?;
        self.rows.insert(key.clone(), rec);
        Some(key)
    }

    pub fn remove(&mut self, key: &PkKey) -> Option<Record> {
        self.rows.remove(key)
    }

    pub fn get(&self, key: &PkKey) -> Option<&Record> {
        self.rows.get(key)
    }

    /// 失效：下次读取时重新载入 / Invalidate, reload on next read
    pub fn invalidate(&mut self) {
        self.rows.clear();
        self.loaded = false;
    }

    fn matching<'a>(&'a self, preds: &'a [Pred]) -> impl Iterator<Item = (&'a PkKey, &'a Record)> + 'a {
        self.rows.iter().filter(move |(_, r)| matches_all(preds, r))
    }

    pub fn matching_keys(&self, preds: &[Pred]) -> Vec<PkKey> {
        self.matching(preds).map(|(k, _)| k.clone()).collect()
    }

    /// 过滤、排序、分页 / Filter, order and paginate
    pub fn select(
        &self,
        preds: &[Pred],
        order: Option<(&str, Order)>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Vec<Record> {
        let mut out: Vec<&Record> = self.matching(preds).map(|(_, r)| r).collect();
        if let Some((col, dir)) = order {
            // 稳定排序，同值保持主键顺序；NULL 视为最小（同 MySQL）
            out.sort_by(|a, b| {
                let ord = cmp_nullable(lookup(a, col), lookup(b, col));
                match dir {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }
        let skip = offset.unwrap_or(0) as usize;
        let take = limit.map(|n| n as usize).unwrap_or(usize::MAX);
        out.into_iter().skip(skip).take(take).cloned().collect()
    }

    pub fn count(&self, preds: &[Pred]) -> i64 {
        self.matching(preds).count() as i64
    }

    /// 聚合：忽略 NULL，空集返回 0
    /// Aggregate over a column, skipping NULLs; empty set yields 0
    pub fn aggregate(&self, preds: &[Pred], col: &str, agg: Agg) -> i64 {
        let values = self
            .matching(preds)
            .filter_map(|(_, r)| lookup(r, col))
            .filter(|v| !v.is_null());
        match agg {
            Agg::Sum => sum(values),
            Agg::Max => pick(values, Ordering::Greater),
            Agg::Min => pick(values, Ordering::Less),
        }
    }
}

/// 整数列精确求和；含小数时按浮点求和后四舍五入（同 `CAST(... AS SIGNED)`）
fn sum<'a>(values: impl Iterator<Item = &'a Value>) -> i64 {
    let mut int_sum = 0i64;
    let mut float_sum = 0f64;
    let mut fractional = false;
    for v in values {
        match v.as_i64() {
            Some(i) => int_sum = int_sum.wrapping_add(i),
            None => {
                if let Some(f) = as_f64(v) {
                    float_sum += f;
                    fractional = true;
                }
            }
        }
    }
    if fractional {
        (int_sum as f64 + float_sum).round() as i64
    } else {
        int_sum
    }
}

fn pick<'a>(values: impl Iterator<Item = &'a Value>, want: Ordering) -> i64 {
    let mut best: Option<&Value> = None;
    for v in values {
        best = match best {
            Some(b) if compare_values(v, b) != Some(want) => Some(b),
            _ => Some(v),
        };
    }
    match best {
        Some(v) => v.as_i64().or_else(|| as_f64(v).map(|f| f.round() as i64)).unwrap_or(0),
        None => 0,
    }
}

fn cmp_nullable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
    }
}
