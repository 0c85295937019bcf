use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use dbx::db::cache::{Agg, Order, TableCache};
use dbx::db::cond::{compile, Clause};
use dbx::db::model::TableMeta;
use dbx::db::value::Record;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Serialize, Deserialize)]
struct User {
    uid: i64,
    gid: i64,
    name: String,
}

dbx::impl_table_meta!(User, "user", "uid", [("uid", Int64), ("gid", Int64), ("name", Text)]);

fn filled_cache(n: i64) -> TableCache {
    let mut cache = TableCache::new(TableMeta::of::<User>());
    let rows: Vec<Record> = (1..=n)
        .map(|i| match json!({"uid": i, "gid": i % 50, "name": format!("name-{}", i)}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        })
        .collect();
    cache.replace_all(rows);
    cache
}

fn benchmark_condition_compile(c: &mut Criterion) {
    let meta = TableMeta::of::<User>();
    let clauses = vec![
        Clause::Raw {
            sql: "uid > ? AND gid <= ?".to_string(),
            args: vec![json!(10), json!(20)],
        },
        Clause::Eq {
            col: "name".to_string(),
            val: json!("name-42"),
        },
    ];

    c.bench_function("compile_conditions", |b| {
        b.iter(|| compile(black_box(&clauses), black_box(&meta)))
    });

    let or_clause = vec![Clause::Raw {
        sql: "uid = ? OR gid = ?".to_string(),
        args: vec![json!(1), json!(2)],
    }];
    c.bench_function("compile_rejects_or", |b| {
        b.iter(|| compile(black_box(&or_clause), black_box(&meta)))
    });
}

fn benchmark_cache_reads(c: &mut Criterion) {
    let meta = TableMeta::of::<User>();
    for size in [1_000i64, 10_000, 100_000].iter() {
        let cache = filled_cache(*size);
        let preds = compile(
            &[Clause::Raw {
                sql: "gid = ?".to_string(),
                args: vec![json!(7)],
            }],
            &meta,
        )
        .unwrap_or_default();

        c.bench_function(&format!("cache_select_ordered_{}", size), |b| {
            b.iter(|| cache.select(black_box(&preds), Some(("name", Order::Desc)), None, Some(20)))
        });

        c.bench_function(&format!("cache_count_{}", size), |b| {
            b.iter(|| cache.count(black_box(&preds)))
        });

        c.bench_function(&format!("cache_sum_{}", size), |b| {
            b.iter(|| cache.aggregate(black_box(&preds), "uid", Agg::Sum))
        });
    }
}

criterion_group!(benches, benchmark_condition_compile, benchmark_cache_reads);
criterion_main!(benches);
