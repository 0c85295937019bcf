//! 需要真实 MySQL：设置 `DBX_TEST_DSN`（如 `root@tcp(localhost)/test`），未设置时跳过。

use chrono::NaiveDateTime;
use dbx::cmd::demo::{run_demo, DemoReport};
use dbx::{args, m, Db, DbError, Order, Repository, TableRepo};
use serde::{Deserialize, Serialize};

fn test_dsn() -> Option<String> {
    std::env::var("DBX_TEST_DSN").ok().filter(|s| !s.trim().is_empty())
}

#[dbx::model(table = "dbx_it_item", pk = "id")]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: i64,
    kind: String,
    qty: i64,
    #[serde(rename = "createdAt")]
    created_at: Option<NaiveDateTime>,
}

fn item(id: i64, kind: &str, qty: i64) -> Item {
    Item {
        id,
        kind: kind.to_string(),
        qty,
        created_at: None,
    }
}

#[tokio::test]
async fn test_demo_sequence_with_and_without_cache() {
    let Some(dsn) = test_dsn() else {
        eprintln!("DBX_TEST_DSN 未设置，跳过");
        return;
    };
    let expected = DemoReport {
        count: 2,
        sum_uid: 5,
        max_uid: 3,
        min_uid: 2,
        uid: 2,
        rows: vec![(3, "name-1".to_string()), (2, "name-0".to_string())],
    };
    for cache in [true, false] {
        let db = Db::open(&dsn).unwrap();
        let report = run_demo(&db, cache).await.unwrap();
        assert_eq!(report, expected, "cache={}", cache);
        db.close().await;
    }
}

#[tokio::test]
async fn test_cache_stays_in_sync_with_database() {
    let Some(dsn) = test_dsn() else {
        return;
    };
    let db = Db::open(&dsn).unwrap();
    db.exec("DROP TABLE IF EXISTS dbx_it_item", args![]).await.unwrap();
    db.exec(
        "CREATE TABLE dbx_it_item(
            id INT PRIMARY KEY AUTO_INCREMENT,
            kind VARCHAR(32) NOT NULL DEFAULT '',
            qty INT NOT NULL DEFAULT 0,
            createdAt DATETIME NULL
        )",
        args![],
    )
    .await
    .unwrap();
    db.bind::<Item>(true);

    let r = db
        .table("dbx_it_item")
        .insert_many(&[item(0, "a", 1), item(0, "b", 2), item(0, "a", 3)])
        .await
        .unwrap();
    assert_eq!(r.rows_affected, 3);

    let r = db.table("dbx_it_item").insert(&item(0, "c", 4)).await.unwrap();
    assert_eq!(r.last_insert_id, 4);
    db.table("dbx_it_item").replace(&item(2, "b", 20)).await.unwrap();
    db.table("dbx_it_item")
        .where_("kind=? AND qty<?", args!["a", 3])
        .update_m(m!["qty" => 100])
        .await
        .unwrap();

    let cached: Vec<Item> = db
        .table("dbx_it_item")
        .order_by("qty", Order::Desc)
        .all()
        .await
        .unwrap();
    let rows = db
        .query("SELECT id FROM dbx_it_item ORDER BY qty DESC", args![])
        .await
        .unwrap();
    let db_ids: Vec<i64> = rows.iter().map(|r| r.get::<i64>(0).unwrap()).collect();
    assert_eq!(cached.iter().map(|i| i.id).collect::<Vec<_>>(), db_ids);
    assert_eq!(db.table("dbx_it_item").sum("qty").await.unwrap(), 100 + 20 + 3 + 4);

    // 原生写入不更新缓存，load_cache 之后一致
    db.exec("UPDATE dbx_it_item SET qty=0 WHERE id=?", args![4]).await.unwrap();
    assert_eq!(db.table("dbx_it_item").where_pk(4).one::<Item>().await.unwrap().qty, 4);
    assert_eq!(db.table("dbx_it_item").load_cache().await.unwrap(), 4);
    assert_eq!(db.table("dbx_it_item").where_pk(4).one::<Item>().await.unwrap().qty, 0);

    // 非可求值条件走数据库，删除后整表重载
    db.table("dbx_it_item")
        .where_("kind=? OR qty=?", args!["c", 20])
        .delete()
        .await
        .unwrap();
    assert_eq!(db.table("dbx_it_item").count().await.unwrap(), 2);

    let err = db.table("dbx_it_item").delete().await.unwrap_err();
    assert!(matches!(err, DbError::Unsafe(_)));

    let repo = TableRepo::<Item>::new(db.clone(), true);
    let got = Repository::<Item, i64>::read_one(&repo, 1).await.unwrap();
    assert_eq!(got.map(|i| i.qty), Some(100));
    assert_eq!(Repository::<Item, i64>::delete(&repo, 1).await.unwrap(), 1);
    assert!(Repository::<Item, i64>::read_one(&repo, 1).await.unwrap().is_none());

    db.exec("DROP TABLE IF EXISTS dbx_it_item", args![]).await.unwrap();
    db.close().await;
}
