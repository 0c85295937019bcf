use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::connection::{Db, PoolConfig};
use crate::{args, m};

/// 演示用的用户表 / The demo `user` table
#[dbx::model(table = "user", pk = "uid")]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: i64,
    pub gid: i64,
    pub name: String,
    #[serde(rename = "createDate")]
    pub create_date: NaiveDateTime,
}

pub const CREATE_USER_TABLE: &str = "CREATE TABLE user(
    uid        INT(11) PRIMARY KEY AUTO_INCREMENT,
    gid        INT(11) NOT NULL DEFAULT '0',
    name       TEXT             DEFAULT '',
    createDate DATETIME         DEFAULT CURRENT_TIMESTAMP
)";

/// 演示结束时的统计 / Figures printed at the end of the demo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoReport {
    pub count: i64,
    pub sum_uid: i64,
    pub max_uid: i64,
    pub min_uid: i64,
    pub uid: i64,
    pub rows: Vec<(i64, String)>,
}

/// 演示使用的连接池参数 / Pool settings used by the demo
pub fn demo_pool() -> PoolConfig {
    PoolConfig::default()
        .max_open(10)
        .conn_max_lifetime(Duration::from_secs(5))
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// 依次执行：建表、插入、读取、更新、删除、聚合、原生查询
/// Runs create table, insert, read, update, delete, aggregate and raw queries in order
pub async fn run_demo(db: &Db, cache: bool) -> Result<DemoReport> {
    db.exec("DROP TABLE IF EXISTS user", args![])
        .await
        .context("删除 user 表失败")?;
    db.exec(CREATE_USER_TABLE, args![])
        .await
        .context("创建 user 表失败")?;

    // 一般只针对小表开启缓存，超过 10w 行不建议开启
    db.bind::<User>(cache);
    db.enable_cache(cache);

    let u1 = User {
        uid: 1,
        gid: 1,
        name: "jet".to_string(),
        create_date: now(),
    };
    db.table("user").insert(&u1).await?;

    let mut u2: User = db.table("user").where_pk(1).one().await?;
    println!("{:?}", u2);

    u2.name = "jet.li".to_string();
    db.table("user").update(&u2).await?;

    db.table("user")
        .where_m(m!["uid" => 1, "gid" => 1])
        .update_m(m!["Name" => "jet.li"])
        .await?;

    db.table("user").where_pk(1).delete().await?;

    // uid 为 0 时由自增生成，避免与已用主键冲突
    for i in 0..5i64 {
        let u = User {
            uid: 0,
            gid: i,
            name: format!("name-{}", i),
            create_date: now(),
        };
        db.table("user").insert(&u).await?;
    }

    let users: Vec<User> = db.table("user").where_("uid>?", args![1]).all().await?;
    for u in &users {
        println!("{:?}", u);
    }

    db.table("user")
        .where_("uid>?", args![3])
        .update_m(m!["gid" => 10])
        .await?;
    db.table("user").where_("uid>?", args![3]).delete().await?;

    let mut report = DemoReport {
        count: db.table("user").where_("uid>?", args![-1]).count().await?,
        sum_uid: db.table("user").where_("uid>?", args![-1]).sum("uid").await?,
        max_uid: db.table("user").where_("uid>?", args![-1]).max("uid").await?,
        min_uid: db.table("user").where_("uid>?", args![-1]).min("uid").await?,
        ..Default::default()
    };
    println!("count: {}", report.count);
    println!("sum(uid): {}", report.sum_uid);
    println!("max(uid): {}", report.max_uid);
    println!("min(uid): {}", report.min_uid);

    report.uid = db
        .query_scalar("SELECT uid FROM user WHERE uid=?", args![2])
        .await?;
    println!("uid: {}", report.uid);
    // 原生 SQL 不经过缓存，需手动刷新
    db.table("user").load_cache().await?;

    let rows = db
        .query("SELECT `uid`, `name` FROM `user` WHERE 1 ORDER BY uid DESC", args![])
        .await?;
    for row in &rows {
        let (uid, name): (i64, String) = row.scan()?;
        println!("uid: {}, name: {}", uid, name);
        report.rows.push((uid, name));
    }
    db.table("user").load_cache().await?;

    Ok(report)
}
