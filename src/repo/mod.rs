use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::cache::Order;
use crate::db::connection::Db;
use crate::db::error::{DbError, Result};
use crate::db::model::Entity;
use crate::db::query::TableQuery;

/// 通用仓库 Trait，约定标准 CRUD 操作。
/// 该 Trait 不依赖具体存储，`TableRepo` 为基于 `Db` 的实现。
#[async_trait]
pub trait Repository<T, PK> {
    /// 创建记录，返回生成的主键；未生成主键时返回影响行数。
    async fn create(&self, model: &T) -> Result<u64>;

    /// 读取一条记录（按主键）。
    async fn read_one(&self, pk: PK) -> Result<Option<T>>;

    /// 读取所有记录。
    async fn read_all(&self) -> Result<Vec<T>>;

    /// 更新记录（按主键）。
    async fn update(&self, model: &T) -> Result<u64>;

    /// 删除记录（按主键）。
    async fn delete(&self, pk: PK) -> Result<u64>;

    /// 分页读取，按主键升序。
    async fn page(&self, limit: i64, offset: i64) -> Result<Vec<T>>;
}

/// 基于表绑定的仓库 / Repository over a bound table
pub struct TableRepo<T> {
    db: Db,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> TableRepo<T> {
    /// 创建仓库；表尚未绑定时按 `cache` 绑定
    pub fn new(db: Db, cache: bool) -> Self {
        if !db.is_bound(T::table_name()) {
            db.bind::<T>(cache);
        }
        Self {
            db,
            _marker: PhantomData,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn query(&self) -> TableQuery {
        self.db.table(T::table_name())
    }
}

#[async_trait]
impl<T, PK> Repository<T, PK> for TableRepo<T>
where
    T: Entity + 'static,
    PK: Into<Value> + Send + 'static,
{
    async fn create(&self, model: &T) -> Result<u64> {
        let r = self.query().insert(model).await?;
        Ok(if r.last_insert_id > 0 {
            r.last_insert_id
        } else {
            r.rows_affected
        })
    }

    async fn read_one(&self, pk: PK) -> Result<Option<T>> {
        match self.query().where_pk(pk).one::<T>().await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_all(&self) -> Result<Vec<T>> {
        self.query().all().await
    }

    async fn update(&self, model: &T) -> Result<u64> {
        Ok(self.query().update(model).await?.rows_affected)
    }

    async fn delete(&self, pk: PK) -> Result<u64> {
        Ok(self.query().where_pk(pk).delete().await?.rows_affected)
    }

    async fn page(&self, limit: i64, offset: i64) -> Result<Vec<T>> {
        if limit < 0 || offset < 0 {
            return Err(DbError::InvalidArgument(format!(
                "分页参数非法: limit={} offset={}",
                limit, offset
            )));
        }
        self.query()
            .order_by(T::primary_key(), Order::Asc)
            .limit(limit as u64)
            .offset(offset as u64)
            .all()
            .await
    }
}
