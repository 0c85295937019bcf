use serde::de::DeserializeOwned;
use serde::Serialize;

/// 通用模型元信息 Trait（表名、主键与列）
/// Generic model meta trait (table name, primary key and columns)
///
/// 通常由 `#[dbx::model(table = "...", pk = "...")]` 生成。
pub trait DbModel {
    fn table_name() -> &'static str;
    fn primary_key() -> &'static str;
    fn columns() -> &'static [ColumnDef];
    /// 主键为 0 或 null 时插入是否交由数据库生成
    fn auto_increment() -> bool {
        true
    }
}

/// 可绑定到表的实体 / An entity that can be bound to a table
pub trait Entity: DbModel + Serialize + DeserializeOwned + Send + Sync {}

impl<T> Entity for T where T: DbModel + Serialize + DeserializeOwned + Send + Sync {}

/// 便捷宏：手动为模型实现 DbModel
/// Helper macro: implement DbModel by hand
///
/// ```ignore
/// dbx::impl_table_meta!(User, "user", "uid", [
///     ("uid", Int64), ("gid", Int64), ("name", Text), ("createDate", Timestamp)
/// ]);
/// ```
#[macro_export]
macro_rules! impl_table_meta {
    ($ty:path, $table:expr, $pk:expr, [$(($col:expr, $cty:ident)),* $(,)?]) => {
        impl $crate::db::model::DbModel for $ty {
            fn table_name() -> &'static str {
                $table
            }
            fn primary_key() -> &'static str {
                $pk
            }
            fn columns() -> &'static [$crate::db::model::ColumnDef] {
                const COLS: &[$crate::db::model::ColumnDef] = &[
                    $($crate::db::model::ColumnDef {
                        name: $col,
                        ty: $crate::db::model::ColType::$cty,
                    }),*
                ];
                COLS
            }
        }
    };
}

/// 列类型声明（用于插入/更新的绑定与缓存比较）
/// Column type declaration (for insert/update binding and cache comparison)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Int64,
    Float64,
    Bool,
    Text,
    Timestamp,
    Json,
}

/// 列定义 / Column definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColType,
}

/// 运行期的表绑定信息 / Runtime table binding
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table: String,
    pub pk: &'static str,
    pub columns: &'static [ColumnDef],
    pub auto_increment: bool,
}

impl TableMeta {
    pub fn of<T: DbModel>() -> Self {
        Self {
            table: T::table_name().to_string(),
            pk: T::primary_key(),
            columns: T::columns(),
            auto_increment: T::auto_increment(),
        }
    }

    /// 按名称查找列（忽略大小写，与 MySQL 列名规则一致）
    /// Find a column by name, case-insensitively like MySQL does
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// 规范化列名：已声明的列返回声明名，否则原样返回
    pub fn resolve<'a>(&self, name: &'a str) -> &'a str {
        match self.column(name) {
            Some(c) => c.name,
            None => name,
        }
    }

    pub fn col_type(&self, name: &str) -> Option<ColType> {
        self.column(name).map(|c| c.ty)
    }
}

/// 将实体序列化为 (列, 值) 列表，按列声明顺序
/// Serialize an entity into ordered (column, value) pairs
pub fn entity_values<T: Entity>(item: &T) -> crate::db::error::Result<Vec<(&'static str, serde_json::Value)>> {
    let js = serde_json::to_value(item)?;
    let mut obj = match js {
        serde_json::Value::Object(map) => map,
        _ => {
            return Err(crate::db::error::DbError::InvalidArgument(format!(
                "实体 {} 必须序列化为对象",
                T::table_name()
            )))
        }
    };
    Ok(T::columns()
        .iter()
        .map(|c| {
            let v = obj.remove(c.name).unwrap_or(serde_json::Value::Null);
            (c.name, v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Account {
        id: i64,
        #[serde(rename = "nickName")]
        nick_name: String,
    }

    crate::impl_table_meta!(Account, "account", "id", [("id", Int64), ("nickName", Text)]);

    #[test]
    fn test_table_meta_resolves_case_insensitively() {
        let meta = TableMeta::of::<Account>();
        assert_eq!(meta.table, "account");
        assert_eq!(meta.pk, "id");
        assert!(meta.auto_increment);
        assert_eq!(meta.resolve("NICKNAME"), "nickName");
        assert_eq!(meta.resolve("unknown"), "unknown");
        assert_eq!(meta.col_type("ID"), Some(ColType::Int64));
    }

    #[test]
    fn test_entity_values_follow_column_order() {
        let a = Account {
            id: 7,
            nick_name: "jet".into(),
        };
        let vals = entity_values(&a).unwrap();
        assert_eq!(vals[0], ("id", serde_json::json!(7)));
        assert_eq!(vals[1], ("nickName", serde_json::json!("jet")));
    }
}
