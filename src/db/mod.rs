// 数据库访问层：连接、原生 SQL、表查询与行缓存

pub mod cache;
pub mod cond;
pub mod connection;
pub mod dsn;
pub mod error;
pub mod model;
pub mod query;
pub mod raw;
pub mod stmt;
pub mod value;
