use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("配置错误: {0}")]
    Config(String),
    #[error("DSN 格式错误: {0}")]
    Dsn(String),
    #[error("SQLx 错误: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("未找到记录")]
    NotFound,
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("表 '{0}' 未绑定结构体")]
    Unbound(String),
    #[error("参数错误: {0}")]
    InvalidArgument(String),
    #[error("拒绝执行无条件的 {0}，请调用 allow_full_table()")]
    Unsafe(&'static str),
}

impl DbError {
    /// 是否为“未找到记录” / Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound | DbError::Sqlx(sqlx::Error::RowNotFound))
    }
}

/// 获取详细错误描述（中英文） / Get detailed error description (CN/EN)
pub fn describe_error(e: &DbError) -> String {
    match e {
        DbError::Config(msg) => format!("配置错误 / Config error: {}", msg),
        DbError::Dsn(msg) => format!("DSN 格式错误 / Malformed DSN: {}", msg),
        DbError::Sqlx(err) => format!("SQLx 错误 / SQLx error: {}", err),
        DbError::NotFound => "未找到记录 / Record not found".to_string(),
        DbError::Serde(msg) => format!("序列化错误 / Serialization error: {}", msg),
        DbError::Unbound(table) => format!("表未绑定 / Table not bound: {}", table),
        DbError::InvalidArgument(msg) => format!("参数错误 / Invalid argument: {}", msg),
        DbError::Unsafe(op) => format!("无条件 {} 被拒绝 / Unconditional {} refused", op, op),
    }
}
