use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 环境变量前缀：`DBX_DATABASE_DEFAULT_HOST` → `database.default.host`
pub const ENV_PREFIX: &str = "DBX";

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置项 '{key}' 不存在")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败: {message}")]
    TypeConversionError { key: String, message: String },
}

/// 配置数据源信息
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 单个数据库分组的配置 / Configuration of one database group
///
/// 对应 `[database.<group>]`，键名沿用驼峰写法。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbGroupConfig {
    /// `mysql://` URL 或 Go 驱动格式 DSN
    pub dsn: Option<String>,
    /// `dsn` 的别名
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub name: Option<String>,
    pub max_open: Option<u32>,
    pub min_idle: Option<u32>,
    /// 秒 / seconds
    pub conn_max_lifetime: Option<u64>,
    /// 秒 / seconds
    pub acquire_timeout: Option<u64>,
    pub echo_sql: Option<bool>,
    pub cache: Option<bool>,
}

/// 配置管理器
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 创建配置管理器
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用指定的配置源创建配置管理器
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        // 优先级从低到高，后添加者优先生效：
        // development.toml -> default.toml -> production.toml -> 环境变量 -> 调用方追加的源
        let default_sources = vec![
            ConfigSource::File {
                path: "config/development.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/default.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/production.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::Env {
                prefix: ENV_PREFIX.to_string(),
                separator: "_",
            },
        ];
        Self::build(default_sources.into_iter().chain(sources).collect())
    }

    /// 仅使用给定的配置源（不读默认文件与环境变量）
    /// Only the given sources, without default files and environment
    pub fn from_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        Self::build(sources)
    }

    fn build(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::new();

        for (idx, source) in sources.into_iter().enumerate() {
            let info = source.get_source_info(idx as u8 + 1);

            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && *required {
                    return Err(anyhow!("必需的配置文件不存在: {}", path));
                }
                if !exists {
                    // 可选文件不存在，记录但不添加
                    sources_info.push(info);
                    continue;
                }
            }

            builder = source
                .add_to_builder(builder)
                .map_err(|e| anyhow!("添加配置源失败: {}", e))?;
            sources_info.push(ConfigSourceInfo {
                loaded: true,
                ..info
            });
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败: {}", e))?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 获取指定 key 的配置值
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败: {}", key, e))
    }

    /// 安全获取配置值，返回详细错误信息
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::TypeConversionError {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 检查配置项是否存在
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    /// 读取数据库分组配置；分组不存在时返回全默认值
    /// Read a database group; a missing group yields all defaults
    ///
    /// 环境变量会把键名转成小写（`DBX_DATABASE_DEFAULT_MAXOPEN` → `maxopen`），
    /// 因此这里按小写键兜底读取。
    pub fn database_group(&self, group: &str) -> Result<DbGroupConfig> {
        let prefix = format!("database.{}", group);
        let mut cfg: DbGroupConfig = match self.get_safe::<DbGroupConfig>(&prefix) {
            Ok(c) => c,
            Err(ConfigError::KeyNotFound { .. }) => DbGroupConfig::default(),
            Err(e) => return Err(anyhow!(e)),
        };
        let lower = |k: &str| format!("{}.{}", prefix, k.to_lowercase());
        cfg.max_open = cfg.max_open.or_else(|| self.get(&lower("maxOpen")).ok());
        cfg.min_idle = cfg.min_idle.or_else(|| self.get(&lower("minIdle")).ok());
        cfg.conn_max_lifetime = cfg
            .conn_max_lifetime
            .or_else(|| self.get(&lower("connMaxLifetime")).ok());
        cfg.acquire_timeout = cfg
            .acquire_timeout
            .or_else(|| self.get(&lower("acquireTimeout")).ok());
        cfg.echo_sql = cfg.echo_sql.or_else(|| self.get(&lower("echoSql")).ok());
        Ok(cfg)
    }

    /// 获取当前活跃的配置源（已成功加载的）
    pub fn get_active_sources(&self) -> Vec<&ConfigSourceInfo> {
        self.sources_info.iter().filter(|info| info.loaded).collect()
    }
}

/// 配置源类型
pub enum ConfigSource {
    /// 文件配置源
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源（HashMap）
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    /// 获取配置源信息
    pub fn get_source_info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => (
                "File",
                format!(
                    "文件配置源: {} (格式: {}, 必需: {})",
                    path,
                    format.as_ref().map(format_name).unwrap_or("Auto-detect"),
                    required
                ),
            ),
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("环境变量配置源: 前缀={}, 分隔符={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => ("Memory", format!("内存配置源: {} 个配置项", map.len())),
            ConfigSource::String { format, .. } => (
                "String",
                format!("字符串配置源: 格式={}", format_name(format)),
            ),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    pub fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file_source = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator(separator)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let json_content = serde_json::to_string(&map)
                    .map_err(|e| anyhow!("序列化内存配置失败: {}", e))?;
                Ok(builder.add_source(File::from_str(&json_content, FileFormat::Json)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

fn format_name(format: &FileFormat) -> &'static str {
    match format {
        FileFormat::Toml => "TOML",
        FileFormat::Yaml => "YAML",
        FileFormat::Json => "JSON",
        FileFormat::Ini => "INI",
        FileFormat::Ron => "RON",
        FileFormat::Json5 => "JSON5",
        _ => "Unknown",
    }
}

/// 获取全局配置管理器实例（单例模式）
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let manager = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置管理器锁失败: {}", e))?;
        if let Some(ref config_manager) = *manager {
            return Ok(Arc::clone(config_manager));
        }
    }
    let mut manager = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    match manager.as_ref() {
        Some(existing) => Ok(Arc::clone(existing)),
        None => {
            let config_manager =
                Arc::new(ConfigManager::new().map_err(|e| anyhow!("创建配置管理器失败: {}", e))?);
            *manager = Some(Arc::clone(&config_manager));
            Ok(config_manager)
        }
    }
}

/// 替换全局配置管理器（CLI 指定配置文件时使用）
pub fn set_global_config_manager(manager: ConfigManager) -> Result<()> {
    let mut guard = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    *guard = Some(Arc::new(manager));
    Ok(())
}
