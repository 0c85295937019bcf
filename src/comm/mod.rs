/// 通用模块：配置与日志
/// Common module: configuration and logging

pub mod config;
pub mod tracing;
