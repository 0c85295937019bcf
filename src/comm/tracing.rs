use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use tracing_log::LogTracer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        let s = format!(
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        );
        w.write_str(&s)
    }
}

/// 以追加模式打开日志文件，自动创建目录
/// Open a log file in append mode, creating parent directories
pub fn open_log_file(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("打开日志文件失败: {}", path.display()))
}

/// 初始化日志：级别取 `logging.level`；配置了 `logging.errorFile` 时错误另写文件
/// Init logging from `logging.level`; errors also go to `logging.errorFile` when set
pub fn init_tracing() -> Result<()> {
    let mgr = crate::comm::config::get_global_config_manager().ok();
    let error_file: Option<String> = mgr.as_ref().and_then(|m| m.get("logging.errorFile").ok());
    match error_file {
        Some(path) => init_tracing_with_error_log(path),
        None => install(None),
    }
}

/// 初始化日志，并把 ERROR 级别事件（含 `dbx::error`）追加写入指定文件
/// Init logging and append ERROR events (including `dbx::error`) to a file
pub fn init_tracing_with_error_log(path: impl AsRef<Path>) -> Result<()> {
    let file = open_log_file(path)?;
    install(Some(file))
}

fn install(error_file: Option<File>) -> Result<()> {
    let level: String = crate::comm::config::get_global_config_manager()
        .ok()
        .and_then(|mgr| mgr.get("logging.level").ok())
        .unwrap_or_else(|| "info".to_string());

    // sqlx 自带的语句日志与 dbx::sql 重复，压到 warn
    let filter = EnvFilter::try_new(format!("{},sqlx=warn", level))
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    LogTracer::init().ok();

    let console = fmt::layer()
        .with_timer(LogTimer)
        .compact()
        .with_target(true)
        .with_filter(filter);
    let errors = error_file.map(|f| {
        fmt::layer()
            .with_writer(Mutex::new(f))
            .with_ansi(false)
            .with_timer(LogTimer)
            .with_filter(LevelFilter::ERROR)
    });

    tracing_subscriber::registry()
        .with(console)
        .with(errors)
        .try_init()
        .ok();
    Ok(())
}
