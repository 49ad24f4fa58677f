// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 日志 (tracing)
//!
//! 控制台 + 按日期分目录的日志文件: `<log_dir>/<YYYY-MM-DD>/counter_<YYYY-MM-DD>.log`

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 当天日期目录
pub fn dated_dir(root: &Path) -> PathBuf {
    root.join(chrono::Local::now().format("%Y-%m-%d").to_string())
}

/// 安装全局日志, 返回日志文件路径
pub fn init_tracing(log_dir: &Path) -> Result<PathBuf> {
    let dir = dated_dir(log_dir);
    fs::create_dir_all(&dir).with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
    let date = chrono::Local::now().format("%Y-%m-%d");
    let path = dir.join(format!("counter_{}.log", date));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("打开日志文件失败: {}", path.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()?;
    Ok(path)
}

/// 审计日志: `<endpoint> - <queue> - <json> - <STATUS>`
pub fn audit<T: Serialize + ?Sized>(endpoint: &str, queue: &str, message: &T, status: &str) {
    let json = serde_json::to_string(message).unwrap_or_else(|_| "<unserializable>".to_string());
    info!(target: "audit", "{} - {} - {} - {}", endpoint, queue, json, status);
}
