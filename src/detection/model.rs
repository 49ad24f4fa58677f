// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测模型接口 (Detector / ModelLoader / ModelSlot)
//!
//! 检测器本身是黑盒: 帧 → [{label, confidence, bbox}]。
//! `ModelSlot` 持有当前模型引用, 使用独立的锁, 整体替换;
//! 检测循环每帧取一次快照, 推理期间不持锁。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use regex::Regex;
use thiserror::Error;
use tracing::{error, info};

use super::types::{Detection, Frame};

/// 统一的检测器接口
pub trait Detector: Send + Sync {
    /// 推理: 返回置信度不低于 `conf_threshold` 的检测结果
    fn predict(&self, frame: &Frame, conf_threshold: f32) -> Result<Vec<Detection>>;
}

/// 按名称加载模型
pub trait ModelLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Arc<dyn Detector>, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("模型文件不存在: {0}")]
    NotFound(PathBuf),
    #[error("模型加载失败: {0:#}")]
    Load(#[from] anyhow::Error),
}

/// 模型仓库: `<root>/<name>.<ext>`
#[derive(Debug, Clone)]
pub struct ModelRepository {
    root: PathBuf,
    extension: String,
}

impl ModelRepository {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析模型路径, 文件不存在时返回 `NotFound`
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ModelError> {
        let path = self.root.join(format!("{}.{}", name, self.extension));
        if path.is_file() {
            Ok(path)
        } else {
            Err(ModelError::NotFound(path))
        }
    }
}

/// 当前模型槽
pub struct ModelSlot {
    loader: Box<dyn ModelLoader>,
    current: Mutex<Option<Arc<dyn Detector>>>,
}

impl ModelSlot {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn Detector>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 加载并整体替换模型; 失败时清空, 直到下一次成功加载前视为未加载
    pub fn reload(&self, name: &str) -> Result<(), ModelError> {
        info!("📦 加载模型: {}", name);
        match self.loader.load(name) {
            Ok(model) => {
                *self.lock() = Some(model);
                info!("✅ 模型加载成功: {}", name);
                Ok(())
            }
            Err(e) => {
                *self.lock() = None;
                error!("❌ 模型加载失败: {}", e);
                Err(e)
            }
        }
    }

    /// 当前模型快照
    pub fn current(&self) -> Option<Arc<dyn Detector>> {
        self.lock().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }
}

/// 解析模型元数据中的类别表, 形如 `{0: 'boxa', 1: 'blister-x'}`
pub fn parse_class_names(raw: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r#"(\d+)\s*:\s*['"]([^'"]*)['"]"#) else {
        return Vec::new();
    };
    let mut pairs: Vec<(usize, String)> = re
        .captures_iter(raw)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].to_string())))
        .collect();
    pairs.sort_by_key(|(id, _)| *id);

    let len = pairs.last().map(|(id, _)| id + 1).unwrap_or(0);
    let mut names = vec![String::new(); len];
    for (id, name) in pairs {
        names[id] = name;
    }
    names
}
