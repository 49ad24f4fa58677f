// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 结果下发 (Dispatch)
//!
//! - Outcome:            `{itemId, count, code?}`
//! - Dispatcher:         出站消息接口 (传输层为外部协作者)
//! - JsonLinesDispatcher: 每条消息一行 JSON
//! - RetryingDispatcher:  有限次重试 + 指数退避, 耗尽后记录错误
//! - ArtifactStore:      匹配帧标注后保存为 JPEG

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::detection::{Detection, Frame};
use crate::telemetry::{audit, dated_dir};

/// 一次计数周期的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub item_id: String,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
}

impl Outcome {
    pub fn new(label: &str, count: u32) -> Self {
        Self {
            item_id: label.to_uppercase(),
            count,
            code: None,
        }
    }

    pub fn with_code(mut self, code: Option<u32>) -> Self {
        self.code = code.map(|c| c.to_string());
        self
    }
}

/// 出站消息接口
pub trait Dispatcher: Send + Sync {
    fn publish(&self, queue: &str, body: &Value) -> Result<()>;

    /// 审计日志中的端点名
    fn endpoint(&self) -> &str {
        "local"
    }

    fn audit(&self, queue: &str, body: &Value, status: &str) {
        audit(self.endpoint(), queue, body, status);
    }
}

/// 发送结果; 失败只记录日志, 不回滚目标状态
pub fn send_outcome(dispatcher: &dyn Dispatcher, queue: &str, outcome: &Outcome) -> bool {
    let body = match serde_json::to_value(outcome) {
        Ok(body) => body,
        Err(e) => {
            error!("❌ 结果序列化失败: {}", e);
            return false;
        }
    };
    match dispatcher.publish(queue, &body) {
        Ok(()) => {
            dispatcher.audit(queue, &body, "SENT");
            true
        }
        Err(e) => {
            error!("❌ 结果发送失败 {} {}: {:#}", queue, body, e);
            false
        }
    }
}

/// JSON 行输出: `{"queue": .., "body": ..}`
pub struct JsonLinesDispatcher<W: Write + Send> {
    endpoint: String,
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesDispatcher<W> {
    pub fn new(endpoint: impl Into<String>, out: W) -> Self {
        Self {
            endpoint: endpoint.into(),
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Dispatcher for JsonLinesDispatcher<W> {
    fn publish(&self, queue: &str, body: &Value) -> Result<()> {
        let line = serde_json::to_string(&json!({ "queue": queue, "body": body }))?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 重试包装
pub struct RetryingDispatcher {
    inner: Box<dyn Dispatcher>,
    attempts: u32,
    backoff: Duration,
}

impl RetryingDispatcher {
    pub fn new(inner: Box<dyn Dispatcher>, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Dispatcher for RetryingDispatcher {
    fn publish(&self, queue: &str, body: &Value) -> Result<()> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.inner.publish(queue, body) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "⚠️ 发送失败 ({}/{}), {:?} 后重试: {:#}",
                        attempt, self.attempts, delay, e
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("发送失败, 已重试 {} 次", self.attempts)));
                }
            }
        }
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }
}

/// 匹配帧保存
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 标注目标检测框后保存到 `<root>/<YYYY-MM-DD>/<name>.jpg`
    pub fn save(
        &self,
        name: &str,
        frame: &Frame,
        detections: &[Detection],
        label: &str,
    ) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .with_context(|| format!("非法文件名: {:?}", name))?;

        let annotated = annotate(frame, detections, label);
        let dir = dated_dir(&self.root);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("创建目录失败: {}", dir.display()))?;
        let path = dir.join(format!("{}.jpg", file_name));
        annotated
            .save(&path)
            .with_context(|| format!("保存图片失败: {}", path.display()))?;
        info!("💾 帧已保存: {}", path.display());
        Ok(path)
    }
}

/// 在帧上绘制目标标签的检测框 (绿色, 2px)
pub fn annotate(frame: &Frame, detections: &[Detection], label: &str) -> Frame {
    let mut canvas = frame.clone();
    let color = Rgb([0u8, 255, 0]);
    for d in detections.iter().filter(|d| d.is(label)) {
        let x = d.bbox.x1.round() as i32;
        let y = d.bbox.y1.round() as i32;
        let w = d.bbox.width().round() as u32;
        let h = d.bbox.height().round() as u32;
        if w < 3 || h < 3 {
            continue;
        }
        draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), color);
        draw_hollow_rect_mut(&mut canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
    }
    canvas
}
