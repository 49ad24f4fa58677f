// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 指令接收 (Command Intake)
//!
//! 每次处理一条指令, 处理完成后(无论成功或失败)确认该消息。
//! 指令格式: `{"itemId": "...", "quantity": N, "model"?: "...", "fileName"?: "..."}`

use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::QUEUE_RECEIVE;
use crate::detection::ModelError;
use crate::dispatch::Dispatcher;
use crate::orchestrator::SharedState;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("指令格式错误: {0}")]
    Malformed(String),
    #[error("指令缺少 itemId")]
    MissingItemId,
    #[error("数量无效: {0}")]
    InvalidQuantity(String),
    #[error("首次使用必须指定模型")]
    ModelRequired,
    #[error(transparent)]
    ModelLoad(#[from] ModelError),
}

/// 已校验的入站指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub item_id: String,
    pub quantity: u32,
    pub model: Option<String>,
    pub file_name: Option<String>,
}

impl Command {
    pub fn parse(body: &[u8]) -> Result<Self, CommandError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| CommandError::Malformed(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, CommandError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CommandError::Malformed("不是JSON对象".to_string()))?;

        // 标签按原样匹配检测类别, 不做裁剪
        let item_id = obj
            .get("itemId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(CommandError::MissingItemId)?
            .to_string();

        let raw = obj.get("quantity").cloned().unwrap_or(Value::Null);
        let quantity = raw
            .as_i64()
            .filter(|q| *q > 0)
            .and_then(|q| u32::try_from(q).ok())
            .ok_or_else(|| CommandError::InvalidQuantity(raw.to_string()))?;

        let optional = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            item_id,
            quantity,
            model: optional("model"),
            file_name: optional("fileName"),
        })
    }
}

/// 一条待确认的消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum SourcePoll {
    Delivery(Delivery),
    /// 超时内无消息
    Idle,
    /// 输入已结束
    Closed,
}

/// 入站消息源 (队列客户端为外部协作者)
pub trait CommandSource: Send {
    fn poll(&mut self, timeout: Duration) -> Result<SourcePoll>;
    fn ack(&mut self, tag: u64) -> Result<()>;
}

/// 内存通道消息源的发布端
#[derive(Clone)]
pub struct CommandPublisher {
    tx: Sender<Delivery>,
    next_tag: Arc<AtomicU64>,
    acked: Arc<Mutex<Vec<u64>>>,
}

impl CommandPublisher {
    /// 发布一条消息, 返回其确认标签; 接收端已关闭时返回 None
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Option<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(Delivery {
                tag,
                body: body.into(),
            })
            .ok()?;
        Some(tag)
    }

    /// 已确认的标签
    pub fn acked(&self) -> Vec<u64> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ChannelCommandSource {
    rx: Receiver<Delivery>,
    acked: Arc<Mutex<Vec<u64>>>,
}

/// 创建内存通道消息源
pub fn channel(capacity: usize) -> (CommandPublisher, ChannelCommandSource) {
    let (tx, rx) = bounded(capacity.max(1));
    let acked = Arc::new(Mutex::new(Vec::new()));
    (
        CommandPublisher {
            tx,
            next_tag: Arc::new(AtomicU64::new(0)),
            acked: Arc::clone(&acked),
        },
        ChannelCommandSource { rx, acked },
    )
}

impl CommandSource for ChannelCommandSource {
    fn poll(&mut self, timeout: Duration) -> Result<SourcePoll> {
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => Ok(SourcePoll::Delivery(delivery)),
            Err(RecvTimeoutError::Timeout) => Ok(SourcePoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(SourcePoll::Closed),
        }
    }

    fn ack(&mut self, tag: u64) -> Result<()> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tag);
        debug!("已确认消息 #{}", tag);
        Ok(())
    }
}

/// JSON 行消息源: 后台线程逐行读取 (stdin / 文件 / FIFO)
pub struct SpoolCommandSource {
    inner: ChannelCommandSource,
}

impl SpoolCommandSource {
    pub fn spawn<R>(reader: R) -> std::io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (publisher, inner) = channel(16);
        thread::Builder::new()
            .name("spool-reader".into())
            .spawn(move || {
                for line in reader.lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("读取指令失败: {}", e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if publisher.publish(line).is_none() {
                        break;
                    }
                }
                debug!("指令输入结束");
            })?;
        Ok(Self { inner })
    }
}

impl CommandSource for SpoolCommandSource {
    fn poll(&mut self, timeout: Duration) -> Result<SourcePoll> {
        self.inner.poll(timeout)
    }

    fn ack(&mut self, tag: u64) -> Result<()> {
        self.inner.ack(tag)
    }
}

pub struct CommandIntake {
    state: SharedState,
    dispatcher: Arc<dyn Dispatcher>,
    poll_timeout: Duration,
}

impl CommandIntake {
    pub fn new(state: SharedState, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            state,
            dispatcher,
            poll_timeout: Duration::from_millis(200),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// 处理一条指令: 校验 → (可选) 加载模型 → 原子替换目标 → 唤醒检测循环
    ///
    /// 任一步失败时目标保持不变。
    pub fn handle(&self, body: &[u8]) -> Result<Command, CommandError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| CommandError::Malformed(e.to_string()))?;
        self.dispatcher.audit(QUEUE_RECEIVE, &value, "RECEIVED");
        let command = Command::from_value(&value)?;

        match &command.model {
            Some(name) => {
                self.state.models.reload(name)?;
                self.dispatcher
                    .audit(QUEUE_RECEIVE, &json!({ "model": name }), "MODEL_LOADED");
            }
            None if !self.state.models.is_loaded() => return Err(CommandError::ModelRequired),
            None => debug!("沿用已加载模型"),
        }

        self.state.target.accept(
            &command.item_id,
            command.quantity,
            command.file_name.clone(),
        );
        self.state.new_target.set();
        info!(
            "🎯 新目标: {} × {}{}",
            command.item_id.to_lowercase(),
            command.quantity,
            command
                .file_name
                .as_deref()
                .map(|f| format!(" → {}", f))
                .unwrap_or_default()
        );
        Ok(command)
    }

    /// 消费循环; 每条消息处理后必确认, 包括处理过程中的 panic
    pub fn run(&self, source: &mut dyn CommandSource, shutdown: &AtomicBool) {
        info!("📨 指令接收启动 ({})", QUEUE_RECEIVE);
        while !shutdown.load(Ordering::SeqCst) {
            let delivery = match source.poll(self.poll_timeout) {
                Ok(SourcePoll::Delivery(delivery)) => delivery,
                Ok(SourcePoll::Idle) => continue,
                Ok(SourcePoll::Closed) => {
                    info!("指令源已关闭");
                    break;
                }
                Err(e) => {
                    warn!("⚠️ 读取指令失败: {:#}", e);
                    thread::sleep(self.poll_timeout);
                    continue;
                }
            };

            match catch_unwind(AssertUnwindSafe(|| self.handle(&delivery.body))) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(
                    "❌ 指令被拒绝: {} ({})",
                    e,
                    String::from_utf8_lossy(&delivery.body)
                ),
                Err(_) => error!("❌ 指令处理异常 #{}", delivery.tag),
            }

            if let Err(e) = source.ack(delivery.tag) {
                warn!("⚠️ 确认消息 #{} 失败: {:#}", delivery.tag, e);
            }
        }
        info!("📨 指令接收退出");
    }
}
