// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 设备监管 (Connection Supervisor)
//!
//! 独立线程, 周期探测头显在位状态:
//! - 未连接 → 已连接: 启动采集源, 等待设备就绪, 打开句柄, 置位 device-ready
//! - 已连接 → 断开:   清除 device-ready, 恢复传输服务, 释放句柄
//!
//! 断线处理也可由事件总线上的 `DeviceEvent::Anomaly` 立即触发;
//! 幂等性统一在 `DeviceLink::disconnect` 中保证。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::detection::Frame;
use crate::input::{CaptureError, CaptureHandle, CaptureSource, DeviceProbe, Presence, SourceLauncher};
use crate::state::Signal;

/// 设备事件总线消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// 异常日志, 按断线处理
    Anomaly(String),
    Shutdown,
}

/// 创建设备事件总线
pub fn device_bus() -> (Sender<DeviceEvent>, Receiver<DeviceEvent>) {
    unbounded()
}

/// 设备链路: device-ready 信号 + 采集句柄的唯一持有者
pub struct DeviceLink {
    ready: Signal,
    engaged: AtomicBool,
    handle: Mutex<Option<Box<dyn CaptureHandle>>>,
    source: Box<dyn CaptureSource>,
    launcher: Box<dyn SourceLauncher>,
    probe: Arc<dyn DeviceProbe>,
}

impl DeviceLink {
    pub fn new(
        source: Box<dyn CaptureSource>,
        launcher: Box<dyn SourceLauncher>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Self {
        Self {
            ready: Signal::new(),
            engaged: AtomicBool::new(false),
            handle: Mutex::new(None),
            source,
            launcher,
            probe,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn CaptureHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout)
    }

    /// 是否处于一次连接周期内 (已开始连接且尚未断线处理)
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// 连接周期开始: 启动采集源
    pub fn begin_connect(&self) {
        self.engaged.store(true, Ordering::SeqCst);
        if let Err(e) = self.launcher.start() {
            error!("❌ 采集源启动失败: {:#}", e);
        }
    }

    /// 打开采集句柄; 失败时 device-ready 保持清除, 由轮询重试
    pub fn open(&self) -> bool {
        let mut slot = self.slot();
        if let Some(mut stale) = slot.take() {
            stale.release();
        }
        match self.source.open() {
            Ok(handle) => {
                *slot = Some(handle);
                self.ready.set();
                info!("✅ 设备就绪");
                true
            }
            Err(e) => {
                self.ready.clear();
                // 下一次轮询重新走连接流程
                self.engaged.store(false, Ordering::SeqCst);
                warn!("❌ 摄像头打开失败: {}", e);
                false
            }
        }
    }

    /// 断线处理 (幂等): 清除 device-ready → 恢复传输服务 → 释放句柄
    ///
    /// 返回 false 表示已处于断开状态, 未产生任何副作用。
    pub fn disconnect(&self) -> bool {
        let handle = self.slot().take();
        if !self.engaged.swap(false, Ordering::SeqCst) && handle.is_none() {
            return false;
        }
        self.ready.clear();
        self.recover();
        if let Some(mut handle) = handle {
            handle.release();
        }
        true
    }

    /// 设备被拔出: 上次打开失败时链路已是断开状态, 仍需恢复传输服务
    pub fn unplugged(&self) {
        if !self.disconnect() {
            self.ready.clear();
            self.recover();
        }
    }

    fn recover(&self) {
        if let Err(e) = self.probe.recover() {
            error!("❌ 传输服务恢复失败: {:#}", e);
        }
    }

    /// 读取一帧; 每次读取前重新检查 device-ready
    pub fn read_frame(&self, timeout: Duration) -> Result<Frame, CaptureError> {
        if !self.is_ready() {
            return Err(CaptureError::NotReady);
        }
        match self.slot().as_mut() {
            Some(handle) => handle.read(timeout),
            None => Err(CaptureError::Closed),
        }
    }

    /// 关闭时唤醒所有等待 device-ready 的线程
    pub fn wake_all(&self) {
        self.ready.set();
    }

    /// 关闭时释放句柄 (不触发恢复)
    pub fn release(&self) {
        self.ready.clear();
        self.engaged.store(false, Ordering::SeqCst);
        if let Some(mut handle) = self.slot().take() {
            handle.release();
        }
    }
}

pub struct ConnectionSupervisor {
    link: Arc<DeviceLink>,
    probe: Arc<dyn DeviceProbe>,
    events: Receiver<DeviceEvent>,
    config: SupervisorConfig,
    was_connected: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(
        link: Arc<DeviceLink>,
        probe: Arc<dyn DeviceProbe>,
        events: Receiver<DeviceEvent>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            link,
            probe,
            events,
            config,
            was_connected: AtomicBool::new(false),
        }
    }

    pub fn run(&self, shutdown: &AtomicBool) {
        info!("🔌 设备监管启动");
        while !shutdown.load(Ordering::SeqCst) {
            if !self.poll_once() {
                break;
            }
            select! {
                recv(self.events) -> event => {
                    if !self.handle_event(event.ok()) {
                        break;
                    }
                }
                default(self.config.poll_interval) => {}
            }
        }
        info!("🔌 设备监管退出");
    }

    /// 一次轮询; 返回 false 表示收到关闭事件
    pub fn poll_once(&self) -> bool {
        let presence = self.probe.presence();
        let connected = presence == Presence::Connected;
        let was_connected = self.was_connected.swap(connected, Ordering::SeqCst);

        if connected && !self.link.is_engaged() {
            info!("📱 设备已连接");
            self.link.begin_connect();
            if !self.settle() {
                return false;
            }
            self.link.open();
        } else if !connected && was_connected {
            info!("📴 设备已断开");
            self.link.unplugged();
        } else if !connected && self.link.is_engaged() {
            self.link.disconnect();
        }

        if !connected {
            self.probe.attach();
        }
        true
    }

    /// 处理总线事件; None 表示总线已关闭
    pub fn handle_event(&self, event: Option<DeviceEvent>) -> bool {
        match event {
            Some(DeviceEvent::Anomaly(line)) => {
                warn!("⚠️ 异常触发重连: {}", line.trim());
                self.link.disconnect();
                true
            }
            Some(DeviceEvent::Shutdown) | None => false,
        }
    }

    /// 等待采集设备出现, 期间仍响应关闭事件
    fn settle(&self) -> bool {
        let deadline = Instant::now() + self.config.settle_delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            match self.events.recv_timeout(remaining) {
                Ok(DeviceEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                // 设备尚未打开, 异常日志无需处理
                Ok(DeviceEvent::Anomaly(_)) => {}
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }
}
