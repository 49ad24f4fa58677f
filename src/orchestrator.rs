// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 编排 (Orchestrator)
//!
//! 三个长期运行的线程: `supervisor` / `intake` / `cycle`,
//! 只通过 `SharedState` 协作。关闭时唤醒所有等待者并逐一 join。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use tracing::{error, info};

use crate::detection::{DetectionCycle, ModelSlot};
use crate::intake::{CommandIntake, CommandSource};
use crate::state::{SharedTarget, Signal};
use crate::supervisor::{ConnectionSupervisor, DeviceEvent, DeviceLink};

/// 线程间共享的状态句柄
#[derive(Clone)]
pub struct SharedState {
    pub target: Arc<SharedTarget>,
    pub models: Arc<ModelSlot>,
    pub new_target: Arc<Signal>,
    pub link: Arc<DeviceLink>,
}

impl SharedState {
    pub fn new(models: ModelSlot, link: DeviceLink) -> Self {
        Self {
            target: Arc::new(SharedTarget::new()),
            models: Arc::new(models),
            new_target: Arc::new(Signal::new()),
            link: Arc::new(link),
        }
    }
}

pub struct Orchestrator {
    state: SharedState,
    shutdown: Arc<AtomicBool>,
    bus: Sender<DeviceEvent>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl Orchestrator {
    pub fn spawn(
        state: SharedState,
        supervisor: ConnectionSupervisor,
        intake: CommandIntake,
        mut source: Box<dyn CommandSource>,
        cycle: DetectionCycle,
        bus: Sender<DeviceEvent>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut orchestrator = Self {
            state,
            shutdown: Arc::clone(&shutdown),
            bus,
            threads: Vec::with_capacity(3),
        };

        let flag = Arc::clone(&shutdown);
        orchestrator.start("supervisor", move || supervisor.run(&flag))?;
        let flag = Arc::clone(&shutdown);
        orchestrator.start("intake", move || intake.run(source.as_mut(), &flag))?;
        let flag = Arc::clone(&shutdown);
        orchestrator.start("cycle", move || cycle.run(&flag))?;

        info!("🚀 计数服务已启动");
        Ok(orchestrator)
    }

    fn start<F>(&mut self, name: &'static str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .with_context(|| format!("线程启动失败: {}", name))?;
        self.threads.push((name, handle));
        Ok(())
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// 关闭: 置位关闭标志, 唤醒所有等待者, join 全部线程后释放采集句柄
    pub fn shutdown(mut self) {
        info!("🛑 正在关闭...");
        self.shutdown.store(true, Ordering::SeqCst);
        // 监管线程可能已退出, 发送失败无妨
        let _ = self.bus.send(DeviceEvent::Shutdown);
        self.state.link.wake_all();
        self.state.new_target.set();

        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("❌ 线程 {} 异常退出", name);
            }
        }
        self.state.link.release();
        info!("👋 已退出");
    }
}
