// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 异常监视器 (Anomaly Watcher)
//!
//! 逐行读取采集进程的 stderr, 命中设备异常模式时向设备事件总线发布
//! `DeviceEvent::Anomaly`, 由设备监管线程按断线处理。

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use regex::RegexSet;
use tracing::{debug, warn};

use crate::supervisor::DeviceEvent;

pub struct AnomalyWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<usize>>,
}

impl AnomalyWatcher {
    pub fn spawn<R>(
        reader: R,
        patterns: Arc<RegexSet>,
        bus: Sender<DeviceEvent>,
    ) -> std::io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("anomaly-watcher".into())
            .spawn(move || watch(reader, &patterns, &bus, &stop_flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// 停止监视; 线程在下一行或 EOF 时退出
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for AnomalyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 监视循环, 返回发布的异常次数
pub fn watch<R: BufRead>(
    reader: R,
    patterns: &RegexSet,
    bus: &Sender<DeviceEvent>,
    stop: &AtomicBool,
) -> usize {
    let mut published = 0;
    for line in reader.lines() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("stderr 读取结束: {}", e);
                break;
            }
        };
        if !patterns.is_match(&line) {
            continue;
        }
        warn!("⚠️ 检测到设备异常: {}", line.trim());
        if bus.send(DeviceEvent::Anomaly(line)).is_err() {
            break;
        }
        published += 1;
    }
    published
}
