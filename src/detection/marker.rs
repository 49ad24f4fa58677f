// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ArUco 码查找 (Marker Resolution)
//!
//! 仅在精确匹配且标签属于标记类别时调用。在固定时间预算内逐帧解码,
//! 首次得到码值立即返回; 超时则不带码值继续, 从不导致发送失败。
//! 解码在独立线程执行, 单次解码耗时不会让查找超出预算。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use super::types::Frame;
use crate::input::CaptureError;

/// 标记解码器 (黑盒): 帧 → 可选的整数码
pub trait MarkerDecoder: Send + Sync {
    fn decode(&self, frame: &Frame) -> Option<u32>;
}

pub struct MarkerResolver {
    decoder: Arc<dyn MarkerDecoder>,
    budget: Duration,
    poll_pause: Duration,
    settle: Duration,
}

impl MarkerResolver {
    pub fn new(
        decoder: Arc<dyn MarkerDecoder>,
        budget: Duration,
        poll_pause: Duration,
        settle: Duration,
    ) -> Self {
        Self {
            decoder,
            budget,
            poll_pause,
            settle,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// 在预算内查找标记码; `read_frame` 的参数为本次读取可用的剩余时间
    pub fn resolve<F>(&self, mut read_frame: F) -> Option<u32>
    where
        F: FnMut(Duration) -> Result<Frame, CaptureError>,
    {
        let start = Instant::now();
        let deadline = start + self.budget;

        let (req_tx, req_rx) = bounded::<Frame>(1);
        let (res_tx, res_rx) = bounded::<Option<u32>>(1);
        let decoder = Arc::clone(&self.decoder);
        let spawned = thread::Builder::new()
            .name("marker-decode".into())
            .spawn(move || {
                for frame in req_rx {
                    if res_tx.send(decoder.decode(&frame)).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("❌ 解码线程启动失败: {}", e);
            return None;
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let frame = match read_frame(remaining) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("查找ArUco时读帧失败: {}", e);
                    pause_until(self.poll_pause, deadline);
                    continue;
                }
            };

            if req_tx.send_deadline(frame, deadline).is_err() {
                break;
            }
            match res_rx.recv_deadline(deadline) {
                Ok(Some(code)) => {
                    info!("🏷️ ArUco码: {} ({:?})", code, start.elapsed());
                    pause_until(self.settle, deadline);
                    return Some(code);
                }
                Ok(None) => debug!("本帧未发现ArUco"),
                Err(_) => break,
            }
            pause_until(self.poll_pause, deadline);
        }

        info!("⏱️ {:?} 内未检测到ArUco", self.budget);
        None
    }
}

/// 暂停, 但不越过截止时间
fn pause_until(pause: Duration, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    thread::sleep(pause.min(remaining));
}
