// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! FFmpeg 子进程采集 (v4l2 → rawvideo rgb24)
//!
//! 读帧线程持续读取 ffmpeg 输出, 队列满时丢弃最旧的帧, 从不阻塞;
//! `read` 只返回最新一帧。
//! ffmpeg 的 stderr 交给异常监视器。

use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::imageops;
use regex::RegexSet;
use tracing::{debug, info, warn};

use super::capture::{CaptureError, CaptureHandle, CaptureSource};
use super::watcher::AnomalyWatcher;
use crate::detection::Frame;
use crate::supervisor::DeviceEvent;

/// 采集参数
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub rotate_180: bool,
}

pub struct FfmpegCapture {
    settings: FfmpegSettings,
    patterns: Arc<RegexSet>,
    events: Sender<DeviceEvent>,
}

impl FfmpegCapture {
    pub fn new(
        settings: FfmpegSettings,
        patterns: &[&str],
        events: Sender<DeviceEvent>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            patterns: Arc::new(RegexSet::new(patterns)?),
            events,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(ffmpeg_args(&self.settings))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// ffmpeg 参数
pub fn ffmpeg_args(settings: &FfmpegSettings) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-f".into(),
        "video4linux2".into(),
        "-i".into(),
        settings.device.clone(),
        "-vf".into(),
        format!("scale={}:{}", settings.width, settings.height),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-f".into(),
        "rawvideo".into(),
        "-".into(),
    ]
}

impl CaptureSource for FfmpegCapture {
    fn open(&self) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let device = &self.settings.device;
        if !Path::new(device).exists() {
            return Err(CaptureError::Open {
                device: device.clone(),
            });
        }

        let mut child = self.command().spawn().map_err(|e| {
            warn!("❌ ffmpeg 启动失败: {}", e);
            CaptureError::Open {
                device: device.clone(),
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("无法获取 ffmpeg stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("无法获取 ffmpeg stderr")))?;

        let watcher = match AnomalyWatcher::spawn(
            BufReader::new(stderr),
            Arc::clone(&self.patterns),
            self.events.clone(),
        ) {
            Ok(w) => w,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(e.into()));
            }
        };

        let (tx, rx) = bounded(2);
        let (width, height) = (self.settings.width, self.settings.height);
        let spawned = thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn({
                let drain = rx.clone();
                move || read_loop(stdout, width, height, tx, drain)
            });
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Other(e.into()));
        }

        info!("✅ 摄像头已打开: {} ({}x{})", device, width, height);
        Ok(Box::new(FfmpegHandle {
            child: Some(child),
            frames: rx,
            watcher: Some(watcher),
            rotate_180: self.settings.rotate_180,
        }))
    }
}

/// 读帧循环: 固定大小的 rgb24 帧
///
/// 检测循环空闲时不读帧, 队列满后由 `drain` 丢弃最旧的一帧,
/// 保证 ffmpeg 的管道一直被读空, 队列里始终是最近的画面。
fn read_loop(
    mut stdout: impl Read,
    width: u32,
    height: u32,
    tx: Sender<Frame>,
    drain: Receiver<Frame>,
) {
    let frame_bytes = (width as usize) * (height as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    loop {
        if let Err(e) = stdout.read_exact(&mut buffer) {
            debug!("ffmpeg 输出结束: {}", e);
            break;
        }
        let Some(frame) = Frame::from_raw(width, height, buffer.clone()) else {
            break;
        };
        let mut pending = frame;
        loop {
            match tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(frame)) => {
                    let _ = drain.try_recv();
                    pending = frame;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

pub struct FfmpegHandle {
    child: Option<Child>,
    frames: Receiver<Frame>,
    watcher: Option<AnomalyWatcher>,
    rotate_180: bool,
}

impl CaptureHandle for FfmpegHandle {
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let first = self.frames.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => CaptureError::Timeout,
            RecvTimeoutError::Disconnected => CaptureError::Closed,
        })?;
        // 丢弃积压的旧帧
        let mut frame = self.frames.try_iter().last().unwrap_or(first);
        if self.rotate_180 {
            imageops::rotate180_in_place(&mut frame);
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            info!("📹 摄像头已释放");
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args(&FfmpegSettings {
            device: "/dev/video2".into(),
            width: 640,
            height: 480,
            rotate_180: true,
        });
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/dev/video2"));
        assert!(args.contains(&"scale=640:480".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_read_loop_splits_frames() {
        let (tx, rx) = bounded(4);
        let raw = vec![7u8; 2 * 2 * 3 * 2 + 5];
        read_loop(Cursor::new(raw), 2, 2, tx, rx.clone());
        let frames: Vec<_> = rx.try_iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get_pixel(1, 1).0, [7, 7, 7]);
    }

    /// 约 100 fps 的模拟摄像头, 每帧像素值为帧序号
    struct LiveCamera {
        frame_bytes: usize,
        pos: usize,
        seq: u8,
        last: u8,
    }

    impl Read for LiveCamera {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == 0 {
                if self.seq == self.last {
                    return Ok(0);
                }
                thread::sleep(Duration::from_millis(10));
                self.seq += 1;
            }
            let n = buf.len().min(self.frame_bytes - self.pos);
            buf[..n].fill(self.seq);
            self.pos = (self.pos + n) % self.frame_bytes;
            Ok(n)
        }
    }

    #[test]
    fn test_read_after_idle_returns_fresh_frame() {
        let (tx, rx) = bounded(2);
        let camera = LiveCamera {
            frame_bytes: 4 * 4 * 3,
            pos: 0,
            seq: 0,
            last: 250,
        };
        let drain = rx.clone();
        thread::spawn(move || read_loop(camera, 4, 4, tx, drain));

        // 空闲期间不读帧
        thread::sleep(Duration::from_millis(500));
        let mut handle = FfmpegHandle {
            child: None,
            frames: rx,
            watcher: None,
            rotate_180: false,
        };
        let frame = handle.read(Duration::from_secs(1)).unwrap();
        let seq = frame.get_pixel(0, 0).0[0];
        assert!(seq >= 20, "frame #{} is stale", seq);
    }

    #[test]
    fn test_open_missing_device() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let capture = FfmpegCapture::new(
            FfmpegSettings {
                device: "/dev/does-not-exist-video".into(),
                width: 64,
                height: 48,
                rotate_180: false,
            },
            crate::config::DEFAULT_ANOMALY_PATTERNS,
            tx,
        )
        .unwrap();
        assert!(matches!(capture.open(), Err(CaptureError::Open { .. })));
    }
}
