// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// - Capture:  采集接口与占位帧
/// - FFmpeg:   v4l2 设备读帧 (子进程)
/// - ADB:      头显在位探测与恢复
/// - Scrcpy:   头显摄像头 → v4l2loopback
/// - Watcher:  stderr 异常监视
pub mod adb;
pub mod capture;
pub mod ffmpeg;
pub mod scrcpy;
pub mod watcher;

pub use adb::{AdbProbe, DeviceProbe, Presence};
pub use capture::{blank_frame, CaptureError, CaptureHandle, CaptureSource, SourceLauncher};
pub use ffmpeg::{FfmpegCapture, FfmpegSettings};
pub use scrcpy::ScrcpyLauncher;
pub use watcher::AnomalyWatcher;
