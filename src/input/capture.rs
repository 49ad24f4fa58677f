// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集接口 (Capture)
//!
//! CaptureSource 打开设备得到 CaptureHandle; 句柄的打开/关闭只由设备监管线程执行,
//! 检测循环只读帧。

use std::time::Duration;

use anyhow::Result;
use image::Rgb;
use thiserror::Error;

use crate::detection::Frame;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("无法打开视频设备 {device:?}")]
    Open { device: String },
    #[error("读取帧超时")]
    Timeout,
    #[error("视频流已关闭")]
    Closed,
    #[error("设备未就绪")]
    NotReady,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 已打开的视频流
pub trait CaptureHandle: Send {
    /// 读取最新一帧, 最多等待 `timeout`
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// 释放设备 (可重复调用)
    fn release(&mut self);
}

/// 视频源: 每次连接打开一个新句柄
pub trait CaptureSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// 启动采集源 (例如 scrcpy → v4l2loopback), 必须幂等
pub trait SourceLauncher: Send + Sync {
    fn start(&self) -> Result<()>;
}

/// 黑色占位帧
pub fn blank_frame(width: u32, height: u32) -> Frame {
    Frame::from_pixel(width, height, Rgb([0, 0, 0]))
}
