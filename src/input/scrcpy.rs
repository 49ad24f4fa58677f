// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! scrcpy 采集源: 头显后置摄像头 → v4l2loopback 设备

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::capture::SourceLauncher;

pub struct ScrcpyLauncher {
    device: String,
    camera_size: String,
    child: Mutex<Option<Child>>,
}

impl ScrcpyLauncher {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            camera_size: "1920x1080".to_string(),
            child: Mutex::new(None),
        }
    }

    /// 确保 v4l2loopback 内核模块已加载
    fn ensure_loopback(&self) {
        match Command::new("lsmod").output() {
            Ok(output) if String::from_utf8_lossy(&output.stdout).contains("v4l2loopback") => {
                debug!("v4l2loopback 已加载");
            }
            Ok(_) => {
                info!("加载 v4l2loopback...");
                match Command::new("sudo")
                    .args(["modprobe", "v4l2loopback", "exclusive_caps=1"])
                    .status()
                {
                    Ok(status) if status.success() => info!("✅ v4l2loopback 配置成功"),
                    Ok(status) => warn!("❌ v4l2loopback 配置失败: {}", status),
                    Err(e) => warn!("❌ v4l2loopback 配置失败: {}", e),
                }
            }
            Err(e) => warn!("⚠️ lsmod 执行失败: {}", e),
        }
    }
}

/// scrcpy 参数
pub fn scrcpy_args(device: &str, camera_size: &str) -> Vec<String> {
    vec![
        "--video-source=camera".into(),
        "--camera-facing=back".into(),
        format!("--camera-size={}", camera_size),
        format!("--v4l2-sink={}", device),
        "--no-audio".into(),
        "--no-window".into(),
        "-e".into(),
    ]
}

impl SourceLauncher for ScrcpyLauncher {
    fn start(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = child.as_mut() {
            if matches!(running.try_wait(), Ok(None)) {
                debug!("scrcpy 已在运行, 复用");
                return Ok(());
            }
        }

        self.ensure_loopback();

        let mut cmd = Command::new("scrcpy");
        cmd.args(scrcpy_args(&self.device, &self.camera_size))
            .stdin(Stdio::null());
        let server = Path::new("scrcpy-server");
        if server.is_file() {
            if let Ok(path) = server.canonicalize() {
                cmd.env("SCRCPY_SERVER_PATH", path);
            }
        } else {
            debug!("未找到 scrcpy-server, 使用 scrcpy 自带版本");
        }

        *child = Some(cmd.spawn().context("启动 scrcpy 失败")?);
        info!("🎥 scrcpy 已启动 → {}", self.device);
        Ok(())
    }
}

impl Drop for ScrcpyLauncher {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrcpy_args() {
        let args = scrcpy_args("/dev/video2", "1920x1080");
        assert!(args.contains(&"--v4l2-sink=/dev/video2".to_string()));
        assert!(args.contains(&"--camera-size=1920x1080".to_string()));
        assert!(args.contains(&"--no-window".to_string()));
    }
}
