// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 头显连接探测 (ADB)
//!
//! - presence: `adb devices`
//! - attach:   nmap 扫描开放端口后逐个 `adb connect`
//! - recover:  重启 adb server

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

/// 设备在位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Offline,
    Connected,
}

/// 设备探测接口
pub trait DeviceProbe: Send + Sync {
    fn presence(&self) -> Presence;

    /// 未连接时尝试建立连接 (尽力而为)
    fn attach(&self) {}

    /// 断线恢复: 重启底层传输服务
    fn recover(&self) -> Result<()> {
        Ok(())
    }
}

/// 解析 `adb devices` 输出, 任一 `device` 状态即视为已连接
pub fn parse_adb_devices(output: &str) -> Presence {
    let mut presence = Presence::Absent;
    for line in output.lines().skip(1) {
        let Some((_serial, state)) = line.trim().split_once('\t') else {
            continue;
        };
        match state.trim() {
            "device" => return Presence::Connected,
            "offline" => presence = Presence::Offline,
            _ => {}
        }
    }
    presence
}

/// 解析 nmap 输出中的开放 TCP 端口
pub fn parse_open_ports(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter(|line| line.contains("/tcp") && line.contains("open"))
        .filter_map(|line| line.split('/').next()?.trim().parse().ok())
        .collect()
}

/// 运行命令, 超时则杀掉进程
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<bool> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.success());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(false);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub struct AdbProbe {
    ip: String,
    port_range: (u16, u16),
    connect_timeout: Duration,
}

impl AdbProbe {
    pub fn new(ip: impl Into<String>, port_range: (u16, u16)) -> Self {
        Self {
            ip: ip.into(),
            port_range,
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn disconnect_stale(&self) {
        let status = Command::new("adb")
            .args(["disconnect", &self.ip])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            warn!("adb disconnect 失败: {}", e);
        }
    }
}

impl DeviceProbe for AdbProbe {
    fn presence(&self) -> Presence {
        let output = match Command::new("adb").arg("devices").output() {
            Ok(output) => output,
            Err(e) => {
                warn!("⚠️ adb devices 执行失败: {}", e);
                return Presence::Absent;
            }
        };
        let presence = parse_adb_devices(&String::from_utf8_lossy(&output.stdout));
        if presence == Presence::Offline {
            self.disconnect_stale();
        }
        presence
    }

    fn attach(&self) {
        info!("🔍 尝试连接头显 {}", self.ip);
        let range = format!("{}-{}", self.port_range.0, self.port_range.1);
        let output = match Command::new("nmap").args(["-p", &range, &self.ip]).output() {
            Ok(output) => output,
            Err(e) => {
                warn!("⚠️ nmap 执行失败: {}", e);
                return;
            }
        };
        for port in parse_open_ports(&String::from_utf8_lossy(&output.stdout)) {
            info!("🔌 尝试端口 {}", port);
            let target = format!("{}:{}", self.ip, port);
            match run_with_timeout(
                Command::new("adb").args(["connect", &target]),
                self.connect_timeout,
            ) {
                Ok(ok) => debug!("adb connect {} → {}", target, ok),
                Err(e) => warn!("adb connect {} 失败: {}", target, e),
            }
        }
    }

    fn recover(&self) -> Result<()> {
        let killed = Command::new("adb")
            .arg("kill-server")
            .output()
            .context("adb kill-server")?;
        if killed.status.success() {
            info!("ADB server 已停止");
        } else {
            warn!("⚠️ ADB server 停止失败, 可能未在运行");
        }

        let started = Command::new("adb")
            .arg("start-server")
            .output()
            .context("adb start-server")?;
        if !started.status.success() {
            bail!("无法启动 ADB server");
        }
        info!("✅ ADB server 已重启");
        Ok(())
    }
}
