// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行参数 (Configuration)
//!
//! 命令行参数均可由环境变量提供, 核心逻辑只依赖 `CycleConfig` / `SupervisorConfig`。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// 下发结果队列
pub const QUEUE_SEND: &str = "fila_envio";
/// 接收指令队列
pub const QUEUE_RECEIVE: &str = "fila_recebimento";

/// 捕获进程 stderr 中表示设备异常的日志模式
pub const DEFAULT_ANOMALY_PATTERNS: &[&str] = &[
    r"select\(\) timeout",
    r"can't open camera",
    r"No such device",
    r"Input/output error",
];

/// 产线计数服务参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "产线物料计数服务 - 头显摄像头 + YOLO检测", long_about = None)]
pub struct Args {
    /// 消息端点 (写入审计日志)
    #[arg(long, env = "COUNTER_ENDPOINT", default_value = "localhost")]
    pub endpoint: String,

    /// 模型根目录, 模型文件为 <root>/<name>.onnx
    #[arg(long, env = "COUNTER_MODEL_ROOT", default_value = "modelostreinados")]
    pub model_root: PathBuf,

    /// 视频设备 (v4l2loopback 输出)
    #[arg(long, env = "COUNTER_DEVICE", default_value = "/dev/video2")]
    pub device: String,

    /// 头显IP
    #[arg(long, env = "COUNTER_HEADSET_IP", default_value = "10.42.0.217")]
    pub headset_ip: String,

    /// 假定帧率
    #[arg(long, env = "COUNTER_FPS", default_value_t = 15)]
    pub fps: u32,

    /// 单个目标的处理时限(秒)
    #[arg(long, env = "COUNTER_LIMIT_SECONDS", default_value_t = 5)]
    pub limit_seconds: u32,

    /// 检测置信度阈值
    #[arg(long, default_value_t = 0.70)]
    pub conf: f32,

    /// 捕获宽度
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// 捕获高度
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// 指令输入 (JSON行), 缺省为 stdin
    #[arg(long, env = "COUNTER_INBOX")]
    pub inbox: Option<PathBuf>,

    /// 结果输出 (JSON行), 缺省为 stdout
    #[arg(long, env = "COUNTER_OUTBOX")]
    pub outbox: Option<PathBuf>,

    /// 日志与截图根目录
    #[arg(long, env = "COUNTER_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// 使用 CUDA 推理
    #[arg(long)]
    pub cuda: bool,

    /// 不旋转画面 (默认旋转180°)
    #[arg(long)]
    pub no_rotate: bool,
}

impl Args {
    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            fps: self.fps,
            processing_limit_seconds: self.limit_seconds,
            conf_threshold: self.conf,
            ..CycleConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            headset_ip: self.headset_ip.clone(),
            device: self.device.clone(),
            ..SupervisorConfig::default()
        }
    }

    pub fn rotate_180(&self) -> bool {
        !self.no_rotate
    }
}

/// 检测循环参数
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub fps: u32,
    pub processing_limit_seconds: u32,
    pub conf_threshold: f32,
    /// 标签包含其中任一子串时, 精确匹配后查找 ArUco 码
    pub marker_categories: Vec<String>,
    /// 超时上报时强制使用的数量 (小写标签 → 数量)
    pub count_overrides: HashMap<String, u32>,
    pub marker_budget: Duration,
    pub marker_settle: Duration,
    pub marker_poll_pause: Duration,
    pub read_timeout: Duration,
    /// 发送前停顿
    pub send_delay: Duration,
    /// NO_DEVICE / NO_MODEL / IDLE 时的等待间隔
    pub idle_wait: Duration,
    /// WAITING 时两帧之间的间隔
    pub frame_pause: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            fps: 15,
            processing_limit_seconds: 5,
            conf_threshold: 0.70,
            marker_categories: vec!["blister".to_string()],
            count_overrides: HashMap::from([("caixa 520x320x170 triplex".to_string(), 1)]),
            marker_budget: Duration::from_secs(5),
            marker_settle: Duration::from_secs(1),
            marker_poll_pause: Duration::from_millis(50),
            read_timeout: Duration::from_secs(1),
            send_delay: Duration::from_millis(300),
            idle_wait: Duration::from_millis(100),
            frame_pause: Duration::from_millis(10),
        }
    }
}

impl CycleConfig {
    /// 帧预算 = 帧率 × 时限
    pub fn processing_limit_frames(&self) -> u32 {
        self.fps
            .saturating_mul(self.processing_limit_seconds)
            .max(1)
    }

    pub fn wants_marker(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.marker_categories
            .iter()
            .any(|category| label.contains(&category.to_lowercase()))
    }

    pub fn count_override(&self, label: &str) -> Option<u32> {
        self.count_overrides.get(&label.to_lowercase()).copied()
    }
}

/// 设备监管参数
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    /// 启动 scrcpy 后等待 /dev/videoN 出现的时间
    pub settle_delay: Duration,
    pub headset_ip: String,
    pub port_range: (u16, u16),
    pub device: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(5),
            headset_ip: "10.42.0.217".to_string(),
            port_range: (37000, 44000),
            device: "/dev/video2".to_string(),
        }
    }
}
