// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 产线计数服务 (Line Counter)
///
/// 系统架构:
/// 1. 监管线程: 头显连接探测与采集设备开关
/// 2. 接收线程: 指令消费, 模型加载, 目标替换
/// 3. 检测线程: 逐帧推理计数, 结果下发
/// 4. 主线程:   等待 Ctrl-C 后有序关闭
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use yolo_counter::config::{Args, DEFAULT_ANOMALY_PATTERNS};
use yolo_counter::detection::{DetectionCycle, ModelSlot, OnnxLoader};
use yolo_counter::dispatch::{ArtifactStore, Dispatcher, JsonLinesDispatcher, RetryingDispatcher};
use yolo_counter::input::{AdbProbe, DeviceProbe, FfmpegCapture, FfmpegSettings, ScrcpyLauncher};
use yolo_counter::intake::{CommandIntake, CommandSource, SpoolCommandSource};
use yolo_counter::orchestrator::{Orchestrator, SharedState};
use yolo_counter::supervisor::{device_bus, ConnectionSupervisor, DeviceLink};
use yolo_counter::telemetry::init_tracing;

fn main() -> Result<()> {
    let args = Args::parse();
    let log_file = init_tracing(&args.log_dir)?;

    info!("🚀 产线计数服务启动");
    info!("📝 日志文件: {}", log_file.display());
    info!("📦 模型目录: {}", args.model_root.display());
    info!("📹 视频设备: {} ({}x{})", args.device, args.width, args.height);
    if !args.model_root.is_dir() {
        warn!("⚠️ 模型目录不存在: {}", args.model_root.display());
    }

    // ========== 消息通道 ==========
    let out: Box<dyn Write + Send> = match &args.outbox {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("无法打开结果输出: {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(RetryingDispatcher::new(
        Box::new(JsonLinesDispatcher::new(args.endpoint.clone(), out)),
        3,
        Duration::from_millis(200),
    ));
    let source: Box<dyn CommandSource> = match &args.inbox {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("无法打开指令输入: {}", path.display()))?;
            Box::new(SpoolCommandSource::spawn(BufReader::new(file))?)
        }
        None => Box::new(SpoolCommandSource::spawn(BufReader::new(io::stdin()))?),
    };

    // ========== 设备链路 ==========
    let supervisor_config = args.supervisor_config();
    let (bus_tx, bus_rx) = device_bus();
    let probe: Arc<dyn DeviceProbe> = Arc::new(AdbProbe::new(
        supervisor_config.headset_ip.clone(),
        supervisor_config.port_range,
    ));
    let capture = FfmpegCapture::new(
        FfmpegSettings {
            device: args.device.clone(),
            width: args.width,
            height: args.height,
            rotate_180: args.rotate_180(),
        },
        DEFAULT_ANOMALY_PATTERNS,
        bus_tx.clone(),
    )?;
    let link = DeviceLink::new(
        Box::new(capture),
        Box::new(ScrcpyLauncher::new(args.device.clone())),
        Arc::clone(&probe),
    );

    // ========== 共享状态与线程 ==========
    let models = ModelSlot::new(Box::new(OnnxLoader::new(args.model_root.clone(), args.cuda)));
    let state = SharedState::new(models, link);

    let supervisor =
        ConnectionSupervisor::new(Arc::clone(&state.link), probe, bus_rx, supervisor_config);
    let intake = CommandIntake::new(state.clone(), Arc::clone(&dispatcher));
    let cycle = DetectionCycle::new(state.clone(), args.cycle_config(), dispatcher)
        .with_artifacts(ArtifactStore::new(&args.log_dir));

    let orchestrator = Orchestrator::spawn(state, supervisor, intake, source, cycle, bus_tx)?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("无法注册 Ctrl-C 处理")?;
    info!("按 Ctrl-C 退出");

    // 发送端随处理函数常驻, recv 只会因信号返回
    let _ = stop_rx.recv();
    orchestrator.shutdown();
    Ok(())
}
