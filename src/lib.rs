// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 运行参数
pub mod detection; // 检测与计数
pub mod dispatch; // 结果下发与截图
pub mod input; // 视频输入与设备探测
pub mod intake; // 指令接收
pub mod orchestrator; // 线程编排
pub mod state; // 共享状态
pub mod supervisor; // 设备监管
pub mod telemetry; // 日志

pub use crate::config::{Args, CycleConfig, SupervisorConfig};
pub use crate::detection::{DetectionCycle, Detector, ModelSlot};
pub use crate::dispatch::{Dispatcher, Outcome};
pub use crate::intake::{Command, CommandError, CommandIntake};
pub use crate::orchestrator::{Orchestrator, SharedState};
pub use crate::supervisor::{ConnectionSupervisor, DeviceEvent, DeviceLink};
