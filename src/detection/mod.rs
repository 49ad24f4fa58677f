// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// 独立工作线程, 负责逐帧计数
/// - Model:  检测器接口与模型槽
/// - Marker: ArUco 码查找
/// - Cycle:  计数状态机
/// - Onnx:   YOLOv8 ONNX 推理 (需要 `onnx` 特性)
pub mod cycle;
pub mod marker;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod types;

pub use cycle::{CycleState, DetectionCycle};
pub use marker::{MarkerDecoder, MarkerResolver};
pub use model::{Detector, ModelError, ModelLoader, ModelRepository, ModelSlot};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxDetector, OnnxLoader};
pub use types::{count_matches, non_max_suppression, BBox, Detection, Frame};
