// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! YOLOv8 ONNX 检测器 (需要 `onnx` 特性)
//!
//! 输入 `[1, 3, H, W]`, 输出 `[1, 4 + nc, N]` (cx, cy, w, h, 各类别得分)。

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use ndarray::{s, Array, Axis, IxDyn};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::ValueType;
use tracing::{info, warn};

use super::model::{parse_class_names, Detector, ModelError, ModelLoader, ModelRepository};
use super::types::{non_max_suppression, BBox, Detection, Frame};

const CXYWH_OFFSET: usize = 4;
const DEFAULT_SIZE: u32 = 640;

/// 从模型仓库加载 `.onnx` 文件
pub struct OnnxLoader {
    repository: ModelRepository,
    cuda: bool,
    iou: f32,
}

impl OnnxLoader {
    pub fn new(root: impl Into<std::path::PathBuf>, cuda: bool) -> Self {
        Self {
            repository: ModelRepository::new(root, "onnx"),
            cuda,
            iou: 0.45,
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, name: &str) -> Result<Arc<dyn Detector>, ModelError> {
        let path = self.repository.resolve(name)?;
        let detector = OnnxDetector::new(&path, self.cuda, self.iou)?;
        Ok(Arc::new(detector))
    }
}

pub struct OnnxDetector {
    session: Session,
    names: Vec<String>,
    width: u32,
    height: u32,
    iou: f32,
}

impl OnnxDetector {
    pub fn new(path: &Path, cuda: bool, iou: f32) -> Result<Self> {
        let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if cuda {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }
        let session = builder.commit_from_file(path)?;

        let (height, width) = match session.inputs.first().map(|i| &i.input_type) {
            Some(ValueType::Tensor { dimensions, .. }) if dimensions.len() == 4 => (
                positive_or_default(dimensions[2]),
                positive_or_default(dimensions[3]),
            ),
            _ => bail!("模型输入不是 [batch, 3, H, W]: {}", path.display()),
        };

        let names = session
            .metadata()?
            .custom("names")?
            .map(|raw| parse_class_names(&raw))
            .unwrap_or_default();
        if names.is_empty() {
            warn!("⚠️ 模型缺少类别名称: {}", path.display());
        }

        info!(
            "✅ ONNX模型: {} ({}x{}, {} 类{})",
            path.display(),
            width,
            height,
            names.len(),
            if cuda { ", CUDA" } else { "" }
        );
        Ok(Self {
            session,
            names,
            width,
            height,
            iou,
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, u32, u32) {
        let r = (self.width as f32 / w0).min(self.height as f32 / h0);
        (r, (w0 * r).round() as u32, (h0 * r).round() as u32)
    }

    /// 等比缩放到左上角, 其余填充 144/255
    fn preprocess(&self, frame: &Frame) -> (Array<f32, IxDyn>, f32) {
        let (ratio, w_new, h_new) = self.scale_wh(frame.width() as f32, frame.height() as f32);
        let resized = imageops::resize(frame, w_new.max(1), h_new.max(1), FilterType::Triangle);

        let mut xs = Array::ones((1, 3, self.height as usize, self.width as usize)).into_dyn();
        xs.fill(144.0 / 255.0);
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= self.width as usize || y >= self.height as usize {
                continue;
            }
            let [r, g, b] = rgb.0;
            xs[[0, 0, y, x]] = r as f32 / 255.0;
            xs[[0, 1, y, x]] = g as f32 / 255.0;
            xs[[0, 2, y, x]] = b as f32 / 255.0;
        }
        (xs, ratio)
    }

    fn label(&self, id: usize) -> String {
        self.names
            .get(id)
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

impl Detector for OnnxDetector {
    fn predict(&self, frame: &Frame, conf_threshold: f32) -> Result<Vec<Detection>> {
        let (xs, ratio) = self.preprocess(frame);
        let input_name = match self.session.inputs.first() {
            Some(input) => input.name.as_str(),
            None => bail!("模型没有输入"),
        };
        let outputs = self.session.run(ort::inputs![input_name => xs.view()]?)?;
        let preds = outputs[0].try_extract_tensor::<f32>()?;
        if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
            bail!("意外的输出形状: {:?}", preds.shape());
        }

        let (w0, h0) = (frame.width() as f32, frame.height() as f32);
        let mut ys = Vec::new();
        for anchor in preds.axis_iter(Axis(0)) {
            for pred in anchor.axis_iter(Axis(1)) {
                let bbox = pred.slice(s![0..CXYWH_OFFSET]);
                let clss = pred.slice(s![CXYWH_OFFSET..]);
                let Some((id, &confidence)) = clss
                    .iter()
                    .enumerate()
                    .reduce(|max, x| if x.1 > max.1 { x } else { max })
                else {
                    continue;
                };
                if confidence < conf_threshold {
                    continue;
                }

                let cx = bbox[0] / ratio;
                let cy = bbox[1] / ratio;
                let w = bbox[2] / ratio;
                let h = bbox[3] / ratio;
                let x1 = (cx - w / 2.).clamp(0.0, w0);
                let y1 = (cy - h / 2.).clamp(0.0, h0);
                let x2 = (cx + w / 2.).clamp(0.0, w0);
                let y2 = (cy + h / 2.).clamp(0.0, h0);
                ys.push(Detection::new(
                    self.label(id),
                    confidence,
                    BBox::new(x1, y1, x2, y2),
                ));
            }
        }
        non_max_suppression(&mut ys, self.iou);
        Ok(ys)
    }
}

fn positive_or_default(dim: i64) -> u32 {
    u32::try_from(dim).ok().filter(|d| *d > 0).unwrap_or(DEFAULT_SIZE)
}
