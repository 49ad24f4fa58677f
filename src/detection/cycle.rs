// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测循环 (Detection Cycle)
//!
//! 每次迭代处理一帧:
//!
//! ```text
//! NO_DEVICE ──ready──▶ NO_MODEL ──model──▶ IDLE ◀──dispatch── WAITING
//!                                           └────new target────▶┘
//! ```
//!
//! WAITING 时统计与目标标签相同的检测数 n:
//! - n == quantity              → 精确匹配 (可选 ArUco 查找)
//! - 已等待帧数 ≥ 帧预算        → 超时上报 n (可被 count_overrides 覆盖)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::marker::MarkerResolver;
use super::types::{count_matches, Detection, Frame};
use crate::config::{CycleConfig, QUEUE_SEND};
use crate::dispatch::{send_outcome, ArtifactStore, Dispatcher, Outcome};
use crate::orchestrator::SharedState;
use crate::state::{TargetSnapshot, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    NoDevice,
    NoModel,
    Idle,
    Waiting,
}

pub struct DetectionCycle {
    state: SharedState,
    config: CycleConfig,
    dispatcher: Arc<dyn Dispatcher>,
    resolver: Option<MarkerResolver>,
    artifacts: Option<ArtifactStore>,
}

impl DetectionCycle {
    pub fn new(state: SharedState, config: CycleConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            state,
            config,
            dispatcher,
            resolver: None,
            artifacts: None,
        }
    }

    pub fn with_marker_resolver(mut self, resolver: MarkerResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// 单次迭代, 返回本帧所处状态
    pub fn step(&self) -> CycleState {
        if !self.state.link.is_ready() {
            return CycleState::NoDevice;
        }
        let Some(model) = self.state.models.current() else {
            return CycleState::NoModel;
        };

        let snapshot = self.state.target.snapshot();
        if !snapshot.is_waiting() {
            return CycleState::Idle;
        }

        // 读帧失败不改变状态, 也不计入等待帧数
        let frame = match self.state.link.read_frame(self.config.read_timeout) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("读取帧失败: {}", e);
                return CycleState::Waiting;
            }
        };

        let detections = match model.predict(&frame, self.config.conf_threshold) {
            Ok(detections) => detections,
            Err(e) => {
                error!("❌ 推理失败: {:#}", e);
                return CycleState::Waiting;
            }
        };

        let label = snapshot.label.as_deref().unwrap_or_default();
        let matches = count_matches(&detections, label);
        let verdict = self.state.target.record_frame(
            snapshot.generation,
            matches,
            self.config.processing_limit_frames(),
        );

        match verdict {
            Verdict::Exact { count } => {
                self.state.new_target.clear();
                info!("✅ 精确匹配: {} × {}", label, count);
                let code = self.lookup_marker(label);
                self.finish(&snapshot, count, code, Some((&frame, detections.as_slice())));
                CycleState::Idle
            }
            Verdict::Partial { count } => {
                self.state.new_target.clear();
                let count = match self.config.count_override(label) {
                    Some(forced) => {
                        info!("⏱️ 超时上报: {} 观测 {} → 固定为 {}", label, count, forced);
                        forced
                    }
                    None => {
                        info!("⏱️ 超时上报: {} × {}", label, count);
                        count
                    }
                };
                // 超时结果没有可信的画面, 不截图
                self.finish(&snapshot, count, None, None);
                CycleState::Idle
            }
            Verdict::Pending { frames_waited } => {
                debug!(
                    "{}: {}/{} (第 {} 帧)",
                    label,
                    matches,
                    snapshot.quantity.unwrap_or_default(),
                    frames_waited
                );
                CycleState::Waiting
            }
            Verdict::Stale | Verdict::Idle => CycleState::Idle,
        }
    }

    fn lookup_marker(&self, label: &str) -> Option<u32> {
        if !self.config.wants_marker(label) {
            return None;
        }
        let resolver = self.resolver.as_ref()?;
        info!("🔎 查找ArUco码 (最长 {:?})", resolver.budget());
        let read_timeout = self.config.read_timeout;
        resolver.resolve(|remaining| self.state.link.read_frame(remaining.min(read_timeout)))
    }

    /// 保存截图 (仅精确匹配) 并发送结果; 两者失败都只记录日志
    fn finish(
        &self,
        snapshot: &TargetSnapshot,
        count: u32,
        code: Option<u32>,
        matched: Option<(&Frame, &[Detection])>,
    ) {
        let label = snapshot.label.as_deref().unwrap_or_default();

        if let (Some(name), Some(store), Some((frame, detections))) =
            (snapshot.output_name.as_deref(), &self.artifacts, matched)
        {
            match store.save(name, frame, detections, label) {
                Ok(path) => self.dispatcher.audit(
                    QUEUE_SEND,
                    &json!({ "fileName": path.display().to_string() }),
                    "SAVED",
                ),
                Err(e) => error!("❌ 截图保存失败: {:#}", e),
            }
        }

        thread::sleep(self.config.send_delay);
        let outcome = Outcome::new(label, count).with_code(code);
        if send_outcome(self.dispatcher.as_ref(), QUEUE_SEND, &outcome) {
            info!("📤 已发送: {} × {}", outcome.item_id, outcome.count);
        }
    }

    /// 配置了标记类别却没有解码器时, 标记查找会被静默跳过
    pub fn marker_lookup_unavailable(&self) -> bool {
        !self.config.marker_categories.is_empty() && self.resolver.is_none()
    }

    pub fn run(&self, shutdown: &AtomicBool) {
        info!(
            "🔁 检测循环启动 (帧预算 {} 帧)",
            self.config.processing_limit_frames()
        );
        if self.marker_lookup_unavailable() {
            warn!(
                "⚠️ 已配置标记类别 {:?}, 但未配置ArUco解码器, 结果不带标记码",
                self.config.marker_categories
            );
        }
        let mut last = None;
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let state = self.step();
            if last != Some(state) {
                info!("状态: {:?} ({:?})", state, started.elapsed());
                last = Some(state);
            }

            match state {
                CycleState::NoDevice => {
                    self.state.link.wait_ready(self.config.idle_wait);
                }
                CycleState::NoModel => thread::sleep(self.config.idle_wait),
                CycleState::Idle => {
                    self.state.new_target.wait_timeout(self.config.idle_wait);
                }
                CycleState::Waiting => thread::sleep(self.config.frame_pause),
            }
        }
        info!("🔁 检测循环退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detector, ModelError, ModelLoader, ModelSlot};
    use crate::input::{
        blank_frame, CaptureError, CaptureHandle, CaptureSource, DeviceProbe, Presence,
        SourceLauncher,
    };
    use crate::supervisor::DeviceLink;
    use anyhow::Result;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 每帧返回固定数量的 "boxa"
    struct Fixed(u32);

    impl Detector for Fixed {
        fn predict(&self, _frame: &Frame, _conf: f32) -> Result<Vec<Detection>> {
            Ok((0..self.0)
                .map(|i| {
                    let x = i as f32 * 10.0;
                    Detection::new("boxa", 0.9, BBox::new(x, 0.0, x + 5.0, 5.0))
                })
                .collect())
        }
    }

    struct Loader(u32);

    impl ModelLoader for Loader {
        fn load(&self, _name: &str) -> Result<Arc<dyn Detector>, ModelError> {
            Ok(Arc::new(Fixed(self.0)))
        }
    }

    struct Camera;

    impl CaptureHandle for Camera {
        fn read(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
            Ok(blank_frame(16, 16))
        }
        fn release(&mut self) {}
    }

    impl CaptureSource for Camera {
        fn open(&self) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            Ok(Box::new(Camera))
        }
    }

    impl SourceLauncher for Camera {
        fn start(&self) -> Result<()> {
            Ok(())
        }
    }

    impl DeviceProbe for Camera {
        fn presence(&self) -> Presence {
            Presence::Connected
        }
    }

    /// 记录发送内容
    #[derive(Default)]
    struct Recorder(Mutex<Vec<serde_json::Value>>);

    impl Dispatcher for Recorder {
        fn publish(&self, _queue: &str, body: &serde_json::Value) -> Result<()> {
            self.0.lock().unwrap().push(body.clone());
            Ok(())
        }
    }

    fn setup(per_frame: u32) -> (SharedState, DetectionCycle, Arc<Recorder>) {
        let link = DeviceLink::new(Box::new(Camera), Box::new(Camera), Arc::new(Camera));
        let state = SharedState::new(ModelSlot::new(Box::new(Loader(per_frame))), link);
        let recorder = Arc::new(Recorder::default());
        let config = CycleConfig {
            fps: 2,
            processing_limit_seconds: 2,
            send_delay: Duration::ZERO,
            ..CycleConfig::default()
        };
        let cycle = DetectionCycle::new(state.clone(), config, recorder.clone());
        (state, cycle, recorder)
    }

    #[test]
    fn test_state_progression() {
        let (state, cycle, recorder) = setup(2);
        assert_eq!(cycle.step(), CycleState::NoDevice);

        state.link.open();
        assert_eq!(cycle.step(), CycleState::NoModel);

        state.models.reload("m1").unwrap();
        assert_eq!(cycle.step(), CycleState::Idle);

        state.target.accept("BoxA", 2, None);
        state.new_target.set();
        assert_eq!(cycle.step(), CycleState::Idle);
        assert!(!state.new_target.is_set());
        assert!(state.target.snapshot().dispatched);

        let sent = recorder.0.lock().unwrap();
        assert_eq!(*sent, vec![serde_json::json!({"itemId": "BOXA", "count": 2})]);
    }

    #[test]
    fn test_partial_after_budget() {
        let (state, cycle, recorder) = setup(1);
        state.link.open();
        state.models.reload("m1").unwrap();
        state.target.accept("boxa", 3, None);

        for _ in 0..3 {
            assert_eq!(cycle.step(), CycleState::Waiting);
        }
        assert_eq!(cycle.step(), CycleState::Idle);
        assert_eq!(recorder.0.lock().unwrap()[0]["count"], 1);

        // 已发送, 之后的帧不再计数
        assert_eq!(cycle.step(), CycleState::Idle);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(state.target.snapshot().frames_waited, 0);
    }

    #[test]
    fn test_override_applies_to_partial_only() {
        let (state, cycle, recorder) = setup(3);
        state.link.open();
        state.models.reload("m1").unwrap();

        // 标签不一致, 永远 0 个匹配
        state.target.accept("Caixa 520x320x170 Triplex", 2, None);
        for _ in 0..4 {
            cycle.step();
        }
        assert_eq!(
            recorder.0.lock().unwrap()[0],
            serde_json::json!({"itemId": "CAIXA 520X320X170 TRIPLEX", "count": 1})
        );
    }

    #[test]
    fn test_artifact_saved_before_send() {
        let dir = tempfile::tempdir().unwrap();
        let (state, cycle, _recorder) = setup(1);
        let cycle = cycle.with_artifacts(ArtifactStore::new(dir.path()));
        state.link.open();
        state.models.reload("m1").unwrap();
        state.target.accept("boxa", 1, Some("lote-9".into()));

        assert_eq!(cycle.step(), CycleState::Idle);
        let saved = crate::telemetry::dated_dir(dir.path()).join("lote-9.jpg");
        assert!(saved.is_file());
    }

    #[test]
    fn test_partial_result_saves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (state, cycle, recorder) = setup(1);
        let cycle = cycle.with_artifacts(ArtifactStore::new(dir.path()));
        state.link.open();
        state.models.reload("m1").unwrap();
        state.target.accept("boxa", 3, Some("lote-10".into()));

        for _ in 0..4 {
            cycle.step();
        }
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        let saved = crate::telemetry::dated_dir(dir.path()).join("lote-10.jpg");
        assert!(!saved.exists());
    }

    #[test]
    fn test_marker_lookup_unavailable_without_resolver() {
        let (_state, cycle, _recorder) = setup(1);
        assert!(!cycle.config.marker_categories.is_empty());
        assert!(cycle.marker_lookup_unavailable());

        let link = DeviceLink::new(Box::new(Camera), Box::new(Camera), Arc::new(Camera));
        let state = SharedState::new(ModelSlot::new(Box::new(Loader(1))), link);
        let config = CycleConfig {
            marker_categories: Vec::new(),
            ..CycleConfig::default()
        };
        let cycle = DetectionCycle::new(state, config, Arc::new(Recorder::default()));
        assert!(!cycle.marker_lookup_unavailable());
    }

    #[test]
    fn test_send_failure_keeps_dispatched() {
        struct Down;
        impl Dispatcher for Down {
            fn publish(&self, _queue: &str, _body: &serde_json::Value) -> Result<()> {
                anyhow::bail!("broker unavailable")
            }
        }

        let link = DeviceLink::new(Box::new(Camera), Box::new(Camera), Arc::new(Camera));
        let state = SharedState::new(ModelSlot::new(Box::new(Loader(1))), link);
        let config = CycleConfig {
            send_delay: Duration::ZERO,
            ..CycleConfig::default()
        };
        let cycle = DetectionCycle::new(state.clone(), config, Arc::new(Down));
        state.link.open();
        state.models.reload("m1").unwrap();
        state.target.accept("boxa", 1, None);

        assert_eq!(cycle.step(), CycleState::Idle);
        assert!(state.target.snapshot().dispatched);
    }
}
