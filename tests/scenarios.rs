// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 端到端场景: 真实组件 + 内存中的检测器 / 摄像头 / 消息通道

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};

use yolo_counter::config::{CycleConfig, SupervisorConfig};
use yolo_counter::detection::{
    BBox, CycleState, Detection, DetectionCycle, Detector, Frame, MarkerDecoder, MarkerResolver,
    ModelError, ModelLoader, ModelSlot,
};
use yolo_counter::dispatch::Dispatcher;
use yolo_counter::input::{
    blank_frame, CaptureError, CaptureHandle, CaptureSource, DeviceProbe, Presence,
    SourceLauncher,
};
use yolo_counter::intake::{channel, CommandError, CommandIntake};
use yolo_counter::orchestrator::{Orchestrator, SharedState};
use yolo_counter::supervisor::{device_bus, ConnectionSupervisor, DeviceLink};

/// 按脚本逐帧给出检测数量, 脚本用完后重复最后一项
struct Scripted {
    label: String,
    script: Mutex<VecDeque<u32>>,
    last: Mutex<u32>,
}

impl Scripted {
    fn new(label: &str, script: &[u32]) -> Self {
        Self {
            label: label.to_string(),
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(0),
        }
    }
}

impl Detector for Scripted {
    fn predict(&self, _frame: &Frame, _conf: f32) -> Result<Vec<Detection>> {
        let n = match self.script.lock().unwrap().pop_front() {
            Some(n) => {
                *self.last.lock().unwrap() = n;
                n
            }
            None => *self.last.lock().unwrap(),
        };
        Ok((0..n)
            .map(|i| {
                let x = i as f32 * 20.0;
                Detection::new(self.label.clone(), 0.9, BBox::new(x, 0.0, x + 10.0, 10.0))
            })
            .collect())
    }
}

/// 只认识模型 "m1"
struct Loader(Arc<dyn Detector>);

impl ModelLoader for Loader {
    fn load(&self, name: &str) -> Result<Arc<dyn Detector>, ModelError> {
        if name == "m1" {
            Ok(Arc::clone(&self.0))
        } else {
            Err(ModelError::NotFound(format!("models/{}.onnx", name).into()))
        }
    }
}

#[derive(Default)]
struct Device {
    connected: AtomicBool,
    released: AtomicUsize,
    recovered: AtomicUsize,
}

struct Handle(Arc<Device>);

impl CaptureHandle for Handle {
    fn read(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        Ok(blank_frame(32, 32))
    }
    fn release(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct Source(Arc<Device>);

impl CaptureSource for Source {
    fn open(&self) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        Ok(Box::new(Handle(Arc::clone(&self.0))))
    }
}

impl SourceLauncher for Source {
    fn start(&self) -> Result<()> {
        Ok(())
    }
}

impl DeviceProbe for Source {
    fn presence(&self) -> Presence {
        if self.0.connected.load(Ordering::SeqCst) {
            Presence::Connected
        } else {
            Presence::Absent
        }
    }
    fn recover(&self) -> Result<()> {
        self.0.recovered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Value>>);

impl Recorder {
    fn sent(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }
}

impl Dispatcher for Recorder {
    fn publish(&self, _queue: &str, body: &Value) -> Result<()> {
        self.0.lock().unwrap().push(body.clone());
        Ok(())
    }
}

struct FoundOnCall {
    calls: AtomicUsize,
    found_on: usize,
    code: u32,
}

impl MarkerDecoder for FoundOnCall {
    fn decode(&self, _frame: &Frame) -> Option<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (n >= self.found_on).then_some(self.code)
    }
}

struct Rig {
    device: Arc<Device>,
    state: SharedState,
    intake: CommandIntake,
    cycle: DetectionCycle,
    recorder: Arc<Recorder>,
}

fn rig(label: &str, script: &[u32]) -> Rig {
    let device = Arc::new(Device::default());
    let probe: Arc<dyn DeviceProbe> = Arc::new(Source(Arc::clone(&device)));
    let link = DeviceLink::new(
        Box::new(Source(Arc::clone(&device))),
        Box::new(Source(Arc::clone(&device))),
        probe,
    );
    let detector: Arc<dyn Detector> = Arc::new(Scripted::new(label, script));
    let state = SharedState::new(ModelSlot::new(Box::new(Loader(detector))), link);
    let recorder = Arc::new(Recorder::default());
    let config = CycleConfig {
        fps: 3,
        processing_limit_seconds: 2,
        send_delay: Duration::ZERO,
        marker_settle: Duration::from_millis(1),
        marker_poll_pause: Duration::from_millis(1),
        ..CycleConfig::default()
    };
    let intake = CommandIntake::new(state.clone(), recorder.clone());
    let cycle = DetectionCycle::new(state.clone(), config, recorder.clone());
    Rig {
        device,
        state,
        intake,
        cycle,
        recorder,
    }
}

#[test]
fn command_without_model_is_rejected_on_first_use() {
    let rig = rig("boxa", &[2]);
    let err = rig
        .intake
        .handle(br#"{"itemId":"boxA","quantity":2}"#)
        .unwrap_err();
    assert!(matches!(err, CommandError::ModelRequired));
    assert_eq!(rig.state.target.snapshot().label, None);
    assert!(!rig.state.models.is_loaded());
}

#[test]
fn exact_match_dispatches_once() {
    let rig = rig("boxa", &[1, 2, 2]);
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"boxA","quantity":2,"model":"m1"}"#)
        .unwrap();

    assert_eq!(rig.cycle.step(), CycleState::Waiting);
    assert!(rig.recorder.sent().is_empty());
    assert_eq!(rig.cycle.step(), CycleState::Idle);
    assert_eq!(rig.recorder.sent(), vec![json!({"itemId": "BOXA", "count": 2})]);

    // 下一条指令之前保持已发送
    for _ in 0..10 {
        assert_eq!(rig.cycle.step(), CycleState::Idle);
    }
    assert!(rig.state.target.snapshot().dispatched);
    assert_eq!(rig.recorder.sent().len(), 1);
}

#[test]
fn marker_code_is_attached_on_exact_match() {
    let rig = rig("blister-x", &[1]);
    let decoder = Arc::new(FoundOnCall {
        calls: AtomicUsize::new(0),
        found_on: 2,
        code: 42,
    });
    let cycle = rig.cycle.with_marker_resolver(MarkerResolver::new(
        decoder,
        Duration::from_secs(2),
        Duration::from_millis(1),
        Duration::from_millis(1),
    ));
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"blister-x","quantity":1,"model":"m1"}"#)
        .unwrap();

    assert_eq!(cycle.step(), CycleState::Idle);
    assert_eq!(
        rig.recorder.sent(),
        vec![json!({"itemId": "BLISTER-X", "count": 1, "code": "42"})]
    );
}

#[test]
fn marker_miss_sends_without_code() {
    let rig = rig("blister-x", &[1]);
    let decoder = Arc::new(FoundOnCall {
        calls: AtomicUsize::new(0),
        found_on: usize::MAX,
        code: 42,
    });
    let cycle = rig.cycle.with_marker_resolver(MarkerResolver::new(
        decoder,
        Duration::from_millis(100),
        Duration::from_millis(1),
        Duration::from_millis(1),
    ));
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"blister-x","quantity":1,"model":"m1"}"#)
        .unwrap();

    let start = Instant::now();
    assert_eq!(cycle.step(), CycleState::Idle);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(
        rig.recorder.sent(),
        vec![json!({"itemId": "BLISTER-X", "count": 1})]
    );
}

#[test]
fn disconnect_pauses_counting() {
    let rig = rig("boxa", &[1]);
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"boxa","quantity":2,"model":"m1"}"#)
        .unwrap();

    assert_eq!(rig.cycle.step(), CycleState::Waiting);
    assert_eq!(rig.state.target.snapshot().frames_waited, 1);

    rig.state.link.disconnect();
    for _ in 0..20 {
        assert_eq!(rig.cycle.step(), CycleState::NoDevice);
    }
    assert_eq!(rig.state.target.snapshot().frames_waited, 1);
    assert!(rig.recorder.sent().is_empty());

    rig.state.link.open();
    assert_eq!(rig.cycle.step(), CycleState::Waiting);
    assert_eq!(rig.state.target.snapshot().frames_waited, 2);
}

#[test]
fn partial_reports_last_count_after_frame_budget() {
    // 帧预算 3 × 2 = 6
    let rig = rig("boxa", &[0, 1, 3, 1, 2, 1]);
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"boxa","quantity":5,"model":"m1"}"#)
        .unwrap();

    for _ in 0..5 {
        assert_eq!(rig.cycle.step(), CycleState::Waiting);
    }
    assert_eq!(rig.cycle.step(), CycleState::Idle);
    assert_eq!(rig.recorder.sent(), vec![json!({"itemId": "BOXA", "count": 1})]);
    assert_eq!(rig.state.target.snapshot().frames_waited, 0);
}

#[test]
fn override_sku_reports_one_on_partial() {
    let rig = rig("caixa 520x320x170 triplex", &[4]);
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"Caixa 520x320x170 Triplex","quantity":6,"model":"m1"}"#)
        .unwrap();

    for _ in 0..6 {
        rig.cycle.step();
    }
    assert_eq!(
        rig.recorder.sent(),
        vec![json!({"itemId": "CAIXA 520X320X170 TRIPLEX", "count": 1})]
    );
}

#[test]
fn new_command_rearms_dispatched_target() {
    let rig = rig("boxa", &[2]);
    rig.state.link.open();
    rig.intake
        .handle(br#"{"itemId":"boxa","quantity":2,"model":"m1"}"#)
        .unwrap();
    rig.cycle.step();
    assert!(rig.state.target.snapshot().dispatched);

    rig.intake
        .handle(br#"{"itemId":"boxa","quantity":2}"#)
        .unwrap();
    let snapshot = rig.state.target.snapshot();
    assert!(!snapshot.dispatched);
    assert_eq!(snapshot.frames_waited, 0);

    rig.cycle.step();
    assert_eq!(rig.recorder.sent().len(), 2);
}

#[test]
fn disconnect_twice_releases_once() {
    let rig = rig("boxa", &[0]);
    rig.state.link.begin_connect();
    rig.state.link.open();

    assert!(rig.state.link.disconnect());
    assert!(!rig.state.link.disconnect());
    assert_eq!(rig.device.released.load(Ordering::SeqCst), 1);
    assert_eq!(rig.device.recovered.load(Ordering::SeqCst), 1);
}

#[test]
fn orchestrated_service_counts_and_shuts_down() {
    let Rig {
        device,
        state,
        intake,
        cycle,
        recorder,
    } = rig("boxa", &[2]);
    device.connected.store(true, Ordering::SeqCst);

    let (bus_tx, bus_rx) = device_bus();
    let supervisor = ConnectionSupervisor::new(
        Arc::clone(&state.link),
        Arc::new(Source(Arc::clone(&device))),
        bus_rx,
        SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::from_millis(1),
            ..SupervisorConfig::default()
        },
    );
    let (publisher, source) = channel(4);
    let intake = intake.with_poll_timeout(Duration::from_millis(20));

    let orchestrator =
        Orchestrator::spawn(state, supervisor, intake, Box::new(source), cycle, bus_tx).unwrap();
    let tag = publisher
        .publish(r#"{"itemId":"boxA","quantity":2,"model":"m1"}"#)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while (recorder.sent().is_empty() || publisher.acked().is_empty()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(recorder.sent(), vec![json!({"itemId": "BOXA", "count": 2})]);
    assert_eq!(publisher.acked(), vec![tag]);
    assert!(orchestrator.state().target.snapshot().dispatched);

    let start = Instant::now();
    orchestrator.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(device.released.load(Ordering::SeqCst), 1);
}
