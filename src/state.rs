// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 共享状态 (Shared State)
//!
//! - SharedTarget: 当前期望物料 + 发送状态,所有线程的唯一真值来源
//! - Signal:       电平触发的唤醒标志 (device-ready / new-target)
//!
//! 两者都不保证投递顺序: 最后写入者获胜。

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 目标快照 (一次临界区内读出的全部字段)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSnapshot {
    /// 小写物料标识, None = 当前无期望
    pub label: Option<String>,
    pub quantity: Option<u32>,
    /// 匹配帧的保存文件名
    pub output_name: Option<String>,
    pub dispatched: bool,
    pub frames_waited: u32,
    /// 每次接受新指令 +1, 用于识别过期的帧判定
    pub generation: u64,
}

impl TargetSnapshot {
    /// WAITING: 有活动目标且尚未发送结果
    pub fn is_waiting(&self) -> bool {
        self.label.as_deref().is_some_and(|l| !l.is_empty())
            && self.quantity.is_some()
            && !self.dispatched
    }
}

/// 单帧计数判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 无活动目标或已发送
    Idle,
    /// 判定期间目标已被新指令替换
    Stale,
    /// 继续等待, 附带已等待帧数
    Pending { frames_waited: u32 },
    /// 精确匹配: 本帧数量 == 期望数量
    Exact { count: u32 },
    /// 帧预算耗尽, 上报最后一次观测数量
    Partial { count: u32 },
}

/// 当前期望目标 (单把互斥锁保护全部字段)
#[derive(Debug, Default)]
pub struct SharedTarget {
    inner: Mutex<TargetSnapshot>,
}

impl SharedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TargetSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        self.lock().clone()
    }

    /// 原子替换目标并重置发送状态, 返回新的 generation
    pub fn accept(&self, label: &str, quantity: u32, output_name: Option<String>) -> u64 {
        let mut state = self.lock();
        state.label = Some(label.to_lowercase());
        state.quantity = Some(quantity);
        state.output_name = output_name;
        state.dispatched = false;
        state.frames_waited = 0;
        state.generation = state.generation.wrapping_add(1);
        state.generation
    }

    /// 记录一帧的匹配数量并给出判定
    ///
    /// `generation` 必须来自本帧开始时的快照; 目标在推理期间被替换时返回 `Stale`,
    /// 不会把旧目标的观测计入新目标。Exact/Partial 在同一临界区内把目标标记为已发送,
    /// 之后的帧只会得到 `Idle`, 每个目标至多发送一次。
    pub fn record_frame(&self, generation: u64, matches: u32, limit_frames: u32) -> Verdict {
        let mut state = self.lock();
        if state.generation != generation {
            return Verdict::Stale;
        }
        if !state.is_waiting() {
            return Verdict::Idle;
        }

        if Some(matches) == state.quantity {
            state.dispatched = true;
            state.frames_waited = 0;
            return Verdict::Exact { count: matches };
        }

        state.frames_waited += 1;
        if state.frames_waited >= limit_frames {
            state.dispatched = true;
            state.frames_waited = 0;
            return Verdict::Partial { count: matches };
        }

        Verdict::Pending {
            frames_waited: state.frames_waited,
        }
    }
}

/// 电平触发信号 (Mutex<bool> + Condvar)
#[derive(Debug, Default)]
pub struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 等待信号置位, 超时返回当前值
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |flag| !*flag)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
