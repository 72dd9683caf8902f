//! 事件广播器
//!
//! 每个组件通过显式的订阅通道对外发布通知：订阅者按事件类型注册，
//! 广播时对每个订阅者 `try_send`，通道满或已关闭时丢弃（fire-and-forget）。

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::device::{DeviceId, DeviceStatus};
use crate::settings::SettingValue;

/// 订阅者 ID
pub type SubscriberId = u64;

/// 每个订阅者通道的默认容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// 可广播的事件
pub trait Event: Clone + Debug + Send + 'static {
    /// 事件类型（用于订阅过滤）
    type Kind: Copy + Eq + Hash + Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// 事件广播器
pub struct Broadcaster<E: Event> {
    /// 订阅关系：SubscriberId → 订阅的事件类型
    subscriptions: RwLock<HashMap<SubscriberId, HashSet<E::Kind>>>,
    /// 发送通道：SubscriberId → 发送通道
    senders: RwLock<HashMap<SubscriberId, mpsc::Sender<E>>>,
    /// 下一个订阅者 ID
    next_id: RwLock<SubscriberId>,
    capacity: usize,
}

impl<E: Event> Broadcaster<E> {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 指定订阅通道容量
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            ..Self::default()
        })
    }

    /// 订阅事件，返回订阅者 ID 和接收通道
    pub fn subscribe(&self, kinds: &[E::Kind]) -> (SubscriberId, mpsc::Receiver<E>) {
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;

        self.senders.write().insert(id, tx);
        self.subscriptions
            .write()
            .insert(id, kinds.iter().copied().collect());

        tracing::debug!("📡 Subscriber registered: id={}, kinds={:?}", id, kinds);
        (id, rx)
    }

    /// 追加订阅的事件类型
    pub fn add_kinds(&self, id: SubscriberId, kinds: &[E::Kind]) {
        if let Some(sub) = self.subscriptions.write().get_mut(&id) {
            sub.extend(kinds.iter().copied());
        }
    }

    /// 注销订阅者
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.senders.write().remove(&id);
        self.subscriptions.write().remove(&id);
        tracing::debug!("📡 Subscriber unregistered: id={}", id);
    }

    /// 广播事件给所有订阅者（非阻塞，fire-and-forget）
    pub fn broadcast(&self, event: E) {
        let kind = event.kind();

        let targets: Vec<(SubscriberId, mpsc::Sender<E>)> = {
            let subs = self.subscriptions.read();
            let senders = self.senders.read();

            subs.iter()
                .filter(|(_, kinds)| kinds.contains(&kind))
                .filter_map(|(id, _)| senders.get(id).map(|s| (*id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: kind={:?}", kind);
            return;
        }

        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, dropping event: subscriber={}, kind={:?}", id, kind);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(id);
                }
            }
        }

        // 接收端已丢弃的订阅者直接清理
        for id in closed {
            tracing::debug!("📡 Channel closed: subscriber={}", id);
            self.unsubscribe(id);
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.senders.read().len()
    }
}

impl<E: Event> Default for Broadcaster<E> {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// 设备事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Status,
    Connection,
    Sync,
    Build,
    Changelist,
    Program,
    Registry,
    Telemetry,
}

/// 设备事件
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// 状态变化
    StatusChanged {
        device: DeviceId,
        old: DeviceStatus,
        new: DeviceStatus,
    },
    /// 连接 listener 失败
    ConnectFailed { device: DeviceId, error: String },
    /// listener 断开（unexpected = 非主动断开）
    Disconnected { device: DeviceId, unexpected: bool },
    /// 同步失败
    SyncFailed { device: DeviceId },
    /// 同步进度（如 "42.50%"）
    SyncProgress { device: DeviceId, percent: String },
    /// 构建进度
    BuildProgress {
        device: DeviceId,
        step: String,
        percent: String,
    },
    /// 构建失败（非零退出码）
    BuildFailed {
        device: DeviceId,
        program: String,
        returncode: i32,
    },
    /// 版本号更新
    ChangelistChanged {
        device: DeviceId,
        engine: Option<String>,
        project: Option<String>,
    },
    /// 远程进程启动失败
    ProgramFailed {
        device: DeviceId,
        program: String,
        error: String,
    },
    /// 设备注册 / 重命名 / 移除
    Added { device: DeviceId, name: String },
    Renamed {
        device: DeviceId,
        old: String,
        new: String,
    },
    Removed { device: DeviceId, name: String },
    /// 电量上报
    Battery { device: DeviceId, level: f32 },
}

impl Event for DeviceEvent {
    type Kind = DeviceEventKind;

    fn kind(&self) -> DeviceEventKind {
        match self {
            DeviceEvent::StatusChanged { .. } => DeviceEventKind::Status,
            DeviceEvent::ConnectFailed { .. } | DeviceEvent::Disconnected { .. } => {
                DeviceEventKind::Connection
            }
            DeviceEvent::SyncFailed { .. } | DeviceEvent::SyncProgress { .. } => DeviceEventKind::Sync,
            DeviceEvent::BuildProgress { .. } | DeviceEvent::BuildFailed { .. } => {
                DeviceEventKind::Build
            }
            DeviceEvent::ChangelistChanged { .. } => DeviceEventKind::Changelist,
            DeviceEvent::ProgramFailed { .. } => DeviceEventKind::Program,
            DeviceEvent::Added { .. }
            | DeviceEvent::Renamed { .. }
            | DeviceEvent::Removed { .. } => DeviceEventKind::Registry,
            DeviceEvent::Battery { .. } => DeviceEventKind::Telemetry,
        }
    }
}

/// 设置事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingEventKind {
    Changed,
    Overridden,
}

/// 设置事件
#[derive(Debug, Clone, PartialEq)]
pub enum SettingEvent {
    /// 基础值变化
    Changed {
        key: String,
        old: SettingValue,
        new: SettingValue,
    },
    /// 设备覆盖值变化（移除覆盖时 new 为回落后的基础值）
    Overridden {
        key: String,
        device: String,
        old: SettingValue,
        new: SettingValue,
    },
}

impl Event for SettingEvent {
    type Kind = SettingEventKind;

    fn kind(&self) -> SettingEventKind {
        match self {
            SettingEvent::Changed { .. } => SettingEventKind::Changed,
            SettingEvent::Overridden { .. } => SettingEventKind::Overridden,
        }
    }
}
