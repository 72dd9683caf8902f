//! switchboard-engine - 多机虚拟制片控制台的设备编排引擎
//!
//! 控制台通过私有的 listener 协议驱动每台设备上的常驻 agent，
//! 并通过 OSC 广播让各设备的 slate / take / 录制状态保持一致。
//!
//! # 核心功能
//!
//! - **Listener 协议**: NUL 分隔的 JSON 命令 / 确认 / 事件，按 id 关联
//! - **设备状态机**: 连接、同步、构建、启动、录制的生命周期
//! - **分层设置**: 项目 → 插件 → 设备覆盖
//! - **会话广播**: slate / take / record 扇出与回声抑制
//! - **集群监控**: 周期轮询同步状态，过期检测
//!
//! # Feature Flags
//!
//! - `session`: 会话协调 + OSC 端点
//! - `monitor`: 集群状态监控
//! - `console`: 单一控制上下文与可执行程序（默认，包含以上两者）
//!
//! # 架构
//!
//! 所有状态只在控制台任务中修改。每个连接的读写任务、连接任务和
//! OSC 接收任务都把消息送入同一个输入通道。

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod listener;
pub mod protocol;
pub mod recording;
pub mod settings;

#[cfg(feature = "session")]
pub mod osc;

#[cfg(feature = "session")]
pub mod session;

#[cfg(feature = "monitor")]
pub mod monitor;

#[cfg(feature = "console")]
pub mod console;

// Re-exports
pub use config::{ConsoleConfig, DeviceConfig};
pub use device::{ConnectRequest, Device, DeviceId, DeviceKind, DeviceManager, DeviceStatus};
pub use error::{Error, Result};
pub use events::{Broadcaster, DeviceEvent, DeviceEventKind, SettingEvent, SettingEventKind};
pub use listener::{ListenerClient, ListenerLink, ListenerSignal};
pub use protocol::{Command, Envelope, Inbound};
pub use recording::{DeviceRecording, Recording, RecordingManager};
pub use settings::{Setting, SettingValue, SettingsContext};

#[cfg(feature = "session")]
pub use session::SessionCoordinator;

#[cfg(feature = "monitor")]
pub use monitor::ClusterMonitor;

#[cfg(feature = "console")]
pub use console::{Console, ConsoleHandle, ConsoleInput, OperatorCommand};
