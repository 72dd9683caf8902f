//! Listener 线协议定义
//!
//! 通信方式：TCP + 自描述 JSON 记录，每条记录以单个 NUL 字节（`\0`）结尾。
//! NUL 不会出现在合法的 JSON 文本中，因此可以作为分隔符。
//!
//! - Console → Agent：[`Envelope`]（`command` 动词 + `id` 关联令牌）
//! - Agent → Console：[`Inbound`]（按 id 匹配的确认，或按名字分发的事件）

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;

/// 记录分隔符
pub const DELIMITER: u8 = 0;

/// 兼容的 listener 主版本号
pub const LISTENER_COMPAT_MAJOR: u32 = 1;

/// 兼容的最低次版本号
pub const LISTENER_COMPAT_MINOR: u32 = 2;

/// 命令（Console → Agent）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// 启动远程进程
    #[serde(rename = "start")]
    Start {
        exe: String,
        args: String,
        name: String,
        caller: String,
        #[serde(rename = "workingDir", default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(rename = "bUpdateClientsWithStdout")]
        echo_stdout: bool,
        #[serde(rename = "priorityModifier", default)]
        priority_modifier: i32,
    },

    /// 结束远程进程
    #[serde(rename = "kill")]
    Kill { uuid: Uuid },

    /// 发送文件（内容为 base64）
    #[serde(rename = "send file")]
    SendFile { destination: String, content: String },

    /// 拉取文件
    #[serde(rename = "receive file")]
    ReceiveFile { source: String },

    /// 查询集群同步状态
    #[serde(rename = "get sync status")]
    GetSyncStatus {
        uuid: Uuid,
        #[serde(rename = "bEcho")]
        echo: bool,
    },

    /// 初始化版本控制
    #[serde(rename = "vcs init")]
    VcsInit {
        provider: String,
        #[serde(rename = "vcsSettings")]
        settings: BTreeMap<String, String>,
    },

    /// 查询本地版本号
    #[serde(rename = "vcs report revision")]
    VcsReportRevision { path: String },

    /// 同步到指定版本
    #[serde(rename = "vcs sync")]
    VcsSync { revision: String, path: String },

    /// 心跳
    #[serde(rename = "keep alive")]
    KeepAlive,

    /// 主动断开
    #[serde(rename = "disconnect")]
    Disconnect,
}

impl Command {
    /// 命令动词（与线上 `command` 字段一致）
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Kill { .. } => "kill",
            Command::SendFile { .. } => "send file",
            Command::ReceiveFile { .. } => "receive file",
            Command::GetSyncStatus { .. } => "get sync status",
            Command::VcsInit { .. } => "vcs init",
            Command::VcsReportRevision { .. } => "vcs report revision",
            Command::VcsSync { .. } => "vcs sync",
            Command::KeepAlive => "keep alive",
            Command::Disconnect => "disconnect",
        }
    }
}

/// 带关联 id 的命令记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub command: Command,
}

impl Envelope {
    /// 生成新的唯一 id
    pub fn new(command: Command) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
        }
    }

    /// 序列化为一帧（JSON + 分隔符）
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(DELIMITER);
        Ok(frame)
    }

    /// 解析一帧（分隔符可有可无）
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(strip_delimiter(frame))?)
    }
}

/// Agent 上运行的进程描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub uuid: Uuid,
    pub name: String,
    pub caller: String,
    #[serde(default)]
    pub pid: u32,
}

/// 连接建立后 agent 主动推送的状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// `major.minor.patch`
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub running_processes: Vec<ProcessInfo>,
    #[serde(default)]
    pub os_version_label: String,
    #[serde(default)]
    pub os_version_label_sub: String,
    #[serde(default)]
    pub os_version_number: String,
    #[serde(default)]
    pub total_physical_memory: u64,
}

impl StateSnapshot {
    /// 解析版本号
    pub fn parsed_version(&self) -> Option<(u32, u32, u32)> {
        let mut parts = self.version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
        Some((major, minor, patch))
    }

    /// 版本是否兼容
    pub fn is_compatible(&self) -> bool {
        matches!(
            self.parsed_version(),
            Some((major, minor, _)) if major == LISTENER_COMPAT_MAJOR && minor >= LISTENER_COMPAT_MINOR
        )
    }
}

/// 集群状态（`get sync status` 的回应）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStatus {
    pub sync_topologies: Vec<SyncTopology>,
    pub refresh_rate: Option<f32>,
    pub house_sync_present: bool,
    pub house_sync_rate: Option<f32>,
    pub sync_source: String,
    pub mosaic_topologies: Vec<MosaicTopology>,
    pub flip_model_history: Vec<String>,
    pub focused_process_id: Option<u32>,
    pub cpu_utilization: Option<f32>,
    pub gpu_utilizations: Vec<f32>,
    pub physical_memory_available: Option<u64>,
    pub os_version: String,
}

/// GPU / 显示同步拓扑
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncTopology {
    pub sync_gpus: Vec<SyncGpu>,
    pub sync_displays: Vec<SyncDisplay>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncGpu {
    pub is_synced: bool,
    pub num_displays: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncDisplay {
    pub sync_state: String,
    pub refresh_rate: Option<f32>,
}

/// Mosaic 显示网格
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MosaicTopology {
    pub rows: u32,
    pub columns: u32,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: Option<f32>,
}

/// 命令确认
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// 对应的命令 id（无法解析时为 None）
    pub id: Option<Uuid>,
    /// 原命令动词
    pub verb: String,
    pub accepted: bool,
    pub error: Option<String>,
}

/// 命名事件（Agent → Console）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum AgentEvent {
    #[serde(rename = "program started")]
    ProgramStarted { process: ProcessInfo },

    #[serde(rename = "program ended")]
    ProgramEnded {
        process: ProcessInfo,
        returncode: i32,
        #[serde(rename = "stdoutB64", default)]
        stdout_b64: String,
    },

    #[serde(rename = "program start failed")]
    ProgramStartFailed {
        puuid: Uuid,
        #[serde(default)]
        error: String,
    },

    #[serde(rename = "program kill failed")]
    ProgramKillFailed {
        puuid: Uuid,
        #[serde(default)]
        error: String,
    },

    #[serde(rename = "programstdout")]
    ProgramOutput {
        process: ProcessInfo,
        #[serde(rename = "partialStdoutB64", default)]
        partial_stdout_b64: String,
    },

    #[serde(rename = "receive file complete")]
    ReceiveFileCompleted { source: String, content: String },

    #[serde(rename = "receive file failed")]
    ReceiveFileFailed {
        source: String,
        #[serde(default)]
        error: String,
    },

    #[serde(rename = "state")]
    State(StateSnapshot),

    #[serde(rename = "sync status")]
    SyncStatus {
        #[serde(rename = "syncStatus")]
        status: SyncStatus,
    },
}

/// 解码后的入站记录
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack(Ack),
    Event(AgentEvent),
}

fn strip_delimiter(frame: &[u8]) -> &[u8] {
    match frame.split_last() {
        Some((&DELIMITER, rest)) => rest,
        _ => frame,
    }
}

/// 解码一条入站记录
///
/// 无法解析的数据被视为一条“未接受”的确认：能恢复出 id 时带上 id，
/// 以便对应的待决命令得到结果；连接本身不受影响。
pub fn decode_inbound(frame: &[u8]) -> Inbound {
    let payload = strip_delimiter(frame);

    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("无法解析 listener 消息: {}", e);
            return malformed(None, String::new(), format!("malformed message: {}", e));
        }
    };

    let verb = value
        .get("command")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let id = value
        .get("id")
        .and_then(|i| i.as_str())
        .and_then(|i| Uuid::parse_str(i).ok());

    if let Some(accepted) = value.get("bAck") {
        let Some(accepted) = accepted.as_bool() else {
            return malformed(id, verb, "bAck is not a bool".to_string());
        };
        let error = value
            .get("error")
            .and_then(|e| e.as_str())
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        return Inbound::Ack(Ack {
            id,
            verb,
            accepted,
            error,
        });
    }

    match serde_json::from_value::<AgentEvent>(value) {
        Ok(event) => Inbound::Event(event),
        Err(e) => {
            tracing::warn!("无法识别的 listener 消息 '{}': {}", verb, e);
            malformed(id, verb, format!("unsupported message: {}", e))
        }
    }
}

fn malformed(id: Option<Uuid>, verb: String, error: String) -> Inbound {
    Inbound::Ack(Ack {
        id,
        verb,
        accepted: false,
        error: Some(error),
    })
}

/// 解码 base64 文本（stdout / 文件内容）
pub fn decode_b64_text(encoded: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("base64 解码失败: {}", e);
            String::new()
        }
    }
}

/// 编码 base64 文本
pub fn encode_b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
