//! 控制台配置
//!
//! 进程启动时加载一次，之后只在显式保存（操作员 Save / 退出）时写回磁盘。

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::error::{Error, Result};
use crate::settings::SettingValue;

/// Listener 默认端口
pub const DEFAULT_LISTENER_PORT: u16 = 2980;

/// 配置文件环境变量
pub const CONFIG_ENV: &str = "SWITCHBOARD_CONFIG";

/// 会话默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub sequence: String,
    pub slate: String,
    pub take: u32,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            sequence: "Main".to_string(),
            slate: "Scene".to_string(),
            take: 1,
        }
    }
}

/// 已注册的设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub address: IpAddr,
    /// 设备自有设置 + 覆盖值
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
}

/// 控制台配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// 数据目录（默认 ~/.switchboard）
    pub data_dir: PathBuf,
    /// 本机地址（发送给设备作为 OSC 回连目标）
    pub address: IpAddr,
    /// Listener 端口
    pub listener_port: u16,
    /// Listener 读缓冲大小
    pub listener_buffer_size: usize,
    /// 本地 OSC 服务端口
    pub osc_server_port: u16,
    /// 设备 OSC 端口
    pub osc_client_port: u16,
    /// 集群状态轮询间隔（毫秒）
    pub cluster_poll_interval_ms: u64,
    /// 命令确认超时（秒）
    pub command_timeout_secs: u64,
    /// 心跳间隔（秒），None 表示不发送
    pub keep_alive_interval_secs: Option<u64>,
    /// 会话默认值
    pub session: SessionDefaults,
    /// 项目设置
    pub project: BTreeMap<String, SettingValue>,
    /// 插件设置（按设备类型）
    pub plugins: BTreeMap<DeviceKind, BTreeMap<String, SettingValue>>,
    /// 已注册设备
    pub devices: Vec<DeviceConfig>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        // 默认路径: ~/.switchboard
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".switchboard"))
            .unwrap_or_else(|| PathBuf::from(".switchboard"));

        Self {
            data_dir,
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listener_port: DEFAULT_LISTENER_PORT,
            listener_buffer_size: 1024,
            osc_server_port: 6000,
            osc_client_port: 8000,
            cluster_poll_interval_ms: 1000,
            command_timeout_secs: 10,
            keep_alive_interval_secs: None,
            session: SessionDefaults::default(),
            project: BTreeMap::new(),
            plugins: BTreeMap::new(),
            devices: Vec::new(),
        }
    }
}

impl ConsoleConfig {
    /// 从文件加载；文件不存在时返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::info!("已加载配置: {:?} ({} devices)", path, config.devices.len());
        Ok(config)
    }

    /// 从环境变量或默认路径加载
    pub fn from_env() -> Result<Self> {
        Self::load(Self::env_path())
    }

    /// 配置文件路径：SWITCHBOARD_CONFIG 优先，否则 ~/.switchboard/config.json
    pub fn env_path() -> PathBuf {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::default().data_dir.join("config.json"),
        }
    }

    /// 写回磁盘
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 设备名必须唯一，缓冲大小与命令超时必须为正
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.name.as_str()) {
                return Err(Error::DuplicateName(device.name.clone()));
            }
        }
        if self.listener_buffer_size == 0 {
            return Err(Error::Config("listener_buffer_size 不能为 0".to_string()));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::Config("command_timeout_secs 不能为 0".to_string()));
        }
        Ok(())
    }

    /// 录制记录文件路径
    pub fn recordings_path(&self) -> PathBuf {
        self.data_dir.join("recordings.json")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}
