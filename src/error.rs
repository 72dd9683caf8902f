//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 连接错误（连接失败 / 意外断开）
    #[error("连接错误: {0}")]
    Connection(String),

    /// 尚未连接 listener
    #[error("未连接 listener: {0}")]
    NotConnected(String),

    /// 协议错误（无法解析 / 不支持的命令 / 版本不兼容）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// OSC 编解码错误
    #[error("OSC 错误: {0}")]
    Osc(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 设置值不在允许范围内
    #[error("非法设置值: {setting} = {value}")]
    InvalidValue { setting: String, value: String },

    /// 未注册的设置
    #[error("未知设置: {0}")]
    UnknownSetting(String),

    /// 未注册的设备
    #[error("未知设备: {0}")]
    UnknownDevice(String),

    /// 设备名重复
    #[error("设备名已存在: {0}")]
    DuplicateName(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
