//! 会话广播协议（OSC over UDP）
//!
//! 只实现会话广播需要的子集：单条消息（不支持 bundle），
//! 参数类型 `i` / `f` / `s` / `T` / `F`。

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// 地址常量
pub mod address {
    pub const TAKE: &str = "/Take";
    pub const SLATE: &str = "/Slate";
    pub const SLATE_DESCRIPTION: &str = "/SlateDescription";
    pub const RECORD_START: &str = "/RecordStart";
    pub const RECORD_STOP: &str = "/RecordStop";
    pub const RECORD_CANCEL: &str = "/RecordCancel";
    pub const RECORD_START_CONFIRM: &str = "/RecordStartConfirm";
    pub const RECORD_STOP_CONFIRM: &str = "/RecordStopConfirm";
    pub const RECORD_CANCEL_CONFIRM: &str = "/RecordCancelConfirm";
    pub const UE4_LAUNCH_CONFIRM: &str = "/UE4LaunchConfirm";
    pub const OSC_ADD_SEND_TARGET: &str = "/OSCAddSendTarget";
    pub const OSC_ADD_SEND_TARGET_CONFIRM: &str = "/OSCAddSendTargetConfirm";
    pub const ARSESSION_START_CONFIRM: &str = "/ARSessionStartConfirm";
    pub const ARSESSION_STOP_CONFIRM: &str = "/ARSessionStopConfirm";
    pub const BATTERY: &str = "/Battery";
    pub const DATA: &str = "/Data";
}

const MAX_DATAGRAM: usize = 65_507;

/// 消息参数
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
    Bool(bool),
}

impl OscArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscArg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 整数；浮点与数字字符串也接受（各端发送的类型并不统一）
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OscArg::Int(v) => Some(i64::from(*v)),
            OscArg::Float(v) => Some(*v as i64),
            OscArg::Str(s) => s.trim().parse().ok(),
            OscArg::Bool(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            OscArg::Int(v) => Some(*v as f32),
            OscArg::Float(v) => Some(*v),
            OscArg::Str(s) => s.trim().parse().ok(),
            OscArg::Bool(_) => None,
        }
    }

    /// 任意参数的文本形式
    pub fn to_text(&self) -> String {
        match self {
            OscArg::Int(v) => v.to_string(),
            OscArg::Float(v) => v.to_string(),
            OscArg::Str(s) => s.clone(),
            OscArg::Bool(b) => b.to_string(),
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        OscArg::Int(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        OscArg::Float(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        OscArg::Str(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        OscArg::Str(v)
    }
}

impl From<bool> for OscArg {
    fn from(v: bool) -> Self {
        OscArg::Bool(v)
    }
}

/// OSC 消息
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    pad4(buf);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_str(&mut self) -> Result<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Osc("unterminated string".to_string()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|e| Error::Osc(format!("invalid utf-8: {}", e)))?
            .to_string();
        // 含终止符后按 4 字节对齐
        self.pos += (end + 4) & !3;
        Ok(s)
    }

    fn read_4(&mut self) -> Result<[u8; 4]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| Error::Osc("truncated argument".to_string()))?;
        self.pos += 4;
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

impl OscMessage {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OscArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_str(&mut buf, &self.address);

        let mut tags = String::from(",");
        for arg in &self.args {
            tags.push(match arg {
                OscArg::Int(_) => 'i',
                OscArg::Float(_) => 'f',
                OscArg::Str(_) => 's',
                OscArg::Bool(true) => 'T',
                OscArg::Bool(false) => 'F',
            });
        }
        write_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Str(s) => write_str(&mut buf, s),
                OscArg::Bool(_) => {}
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&b'/') {
            return Err(Error::Osc("not an OSC message".to_string()));
        }

        let mut cursor = Cursor { data, pos: 0 };
        let address = cursor.read_str()?;
        if cursor.pos >= data.len() {
            // 旧实现可以省略类型标签
            return Ok(Self { address, args: Vec::new() });
        }

        let tags = cursor.read_str()?;
        let tags = tags
            .strip_prefix(',')
            .ok_or_else(|| Error::Osc(format!("bad type tag string '{}'", tags)))?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => OscArg::Int(i32::from_be_bytes(cursor.read_4()?)),
                'f' => OscArg::Float(f32::from_be_bytes(cursor.read_4()?)),
                's' => OscArg::Str(cursor.read_str()?),
                'T' => OscArg::Bool(true),
                'F' => OscArg::Bool(false),
                other => return Err(Error::Osc(format!("unsupported type tag '{}'", other))),
            };
            args.push(arg);
        }
        Ok(Self { address, args })
    }
}

/// 收到的广播消息
#[derive(Debug, Clone, PartialEq)]
pub struct OscInbound {
    pub from: SocketAddr,
    pub message: OscMessage,
}

/// UDP 端点：接收任务把消息送入控制上下文的输入通道
pub struct OscEndpoint {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl OscEndpoint {
    pub async fn bind<T>(addr: SocketAddr, inbox: mpsc::UnboundedSender<T>) -> Result<Self>
    where
        T: From<OscInbound> + Send + 'static,
    {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        tracing::info!("📡 OSC server listening on {}", socket.local_addr()?);

        let reader = socket.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match reader.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!("OSC recv error: {}", e);
                        continue;
                    }
                };
                match OscMessage::decode(&buf[..len]) {
                    Ok(message) => {
                        if inbox.send(OscInbound { from, message }.into()).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("OSC 消息解析失败 ({}): {}", from, e),
                }
            }
        });

        Ok(Self { socket, task })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 非阻塞发送
    pub fn send_to(&self, target: SocketAddr, message: &OscMessage) -> Result<()> {
        self.socket.try_send_to(&message.encode(), target)?;
        tracing::trace!("OSC ➡️ {} {} {:?}", target, message.address, message.args);
        Ok(())
    }
}

impl Drop for OscEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}
