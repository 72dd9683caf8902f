//! Listener 连接逻辑
//!
//! 每个连接两个任务：读取任务按 NUL 分帧解码并转发到控制上下文，
//! 写入任务按发送顺序把帧写入 socket。
//!
//! 读取任务在连接被挂到设备上（[`ListenerLink::start`]）之前不读取任何数据，
//! 因此控制上下文总是先看到连接结果，再看到这条连接上的记录或断开信号。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::protocol::{self, Inbound, DELIMITER};

/// 连接超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 单条记录上限 = 读缓冲大小 × 该倍数；超出的记录被丢弃
pub const MAX_FRAME_FACTOR: usize = 16 * 1024;

/// 读取任务发往控制上下文的信号
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSignal {
    pub device: DeviceId,
    /// 连接代数，用于丢弃已被替换的连接发出的信号
    pub generation: u64,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// 一条解码后的入站记录
    Message(Inbound),
    /// 连接断开
    Disconnected { unexpected: bool },
}

/// 一条已建立的连接
#[derive(Debug)]
pub struct ListenerLink {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    start: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ListenerLink {
    /// 不绑定 socket 的连接，写入的帧从返回的接收端取出
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox,
                start: None,
                reader: None,
                writer: None,
            },
            rx,
        )
    }

    /// 放行读取任务；只有第一次调用生效
    pub fn start(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
    }

    /// 入队一帧；不会阻塞
    pub fn write(&self, frame: Vec<u8>) -> Result<()> {
        self.outbox
            .send(frame)
            .map_err(|_| Error::Connection("写入通道已关闭".to_string()))
    }

    /// 关闭连接：停止读取（不再产生断开信号），写入任务发完剩余帧后退出
    pub fn close(mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // outbox 随 self 一起丢弃，写入任务在通道耗尽后关闭 socket
        self.writer.take();
    }
}

/// 建立连接并启动读写任务
///
/// 读到的每条记录以 [`ListenerSignal`] 形式送入 `inbox`；
/// `inbox` 可以是控制上下文的统一输入通道（实现 `From<ListenerSignal>`）。
pub async fn open<T>(
    addr: SocketAddr,
    buffer_size: usize,
    device: DeviceId,
    generation: u64,
    inbox: mpsc::UnboundedSender<T>,
) -> Result<ListenerLink>
where
    T: From<ListenerSignal> + Send + 'static,
{
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Connection(format!("连接 {} 超时", addr)))?
        .map_err(|e| Error::Connection(format!("连接 {} 失败: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    tracing::debug!("🔌 Listener connected: device={}, addr={}", device, addr);

    let (read_half, write_half) = stream.into_split();
    let (outbox, rx) = mpsc::unbounded_channel();
    let (start, started) = oneshot::channel();

    let writer = tokio::spawn(write_loop(write_half, rx));
    let reader = tokio::spawn(async move {
        // 连接被丢弃而未挂上时静默退出
        if started.await.is_ok() {
            read_loop(read_half, buffer_size, device, generation, inbox).await;
        }
    });

    Ok(ListenerLink {
        outbox,
        start: Some(start),
        reader: Some(reader),
        writer: Some(writer),
    })
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("写入 listener 失败: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<T>(
    reader: OwnedReadHalf,
    buffer_size: usize,
    device: DeviceId,
    generation: u64,
    inbox: mpsc::UnboundedSender<T>,
) where
    T: From<ListenerSignal> + Send + 'static,
{
    let mut reader = BufReader::with_capacity(buffer_size.max(1), reader);
    let mut frame = Vec::with_capacity(buffer_size);
    let max_frame = (buffer_size.max(1) * MAX_FRAME_FACTOR) as u64;

    let signal = |kind| {
        T::from(ListenerSignal {
            device,
            generation,
            kind,
        })
    };

    loop {
        frame.clear();
        let read = (&mut reader).take(max_frame).read_until(DELIMITER, &mut frame).await;
        match read {
            Ok(0) => break,
            Ok(n) => {
                if frame.last() != Some(&DELIMITER) && n as u64 == max_frame {
                    tracing::warn!("device={}: 记录超过 {} bytes，已丢弃", device, max_frame);
                    match skip_frame(&mut reader, max_frame).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!("device={}: 读取 listener 失败: {}", device, e);
                            break;
                        }
                    }
                }
                // 末尾没有分隔符说明对端在记录中途关闭
                if frame.last() != Some(&DELIMITER) {
                    tracing::warn!("device={}: 丢弃不完整的记录 ({} bytes)", device, frame.len());
                    break;
                }
                if frame.len() == 1 {
                    continue;
                }
                let inbound = protocol::decode_inbound(&frame);
                if inbox.send(signal(SignalKind::Message(inbound))).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("device={}: 读取 listener 失败: {}", device, e);
                break;
            }
        }
    }

    let _ = inbox.send(signal(SignalKind::Disconnected { unexpected: true }));
}

/// 丢弃到下一个分隔符为止的数据；对端关闭时返回 false
async fn skip_frame(reader: &mut BufReader<OwnedReadHalf>, chunk: u64) -> std::io::Result<bool> {
    let mut discard = Vec::new();
    loop {
        discard.clear();
        let n = (&mut *reader).take(chunk).read_until(DELIMITER, &mut discard).await?;
        if n == 0 {
            return Ok(false);
        }
        if discard.last() == Some(&DELIMITER) {
            return Ok(true);
        }
    }
}
