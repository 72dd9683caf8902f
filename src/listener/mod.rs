//! Listener 协议客户端
//!
//! 每个设备恰好一个连接。发送命令只是把帧放入写入队列并立即返回关联 id，
//! 结果稍后由读取任务经控制上下文送回。

mod connect;

pub use connect::{open, ListenerLink, ListenerSignal, SignalKind, CONNECT_TIMEOUT, MAX_FRAME_FACTOR};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Ack, Command, Envelope};

/// 等待确认的命令
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: Uuid,
    pub verb: &'static str,
    pub sent_at: Instant,
}

/// 确认匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub ack: Ack,
    /// 匹配到的待决命令；未知 id 时为 None
    pub pending: Option<PendingCommand>,
}

/// Listener 协议客户端
#[derive(Debug)]
pub struct ListenerClient {
    address: IpAddr,
    port: u16,
    buffer_size: usize,
    command_timeout: Duration,
    link: Option<ListenerLink>,
    pending: HashMap<Uuid, PendingCommand>,
    generation: u64,
}

impl ListenerClient {
    pub fn new(address: IpAddr, port: u16, buffer_size: usize, command_timeout: Duration) -> Self {
        Self {
            address,
            port,
            buffer_size,
            command_timeout,
            link: None,
            pending: HashMap::new(),
            generation: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn set_address(&mut self, address: IpAddr) {
        self.address = address;
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// 当前连接代数
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 开始一次新的连接尝试，返回其代数；旧代数的信号此后都会被忽略
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// 挂上新建立的连接并放行其读取任务；代数不匹配时关闭它并返回 false
    pub fn attach(&mut self, mut link: ListenerLink, generation: u64) -> bool {
        if generation != self.generation {
            link.close();
            return false;
        }
        link.start();
        if let Some(old) = self.link.replace(link) {
            old.close();
        }
        true
    }

    /// 发送命令，返回关联 id
    pub fn send(&mut self, command: Command) -> Result<Uuid> {
        self.send_envelope(Envelope::new(command))
    }

    /// 发送指定 id 的命令（start 命令的 id 同时作为程序 id）
    pub fn send_envelope(&mut self, envelope: Envelope) -> Result<Uuid> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::NotConnected(self.socket_addr().to_string()))?;

        let frame = envelope.encode()?;
        link.write(frame)?;

        let verb = envelope.command.verb();
        self.pending.insert(
            envelope.id,
            PendingCommand {
                id: envelope.id,
                verb,
                sent_at: Instant::now(),
            },
        );
        tracing::trace!("➡️ {} ({})", verb, envelope.id);
        Ok(envelope.id)
    }

    /// 用确认匹配待决命令
    pub fn resolve(&mut self, ack: Ack) -> Resolved {
        let pending = ack.id.and_then(|id| self.pending.remove(&id));
        if pending.is_none() {
            tracing::debug!("收到未知命令的确认: verb='{}', id={:?}", ack.verb, ack.id);
        }
        Resolved { ack, pending }
    }

    /// 取出超时未确认的命令
    pub fn expire(&mut self, now: Instant) -> Vec<PendingCommand> {
        let timeout = self.command_timeout;
        let expired: Vec<Uuid> = self
            .pending
            .values()
            .filter(|p| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|p| p.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }

    /// 主动断开：先通知对端，再关闭连接。返回被放弃的待决命令。
    pub fn disconnect(&mut self) -> Vec<PendingCommand> {
        if let Some(link) = self.link.take() {
            if let Ok(frame) = Envelope::new(Command::Disconnect).encode() {
                let _ = link.write(frame);
            }
            link.close();
        }
        // 断开后旧连接的信号全部作废
        self.generation += 1;
        self.pending.drain().map(|(_, p)| p).collect()
    }

    /// 连接意外断开（读取任务已退出）
    pub fn on_connection_lost(&mut self) -> Vec<PendingCommand> {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client() -> ListenerClient {
        ListenerClient::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            2980,
            1024,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_send_without_connection() {
        let mut client = client();
        assert!(matches!(
            client.send(Command::KeepAlive),
            Err(Error::NotConnected(_))
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sends_are_ordered_and_tracked() {
        let mut client = client();
        let (link, mut rx) = ListenerLink::detached();
        let generation = client.begin_connect();
        assert!(client.attach(link, generation));

        let first = client.send(Command::KeepAlive).unwrap();
        let second = client
            .send(Command::VcsReportRevision {
                path: "//depot/Proj".to_string(),
            })
            .unwrap();
        assert_eq!(client.pending_count(), 2);

        let frame = rx.recv().await.unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap().id, first);
        let frame = rx.recv().await.unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap().id, second);

        let resolved = client.resolve(Ack {
            id: Some(second),
            verb: "vcs report revision".to_string(),
            accepted: true,
            error: None,
        });
        assert_eq!(resolved.pending.map(|p| p.verb), Some("vcs report revision"));
        assert!(client.is_pending(&first));
        assert!(!client.is_pending(&second));
    }

    #[tokio::test]
    async fn test_stale_generation_is_rejected() {
        let mut client = client();
        let stale = client.begin_connect();
        let current = client.begin_connect();

        let (link, _rx) = ListenerLink::detached();
        assert!(!client.attach(link, stale));
        assert!(!client.is_connected());

        let (link, _rx) = ListenerLink::detached();
        assert!(client.attach(link, current));
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_commands_expire() {
        let mut client = client();
        let (link, _rx) = ListenerLink::detached();
        let generation = client.begin_connect();
        client.attach(link, generation);

        let id = client.send(Command::KeepAlive).unwrap();
        assert!(client.expire(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        let expired = client.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_sends_goodbye() {
        let mut client = client();
        let (link, mut rx) = ListenerLink::detached();
        let generation = client.begin_connect();
        client.attach(link, generation);
        client.send(Command::KeepAlive).unwrap();

        let abandoned = client.disconnect();
        assert_eq!(abandoned.len(), 1);
        assert!(!client.is_connected());
        assert!(client.generation() > generation);

        let _keep_alive = rx.recv().await.unwrap();
        let goodbye = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(goodbye.command, Command::Disconnect);
        assert!(rx.recv().await.is_none());
    }
}
