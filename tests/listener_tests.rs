//! Listener 连接集成测试（本地假 agent）

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use switchboard_engine::listener::{open, ListenerClient, ListenerSignal, SignalKind, MAX_FRAME_FACTOR};
use switchboard_engine::protocol::{AgentEvent, Command, Envelope, Inbound, DELIMITER};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const DEVICE: u64 = 7;

/// 假 agent 的一端
struct FakeAgent {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeAgent {
    async fn read_command(&mut self) -> Envelope {
        let mut frame = Vec::new();
        self.reader.read_until(DELIMITER, &mut frame).await.unwrap();
        Envelope::decode(&frame).unwrap()
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn write_json(&mut self, value: serde_json::Value) {
        let mut frame = serde_json::to_vec(&value).unwrap();
        frame.push(DELIMITER);
        self.write_raw(&frame).await;
    }

    async fn ack(&mut self, envelope: &Envelope, accepted: bool, error: &str) {
        self.write_json(json!({
            "command": envelope.command.verb(),
            "id": envelope.id.to_string(),
            "bAck": accepted,
            "error": error,
        }))
        .await;
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> FakeAgent {
    let (stream, _) = listener.accept().await.unwrap();
    let (reader, writer) = stream.into_split();
    FakeAgent {
        reader: BufReader::new(reader),
        writer,
    }
}

async fn connect(
    addr: SocketAddr,
    listener: &TcpListener,
) -> (ListenerClient, FakeAgent, mpsc::UnboundedReceiver<ListenerSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut client = ListenerClient::new(addr.ip(), addr.port(), 1024, Duration::from_secs(10));
    let generation = client.begin_connect();

    let (link, agent) = tokio::join!(
        open(client.socket_addr(), client.buffer_size(), DEVICE, generation, tx),
        accept(listener)
    );
    assert!(client.attach(link.unwrap(), generation));
    assert!(client.is_connected());
    (client, agent, rx)
}

async fn next_signal(rx: &mut mpsc::UnboundedReceiver<ListenerSignal>) -> ListenerSignal {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("inbox closed")
}

fn expect_ack(signal: ListenerSignal) -> switchboard_engine::protocol::Ack {
    match signal.kind {
        SignalKind::Message(Inbound::Ack(ack)) => ack,
        other => panic!("Expected ack, got {:?}", other),
    }
}

#[tokio::test]
async fn test_command_is_acknowledged_by_id() {
    let (listener, addr) = bind().await;
    let (mut client, mut agent, mut rx) = connect(addr, &listener).await;

    let id = client.send(Command::KeepAlive).unwrap();
    assert!(client.is_pending(&id));

    let received = agent.read_command().await;
    assert_eq!(received.id, id);
    assert_eq!(received.command, Command::KeepAlive);
    agent.ack(&received, true, "").await;

    let signal = next_signal(&mut rx).await;
    assert_eq!(signal.device, DEVICE);
    assert_eq!(signal.generation, client.generation());

    let resolved = client.resolve(expect_ack(signal));
    assert!(resolved.ack.accepted);
    assert_eq!(resolved.pending.map(|p| p.verb), Some("keep alive"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_malformed_record_does_not_break_the_connection() {
    let (listener, addr) = bind().await;
    let (mut client, mut agent, mut rx) = connect(addr, &listener).await;

    let first = client.send(Command::KeepAlive).unwrap();
    let _ = agent.read_command().await;
    agent.write_raw(b"{this is not json\0").await;

    let ack = expect_ack(next_signal(&mut rx).await);
    assert!(!ack.accepted);
    assert!(ack.error.is_some());
    let resolved = client.resolve(ack);
    assert!(resolved.pending.is_none());
    assert!(client.is_pending(&first));

    // 之后的命令照常工作
    let second = client
        .send(Command::ReceiveFile {
            source: "D:/Proj/Config/Tags/VPRoles.ini".to_string(),
        })
        .unwrap();
    let received = agent.read_command().await;
    assert_eq!(received.id, second);
    agent.ack(&received, false, "file not found").await;

    let resolved = client.resolve(expect_ack(next_signal(&mut rx).await));
    assert!(!resolved.ack.accepted);
    assert_eq!(resolved.ack.error.as_deref(), Some("file not found"));
    assert_eq!(resolved.pending.map(|p| p.id), Some(second));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_events_and_empty_frames() {
    let (listener, addr) = bind().await;
    let (_client, mut agent, mut rx) = connect(addr, &listener).await;

    agent.write_raw(b"\0").await;
    agent
        .write_json(json!({
            "command": "state",
            "version": "1.4.0",
            "runningProcesses": [],
            "osVersionLabel": "Windows 10",
            "totalPhysicalMemory": 68719476736u64,
        }))
        .await;

    match next_signal(&mut rx).await.kind {
        SignalKind::Message(Inbound::Event(AgentEvent::State(state))) => {
            assert_eq!(state.version, "1.4.0");
            assert!(state.is_compatible());
            assert_eq!(state.os_version_label, "Windows 10");
        }
        other => panic!("Expected state event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_peer_close_reports_unexpected_disconnect() {
    let (listener, addr) = bind().await;
    let (client, mut agent, mut rx) = connect(addr, &listener).await;

    // 记录中途断开：不完整的记录被丢弃
    agent.write_raw(br#"{"command": "keep alive", "bAck": tr"#).await;
    drop(agent);

    let signal = next_signal(&mut rx).await;
    assert_eq!(signal.generation, client.generation());
    assert_eq!(signal.kind, SignalKind::Disconnected { unexpected: true });
}

#[tokio::test]
async fn test_disconnect_notifies_peer() {
    let (listener, addr) = bind().await;
    let (mut client, mut agent, _rx) = connect(addr, &listener).await;

    let pending = client.send(Command::KeepAlive).unwrap();
    let _ = agent.read_command().await;

    let generation = client.generation();
    let abandoned = client.disconnect();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].id, pending);
    assert!(!client.is_connected());
    assert!(client.generation() > generation);

    let goodbye = timeout(Duration::from_secs(5), agent.read_command())
        .await
        .unwrap();
    assert_eq!(goodbye.command, Command::Disconnect);
}

#[tokio::test]
async fn test_records_are_held_until_attached() {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = ListenerClient::new(addr.ip(), addr.port(), 1024, Duration::from_secs(10));
    let generation = client.begin_connect();

    let (link, agent) = tokio::join!(
        open(client.socket_addr(), client.buffer_size(), DEVICE, generation, tx),
        accept(&listener)
    );
    let link = link.unwrap();

    // 对端在连接挂上之前就发完状态并关闭
    let mut agent = agent;
    agent
        .write_json(json!({
            "command": "state",
            "version": "1.4.0",
            "runningProcesses": [],
        }))
        .await;
    drop(agent);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    assert!(client.attach(link, generation));
    match next_signal(&mut rx).await.kind {
        SignalKind::Message(Inbound::Event(AgentEvent::State(state))) => {
            assert_eq!(state.version, "1.4.0");
        }
        other => panic!("Expected state event, got {:?}", other),
    }
    assert_eq!(
        next_signal(&mut rx).await.kind,
        SignalKind::Disconnected { unexpected: true }
    );
}

#[tokio::test]
async fn test_unattached_link_stays_silent() {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel::<ListenerSignal>();

    let (link, agent) = tokio::join!(open(addr, 1024, DEVICE, 1, tx), accept(&listener));
    drop(agent);
    drop(link.unwrap());

    // 读取任务退出后通道关闭，期间没有任何信号
    let closed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_oversized_record_is_dropped() {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = ListenerClient::new(addr.ip(), addr.port(), 2, Duration::from_secs(10));
    let generation = client.begin_connect();

    let (link, agent) = tokio::join!(
        open(client.socket_addr(), client.buffer_size(), DEVICE, generation, tx),
        accept(&listener)
    );
    assert!(client.attach(link.unwrap(), generation));
    let mut agent = agent;

    // 超过上限且没有分隔符的数据，之后跟一条正常记录
    let oversized = vec![b'x'; 2 * MAX_FRAME_FACTOR * 3];
    agent.write_raw(&oversized).await;
    agent.write_raw(b"\0").await;
    agent
        .write_json(json!({
            "command": "state",
            "version": "1.4.0",
            "runningProcesses": [],
        }))
        .await;

    match next_signal(&mut rx).await.kind {
        SignalKind::Message(Inbound::Event(AgentEvent::State(state))) => {
            assert_eq!(state.version, "1.4.0");
        }
        other => panic!("Expected state event, got {:?}", other),
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let (listener, addr) = bind().await;
    drop(listener);

    let (tx, _rx) = mpsc::unbounded_channel::<ListenerSignal>();
    let result = open(addr, 1024, DEVICE, 1, tx).await;
    assert!(matches!(result, Err(switchboard_engine::Error::Connection(_))));
}
