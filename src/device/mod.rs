//! 设备状态机
//!
//! 每个远程参与者一个 [`Device`]，独占自己的 listener 连接与待决命令表。
//! 所有方法都在控制上下文中调用；设置通过参数显式传入。

pub mod commands;
mod kind;
mod manager;
mod programs;

pub use commands::{BuildTarget, SyncLeg};
pub use kind::{Capabilities, DeviceDescriptor, DeviceKind};
pub use manager::DeviceManager;
pub use programs::{ProgramTracker, RemoteProgram};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Broadcaster, DeviceEvent};
use crate::listener::{self, ListenerClient, ListenerLink, ListenerSignal, SignalKind};
use crate::protocol::{self, AgentEvent, Command, Inbound, ProcessInfo, StateSnapshot};
use crate::recording::DeviceRecording;
use crate::settings::{keys, SettingsContext};

use commands::{is_build, is_cstat, is_sync};

/// 设备 ID
pub type DeviceId = u64;

/// 设备状态（按“能力”递增排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// 仅用于移除时的记账
    Delete,
    Disconnected,
    Connecting,
    Closed,
    Closing,
    Syncing,
    Building,
    Open,
    Ready,
    Recording,
}

impl DeviceStatus {
    pub fn is_disconnected(self) -> bool {
        self <= DeviceStatus::Connecting
    }
}

/// 一次连接尝试；由控制上下文放到独立任务中执行
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub device: DeviceId,
    pub generation: u64,
    pub addr: SocketAddr,
    pub buffer_size: usize,
}

impl ConnectRequest {
    pub async fn open<T>(self, inbox: mpsc::UnboundedSender<T>) -> Result<ListenerLink>
    where
        T: From<ListenerSignal> + Send + 'static,
    {
        listener::open(self.addr, self.buffer_size, self.device, self.generation, inbox).await
    }
}

/// listener 上报的主机信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub listener_version: String,
    pub os_version_label: String,
    pub os_version_label_sub: String,
    pub os_version_number: String,
    pub total_physical_memory: u64,
}

#[derive(Debug, Default)]
struct SyncState {
    inflight_engine: Option<String>,
    inflight_project: Option<String>,
    build_after_sync: bool,
}

/// 设备
pub struct Device {
    id: DeviceId,
    name: String,
    kind: DeviceKind,
    address: IpAddr,
    status: DeviceStatus,
    listener: ListenerClient,
    programs: ProgramTracker,
    sync: SyncState,
    /// kill 命令 id → 目标程序 id
    kills: HashMap<Uuid, Uuid>,
    engine_changelist: Option<String>,
    project_changelist: Option<String>,
    host: HostInfo,
    send_target_confirmed: bool,
    record_timecode_in: Option<String>,
    battery: Option<f32>,
    events: Arc<Broadcaster<DeviceEvent>>,
}

impl Device {
    pub fn new(
        id: DeviceId,
        name: &str,
        kind: DeviceKind,
        address: IpAddr,
        listener: ListenerClient,
        events: Arc<Broadcaster<DeviceEvent>>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            address,
            status: DeviceStatus::Disconnected,
            listener,
            programs: ProgramTracker::new(),
            sync: SyncState::default(),
            kills: HashMap::new(),
            engine_changelist: None,
            project_changelist: None,
            host: HostInfo::default(),
            send_target_confirmed: false,
            record_timecode_in: None,
            battery: None,
            events,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.kind.descriptor()
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn engine_changelist(&self) -> Option<&str> {
        self.engine_changelist.as_deref()
    }

    pub fn project_changelist(&self) -> Option<&str> {
        self.project_changelist.as_deref()
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn battery(&self) -> Option<f32> {
        self.battery
    }

    pub fn programs(&self) -> &ProgramTracker {
        &self.programs
    }

    pub fn listener(&self) -> &ListenerClient {
        &self.listener
    }

    pub fn is_build_after_sync(&self) -> bool {
        self.sync.build_after_sync
    }

    pub fn is_recording_device(&self, settings: &SettingsContext) -> bool {
        settings.boolean(keys::IS_RECORDING_DEVICE, Some(&self.name))
    }

    /// 设备 OSC 端口（设备设置优先）
    pub fn osc_port(&self, settings: &SettingsContext, default: u16) -> u16 {
        settings
            .integer(keys::OSC_PORT, Some(&self.name))
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(default)
    }

    fn emit(&self, event: DeviceEvent) {
        self.events.broadcast(event);
    }

    pub(crate) fn set_status(&mut self, status: DeviceStatus) {
        if self.status == status {
            return;
        }
        let old = std::mem::replace(&mut self.status, status);
        tracing::info!("{}: {:?} -> {:?}", self.name, old, status);
        self.emit(DeviceEvent::StatusChanged {
            device: self.id,
            old,
            new: status,
        });
    }

    pub(crate) fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub(crate) fn set_address(&mut self, address: IpAddr) {
        self.address = address;
        self.listener.set_address(address);
    }

    pub(crate) fn mark_deleted(&mut self) {
        if self.listener.is_connected() {
            self.disconnect_listener();
        }
        self.set_status(DeviceStatus::Delete);
    }

    // ------------------------------------------------------------------
    // 连接
    // ------------------------------------------------------------------

    /// 请求连接 listener；没有 listener 的设备直接进入 OPEN，等待 OSC 握手
    pub fn connect_listener(&mut self) -> Option<ConnectRequest> {
        if !self.descriptor().capabilities.listener {
            if self.status.is_disconnected() {
                self.set_status(DeviceStatus::Open);
            }
            return None;
        }
        if self.listener.is_connected() || self.status == DeviceStatus::Connecting {
            tracing::debug!("{}: already connected or connecting", self.name);
            return None;
        }

        let generation = self.listener.begin_connect();
        self.set_status(DeviceStatus::Connecting);
        Some(ConnectRequest {
            device: self.id,
            generation,
            addr: self.listener.socket_addr(),
            buffer_size: self.listener.buffer_size(),
        })
    }

    /// 连接任务的结果
    pub fn on_connected(&mut self, generation: u64, result: Result<ListenerLink>) {
        if generation != self.listener.generation() {
            if let Ok(link) = result {
                link.close();
            }
            tracing::debug!("{}: discarding superseded connection attempt", self.name);
            return;
        }

        match result {
            Ok(link) => {
                self.listener.attach(link, generation);
                tracing::info!("{}: Connected to listener at {}", self.name, self.listener.socket_addr());
                self.set_status(DeviceStatus::Closed);
            }
            Err(e) => self.on_connect_failed(&e.to_string()),
        }
    }

    fn on_connect_failed(&mut self, error: &str) {
        tracing::warn!("{}: Unable to connect to listener: {}", self.name, error);
        self.set_status(DeviceStatus::Disconnected);
        self.emit(DeviceEvent::ConnectFailed {
            device: self.id,
            error: error.to_string(),
        });
    }

    fn reset_session_state(&mut self) {
        self.programs.reset();
        self.sync = SyncState::default();
        self.kills.clear();
        self.send_target_confirmed = false;
        self.record_timecode_in = None;
    }

    /// 主动断开
    pub fn disconnect_listener(&mut self) {
        let abandoned = self.listener.disconnect();
        if !abandoned.is_empty() {
            tracing::debug!("{}: abandoning {} pending commands", self.name, abandoned.len());
        }
        self.reset_session_state();
        self.set_status(DeviceStatus::Disconnected);
        self.emit(DeviceEvent::Disconnected {
            device: self.id,
            unexpected: false,
        });
    }

    fn on_connection_lost(&mut self) {
        tracing::warn!("{}: Listener disconnected unexpectedly", self.name);
        self.listener.on_connection_lost();
        self.reset_session_state();
        self.set_status(DeviceStatus::Disconnected);
        self.emit(DeviceEvent::Disconnected {
            device: self.id,
            unexpected: true,
        });
    }

    /// 发送任意命令
    pub fn send_command(&mut self, command: Command) -> Result<Uuid> {
        self.listener.send(command)
    }

    pub fn send_file(&mut self, destination: &str, content: &[u8]) -> Result<Uuid> {
        self.send_command(Command::SendFile {
            destination: destination.to_string(),
            content: protocol::encode_b64(content),
        })
    }

    pub fn receive_file(&mut self, source: &str) -> Result<Uuid> {
        self.send_command(Command::ReceiveFile {
            source: source.to_string(),
        })
    }

    /// 心跳
    pub fn keep_alive(&mut self) {
        if !self.listener.is_connected() {
            return;
        }
        if let Err(e) = self.send_command(Command::KeepAlive) {
            tracing::debug!("{}: keep alive failed: {}", self.name, e);
        }
    }

    /// 请求集群状态（关联到正在运行的编辑器进程，没有则为 nil）
    pub fn request_cluster_status(&mut self) -> Result<Uuid> {
        let program = self.descriptor().program_name;
        let uuid = self
            .programs
            .running_named(program)
            .first()
            .copied()
            .unwrap_or_else(Uuid::nil);
        self.send_command(Command::GetSyncStatus { uuid, echo: false })
    }

    /// 超时未确认的命令按“未接受”处理
    pub fn expire_pending(&mut self, now: Instant, settings: &mut SettingsContext) {
        for pending in self.listener.expire(now) {
            tracing::warn!(
                "{}: '{}' ({}) was not acknowledged in time",
                self.name,
                pending.verb,
                pending.id
            );
            self.on_command_rejected(pending.id, pending.verb, "timed out", settings);
        }
    }

    // ------------------------------------------------------------------
    // 入站消息
    // ------------------------------------------------------------------

    /// 处理来自读取任务的信号
    pub fn handle_signal(&mut self, signal: ListenerSignal, settings: &mut SettingsContext) {
        if signal.generation != self.listener.generation() {
            tracing::trace!("{}: ignoring signal from superseded connection", self.name);
            return;
        }

        match signal.kind {
            SignalKind::Message(Inbound::Ack(ack)) => {
                let verb = ack.verb.clone();
                let error = ack.error.clone().unwrap_or_default();
                let accepted = ack.accepted;
                let resolved = self.listener.resolve(ack);

                match resolved.pending {
                    Some(pending) if accepted => {
                        if pending.verb == "kill" {
                            self.kills.remove(&pending.id);
                        }
                    }
                    Some(pending) => {
                        self.on_command_rejected(pending.id, pending.verb, &error, settings);
                    }
                    None if !accepted => {
                        tracing::warn!("{}: '{}' was not accepted: {}", self.name, verb, error);
                    }
                    None => {}
                }
            }
            SignalKind::Message(Inbound::Event(event)) => self.on_event(event, settings),
            SignalKind::Disconnected { unexpected } => {
                if !unexpected {
                    return;
                }
                if self.listener.is_connected() {
                    self.on_connection_lost();
                } else if self.status == DeviceStatus::Connecting {
                    // 连接尚未挂上就已断开：作废本次尝试，随后到达的连接结果会被丢弃
                    self.listener.begin_connect();
                    self.on_connect_failed("connection closed before it was attached");
                }
            }
        }
    }

    fn on_command_rejected(
        &mut self,
        id: Uuid,
        verb: &str,
        error: &str,
        settings: &mut SettingsContext,
    ) {
        match verb {
            "start" => self.on_start_failed(id, error, settings),
            "kill" => {
                let program = self.kills.remove(&id);
                self.on_kill_failed(program, error);
            }
            _ => tracing::error!("{}: '{}' was not accepted: {}", self.name, verb, error),
        }
    }

    fn on_event(&mut self, event: AgentEvent, settings: &mut SettingsContext) {
        match event {
            AgentEvent::ProgramStarted { process } => {
                if process.caller == self.name {
                    self.on_program_started(&process);
                }
            }
            AgentEvent::ProgramEnded {
                process,
                returncode,
                stdout_b64,
            } => {
                if process.caller == self.name {
                    let output = protocol::decode_b64_text(&stdout_b64);
                    self.on_program_ended(process.uuid, returncode, &output, settings);
                }
            }
            AgentEvent::ProgramStartFailed { puuid, error } => {
                self.on_start_failed(puuid, &error, settings);
            }
            AgentEvent::ProgramKillFailed { puuid, error } => {
                self.on_kill_failed(Some(puuid), &error);
            }
            AgentEvent::ProgramOutput {
                process,
                partial_stdout_b64,
            } => {
                if process.caller == self.name {
                    self.on_program_output(&process, &partial_stdout_b64);
                }
            }
            AgentEvent::ReceiveFileCompleted { source, content } => {
                self.on_file_received(&source, &content, settings);
            }
            AgentEvent::ReceiveFileFailed { source, error } => {
                self.on_file_receive_failed(&source, &error, settings);
            }
            AgentEvent::State(snapshot) => self.on_state(snapshot, settings),
            AgentEvent::SyncStatus { .. } => {
                tracing::trace!("{}: sync status outside of the monitor", self.name);
            }
        }
    }

    fn on_program_started(&mut self, process: &ProcessInfo) {
        let name = self.programs.on_started(process);
        tracing::info!("{}: {} with id {} was successfully started", self.name, name, process.uuid);
        self.program_running_update(&name);
    }

    fn program_running_update(&mut self, program: &str) {
        if program == self.descriptor().program_name {
            if self.status < DeviceStatus::Open {
                self.set_status(DeviceStatus::Open);
            }
        } else if is_build(program) {
            self.set_status(DeviceStatus::Building);
        } else if is_sync(program) {
            self.set_status(DeviceStatus::Syncing);
        }
    }

    fn on_start_failed(&mut self, id: Uuid, error: &str, settings: &mut SettingsContext) {
        let Some(program) = self.programs.on_ended(id) else {
            tracing::error!("{}: Could not start unknown program {}: {}", self.name, id, error);
            return;
        };
        tracing::error!("{}: Could not start {}: {}", self.name, program.name, error);
        self.emit(DeviceEvent::ProgramFailed {
            device: self.id,
            program: program.name.clone(),
            error: error.to_string(),
        });

        for dropped in self.programs.drop_dependents(id) {
            tracing::warn!("{}: Dropping {} after {} failed to start", self.name, dropped.name, program.name);
        }

        if is_sync(&program.name) {
            self.abort_sync();
        }
        if program.name == self.descriptor().program_name {
            self.set_status(DeviceStatus::Closed);
        }
        self.settle_pipeline(settings);
    }

    fn on_kill_failed(&mut self, program: Option<Uuid>, error: &str) {
        if let Some(id) = program {
            self.programs.on_ended(id);
        }
        tracing::error!(
            "{}: Unable to close program with id {:?}. Error was '{}'",
            self.name,
            program,
            error
        );
        self.set_status(DeviceStatus::Closed);
    }

    fn on_program_ended(
        &mut self,
        id: Uuid,
        returncode: i32,
        output: &str,
        settings: &mut SettingsContext,
    ) {
        let Some(program) = self.programs.on_ended(id) else {
            tracing::error!("{}: on_program_ended with unknown id {}", self.name, id);
            return;
        };
        tracing::info!(
            "{}: Program {} ({}) exited with returncode {}",
            self.name,
            program.name,
            id,
            returncode
        );

        let name = program.name.as_str();
        if name == self.descriptor().program_name {
            if self.programs.running_named(name).is_empty() {
                self.send_target_confirmed = false;
                self.set_status(DeviceStatus::Closed);
            }
        } else if let (true, Some(leg)) = (is_sync(name), SyncLeg::from_program(name)) {
            self.on_sync_leg_ended(leg, id, returncode, output, settings);
        } else if is_build(name) {
            self.on_build_ended(name, id, returncode, output);
        } else if let (true, Some(leg)) = (is_cstat(name), SyncLeg::from_program(name)) {
            self.on_changelist_reported(leg, output);
        } else {
            self.programs.release_dependents(id);
        }

        self.dispatch_ready(settings);
        self.settle_pipeline(settings);
    }

    fn on_sync_leg_ended(
        &mut self,
        leg: SyncLeg,
        id: Uuid,
        returncode: i32,
        output: &str,
        settings: &mut SettingsContext,
    ) {
        if returncode == 0 {
            tracing::info!("{}: {:?} sync successful", self.name, leg);
            match leg {
                SyncLeg::Engine => {
                    if let Some(cl) = self.sync.inflight_engine.take() {
                        self.engine_changelist = Some(cl);
                    }
                }
                SyncLeg::Project => {
                    if let Some(cl) = self.sync.inflight_project.take() {
                        self.project_changelist = Some(cl);
                    }
                }
            }
            self.emit_changelists();
            self.programs.release_dependents(id);
            self.request_changelist(leg, settings);
            return;
        }

        tracing::error!("{}: Sync failed!", self.name);
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            tracing::error!("{}: {}", self.name, line);
        }
        for dropped in self.programs.drop_dependents(id) {
            tracing::warn!("{}: Dropping {} after failed sync", self.name, dropped.name);
        }
        self.abort_sync();
    }

    fn abort_sync(&mut self) {
        self.sync = SyncState::default();
        self.emit(DeviceEvent::SyncFailed { device: self.id });
    }

    fn on_build_ended(&mut self, program: &str, id: Uuid, returncode: i32, output: &str) {
        if returncode == 0 {
            tracing::info!("{}: {} successful!", self.name, program);
        } else {
            tracing::error!("{}: {} failed!", self.name, program);
            for line in commands::build_error_lines(output) {
                tracing::error!("{}: {}", self.name, line);
            }
            self.emit(DeviceEvent::BuildFailed {
                device: self.id,
                program: program.to_string(),
                returncode,
            });
        }
        // 构建链不因退出码中断
        self.programs.release_dependents(id);
    }

    fn on_changelist_reported(&mut self, leg: SyncLeg, output: &str) {
        let Some(changelist) = commands::parse_changelist(output) else {
            tracing::warn!(
                "{}: Could not retrieve {:?} changelist. Are the Source Control Settings correctly configured?",
                self.name,
                leg
            );
            return;
        };

        tracing::info!("{}: {:?} is on revision {}", self.name, leg, changelist);
        match leg {
            SyncLeg::Engine => self.engine_changelist = Some(changelist),
            SyncLeg::Project => self.project_changelist = Some(changelist),
        }
        self.emit_changelists();
    }

    fn emit_changelists(&self) {
        self.emit(DeviceEvent::ChangelistChanged {
            device: self.id,
            engine: self.engine_changelist.clone(),
            project: self.project_changelist.clone(),
        });
    }

    /// 同步 / 构建阶段结束后回到 CLOSED，并执行排队的构建
    fn settle_pipeline(&mut self, settings: &mut SettingsContext) {
        match self.status {
            DeviceStatus::Syncing if !self.programs.any_named(is_sync) => {
                self.set_status(DeviceStatus::Closed);
                if std::mem::take(&mut self.sync.build_after_sync) {
                    tracing::info!("{}: Starting build scheduled after sync", self.name);
                    if let Err(e) = self.build(settings) {
                        tracing::error!("{}: {}", self.name, e);
                    }
                }
            }
            DeviceStatus::Building if !self.programs.any_named(is_build) => {
                self.set_status(DeviceStatus::Closed);
            }
            _ => {}
        }
    }

    /// 派发所有依赖已满足的程序
    fn dispatch_ready(&mut self, settings: &mut SettingsContext) {
        for envelope in self.programs.take_ready() {
            let id = envelope.id;
            let verb = envelope.command.verb();
            if let Err(e) = self.listener.send_envelope(envelope) {
                tracing::error!("{}: failed to send '{}': {}", self.name, verb, e);
                self.on_start_failed(id, &e.to_string(), settings);
            }
        }
    }

    fn on_program_output(&mut self, process: &ProcessInfo, partial_b64: &str) {
        let text = protocol::decode_b64_text(partial_b64);
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();

        if is_build(&process.name) {
            for line in &lines {
                if let Some((step, percent)) = commands::parse_build_progress(line) {
                    self.emit(DeviceEvent::BuildProgress {
                        device: self.id,
                        step,
                        percent,
                    });
                }
            }
        } else if is_sync(&process.name) {
            for line in &lines {
                if let Some(percent) = commands::parse_sync_progress(line) {
                    self.emit(DeviceEvent::SyncProgress {
                        device: self.id,
                        percent,
                    });
                }
            }
        }

        for line in lines {
            tracing::debug!("{} {}: {}", self.name, process.name, line);
        }
    }

    fn on_file_received(&mut self, source: &str, content: &str, settings: &mut SettingsContext) {
        let roles_filename = settings.string(keys::ROLES_FILENAME, Some(&self.name));
        if roles_filename.is_empty() || !source.ends_with(&roles_filename) {
            tracing::debug!("{}: received {}", self.name, source);
            return;
        }

        let tags = commands::parse_roles(&protocol::decode_b64_text(content));
        tracing::info!("{}: All possible roles: {:?}", self.name, tags);
        if let Err(e) = settings.set_possible_values(&self.name, keys::ROLES, tags.clone()) {
            tracing::debug!("{}: {}", self.name, e);
            return;
        }

        let unsupported: Vec<String> = settings
            .list(keys::ROLES, Some(&self.name))
            .into_iter()
            .filter(|r| !tags.contains(r))
            .collect();
        if !unsupported.is_empty() {
            tracing::error!("{}: Found unsupported roles: {:?}", self.name, unsupported);
            tracing::error!(
                "{}: Please change the roles for this device in the settings or in the unreal project settings!",
                self.name
            );
        }
    }

    fn on_file_receive_failed(&mut self, source: &str, error: &str, settings: &SettingsContext) {
        let roles = settings.list(keys::ROLES, Some(&self.name));
        if roles.is_empty() {
            tracing::debug!("{}: could not receive {}: {}", self.name, source, error);
            return;
        }
        tracing::error!(
            "{}: Error receiving role file from listener and device claims to have these roles: {}",
            self.name,
            roles.join(" | ")
        );
        tracing::error!("{}: Error: {}", self.name, error);
    }

    /// 连接后 listener 主动推送的状态快照
    fn on_state(&mut self, snapshot: StateSnapshot, settings: &mut SettingsContext) {
        self.programs.clear_running();

        if snapshot.parsed_version().is_none() {
            tracing::error!("{}: Unable to parse listener version. Disconnecting...", self.name);
            self.disconnect_listener();
            return;
        }
        if !snapshot.is_compatible() {
            tracing::error!(
                "{}: Listener version {} not compatible ({}.{}+ required)",
                self.name,
                snapshot.version,
                protocol::LISTENER_COMPAT_MAJOR,
                protocol::LISTENER_COMPAT_MINOR
            );
            self.disconnect_listener();
            return;
        }

        self.host = HostInfo {
            listener_version: snapshot.version.clone(),
            os_version_label: snapshot.os_version_label.clone(),
            os_version_label_sub: snapshot.os_version_label_sub.clone(),
            os_version_number: snapshot.os_version_number.clone(),
            total_physical_memory: snapshot.total_physical_memory,
        };

        let caller = self.name.clone();
        for process in snapshot.running_processes.iter().filter(|p| p.caller == caller) {
            tracing::warn!("{}: already running {} {}", self.name, process.name, process.uuid);
            self.programs.adopt(RemoteProgram::from(process));
            self.program_running_update(&process.name);
        }

        self.request_roles_file(settings);
        self.request_changelist(SyncLeg::Project, settings);
        if settings.boolean(keys::BUILD_ENGINE, None) {
            self.request_changelist(SyncLeg::Engine, settings);
        }
    }

    fn request_roles_file(&mut self, settings: &SettingsContext) {
        if !self.descriptor().capabilities.sync_build {
            return;
        }
        let Some(path) = commands::roles_file_path(settings, &self.name) else {
            return;
        };
        if let Err(e) = self.receive_file(&path) {
            tracing::warn!("{}: could not request roles file: {}", self.name, e);
        }
    }

    /// 后台查询版本号（不改变设备状态）
    pub fn request_changelist(&mut self, leg: SyncLeg, settings: &mut SettingsContext) {
        if let Some(command) = commands::cstat_command(settings, &self.name, leg) {
            self.programs.queue(leg.cstat_name(), &self.name, command, None);
            self.dispatch_ready(settings);
        }
    }

    // ------------------------------------------------------------------
    // 操作
    // ------------------------------------------------------------------

    fn require_listener(&self, operation: &str) -> Result<()> {
        if !self.descriptor().capabilities.listener {
            return Err(Error::Protocol(format!(
                "{}: {} does not support {}",
                self.name,
                self.kind.type_name(),
                operation
            )));
        }
        if !self.listener.is_connected() {
            return Err(Error::NotConnected(self.name.clone()));
        }
        Ok(())
    }

    /// 启动编辑器
    pub fn launch(&mut self, map: &str, settings: &mut SettingsContext) -> Result<()> {
        self.require_listener("launch")?;

        let program = self.descriptor().program_name;
        if self.programs.any_named(|n| n == program) {
            tracing::info!("{}: {} is already running", self.name, program);
            return Ok(());
        }
        if !matches!(self.status, DeviceStatus::Closed | DeviceStatus::Open) {
            tracing::warn!("{}: cannot launch while {:?}", self.name, self.status);
            return Ok(());
        }

        if let Err(e) = commands::check_launch_settings(settings, &self.name) {
            tracing::error!("{}: Not launching due to invalid settings", self.name);
            return Err(e);
        }

        let command =
            commands::launch_command(settings, &self.name, self.kind, self.address, program, map);
        self.programs.queue(program, &self.name, command, None);
        self.dispatch_ready(settings);
        Ok(())
    }

    /// 结束所有编辑器进程
    pub fn close(&mut self) -> Result<()> {
        self.require_listener("close")?;

        if matches!(self.status, DeviceStatus::Syncing | DeviceStatus::Building) {
            tracing::warn!("{}: cannot close while {:?}", self.name, self.status);
            return Ok(());
        }

        let program = self.descriptor().program_name;
        let running = self.programs.running_named(program);
        for id in &running {
            let kill = self.listener.send(Command::Kill { uuid: *id })?;
            self.kills.insert(kill, *id);
        }

        if running.is_empty() {
            self.set_status(DeviceStatus::Closed);
        } else {
            self.set_status(DeviceStatus::Closing);
        }
        Ok(())
    }

    /// 同步引擎 / 项目到指定版本；项目段排在引擎段完成之后
    pub fn sync(
        &mut self,
        engine_changelist: Option<&str>,
        project_changelist: Option<&str>,
        settings: &mut SettingsContext,
    ) -> Result<()> {
        let engine = engine_changelist.map(str::trim).filter(|c| !c.is_empty());
        let project = project_changelist.map(str::trim).filter(|c| !c.is_empty());
        if engine.is_none() && project.is_none() {
            tracing::warn!(
                "{}: Neither project nor engine changelist is selected. There is nothing to sync!",
                self.name
            );
            return Ok(());
        }

        if !self.descriptor().capabilities.sync_build {
            return Err(Error::Protocol(format!("{}: sync is not supported", self.name)));
        }
        self.require_listener("sync")?;

        if self.programs.any_named(is_sync) {
            tracing::info!("{}: Already syncing", self.name);
            return Ok(());
        }
        if self.status != DeviceStatus::Closed {
            tracing::warn!("{}: cannot sync while {:?}", self.name, self.status);
            return Ok(());
        }

        tracing::info!(
            "{}: Queuing sync (revisions: engine={:?}, project={:?})",
            self.name,
            engine,
            project
        );

        let mut dependency = None;
        if let Some(cl) = engine {
            let command = commands::sync_command(settings, &self.name, SyncLeg::Engine, cl);
            dependency = Some(self.programs.queue(SyncLeg::Engine.program_name(), &self.name, command, None));
            self.sync.inflight_engine = Some(cl.to_string());
        }
        if let Some(cl) = project {
            let command = commands::sync_command(settings, &self.name, SyncLeg::Project, cl);
            self.programs
                .queue(SyncLeg::Project.program_name(), &self.name, command, dependency);
            self.sync.inflight_project = Some(cl.to_string());
        }

        self.set_status(DeviceStatus::Syncing);
        self.dispatch_ready(settings);
        Ok(())
    }

    /// 构建；同步中则推迟到同步完成后
    pub fn build(&mut self, settings: &mut SettingsContext) -> Result<()> {
        if !self.descriptor().capabilities.sync_build {
            return Err(Error::Protocol(format!("{}: build is not supported", self.name)));
        }
        self.require_listener("build")?;

        if self.programs.any_named(is_build) {
            tracing::info!("{}: Already building", self.name);
            return Ok(());
        }
        if self.status == DeviceStatus::Syncing {
            tracing::info!("{}: Queuing build after sync", self.name);
            self.sync.build_after_sync = true;
            return Ok(());
        }
        if self.status != DeviceStatus::Closed {
            tracing::warn!("{}: cannot build while {:?}", self.name, self.status);
            return Ok(());
        }

        let shader = self.programs.queue(
            BuildTarget::ShaderCompileWorker.program_name(),
            &self.name,
            commands::build_command(settings, &self.name, BuildTarget::ShaderCompileWorker),
            None,
        );
        self.programs.queue(
            BuildTarget::Project.program_name(),
            &self.name,
            commands::build_command(settings, &self.name, BuildTarget::Project),
            Some(shader),
        );

        self.set_status(DeviceStatus::Building);
        self.dispatch_ready(settings);
        Ok(())
    }

    // ------------------------------------------------------------------
    // 会话广播确认
    // ------------------------------------------------------------------

    /// 设备需要（重复）发送 OSC 回连目标
    pub fn needs_send_target(&self, settings: &SettingsContext) -> bool {
        self.descriptor().capabilities.osc
            && self.status == DeviceStatus::Open
            && !self.send_target_confirmed
            && self.is_recording_device(settings)
    }

    pub fn on_send_target_confirmed(&mut self) {
        self.send_target_confirmed = true;
        if self.status == DeviceStatus::Open {
            self.set_status(DeviceStatus::Ready);
        }
    }

    /// 引擎启动完成
    pub fn on_launch_confirmed(&mut self) {
        if !self.status.is_disconnected() && self.status < DeviceStatus::Ready {
            self.set_status(DeviceStatus::Ready);
        }
    }

    pub fn on_record_start_confirmed(&mut self, timecode: &str) {
        if self.status != DeviceStatus::Ready {
            tracing::warn!("{}: record start confirmed while {:?}", self.name, self.status);
            return;
        }
        self.record_timecode_in = Some(timecode.to_string());
        self.set_status(DeviceStatus::Recording);
    }

    /// 录制停止确认，返回本设备的产物清单
    pub fn on_record_stop_confirmed(&mut self, timecode: &str, paths: Vec<String>) -> Option<DeviceRecording> {
        if self.status != DeviceStatus::Recording {
            tracing::warn!("{}: record stop confirmed while {:?}", self.name, self.status);
            return None;
        }
        self.set_status(DeviceStatus::Ready);
        Some(DeviceRecording {
            device_name: self.name.clone(),
            device_type: self.kind.type_name().to_string(),
            timecode_in: self.record_timecode_in.take(),
            timecode_out: timecode.to_string(),
            paths,
        })
    }

    pub fn set_battery(&mut self, level: f32) {
        self.battery = Some(level);
        self.emit(DeviceEvent::Battery {
            device: self.id,
            level,
        });
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(DeviceStatus::Disconnected < DeviceStatus::Closed);
        assert!(DeviceStatus::Closed < DeviceStatus::Syncing);
        assert!(DeviceStatus::Building < DeviceStatus::Open);
        assert!(DeviceStatus::Open < DeviceStatus::Ready);
        assert!(DeviceStatus::Ready < DeviceStatus::Recording);
        assert!(DeviceStatus::Connecting.is_disconnected());
        assert!(!DeviceStatus::Closed.is_disconnected());
    }
}
