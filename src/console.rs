//! 控制台：唯一的控制上下文
//!
//! 一个任务独占设备表、设置、会话与监控状态，从单一输入通道消费
//! listener 信号、连接结果、OSC 消息与操作员命令。它从不等待远程调用：
//! 连接在独立任务中建立，结果经同一通道送回。

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::{ConsoleConfig, DeviceConfig, SessionDefaults};
use crate::device::{Device, DeviceId, DeviceKind, DeviceManager, DeviceStatus};
use crate::error::{Error, Result};
use crate::events::{Broadcaster, DeviceEvent, SettingEvent};
use crate::listener::{ListenerLink, ListenerSignal, SignalKind};
use crate::monitor::ClusterMonitor;
use crate::osc::{address, OscArg, OscEndpoint, OscInbound};
use crate::protocol::{AgentEvent, Inbound};
use crate::recording::RecordingManager;
use crate::session::{Outbound, SessionCoordinator};
use crate::settings::{SettingValue, SettingsContext};

/// OSC 回连握手的重试间隔
const SEND_TARGET_INTERVAL: Duration = Duration::from_secs(1);

/// 操作员命令；`device` 为 None 时作用于全部设备
#[derive(Debug, Clone)]
pub enum OperatorCommand {
    AddDevice {
        name: String,
        kind: DeviceKind,
        address: IpAddr,
        settings: BTreeMap<String, SettingValue>,
    },
    RemoveDevice { device: String },
    RenameDevice { device: String, new_name: String },
    SetAddress { device: String, address: IpAddr },
    Connect { device: Option<String> },
    Disconnect { device: Option<String> },
    Launch { device: Option<String>, map: String },
    Close { device: Option<String> },
    Sync {
        device: Option<String>,
        engine: Option<String>,
        project: Option<String>,
    },
    Build { device: Option<String> },
    SetSetting {
        key: String,
        value: SettingValue,
        device: Option<String>,
    },
    RemoveOverride { key: String, device: String },
    SetSequence(String),
    SetSlate(String),
    SetTake(u32),
    SetDescription(String),
    SetMap(String),
    RecordStart,
    RecordStop,
    Save,
}

/// 控制上下文的输入
#[derive(Debug)]
pub enum ConsoleInput {
    Listener(ListenerSignal),
    Connected {
        device: DeviceId,
        generation: u64,
        result: Result<ListenerLink>,
    },
    Osc(OscInbound),
    Operator(OperatorCommand),
    Shutdown,
}

impl From<ListenerSignal> for ConsoleInput {
    fn from(signal: ListenerSignal) -> Self {
        ConsoleInput::Listener(signal)
    }
}

impl From<OscInbound> for ConsoleInput {
    fn from(inbound: OscInbound) -> Self {
        ConsoleInput::Osc(inbound)
    }
}

/// 向控制台发送命令的句柄
#[derive(Debug, Clone)]
pub struct ConsoleHandle {
    tx: mpsc::UnboundedSender<ConsoleInput>,
}

impl ConsoleHandle {
    pub fn send(&self, command: OperatorCommand) -> Result<()> {
        self.tx
            .send(ConsoleInput::Operator(command))
            .map_err(|_| Error::Connection("console is not running".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ConsoleInput::Shutdown);
    }
}

/// 控制台
pub struct Console {
    config: ConsoleConfig,
    config_path: Option<PathBuf>,
    devices: DeviceManager,
    settings: SettingsContext,
    session: SessionCoordinator,
    monitor: ClusterMonitor,
    osc: Option<OscEndpoint>,
    last_status: HashMap<DeviceId, DeviceStatus>,
    tx: mpsc::UnboundedSender<ConsoleInput>,
    rx: Option<mpsc::UnboundedReceiver<ConsoleInput>>,
}

impl Console {
    /// 按配置构建全部状态
    pub fn new(config: ConsoleConfig, config_path: Option<PathBuf>) -> Result<(Self, ConsoleHandle)> {
        let mut settings = SettingsContext::with_project_defaults(Broadcaster::<SettingEvent>::new());
        for (key, value) in &config.project {
            if let Err(e) = settings.update(key, value.clone()) {
                tracing::warn!("ignoring project setting '{}': {}", key, e);
            }
        }
        for (kind, values) in &config.plugins {
            settings.register_plugin(*kind, kind.descriptor().plugin_settings());
            for (key, value) in values {
                if let Err(e) = settings.update_plugin(*kind, key, value.clone()) {
                    tracing::warn!("ignoring {} setting '{}': {}", kind.type_name(), key, e);
                }
            }
        }

        let mut devices = DeviceManager::new(
            config.listener_port,
            config.listener_buffer_size,
            config.command_timeout(),
            Broadcaster::<DeviceEvent>::new(),
        );
        for device in &config.devices {
            if let Err(e) = devices.add(&device.name, device.kind, device.address, &device.settings, &mut settings) {
                tracing::error!("❌ 无法添加设备 {}: {}", device.name, e);
            }
        }

        let recordings = match RecordingManager::load(&config.recordings_path()) {
            Ok(recordings) => recordings,
            Err(e) => {
                tracing::warn!("无法加载录制记录: {}", e);
                RecordingManager::new()
            }
        };
        let session = SessionCoordinator::new(
            &config.session.sequence,
            &config.session.slate,
            config.session.take,
            recordings,
            config.osc_client_port,
        );
        let monitor = ClusterMonitor::new(config.poll_interval());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConsoleHandle { tx: tx.clone() };

        let console = Self {
            config,
            config_path,
            devices,
            settings,
            session,
            monitor,
            osc: None,
            last_status: HashMap::new(),
            tx,
            rx: Some(rx),
        };
        Ok((console, handle))
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn settings(&self) -> &SettingsContext {
        &self.settings
    }

    pub fn session(&self) -> &SessionCoordinator {
        &self.session
    }

    pub fn monitor(&self) -> &ClusterMonitor {
        &self.monitor
    }

    /// 设备事件（状态、同步、构建等）
    pub fn device_events(&self) -> &Arc<Broadcaster<DeviceEvent>> {
        self.devices.events()
    }

    /// 运行直到收到 Shutdown 或 Ctrl-C；退出前保存配置
    pub async fn run(mut self) -> Result<()> {
        let Some(mut rx) = self.rx.take() else {
            return Err(Error::Config("console is already running".to_string()));
        };

        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.osc_server_port);
        match OscEndpoint::bind(server, self.tx.clone()).await {
            Ok(endpoint) => self.osc = Some(endpoint),
            Err(e) => tracing::warn!("⚠️ OSC server unavailable on {}: {}", server, e),
        }

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut handshake = interval(SEND_TARGET_INTERVAL);
        handshake.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = self.config.keep_alive_interval().map(interval);

        tracing::info!("🚀 Console running ({} devices)", self.devices.len());

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(ConsoleInput::Shutdown) | None => break,
                    Some(input) => self.handle_input(input),
                },
                now = poll.tick() => self.poll(now),
                _ = handshake.tick() => self.send_targets(),
                _ = async {
                    match keep_alive.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => self.keep_alive(),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
            self.observe_transitions();
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        for device in self.devices.iter_mut() {
            if device.listener().is_connected() {
                device.disconnect_listener();
            }
        }
        if let Err(e) = self.save_config() {
            tracing::error!("❌ 保存配置失败: {}", e);
        }
        tracing::info!("👋 Console stopped");
    }

    /// 处理一条输入
    pub fn handle_input(&mut self, input: ConsoleInput) {
        match input {
            ConsoleInput::Listener(signal) => self.on_listener_signal(signal),
            ConsoleInput::Connected {
                device,
                generation,
                result,
            } => {
                if let Some(d) = self.devices.get_mut(device) {
                    d.on_connected(generation, result);
                }
            }
            ConsoleInput::Osc(inbound) => self.on_osc(inbound),
            ConsoleInput::Operator(command) => {
                if let Err(e) = self.on_operator(command) {
                    tracing::error!("❌ {}", e);
                }
            }
            ConsoleInput::Shutdown => {}
        }
    }

    fn on_listener_signal(&mut self, signal: ListenerSignal) {
        let Some(device) = self.devices.get_mut(signal.device) else {
            tracing::trace!("signal for removed device {}", signal.device);
            return;
        };

        // 集群状态交给监控，其余交给设备
        if let SignalKind::Message(Inbound::Event(AgentEvent::SyncStatus { status })) = &signal.kind {
            if signal.generation == device.listener().generation() {
                self.monitor.on_status(signal.device, status, Instant::now());
            }
            return;
        }
        device.handle_signal(signal, &mut self.settings);
    }

    fn connect(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let Some(request) = device.connect_listener() else {
            return;
        };

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let device = request.device;
            let generation = request.generation;
            let result = request.open(tx.clone()).await;
            let _ = tx.send(ConsoleInput::Connected {
                device,
                generation,
                result,
            });
        });
    }

    fn targets(&self, device: Option<&str>) -> Result<Vec<DeviceId>> {
        match device {
            None => Ok(self.devices.ids()),
            Some(name) => self
                .devices
                .find_by_name(name)
                .map(|id| vec![id])
                .ok_or_else(|| Error::UnknownDevice(name.to_string())),
        }
    }

    fn require(&self, name: &str) -> Result<DeviceId> {
        self.devices
            .find_by_name(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))
    }

    /// 对每个目标设备执行操作；单个设备失败不影响其余设备
    fn for_each(
        &mut self,
        device: Option<&str>,
        mut op: impl FnMut(&mut Device, &mut SettingsContext) -> Result<()>,
    ) -> Result<()> {
        for id in self.targets(device)? {
            if let Some(d) = self.devices.get_mut(id) {
                if let Err(e) = op(d, &mut self.settings) {
                    tracing::error!("{}: {}", d.name(), e);
                }
            }
        }
        Ok(())
    }

    fn on_operator(&mut self, command: OperatorCommand) -> Result<()> {
        tracing::debug!("🎛️ {:?}", command);
        let out = match command {
            OperatorCommand::AddDevice {
                name,
                kind,
                address,
                settings,
            } => {
                self.devices.add(&name, kind, address, &settings, &mut self.settings)?;
                Vec::new()
            }
            OperatorCommand::RemoveDevice { device } => {
                let id = self.require(&device)?;
                self.monitor.on_disconnect(id);
                self.devices.remove(id, &mut self.settings)?;
                Vec::new()
            }
            OperatorCommand::RenameDevice { device, new_name } => {
                let id = self.require(&device)?;
                self.devices.rename(id, &new_name, &mut self.settings)?;
                Vec::new()
            }
            OperatorCommand::SetAddress { device, address } => {
                let id = self.require(&device)?;
                self.devices.set_address(id, address)?;
                Vec::new()
            }
            OperatorCommand::Connect { device } => {
                for id in self.targets(device.as_deref())? {
                    self.connect(id);
                }
                Vec::new()
            }
            OperatorCommand::Disconnect { device } => {
                for id in self.targets(device.as_deref())? {
                    self.monitor.on_disconnect(id);
                    if let Some(d) = self.devices.get_mut(id) {
                        if !d.status().is_disconnected() {
                            d.disconnect_listener();
                        }
                    }
                }
                Vec::new()
            }
            OperatorCommand::Launch { device, map } => {
                self.for_each(device.as_deref(), |d, s| {
                    if d.descriptor().capabilities.listener {
                        d.launch(&map, s)
                    } else {
                        Ok(())
                    }
                })?;
                Vec::new()
            }
            OperatorCommand::Close { device } => {
                self.for_each(device.as_deref(), |d, _| {
                    if d.descriptor().capabilities.listener && !d.status().is_disconnected() {
                        d.close()
                    } else {
                        Ok(())
                    }
                })?;
                Vec::new()
            }
            OperatorCommand::Sync {
                device,
                engine,
                project,
            } => {
                self.for_each(device.as_deref(), |d, s| {
                    if d.descriptor().capabilities.sync_build {
                        d.sync(engine.as_deref(), project.as_deref(), s)
                    } else {
                        Ok(())
                    }
                })?;
                Vec::new()
            }
            OperatorCommand::Build { device } => {
                self.for_each(device.as_deref(), |d, s| {
                    if d.descriptor().capabilities.sync_build {
                        d.build(s)
                    } else {
                        Ok(())
                    }
                })?;
                Vec::new()
            }
            OperatorCommand::SetSetting { key, value, device } => {
                match device {
                    Some(device) => self.settings.override_value(&key, &device, value)?,
                    None => self.settings.update(&key, value)?,
                }
                Vec::new()
            }
            OperatorCommand::RemoveOverride { key, device } => {
                self.settings.remove_override(&key, &device)?;
                Vec::new()
            }
            OperatorCommand::SetSequence(value) => {
                self.session.set_sequence(&value, &self.devices, &self.settings)
            }
            OperatorCommand::SetSlate(value) => {
                self.session.set_slate(&value, None, &self.devices, &self.settings)
            }
            OperatorCommand::SetTake(value) => {
                self.session.set_take(value, None, &self.devices, &self.settings)
            }
            OperatorCommand::SetDescription(value) => {
                self.session.set_description(&value);
                Vec::new()
            }
            OperatorCommand::SetMap(value) => {
                self.session.set_map(&value);
                Vec::new()
            }
            OperatorCommand::RecordStart => {
                let changelist = self.current_changelist();
                self.session
                    .record_start(None, changelist, &self.devices, &self.settings)
            }
            OperatorCommand::RecordStop => {
                self.session.record_stop(None, &self.devices, &self.settings)
            }
            OperatorCommand::Save => {
                self.save_config()?;
                Vec::new()
            }
        };
        self.dispatch(out);
        Ok(())
    }

    /// 第一个已知项目版本号的设备
    fn current_changelist(&self) -> Option<String> {
        self.devices
            .iter()
            .filter(|d| !d.status().is_disconnected())
            .find_map(|d| d.project_changelist().map(str::to_string))
    }

    fn on_osc(&mut self, inbound: OscInbound) {
        let ip = inbound.from.ip();
        let message = inbound.message;
        let Some(id) = self.devices.find_by_address(ip) else {
            tracing::warn!("{} is not registered with a device", inbound.from);
            return;
        };
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };

        // 握手类消息不要求设备已连接
        match message.address.as_str() {
            address::BATTERY => {
                if let Some(level) = message.args.first().and_then(OscArg::as_float) {
                    device.set_battery(level);
                }
                return;
            }
            address::OSC_ADD_SEND_TARGET_CONFIRM => {
                device.on_send_target_confirmed();
                return;
            }
            _ => {}
        }

        if device.status().is_disconnected() {
            tracing::warn!(
                "{}: is sending OSC commands but is not connected. Ignoring \"{}\"",
                device.name(),
                message.address
            );
            return;
        }
        tracing::debug!(
            "OSC Server: Received \"{} {:?}\" from {} ({})",
            message.address,
            message.args,
            device.name(),
            ip
        );

        let text = |i: usize| message.args.get(i).map(OscArg::to_text);
        let out = match message.address.as_str() {
            address::TAKE => match message.args.first().and_then(OscArg::as_int) {
                Some(take) => self.session.set_take(
                    u32::try_from(take).unwrap_or(1),
                    Some(ip),
                    &self.devices,
                    &self.settings,
                ),
                None => Vec::new(),
            },
            address::SLATE => match text(0) {
                Some(slate) => self.session.set_slate(&slate, Some(ip), &self.devices, &self.settings),
                None => Vec::new(),
            },
            address::SLATE_DESCRIPTION => {
                self.session.set_description(&text(0).unwrap_or_default());
                Vec::new()
            }
            address::RECORD_START => {
                let take = message
                    .args
                    .get(1)
                    .and_then(OscArg::as_int)
                    .and_then(|t| u32::try_from(t).ok());
                let changelist = self.current_changelist();
                self.session.on_remote_record_start(
                    ip,
                    text(0).as_deref(),
                    take,
                    &text(2).unwrap_or_default(),
                    changelist,
                    &self.devices,
                    &self.settings,
                )
            }
            address::RECORD_STOP => self.session.record_stop(Some(ip), &self.devices, &self.settings),
            address::RECORD_CANCEL => {
                self.session.record_cancel(Some(ip), &self.devices, &self.settings)
            }
            address::RECORD_START_CONFIRM => {
                device.on_record_start_confirmed(&text(0).unwrap_or_default());
                Vec::new()
            }
            address::RECORD_STOP_CONFIRM => {
                let paths = message.args.iter().skip(1).map(OscArg::to_text).collect();
                if let Some(clip) = device.on_record_stop_confirmed(&text(0).unwrap_or_default(), paths) {
                    self.session.on_record_stop_confirmed(clip);
                }
                Vec::new()
            }
            address::UE4_LAUNCH_CONFIRM => {
                device.on_launch_confirmed();
                Vec::new()
            }
            address::ARSESSION_START_CONFIRM => {
                self.connect(id);
                Vec::new()
            }
            address::RECORD_CANCEL_CONFIRM | address::ARSESSION_STOP_CONFIRM | address::DATA => {
                Vec::new()
            }
            other => {
                tracing::debug!("unhandled OSC address {}", other);
                Vec::new()
            }
        };
        self.dispatch(out);
    }

    fn dispatch(&self, out: Vec<Outbound>) {
        let Some(osc) = &self.osc else {
            if !out.is_empty() {
                tracing::trace!("OSC server not running, dropping {} messages", out.len());
            }
            return;
        };
        for outbound in out {
            if let Err(e) = osc.send_to(outbound.target, &outbound.message) {
                tracing::warn!("OSC send to {} failed: {}", outbound.target, e);
            }
        }
    }

    /// 状态变化的后续动作：进入 READY 时推送 slate/take，断开时重置监控，
    /// 新连接的集群设备开始跟踪
    fn observe_transitions(&mut self) {
        let now = Instant::now();
        let mut ready = Vec::new();

        for device in self.devices.iter() {
            let id = device.id();
            let status = device.status();
            let previous = self
                .last_status
                .insert(id, status)
                .unwrap_or(DeviceStatus::Disconnected);

            if previous <= DeviceStatus::Open && status >= DeviceStatus::Ready {
                ready.push(id);
            }
            if !previous.is_disconnected() && status.is_disconnected() {
                self.monitor.on_disconnect(id);
            }
            if device.descriptor().capabilities.cluster_status
                && device.listener().is_connected()
                && !self.monitor.is_tracked(id)
            {
                self.monitor.track(id, now);
            }
        }
        let devices = &self.devices;
        self.last_status.retain(|id, _| devices.get(*id).is_some());

        let mut out = Vec::new();
        for id in ready {
            if let Some(device) = self.devices.get(id) {
                out.extend(self.session.push_current(device, &self.settings));
            }
        }
        self.dispatch(out);
    }

    fn poll(&mut self, now: Instant) {
        for id in self.monitor.tick(now) {
            if let Some(device) = self.devices.get_mut(id) {
                if let Err(e) = device.request_cluster_status() {
                    tracing::debug!("{}: cluster status request failed: {}", device.name(), e);
                }
            }
        }
        for device in self.devices.iter_mut() {
            device.expire_pending(now, &mut self.settings);
        }
    }

    fn send_targets(&mut self) {
        let console_address = self.config.address.to_string();
        let out: Vec<Outbound> = self
            .devices
            .iter()
            .filter(|d| d.needs_send_target(&self.settings))
            .map(|d| {
                self.session
                    .add_send_target(d, &self.settings, &console_address, self.config.osc_server_port)
            })
            .collect();
        self.dispatch(out);
    }

    fn keep_alive(&mut self) {
        for device in self.devices.iter_mut() {
            device.keep_alive();
        }
    }

    /// 把当前设置与会话写回配置
    pub fn snapshot_config(&self) -> ConsoleConfig {
        let mut config = self.config.clone();
        config.project = self.settings.project_snapshot();
        config.plugins = DeviceKind::ALL
            .into_iter()
            .filter(|k| self.settings.has_plugin(*k))
            .map(|k| (k, self.settings.plugin_snapshot(k)))
            .collect();
        config.devices = self
            .devices
            .iter()
            .map(|d| DeviceConfig {
                name: d.name().to_string(),
                kind: d.kind(),
                address: d.address(),
                settings: self.settings.device_snapshot(d.name()),
            })
            .collect();
        config.session = SessionDefaults {
            sequence: self.session.sequence().to_string(),
            slate: self.session.slate().to_string(),
            take: self.session.take(),
        };
        config
    }

    fn save_config(&mut self) -> Result<()> {
        self.config = self.snapshot_config();
        match &self.config_path {
            Some(path) => {
                self.config.save(path)?;
                tracing::info!("💾 配置已保存: {:?}", path);
            }
            None => tracing::debug!("no config path, skipping save"),
        }
        Ok(())
    }
}
