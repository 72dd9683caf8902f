//! 会话协调：slate / take / record 的广播与回声抑制
//!
//! 所有操作返回待发送的 [`Outbound`] 列表，由控制上下文交给 OSC 端点发送。
//! 由广播触发的变更会排除来源地址，避免把消息回传给发起者。

use std::net::{IpAddr, SocketAddr};

use crate::device::{Device, DeviceId, DeviceManager};
use crate::osc::{address, OscMessage};
use crate::recording::{DeviceRecording, Recording, RecordingManager};
use crate::settings::SettingsContext;

/// 待发送的广播消息
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub device: DeviceId,
    pub target: SocketAddr,
    pub message: OscMessage,
}

/// 会话协调器
#[derive(Debug)]
pub struct SessionCoordinator {
    sequence: String,
    slate: String,
    take: u32,
    description: String,
    map: String,
    multiuser_session: String,
    recording: bool,
    recordings: RecordingManager,
    osc_client_port: u16,
}

impl SessionCoordinator {
    pub fn new(sequence: &str, slate: &str, take: u32, recordings: RecordingManager, osc_client_port: u16) -> Self {
        Self {
            sequence: sequence.to_string(),
            slate: slate.to_string(),
            take: take.max(1),
            description: String::new(),
            map: String::new(),
            multiuser_session: String::new(),
            recording: false,
            recordings,
            osc_client_port,
        }
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn slate(&self) -> &str {
        &self.slate
    }

    pub fn take(&self) -> u32 {
        self.take
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn recordings(&self) -> &RecordingManager {
        &self.recordings
    }

    pub fn recordings_mut(&mut self) -> &mut RecordingManager {
        &mut self.recordings
    }

    pub fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    pub fn set_map(&mut self, map: &str) {
        self.map = map.to_string();
    }

    pub fn set_multiuser_session(&mut self, session: &str) {
        self.multiuser_session = session.to_string();
    }

    fn target(&self, device: &Device, settings: &SettingsContext) -> SocketAddr {
        SocketAddr::new(device.address(), device.osc_port(settings, self.osc_client_port))
    }

    fn accepts_broadcast(device: &Device, settings: &SettingsContext) -> bool {
        device.descriptor().capabilities.osc
            && !device.status().is_disconnected()
            && device.is_recording_device(settings)
    }

    /// 发给所有已连接的录制设备，排除来源地址
    fn fan_out(
        &self,
        devices: &DeviceManager,
        settings: &SettingsContext,
        message: OscMessage,
        exclude: Option<IpAddr>,
    ) -> Vec<Outbound> {
        devices
            .iter()
            .filter(|d| exclude != Some(d.address()))
            .filter(|d| Self::accepts_broadcast(d, settings))
            .map(|d| Outbound {
                device: d.id(),
                target: self.target(d, settings),
                message: message.clone(),
            })
            .collect()
    }

    /// 修改 sequence；take 回到 1
    pub fn set_sequence(&mut self, value: &str, devices: &DeviceManager, settings: &SettingsContext) -> Vec<Outbound> {
        let value = value.trim();
        if value.is_empty() || value == self.sequence {
            return Vec::new();
        }
        tracing::info!("🎬 Sequence: {}", value);
        self.sequence = value.to_string();
        self.set_take(1, None, devices, settings)
    }

    /// 修改 slate
    ///
    /// `origin` 为 None 表示操作员修改：take 重置为 1。来自设备广播的修改保留 take。
    pub fn set_slate(
        &mut self,
        value: &str,
        origin: Option<IpAddr>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        if value.is_empty() || value == self.slate {
            return Vec::new();
        }
        tracing::info!("🎬 Slate: {}", value);
        self.slate = value.to_string();

        let mut out = self.fan_out(
            devices,
            settings,
            OscMessage::new(address::SLATE).arg(value),
            origin,
        );
        if origin.is_none() {
            out.extend(self.set_take(1, None, devices, settings));
        }
        out
    }

    /// 修改 take；已用过的组合会自动递增
    pub fn set_take(
        &mut self,
        value: u32,
        origin: Option<IpAddr>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        let value = value.max(1);
        let mut requested = value;
        while !self
            .recordings
            .slate_take_available(&self.sequence, &self.slate, requested)
        {
            requested += 1;
        }

        if requested == value && value == self.take {
            return Vec::new();
        }

        let mut exclude = origin;
        if requested != value {
            tracing::warn!(
                "Slate: \"{}\" Take: \"{}\" have already been used. Auto incremented up to take: \"{}\"",
                self.slate,
                value,
                requested
            );
            // 来源也需要知道修正后的 take
            exclude = None;
        }

        self.take = requested;
        self.fan_out(
            devices,
            settings,
            OscMessage::new(address::TAKE).arg(requested as i32),
            exclude,
        )
    }

    /// 开始录制：创建录制记录并广播
    pub fn record_start(
        &mut self,
        origin: Option<IpAddr>,
        changelist: Option<String>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        if self.recording {
            tracing::warn!("Record start ignored: already recording \"{}\" {}", self.slate, self.take);
            return Vec::new();
        }
        tracing::info!("🔴 Record Start: \"{}\" {}", self.slate, self.take);
        self.recording = true;

        let mut recording = Recording::new(&self.sequence, &self.slate, self.take, &self.description);
        recording.map = self.map.clone();
        recording.multiuser_session = self.multiuser_session.clone();
        recording.changelist = changelist;
        self.recordings.add(recording);

        let message = OscMessage::new(address::RECORD_START)
            .arg(self.slate.as_str())
            .arg(self.take as i32)
            .arg(self.description.as_str());
        self.fan_out(devices, settings, message, origin)
    }

    /// 设备发起的录制：先采用它的 slate / take / description
    pub fn on_remote_record_start(
        &mut self,
        origin: IpAddr,
        slate: Option<&str>,
        take: Option<u32>,
        description: &str,
        changelist: Option<String>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        match slate {
            Some(slate) if !slate.is_empty() && slate != "None" => {
                out.extend(self.set_slate(slate, Some(origin), devices, settings));
            }
            _ => tracing::error!("Slate is None, using {}", self.slate),
        }
        if let Some(take) = take {
            out.extend(self.set_take(take, Some(origin), devices, settings));
        }
        self.description = description.to_string();

        out.extend(self.record_start(Some(origin), changelist, devices, settings));
        out
    }

    /// 停止录制；设备的产物随各自的停止确认陆续到达
    pub fn record_stop(
        &mut self,
        origin: Option<IpAddr>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        if !self.recording {
            tracing::warn!("Record stop ignored: not recording");
            return Vec::new();
        }
        tracing::info!("⏹️ Record Stop: \"{}\" {}", self.slate, self.take);
        self.recording = false;
        self.save_recordings();

        self.fan_out(
            devices,
            settings,
            OscMessage::new(address::RECORD_STOP).arg(1),
            origin,
        )
    }

    /// 取消等同于停止
    pub fn record_cancel(
        &mut self,
        origin: Option<IpAddr>,
        devices: &DeviceManager,
        settings: &SettingsContext,
    ) -> Vec<Outbound> {
        self.record_stop(origin, devices, settings)
    }

    /// 把设备产物挂到当前录制上
    pub fn on_record_stop_confirmed(&mut self, clip: DeviceRecording) {
        tracing::info!("{}: recorded {} file(s)", clip.device_name, clip.paths.len());
        self.recordings.attach(clip);
        self.save_recordings();
    }

    fn save_recordings(&self) {
        if let Err(e) = self.recordings.save() {
            tracing::error!("❌ 保存录制记录失败: {}", e);
        }
    }

    /// 设备进入 READY 时推送当前 take 与 slate
    pub fn push_current(&self, device: &Device, settings: &SettingsContext) -> Vec<Outbound> {
        if !Self::accepts_broadcast(device, settings) {
            return Vec::new();
        }
        let target = self.target(device, settings);
        vec![
            Outbound {
                device: device.id(),
                target,
                message: OscMessage::new(address::TAKE).arg(self.take as i32),
            },
            Outbound {
                device: device.id(),
                target,
                message: OscMessage::new(address::SLATE).arg(self.slate.as_str()),
            },
        ]
    }

    /// 请设备把控制台加为 OSC 发送目标
    pub fn add_send_target(
        &self,
        device: &Device,
        settings: &SettingsContext,
        console_address: &str,
        server_port: u16,
    ) -> Outbound {
        Outbound {
            device: device.id(),
            target: self.target(device, settings),
            message: OscMessage::new(address::OSC_ADD_SEND_TARGET)
                .arg(console_address)
                .arg(i32::from(server_port)),
        }
    }
}
