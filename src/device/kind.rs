//! 设备类型描述表
//!
//! 类型标签 → 描述（能力、插件默认设置、允许覆盖的共享设置、图标）。

use serde::{Deserialize, Serialize};

use crate::settings::{keys, Setting};

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Unreal,
    #[serde(rename = "nDisplay")]
    NDisplay,
    LiveLinkFace,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Unreal, DeviceKind::NDisplay, DeviceKind::LiveLinkFace];

    pub fn descriptor(self) -> &'static DeviceDescriptor {
        match self {
            DeviceKind::Unreal => &UNREAL,
            DeviceKind::NDisplay => &NDISPLAY,
            DeviceKind::LiveLinkFace => &LIVE_LINK_FACE,
        }
    }

    pub fn type_name(self) -> &'static str {
        self.descriptor().type_name
    }
}

/// 设备能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// 通过 listener 驱动远程进程
    pub listener: bool,
    /// 支持源码同步与构建
    pub sync_build: bool,
    /// 参与 OSC 会话广播
    pub osc: bool,
    /// 上报集群状态
    pub cluster_status: bool,
}

/// 设备类型描述
#[derive(Debug)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub type_name: &'static str,
    pub capabilities: Capabilities,
    /// 启动的远程程序名
    pub program_name: &'static str,
    /// 允许单设备覆盖的共享设置
    pub overridable: &'static [&'static str],
    pub icons: &'static [&'static str],
    plugin_settings: fn() -> Vec<Setting>,
    device_settings: fn() -> Vec<Setting>,
}

impl DeviceDescriptor {
    /// 插件级设置（同类设备共享）
    pub fn plugin_settings(&self) -> Vec<Setting> {
        (self.plugin_settings)()
    }

    /// 每个设备实例独有的设置
    pub fn device_settings(&self) -> Vec<Setting> {
        (self.device_settings)()
    }
}

const UNREAL_OVERRIDABLE: &[&str] = &[
    keys::UPROJECT_PATH,
    keys::ENGINE_DIR,
    keys::SOURCE_CONTROL_WORKSPACE,
    keys::EXTRA_CMDLINE_ARGS,
    keys::EXEC_CMDS,
    keys::DP_CVARS,
    keys::MAX_GPU_COUNT,
    keys::PRIORITY_MODIFIER,
    keys::AUTO_DECLINE_PACKAGE_RECOVERY,
    keys::ROLES_FILENAME,
    keys::UDP_UNICAST_ENDPOINT,
    keys::UDP_EXTRA_STATIC_ENDPOINTS,
];

static UNREAL: DeviceDescriptor = DeviceDescriptor {
    kind: DeviceKind::Unreal,
    type_name: "Unreal",
    capabilities: Capabilities {
        listener: true,
        sync_build: true,
        osc: true,
        cluster_status: false,
    },
    program_name: "unreal",
    overridable: UNREAL_OVERRIDABLE,
    icons: &["unreal/enabled", "unreal/disabled", "unreal/hovered"],
    plugin_settings: unreal_plugin_settings,
    device_settings: unreal_device_settings,
};

static NDISPLAY: DeviceDescriptor = DeviceDescriptor {
    kind: DeviceKind::NDisplay,
    type_name: "nDisplay",
    capabilities: Capabilities {
        listener: true,
        sync_build: true,
        osc: true,
        cluster_status: true,
    },
    program_name: "unreal",
    overridable: UNREAL_OVERRIDABLE,
    icons: &["ndisplay/enabled", "ndisplay/disabled", "ndisplay/hovered"],
    plugin_settings: ndisplay_plugin_settings,
    device_settings: ndisplay_device_settings,
};

static LIVE_LINK_FACE: DeviceDescriptor = DeviceDescriptor {
    kind: DeviceKind::LiveLinkFace,
    type_name: "LiveLinkFace",
    capabilities: Capabilities {
        listener: false,
        sync_build: false,
        osc: true,
        cluster_status: false,
    },
    program_name: "",
    overridable: &[],
    icons: &["livelinkface/enabled", "livelinkface/disabled"],
    plugin_settings: Vec::new,
    device_settings: live_link_face_device_settings,
};

fn unreal_plugin_settings() -> Vec<Setting> {
    vec![
        Setting::new(keys::EXTRA_CMDLINE_ARGS, "Command Line Arguments", ""),
        Setting::new(keys::EXEC_CMDS, "ExecCmds", ""),
        Setting::new(keys::DP_CVARS, "Device Profile CVars", ""),
        Setting::new(keys::STAGE_SESSION_ID, "Stage Session ID", 0i64),
        Setting::new(keys::MAX_GPU_COUNT, "Number of GPUs", "1")
            .with_possible_values(["1", "2", "3", "4"]),
        Setting::new(keys::PRIORITY_MODIFIER, "Process Priority", "Normal")
            .with_possible_values(["Idle", "BelowNormal", "Normal", "AboveNormal", "High"]),
        Setting::new(keys::AUTO_DECLINE_PACKAGE_RECOVERY, "Skip Package Recovery", false),
        Setting::new(keys::ROLES_FILENAME, "Roles Filename", "VPRoles.ini"),
        Setting::new(keys::UDP_MULTICAST_ENDPOINT, "Multicast Endpoint", "230.0.0.1:6666"),
        Setting::new(keys::UDP_UNICAST_ENDPOINT, "Unicast Endpoint", ":0"),
        Setting::new(keys::UDP_EXTRA_STATIC_ENDPOINTS, "Extra Static Endpoints", ""),
    ]
}

fn ndisplay_plugin_settings() -> Vec<Setting> {
    let mut settings = unreal_plugin_settings();
    settings.push(Setting::new(keys::NDISPLAY_CONFIG_FILE, "nDisplay Config File", ""));
    settings
}

fn unreal_device_settings() -> Vec<Setting> {
    vec![
        Setting::new(keys::ROLES, "Roles", Vec::<String>::new()),
        Setting::new(keys::IS_RECORDING_DEVICE, "Recording Device", true),
        Setting::new(keys::OSC_PORT, "OSC Port", 8000i64),
    ]
}

fn ndisplay_device_settings() -> Vec<Setting> {
    vec![
        Setting::new(keys::ROLES, "Roles", Vec::<String>::new()),
        Setting::new(keys::IS_RECORDING_DEVICE, "Recording Device", false),
        Setting::new(keys::OSC_PORT, "OSC Port", 8000i64),
    ]
}

fn live_link_face_device_settings() -> Vec<Setting> {
    vec![
        Setting::new(keys::IS_RECORDING_DEVICE, "Recording Device", true),
        Setting::new(keys::OSC_PORT, "OSC Port", 8000i64),
    ]
}
