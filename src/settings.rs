//! 设置与覆盖解析
//!
//! 三层解析：项目基础值 → 插件默认值（同类设备共享）→ 单设备覆盖值。
//! 设备身份作为显式参数传入，不依赖任何全局状态。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::error::{Error, Result};
use crate::events::{Broadcaster, SettingEvent};

/// 常用设置键
pub mod keys {
    // 项目设置
    pub const UPROJECT_PATH: &str = "uproject";
    pub const ENGINE_DIR: &str = "engine_dir";
    pub const BUILD_ENGINE: &str = "build_engine";
    pub const SOURCE_CONTROL_ENABLED: &str = "p4_enabled";
    pub const SOURCE_CONTROL_WORKSPACE: &str = "source_control_workspace";
    pub const P4_PROJECT_PATH: &str = "p4_project_path";
    pub const P4_ENGINE_PATH: &str = "p4_engine_path";
    pub const MAPS_PATH: &str = "maps_path";

    // Unreal 插件设置
    pub const EXTRA_CMDLINE_ARGS: &str = "command_line_arguments";
    pub const EXEC_CMDS: &str = "exec_cmds";
    pub const DP_CVARS: &str = "dp_cvars";
    pub const STAGE_SESSION_ID: &str = "stage_session_id";
    pub const MAX_GPU_COUNT: &str = "max_gpu_count";
    pub const PRIORITY_MODIFIER: &str = "priority_modifier";
    pub const AUTO_DECLINE_PACKAGE_RECOVERY: &str = "auto_decline_package_recovery";
    pub const ROLES_FILENAME: &str = "roles_filename";
    pub const UDP_MULTICAST_ENDPOINT: &str = "udpmessaging_multicast_endpoint";
    pub const UDP_UNICAST_ENDPOINT: &str = "udpmessaging_unicast_endpoint";
    pub const UDP_EXTRA_STATIC_ENDPOINTS: &str = "udpmessaging_extra_static_endpoints";

    // nDisplay 插件设置
    pub const NDISPLAY_CONFIG_FILE: &str = "ndisplay_cfg_file";

    // 设备自有设置
    pub const ROLES: &str = "roles";
    pub const IS_RECORDING_DEVICE: &str = "is_recording_device";
    pub const OSC_PORT: &str = "osc_port";
}

/// 设置值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            SettingValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{}", b),
            SettingValue::Int(i) => write!(f, "{}", i),
            SettingValue::Str(s) => f.write_str(s),
            SettingValue::List(l) => f.write_str(&l.join("|")),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Str(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Str(v)
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(v: Vec<String>) -> Self {
        SettingValue::List(v)
    }
}

/// 单个设置：基础值 + 按设备名索引的覆盖值
#[derive(Debug, Clone)]
pub struct Setting {
    key: String,
    nice_name: String,
    value: SettingValue,
    original: SettingValue,
    overrides: HashMap<String, SettingValue>,
    possible_values: Vec<String>,
}

impl Setting {
    pub fn new(key: &str, nice_name: &str, value: impl Into<SettingValue>) -> Self {
        let value = value.into();
        Self {
            key: key.to_string(),
            nice_name: nice_name.to_string(),
            original: value.clone(),
            value,
            overrides: HashMap::new(),
            possible_values: Vec::new(),
        }
    }

    /// 限定可选值
    pub fn with_possible_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.possible_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn nice_name(&self) -> &str {
        &self.nice_name
    }

    pub fn possible_values(&self) -> &[String] {
        &self.possible_values
    }

    pub fn set_possible_values(&mut self, values: Vec<String>) {
        self.possible_values = values;
    }

    /// 注册时的初始值
    pub fn original(&self) -> &SettingValue {
        &self.original
    }

    /// 解析值：有覆盖取覆盖，否则取基础值
    pub fn get(&self, device: Option<&str>) -> &SettingValue {
        device
            .and_then(|d| self.overrides.get(d))
            .unwrap_or(&self.value)
    }

    pub fn is_overridden(&self, device: &str) -> bool {
        self.overrides.contains_key(device)
    }

    /// 当前所有覆盖（设备名 → 值）
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.overrides.iter().map(|(d, v)| (d.as_str(), v))
    }

    /// 校验标量值是否在可选范围内（列表值由使用方自行报告不支持的项）
    fn validate(&self, value: &SettingValue) -> Result<()> {
        if self.possible_values.is_empty() {
            return Ok(());
        }
        let scalar = match value {
            SettingValue::List(_) => return Ok(()),
            other => other.to_string(),
        };
        if self.possible_values.iter().any(|p| *p == scalar) {
            Ok(())
        } else {
            Err(Error::InvalidValue {
                setting: self.key.clone(),
                value: scalar,
            })
        }
    }

    /// 修改基础值；值相同时不产生通知，已有覆盖不受影响
    pub fn update(&mut self, value: impl Into<SettingValue>) -> Result<Option<SettingEvent>> {
        let value = value.into();
        self.validate(&value)?;

        if self.value == value {
            return Ok(None);
        }

        let old = std::mem::replace(&mut self.value, value.clone());
        Ok(Some(SettingEvent::Changed {
            key: self.key.clone(),
            old,
            new: value,
        }))
    }

    /// 设置设备覆盖值
    ///
    /// 与该设备当前解析值相同时只记录覆盖，不产生通知。
    pub fn override_value(
        &mut self,
        device: &str,
        value: impl Into<SettingValue>,
    ) -> Result<Option<SettingEvent>> {
        let value = value.into();
        self.validate(&value)?;

        let old = self.get(Some(device)).clone();
        self.overrides.insert(device.to_string(), value.clone());

        if old == value {
            return Ok(None);
        }

        Ok(Some(SettingEvent::Overridden {
            key: self.key.clone(),
            device: device.to_string(),
            old,
            new: value,
        }))
    }

    /// 移除设备覆盖值，之后该设备回落到基础值
    pub fn remove_override(&mut self, device: &str) -> Option<SettingEvent> {
        let old = self.overrides.remove(device)?;
        if old == self.value {
            return None;
        }
        Some(SettingEvent::Overridden {
            key: self.key.clone(),
            device: device.to_string(),
            old,
            new: self.value.clone(),
        })
    }

    /// 设备改名后迁移覆盖值
    pub fn rename_device(&mut self, old: &str, new: &str) {
        if let Some(value) = self.overrides.remove(old) {
            self.overrides.insert(new.to_string(), value);
        }
    }
}

/// 设备注册信息
#[derive(Debug, Clone)]
struct DeviceEntry {
    kind: DeviceKind,
    /// 设备自有设置
    owned: BTreeMap<String, Setting>,
    /// 允许单设备覆盖的共享设置
    overridable: HashSet<String>,
}

/// 设置解析上下文
///
/// 只在控制上下文中被修改，不需要加锁。
pub struct SettingsContext {
    project: BTreeMap<String, Setting>,
    plugins: HashMap<DeviceKind, BTreeMap<String, Setting>>,
    devices: HashMap<String, DeviceEntry>,
    events: Arc<Broadcaster<SettingEvent>>,
}

impl SettingsContext {
    pub fn new(events: Arc<Broadcaster<SettingEvent>>) -> Self {
        Self {
            project: BTreeMap::new(),
            plugins: HashMap::new(),
            devices: HashMap::new(),
            events,
        }
    }

    /// 带有默认项目设置的上下文
    pub fn with_project_defaults(events: Arc<Broadcaster<SettingEvent>>) -> Self {
        let mut ctx = Self::new(events);
        for setting in default_project_settings() {
            ctx.register_project(setting);
        }
        ctx
    }

    pub fn events(&self) -> &Arc<Broadcaster<SettingEvent>> {
        &self.events
    }

    fn emit(&self, event: Option<SettingEvent>) {
        if let Some(event) = event {
            tracing::debug!("⚙️ {:?}", event);
            self.events.broadcast(event);
        }
    }

    /// 注册项目级设置（已存在则保留当前值）
    pub fn register_project(&mut self, setting: Setting) {
        self.project
            .entry(setting.key().to_string())
            .or_insert(setting);
    }

    /// 注册插件级设置（同类设备共享）
    pub fn register_plugin(&mut self, kind: DeviceKind, settings: Vec<Setting>) {
        let plugin = self.plugins.entry(kind).or_default();
        for setting in settings {
            plugin.entry(setting.key().to_string()).or_insert(setting);
        }
    }

    pub fn has_plugin(&self, kind: DeviceKind) -> bool {
        self.plugins.contains_key(&kind)
    }

    /// 注册设备自有设置及其允许覆盖的共享设置
    pub fn register_device(
        &mut self,
        name: &str,
        kind: DeviceKind,
        owned: Vec<Setting>,
        overridable: &[&str],
    ) -> Result<()> {
        if self.devices.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        self.devices.insert(
            name.to_string(),
            DeviceEntry {
                kind,
                owned: owned
                    .into_iter()
                    .map(|s| (s.key().to_string(), s))
                    .collect(),
                overridable: overridable.iter().map(|k| k.to_string()).collect(),
            },
        );
        Ok(())
    }

    /// 移除设备：清除其自有设置以及它在所有共享设置上的覆盖
    pub fn remove_device(&mut self, name: &str) {
        self.devices.remove(name);

        let mut events = Vec::new();
        for setting in self.project.values_mut() {
            events.extend(setting.remove_override(name));
        }
        for plugin in self.plugins.values_mut() {
            for setting in plugin.values_mut() {
                events.extend(setting.remove_override(name));
            }
        }
        for event in events {
            self.emit(Some(event));
        }
    }

    /// 设备改名：自有设置与覆盖随名字迁移
    pub fn rename_device(&mut self, old: &str, new: &str) -> Result<()> {
        if self.devices.contains_key(new) {
            return Err(Error::DuplicateName(new.to_string()));
        }
        let entry = self
            .devices
            .remove(old)
            .ok_or_else(|| Error::UnknownDevice(old.to_string()))?;
        self.devices.insert(new.to_string(), entry);

        for setting in self.project.values_mut() {
            setting.rename_device(old, new);
        }
        for plugin in self.plugins.values_mut() {
            for setting in plugin.values_mut() {
                setting.rename_device(old, new);
            }
        }
        Ok(())
    }

    fn shared(&self, key: &str, device: Option<&str>) -> Option<&Setting> {
        let kind = device.and_then(|d| self.devices.get(d)).map(|e| e.kind);
        kind.and_then(|k| self.plugins.get(&k))
            .and_then(|p| p.get(key))
            .or_else(|| self.project.get(key))
            .or_else(|| {
                // 未指定设备时按 key 在所有插件中查找
                if device.is_none() {
                    self.plugins.values().find_map(|p| p.get(key))
                } else {
                    None
                }
            })
    }

    fn shared_mut(&mut self, key: &str, device: Option<&str>) -> Option<&mut Setting> {
        let kind = device.and_then(|d| self.devices.get(d)).map(|e| e.kind);
        let in_plugin = kind
            .and_then(|k| self.plugins.get(&k))
            .is_some_and(|p| p.contains_key(key));

        if in_plugin {
            return kind
                .and_then(|k| self.plugins.get_mut(&k))
                .and_then(|p| p.get_mut(key));
        }
        if self.project.contains_key(key) {
            return self.project.get_mut(key);
        }
        if device.is_none() {
            return self.plugins.values_mut().find_map(|p| p.get_mut(key));
        }
        None
    }

    /// 分层解析
    pub fn resolve(&self, key: &str, device: Option<&str>) -> Option<&SettingValue> {
        if let Some(owned) = device
            .and_then(|d| self.devices.get(d))
            .and_then(|e| e.owned.get(key))
        {
            return Some(owned.get(None));
        }
        self.shared(key, device).map(|s| s.get(device))
    }

    pub fn string(&self, key: &str, device: Option<&str>) -> String {
        self.resolve(key, device)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    pub fn boolean(&self, key: &str, device: Option<&str>) -> bool {
        self.resolve(key, device)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false)
    }

    pub fn integer(&self, key: &str, device: Option<&str>) -> Option<i64> {
        self.resolve(key, device).and_then(SettingValue::as_int)
    }

    pub fn list(&self, key: &str, device: Option<&str>) -> Vec<String> {
        self.resolve(key, device)
            .and_then(SettingValue::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    /// 只读访问共享设置
    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.shared(key, None)
    }

    /// 只读访问设备自有设置
    pub fn device_setting(&self, device: &str, key: &str) -> Option<&Setting> {
        self.devices.get(device).and_then(|e| e.owned.get(key))
    }

    /// 修改共享设置的基础值
    pub fn update(&mut self, key: &str, value: impl Into<SettingValue>) -> Result<()> {
        let setting = self
            .shared_mut(key, None)
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let event = setting.update(value)?;
        self.emit(event);
        Ok(())
    }

    /// 修改指定设备类型的插件设置
    pub fn update_plugin(
        &mut self,
        kind: DeviceKind,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> Result<()> {
        let setting = self
            .plugins
            .get_mut(&kind)
            .and_then(|p| p.get_mut(key))
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let event = setting.update(value)?;
        self.emit(event);
        Ok(())
    }

    /// 修改设备自有设置
    pub fn update_device(
        &mut self,
        device: &str,
        key: &str,
        value: impl Into<SettingValue>,
    ) -> Result<()> {
        let setting = self
            .devices
            .get_mut(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?
            .owned
            .get_mut(key)
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let event = setting.update(value)?.map(|event| match event {
            SettingEvent::Changed { key, old, new } => SettingEvent::Overridden {
                key,
                device: device.to_string(),
                old,
                new,
            },
            other => other,
        });
        self.emit(event);
        Ok(())
    }

    /// 设置设备覆盖值；自有设置直接修改，共享设置需在允许覆盖列表中
    pub fn override_value(
        &mut self,
        key: &str,
        device: &str,
        value: impl Into<SettingValue>,
    ) -> Result<()> {
        let entry = self
            .devices
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;

        if entry.owned.contains_key(key) {
            return self.update_device(device, key, value);
        }
        if !entry.overridable.contains(key) {
            return Err(Error::Config(format!("{}: 不允许覆盖设置 {}", device, key)));
        }

        let setting = self
            .shared_mut(key, Some(device))
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let event = setting.override_value(device, value)?;
        self.emit(event);
        Ok(())
    }

    pub fn remove_override(&mut self, key: &str, device: &str) -> Result<()> {
        let setting = self
            .shared_mut(key, Some(device))
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        let event = setting.remove_override(device);
        self.emit(event);
        Ok(())
    }

    pub fn is_overridden(&self, key: &str, device: &str) -> bool {
        self.shared(key, Some(device))
            .is_some_and(|s| s.is_overridden(device))
    }

    /// 更新设备自有设置的可选值（如从项目读取的角色列表）
    pub fn set_possible_values(&mut self, device: &str, key: &str, values: Vec<String>) -> Result<()> {
        let setting = self
            .devices
            .get_mut(device)
            .and_then(|e| e.owned.get_mut(key))
            .ok_or_else(|| Error::UnknownSetting(key.to_string()))?;
        setting.set_possible_values(values);
        Ok(())
    }

    /// 项目设置快照（用于保存配置）
    pub fn project_snapshot(&self) -> BTreeMap<String, SettingValue> {
        self.project
            .iter()
            .map(|(k, s)| (k.clone(), s.get(None).clone()))
            .collect()
    }

    /// 插件设置快照
    pub fn plugin_snapshot(&self, kind: DeviceKind) -> BTreeMap<String, SettingValue> {
        self.plugins
            .get(&kind)
            .map(|p| p.iter().map(|(k, s)| (k.clone(), s.get(None).clone())).collect())
            .unwrap_or_default()
    }

    /// 设备设置快照：自有设置 + 它在共享设置上的覆盖
    pub fn device_snapshot(&self, device: &str) -> BTreeMap<String, SettingValue> {
        let mut snapshot = BTreeMap::new();
        let Some(entry) = self.devices.get(device) else {
            return snapshot;
        };

        for (key, setting) in &entry.owned {
            snapshot.insert(key.clone(), setting.get(None).clone());
        }
        let plugin = self.plugins.get(&entry.kind);
        for setting in self.project.values().chain(plugin.into_iter().flat_map(|p| p.values())) {
            if setting.is_overridden(device) {
                snapshot.insert(setting.key().to_string(), setting.get(Some(device)).clone());
            }
        }
        snapshot
    }
}

/// 项目级默认设置
pub fn default_project_settings() -> Vec<Setting> {
    vec![
        Setting::new(keys::UPROJECT_PATH, "uProject Path", ""),
        Setting::new(keys::ENGINE_DIR, "Engine Directory", ""),
        Setting::new(keys::BUILD_ENGINE, "Build Engine", false),
        Setting::new(keys::SOURCE_CONTROL_ENABLED, "Perforce Enabled", false),
        Setting::new(keys::SOURCE_CONTROL_WORKSPACE, "Workspace Name", ""),
        Setting::new(keys::P4_PROJECT_PATH, "Perforce Project Path", ""),
        Setting::new(keys::P4_ENGINE_PATH, "Perforce Engine Path", ""),
        Setting::new(keys::MAPS_PATH, "Map Path", ""),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SettingEventKind;

    fn context() -> SettingsContext {
        let mut ctx = SettingsContext::with_project_defaults(Broadcaster::new());
        ctx.register_plugin(
            DeviceKind::Unreal,
            vec![
                Setting::new(keys::MAX_GPU_COUNT, "Number of GPUs", "1")
                    .with_possible_values(["1", "2", "3", "4"]),
                Setting::new(keys::EXEC_CMDS, "ExecCmds", ""),
            ],
        );
        ctx.register_device(
            "Node_0",
            DeviceKind::Unreal,
            vec![Setting::new(keys::ROLES, "Roles", Vec::<String>::new())],
            &[keys::UPROJECT_PATH, keys::MAX_GPU_COUNT],
        )
        .unwrap();
        ctx.register_device("Node_1", DeviceKind::Unreal, vec![], &[keys::UPROJECT_PATH])
            .unwrap();
        ctx
    }

    #[test]
    fn test_override_then_remove() {
        let mut setting = Setting::new("uproject", "uProject", "C:/A/A.uproject");

        let event = setting.override_value("Node_0", "D:/B/B.uproject").unwrap();
        assert!(matches!(event, Some(SettingEvent::Overridden { .. })));
        assert_eq!(setting.get(Some("Node_0")), &SettingValue::from("D:/B/B.uproject"));
        assert!(setting.is_overridden("Node_0"));
        assert_eq!(setting.get(Some("Node_1")), setting.get(None));

        setting.remove_override("Node_0");
        assert!(!setting.is_overridden("Node_0"));
        assert_eq!(setting.get(Some("Node_0")), setting.get(None));
    }

    #[test]
    fn test_identical_override_is_silent_but_pinned() {
        let mut setting = Setting::new("exec_cmds", "ExecCmds", "stat fps");

        let event = setting.override_value("Node_0", "stat fps").unwrap();
        assert!(event.is_none());
        assert!(setting.is_overridden("Node_0"));

        // 基础值变化后，已固定的覆盖保持不变
        setting.update("stat unit").unwrap();
        assert_eq!(setting.get(Some("Node_0")), &SettingValue::from("stat fps"));
    }

    #[test]
    fn test_update_is_noop_for_same_value() {
        let mut setting = Setting::new("take", "Take", 1i64);
        assert!(setting.update(1i64).unwrap().is_none());

        match setting.update(2i64).unwrap() {
            Some(SettingEvent::Changed { old, new, .. }) => {
                assert_eq!(old, SettingValue::Int(1));
                assert_eq!(new, SettingValue::Int(2));
            }
            other => panic!("Expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_possible_values_are_enforced() {
        let mut setting =
            Setting::new("max_gpu_count", "GPUs", "1").with_possible_values(["1", "2"]);
        assert!(matches!(setting.update("8"), Err(Error::InvalidValue { .. })));
        assert!(setting.override_value("Node_0", "2").is_ok());
    }

    #[test]
    fn test_layered_resolution() {
        let mut ctx = context();
        ctx.update(keys::UPROJECT_PATH, "C:/Proj/Proj.uproject").unwrap();
        ctx.override_value(keys::UPROJECT_PATH, "Node_0", "D:/Proj/Proj.uproject")
            .unwrap();
        ctx.override_value(keys::MAX_GPU_COUNT, "Node_0", "2").unwrap();

        assert_eq!(ctx.string(keys::UPROJECT_PATH, Some("Node_0")), "D:/Proj/Proj.uproject");
        assert_eq!(ctx.string(keys::UPROJECT_PATH, Some("Node_1")), "C:/Proj/Proj.uproject");
        assert_eq!(ctx.string(keys::MAX_GPU_COUNT, Some("Node_0")), "2");
        assert_eq!(ctx.string(keys::MAX_GPU_COUNT, Some("Node_1")), "1");
        assert!(ctx.is_overridden(keys::UPROJECT_PATH, "Node_0"));
    }

    #[test]
    fn test_override_requires_permission() {
        let mut ctx = context();
        let result = ctx.override_value(keys::MAX_GPU_COUNT, "Node_1", "2");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_remove_device_purges_overrides() {
        let mut ctx = context();
        ctx.override_value(keys::UPROJECT_PATH, "Node_0", "D:/X.uproject")
            .unwrap();
        ctx.override_value(keys::MAX_GPU_COUNT, "Node_0", "4").unwrap();

        ctx.remove_device("Node_0");

        assert!(!ctx.setting(keys::UPROJECT_PATH).unwrap().is_overridden("Node_0"));
        assert!(!ctx.setting(keys::MAX_GPU_COUNT).unwrap().is_overridden("Node_0"));
        assert!(ctx.device_setting("Node_0", keys::ROLES).is_none());
    }

    #[test]
    fn test_rename_moves_overrides() {
        let mut ctx = context();
        ctx.override_value(keys::UPROJECT_PATH, "Node_0", "D:/X.uproject")
            .unwrap();

        ctx.rename_device("Node_0", "Wall_Left").unwrap();

        assert_eq!(ctx.string(keys::UPROJECT_PATH, Some("Wall_Left")), "D:/X.uproject");
        assert!(!ctx.is_overridden(keys::UPROJECT_PATH, "Node_0"));
        assert!(matches!(
            ctx.rename_device("Wall_Left", "Node_1"),
            Err(Error::DuplicateName(_))
        ));
    }

    #[test]
    fn test_notifications_are_broadcast() {
        let mut ctx = context();
        let (_, mut rx) = ctx
            .events()
            .subscribe(&[SettingEventKind::Changed, SettingEventKind::Overridden]);

        ctx.update(keys::ENGINE_DIR, "C:/UE").unwrap();
        ctx.override_value(keys::UPROJECT_PATH, "Node_0", "D:/X.uproject")
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(SettingEvent::Changed { .. })));
        match rx.try_recv() {
            Ok(SettingEvent::Overridden { device, old, new, .. }) => {
                assert_eq!(device, "Node_0");
                assert_eq!(old, SettingValue::from(""));
                assert_eq!(new, SettingValue::from("D:/X.uproject"));
            }
            other => panic!("Expected Overridden, got {:?}", other),
        }
    }

    #[test]
    fn test_device_snapshot() {
        let mut ctx = context();
        ctx.override_value(keys::MAX_GPU_COUNT, "Node_0", "2").unwrap();
        ctx.update_device("Node_0", keys::ROLES, vec!["Render".to_string()])
            .unwrap();

        let snapshot = ctx.device_snapshot("Node_0");
        assert_eq!(snapshot.get(keys::MAX_GPU_COUNT), Some(&SettingValue::from("2")));
        assert_eq!(
            snapshot.get(keys::ROLES),
            Some(&SettingValue::List(vec!["Render".to_string()]))
        );
        assert!(!snapshot.contains_key(keys::UPROJECT_PATH));
    }
}
