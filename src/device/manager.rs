//! 设备注册表

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::{Broadcaster, DeviceEvent};
use crate::listener::ListenerClient;
use crate::settings::{SettingValue, SettingsContext};

use super::{Device, DeviceId, DeviceKind, DeviceStatus};

/// 设备注册表：名字唯一，id 单调递增
pub struct DeviceManager {
    devices: BTreeMap<DeviceId, Device>,
    next_id: DeviceId,
    listener_port: u16,
    buffer_size: usize,
    command_timeout: Duration,
    events: Arc<Broadcaster<DeviceEvent>>,
}

impl DeviceManager {
    pub fn new(
        listener_port: u16,
        buffer_size: usize,
        command_timeout: Duration,
        events: Arc<Broadcaster<DeviceEvent>>,
    ) -> Self {
        Self {
            devices: BTreeMap::new(),
            next_id: 1,
            listener_port,
            buffer_size,
            command_timeout,
            events,
        }
    }

    pub fn events(&self) -> &Arc<Broadcaster<DeviceEvent>> {
        &self.events
    }

    /// 添加设备；首次出现的类型会注册其插件设置
    pub fn add(
        &mut self,
        name: &str,
        kind: DeviceKind,
        address: IpAddr,
        values: &BTreeMap<String, SettingValue>,
        settings: &mut SettingsContext,
    ) -> Result<DeviceId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("device name must not be empty".to_string()));
        }
        if self.find_by_name(name).is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let descriptor = kind.descriptor();
        if !settings.has_plugin(kind) {
            settings.register_plugin(kind, descriptor.plugin_settings());
        }
        settings.register_device(name, kind, descriptor.device_settings(), descriptor.overridable)?;

        // 配置中保存的值：设备自有设置直接更新，共享设置作为覆盖
        for (key, value) in values {
            if let Err(e) = settings.override_value(key, name, value.clone()) {
                tracing::warn!("{}: ignoring stored setting '{}': {}", name, key, e);
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        let listener = ListenerClient::new(address, self.listener_port, self.buffer_size, self.command_timeout);
        let device = Device::new(id, name, kind, address, listener, self.events.clone());
        self.devices.insert(id, device);

        tracing::info!("➕ Added {} device {} ({})", kind.type_name(), name, address);
        self.events.broadcast(DeviceEvent::Added {
            device: id,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// 改名；设置随之迁移
    pub fn rename(&mut self, id: DeviceId, new_name: &str, settings: &mut SettingsContext) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::Config("device name must not be empty".to_string()));
        }
        if self.find_by_name(new_name).is_some_and(|other| other != id) {
            return Err(Error::DuplicateName(new_name.to_string()));
        }

        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        let old = device.name().to_string();
        if old == new_name {
            return Ok(());
        }

        settings.rename_device(&old, new_name)?;
        device.rename(new_name);

        tracing::info!("✏️ Renamed {} -> {}", old, new_name);
        self.events.broadcast(DeviceEvent::Renamed {
            device: id,
            old,
            new: new_name.to_string(),
        });
        Ok(())
    }

    /// 修改地址；已连接的设备需重连后生效
    pub fn set_address(&mut self, id: DeviceId, address: IpAddr) -> Result<()> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        device.set_address(address);
        Ok(())
    }

    /// 移除设备：断开、清理设置、广播
    pub fn remove(&mut self, id: DeviceId, settings: &mut SettingsContext) -> Result<Device> {
        let mut device = self
            .devices
            .remove(&id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;

        device.mark_deleted();
        settings.remove_device(device.name());

        tracing::info!("➖ Removed device {}", device.name());
        self.events.broadcast(DeviceEvent::Removed {
            device: id,
            name: device.name().to_string(),
        });
        Ok(device)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .values()
            .find(|d| d.name() == name)
            .map(|d| d.id())
    }

    /// 按来源地址查找（OSC 消息只有 IP 可用）
    pub fn find_by_address(&self, address: IpAddr) -> Option<DeviceId> {
        self.devices
            .values()
            .find(|d| d.address() == address)
            .map(|d| d.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// 处于给定状态区间内的设备
    pub fn with_status(&self, pred: impl Fn(DeviceStatus) -> bool) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| pred(d.status()))
            .map(|d| d.id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::keys;
    use std::net::Ipv4Addr;

    fn setup() -> (DeviceManager, SettingsContext) {
        let manager = DeviceManager::new(2980, 1024, Duration::from_secs(10), Broadcaster::new());
        let settings = SettingsContext::with_project_defaults(Broadcaster::new());
        (manager, settings)
    }

    fn local(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_names_are_unique() {
        let (mut manager, mut settings) = setup();
        manager
            .add("Node_0", DeviceKind::Unreal, local(1), &BTreeMap::new(), &mut settings)
            .unwrap();
        let err = manager
            .add("Node_0", DeviceKind::NDisplay, local(2), &BTreeMap::new(), &mut settings)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_stored_values_are_applied() {
        let (mut manager, mut settings) = setup();
        let mut values = BTreeMap::new();
        values.insert(keys::IS_RECORDING_DEVICE.to_string(), SettingValue::Bool(false));
        values.insert(keys::MAX_GPU_COUNT.to_string(), SettingValue::from("2"));

        manager
            .add("Node_0", DeviceKind::Unreal, local(1), &values, &mut settings)
            .unwrap();

        assert!(!settings.boolean(keys::IS_RECORDING_DEVICE, Some("Node_0")));
        assert_eq!(settings.string(keys::MAX_GPU_COUNT, Some("Node_0")), "2");
        assert_eq!(settings.string(keys::MAX_GPU_COUNT, None), "1");
    }

    #[test]
    fn test_rename_and_remove() {
        let (mut manager, mut settings) = setup();
        let id = manager
            .add("Node_0", DeviceKind::Unreal, local(1), &BTreeMap::new(), &mut settings)
            .unwrap();
        manager
            .add("Node_1", DeviceKind::Unreal, local(2), &BTreeMap::new(), &mut settings)
            .unwrap();

        assert!(matches!(
            manager.rename(id, "Node_1", &mut settings),
            Err(Error::DuplicateName(_))
        ));
        manager.rename(id, "Stage", &mut settings).unwrap();
        assert_eq!(manager.find_by_name("Stage"), Some(id));
        assert!(settings.device_setting("Stage", keys::ROLES).is_some());

        let removed = manager.remove(id, &mut settings).unwrap();
        assert_eq!(removed.status(), DeviceStatus::Delete);
        assert!(manager.get(id).is_none());
        assert!(settings.device_setting("Stage", keys::ROLES).is_none());
        assert_eq!(manager.find_by_address(local(2)), manager.find_by_name("Node_1"));
    }
}
