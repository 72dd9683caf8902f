//! 录制记录
//!
//! 每次录制开始生成一条 [`Recording`]，设备的停止确认把各自的产物追加进去。
//! 记录保存在数据目录下的 JSON 文件里。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 单个设备在一次录制中的产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecording {
    pub device_name: String,
    pub device_type: String,
    pub timecode_in: Option<String>,
    pub timecode_out: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// 一次录制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub sequence: String,
    pub slate: String,
    pub take: u32,
    #[serde(default)]
    pub description: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub multiuser_session: String,
    #[serde(default)]
    pub changelist: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceRecording>,
}

impl Recording {
    pub fn new(sequence: &str, slate: &str, take: u32, description: &str) -> Self {
        Self {
            sequence: sequence.to_string(),
            slate: slate.to_string(),
            take,
            description: description.to_string(),
            date: Utc::now(),
            map: String::new(),
            multiuser_session: String::new(),
            changelist: None,
            devices: Vec::new(),
        }
    }

    pub fn matches(&self, sequence: &str, slate: &str, take: u32) -> bool {
        self.sequence == sequence && self.slate == slate && self.take == take
    }
}

/// 录制记录管理
#[derive(Debug, Default)]
pub struct RecordingManager {
    recordings: Vec<Recording>,
    path: Option<PathBuf>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从文件加载；文件不存在时为空
    pub fn load(path: &Path) -> Result<Self> {
        let recordings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };
        tracing::debug!("🎬 loaded {} recordings from {:?}", recordings.len(), path);
        Ok(Self {
            recordings,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.recordings)?)?;
        Ok(())
    }

    pub fn add(&mut self, recording: Recording) {
        self.recordings.push(recording);
    }

    pub fn latest(&self) -> Option<&Recording> {
        self.recordings.last()
    }

    /// 该 sequence/slate/take 组合是否尚未被使用
    pub fn slate_take_available(&self, sequence: &str, slate: &str, take: u32) -> bool {
        !self.recordings.iter().any(|r| r.matches(sequence, slate, take))
    }

    /// 把设备产物挂到最近一次录制上
    pub fn attach(&mut self, device: DeviceRecording) {
        match self.recordings.last_mut() {
            Some(recording) => {
                recording.devices.retain(|d| d.device_name != device.device_name);
                recording.devices.push(device);
            }
            None => tracing::warn!("{}: no recording to attach to", device.device_name),
        }
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slate_take_available() {
        let mut manager = RecordingManager::new();
        manager.add(Recording::new("Main", "Scene", 1, ""));
        assert!(!manager.slate_take_available("Main", "Scene", 1));
        assert!(manager.slate_take_available("Main", "Scene", 2));
        assert!(manager.slate_take_available("Other", "Scene", 1));
    }

    #[test]
    fn test_attach_replaces_same_device() {
        let mut manager = RecordingManager::new();
        manager.add(Recording::new("Main", "Scene", 1, ""));

        let clip = |out: &str| DeviceRecording {
            device_name: "Face".to_string(),
            device_type: "LiveLinkFace".to_string(),
            timecode_in: Some("00:00:01:00".to_string()),
            timecode_out: out.to_string(),
            paths: vec![],
        };
        manager.attach(clip("00:00:05:00"));
        manager.attach(clip("00:00:06:00"));

        let latest = manager.latest().unwrap();
        assert_eq!(latest.devices.len(), 1);
        assert_eq!(latest.devices[0].timecode_out, "00:00:06:00");
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recordings.json");

        let mut manager = RecordingManager::load(&path).unwrap();
        assert!(manager.is_empty());
        manager.add(Recording::new("Main", "Scene", 3, "wide"));
        manager.save().unwrap();

        let loaded = RecordingManager::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.latest().unwrap().description, "wide");
    }
}
