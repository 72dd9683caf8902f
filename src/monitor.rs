//! 集群状态监控
//!
//! 按固定间隔轮询支持集群状态的设备。超过 4 个间隔没有新数据的设备
//! 被视为过期，显示字段重置为 [`UNAVAILABLE`]；断开时立即重置。
//! 时间由调用方注入，便于在测试中推进。

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::device::DeviceId;
use crate::protocol::SyncStatus;

/// 不可用字段的占位值
pub const UNAVAILABLE: &str = "n/a";

/// 过期阈值（以轮询间隔计）
pub const STALE_INTERVALS: u32 = 4;

/// 一台设备的显示字段
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRow {
    pub gpu_sync: String,
    pub display_sync: String,
    pub refresh_rate: String,
    pub house_sync: String,
    pub sync_source: String,
    pub mosaics: String,
    pub present_mode: String,
    pub focused_pid: String,
    pub cpu: String,
    pub gpus: String,
    pub memory: String,
    pub os_version: String,
}

impl Default for ClusterRow {
    fn default() -> Self {
        let na = || UNAVAILABLE.to_string();
        Self {
            gpu_sync: na(),
            display_sync: na(),
            refresh_rate: na(),
            house_sync: na(),
            sync_source: na(),
            mosaics: na(),
            present_mode: na(),
            focused_pid: na(),
            cpu: na(),
            gpus: na(),
            memory: na(),
            os_version: na(),
        }
    }
}

fn or_na(value: String) -> String {
    if value.is_empty() {
        UNAVAILABLE.to_string()
    } else {
        value
    }
}

fn rate(value: Option<f32>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| UNAVAILABLE.to_string())
}

impl ClusterRow {
    pub fn from_status(status: &SyncStatus) -> Self {
        let gpu_sync = status
            .sync_topologies
            .iter()
            .flat_map(|t| t.sync_gpus.iter())
            .map(|g| if g.is_synced { "Synced" } else { "Free" })
            .collect::<Vec<_>>()
            .join(", ");
        let display_sync = status
            .sync_topologies
            .iter()
            .flat_map(|t| t.sync_displays.iter())
            .map(|d| d.sync_state.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mosaics = status
            .mosaic_topologies
            .iter()
            .map(|m| format!("{}x{} {}x{}", m.columns, m.rows, m.width, m.height))
            .collect::<Vec<_>>()
            .join(", ");
        let house_sync = if status.house_sync_present {
            rate(status.house_sync_rate)
        } else {
            "None".to_string()
        };

        Self {
            gpu_sync: or_na(gpu_sync),
            display_sync: or_na(display_sync),
            refresh_rate: rate(status.refresh_rate),
            house_sync,
            sync_source: or_na(status.sync_source.clone()),
            mosaics: or_na(mosaics),
            present_mode: or_na(status.flip_model_history.last().cloned().unwrap_or_default()),
            focused_pid: status
                .focused_process_id
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| UNAVAILABLE.to_string()),
            cpu: status
                .cpu_utilization
                .map(|v| format!("{:.0}%", v))
                .unwrap_or_else(|| UNAVAILABLE.to_string()),
            gpus: or_na(
                status
                    .gpu_utilizations
                    .iter()
                    .map(|v| format!("{:.0}%", v))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            memory: status
                .physical_memory_available
                .map(|b| format!("{:.1} GB", b as f64 / (1024.0 * 1024.0 * 1024.0)))
                .unwrap_or_else(|| UNAVAILABLE.to_string()),
            os_version: or_na(status.os_version.clone()),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        *self == ClusterRow::default()
    }
}

#[derive(Debug)]
struct Entry {
    row: ClusterRow,
    /// 最近一次收到数据（或开始跟踪）的时间
    fresh_at: Instant,
    stale: bool,
}

/// 集群状态监控
#[derive(Debug)]
pub struct ClusterMonitor {
    interval: Duration,
    entries: BTreeMap<DeviceId, Entry>,
}

impl ClusterMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: BTreeMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn stale_after(&self) -> Duration {
        self.interval * STALE_INTERVALS
    }

    /// 开始跟踪设备（已跟踪则不变）
    pub fn track(&mut self, device: DeviceId, now: Instant) {
        self.entries.entry(device).or_insert_with(|| Entry {
            row: ClusterRow::default(),
            fresh_at: now,
            stale: false,
        });
    }

    pub fn untrack(&mut self, device: DeviceId) {
        self.entries.remove(&device);
    }

    pub fn is_tracked(&self, device: DeviceId) -> bool {
        self.entries.contains_key(&device)
    }

    /// 一个轮询周期：标记过期设备，返回需要轮询的设备
    pub fn tick(&mut self, now: Instant) -> Vec<DeviceId> {
        let stale_after = self.stale_after();
        for (device, entry) in self.entries.iter_mut() {
            if !entry.stale && now.saturating_duration_since(entry.fresh_at) >= stale_after {
                tracing::debug!("📉 device {} cluster status is stale", device);
                entry.row = ClusterRow::default();
                entry.stale = true;
            }
        }
        self.entries.keys().copied().collect()
    }

    /// 收到新的状态数据
    pub fn on_status(&mut self, device: DeviceId, status: &SyncStatus, now: Instant) {
        let Some(entry) = self.entries.get_mut(&device) else {
            tracing::trace!("cluster status for untracked device {}", device);
            return;
        };
        entry.row = ClusterRow::from_status(status);
        entry.fresh_at = now;
        entry.stale = false;
    }

    /// 断开：立即重置并停止跟踪
    pub fn on_disconnect(&mut self, device: DeviceId) {
        if let Some(mut entry) = self.entries.remove(&device) {
            entry.row = ClusterRow::default();
        }
    }

    pub fn row(&self, device: DeviceId) -> Option<&ClusterRow> {
        self.entries.get(&device).map(|e| &e.row)
    }

    pub fn is_stale(&self, device: DeviceId) -> bool {
        self.entries.get(&device).is_some_and(|e| e.stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SyncGpu, SyncTopology};

    fn status() -> SyncStatus {
        SyncStatus {
            sync_topologies: vec![SyncTopology {
                sync_gpus: vec![SyncGpu {
                    is_synced: true,
                    num_displays: 2,
                }],
                sync_displays: vec![],
            }],
            refresh_rate: Some(59.94),
            sync_source: "House".to_string(),
            cpu_utilization: Some(12.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_row_formatting() {
        let row = ClusterRow::from_status(&status());
        assert_eq!(row.gpu_sync, "Synced");
        assert_eq!(row.refresh_rate, "59.94");
        assert_eq!(row.house_sync, "None");
        assert_eq!(row.cpu, "12%");
        assert_eq!(row.display_sync, UNAVAILABLE);
        assert!(!row.is_unavailable());
    }

    #[test]
    fn test_stale_after_four_intervals() {
        let interval = Duration::from_millis(1000);
        let mut monitor = ClusterMonitor::new(interval);
        let start = Instant::now();

        monitor.track(7, start);
        monitor.on_status(7, &status(), start);

        for i in 1..STALE_INTERVALS {
            let polled = monitor.tick(start + interval * i);
            assert_eq!(polled, vec![7]);
            assert!(!monitor.is_stale(7));
        }

        monitor.tick(start + interval * STALE_INTERVALS);
        assert!(monitor.is_stale(7));
        assert!(monitor.row(7).unwrap().is_unavailable());

        // 新数据恢复
        monitor.on_status(7, &status(), start + interval * 5);
        assert!(!monitor.is_stale(7));
    }

    #[test]
    fn test_disconnect_resets_immediately() {
        let mut monitor = ClusterMonitor::new(Duration::from_secs(1));
        let now = Instant::now();
        monitor.track(1, now);
        monitor.on_status(1, &status(), now);
        monitor.on_disconnect(1);
        assert!(!monitor.is_tracked(1));
        assert!(monitor.row(1).is_none());
        assert!(monitor.tick(now).is_empty());
    }
}
