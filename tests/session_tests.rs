//! 会话广播集成测试

#[cfg(feature = "session")]
mod tests {
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use switchboard_engine::device::{DeviceId, DeviceKind, DeviceManager, DeviceStatus};
    use switchboard_engine::events::Broadcaster;
    use switchboard_engine::osc::{address, OscArg};
    use switchboard_engine::recording::{Recording, RecordingManager};
    use switchboard_engine::session::{Outbound, SessionCoordinator};
    use switchboard_engine::settings::{keys, SettingsContext};
    use tempfile::tempdir;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    /// 三台已就绪的 LiveLinkFace + 一台未连接的 Unreal
    struct Stage {
        devices: DeviceManager,
        settings: SettingsContext,
        phones: Vec<DeviceId>,
        editor: DeviceId,
    }

    fn stage() -> Stage {
        let mut settings = SettingsContext::with_project_defaults(Broadcaster::new());
        let mut devices = DeviceManager::new(2980, 1024, Duration::from_secs(10), Broadcaster::new());

        let mut phones = Vec::new();
        for n in 1..=3u8 {
            let id = devices
                .add(
                    &format!("iPhone_{}", n),
                    DeviceKind::LiveLinkFace,
                    ip(n),
                    &BTreeMap::new(),
                    &mut settings,
                )
                .unwrap();
            let device = devices.get_mut(id).unwrap();
            assert!(device.connect_listener().is_none());
            assert_eq!(device.status(), DeviceStatus::Open);
            phones.push(id);
        }

        let editor = devices
            .add("Editor", DeviceKind::Unreal, ip(9), &BTreeMap::new(), &mut settings)
            .unwrap();

        Stage {
            devices,
            settings,
            phones,
            editor,
        }
    }

    fn with_address<'a>(out: &'a [Outbound], addr: &str) -> Vec<&'a Outbound> {
        out.iter().filter(|o| o.message.address == addr).collect()
    }

    fn targets(out: &[&Outbound]) -> Vec<IpAddr> {
        out.iter().map(|o| o.target.ip()).collect()
    }

    #[test]
    fn test_used_take_is_auto_incremented() {
        let s = stage();
        let mut recordings = RecordingManager::new();
        recordings.add(Recording::new("Seq", "A", 1, ""));
        recordings.add(Recording::new("Seq", "A", 2, ""));

        let mut session = SessionCoordinator::new("Seq", "B", 1, recordings, 8000);
        let out = session.set_slate("A", None, &s.devices, &s.settings);

        assert_eq!(session.slate(), "A");
        assert_eq!(session.take(), 3);

        let slates = with_address(&out, address::SLATE);
        assert_eq!(targets(&slates), vec![ip(1), ip(2), ip(3)]);

        let takes = with_address(&out, address::TAKE);
        assert_eq!(takes.len(), 3);
        assert!(takes.iter().all(|o| o.message.args == vec![OscArg::Int(3)]));
        // 未连接的设备不参与广播
        assert!(!out.iter().any(|o| o.device == s.editor));
    }

    #[test]
    fn test_remote_take_change_is_not_echoed() {
        let s = stage();
        let mut session = SessionCoordinator::new("Seq", "A", 1, RecordingManager::new(), 8000);

        let out = session.set_take(5, Some(ip(2)), &s.devices, &s.settings);
        assert_eq!(session.take(), 5);
        assert_eq!(targets(&with_address(&out, address::TAKE)), vec![ip(1), ip(3)]);

        // 同值不再广播
        assert!(session.set_take(5, Some(ip(1)), &s.devices, &s.settings).is_empty());
    }

    #[test]
    fn test_corrected_take_goes_back_to_origin() {
        let s = stage();
        let mut recordings = RecordingManager::new();
        recordings.add(Recording::new("Seq", "A", 2, ""));
        let mut session = SessionCoordinator::new("Seq", "A", 1, recordings, 8000);

        let out = session.set_take(2, Some(ip(2)), &s.devices, &s.settings);
        assert_eq!(session.take(), 3);
        assert_eq!(targets(&with_address(&out, address::TAKE)), vec![ip(1), ip(2), ip(3)]);
    }

    #[test]
    fn test_operator_slate_change_resets_take() {
        let s = stage();
        let mut session = SessionCoordinator::new("Seq", "A", 4, RecordingManager::new(), 8000);

        session.set_slate("B", Some(ip(1)), &s.devices, &s.settings);
        assert_eq!(session.take(), 4);

        let out = session.set_slate("C", None, &s.devices, &s.settings);
        assert_eq!(session.take(), 1);
        assert_eq!(with_address(&out, address::TAKE).len(), 3);

        let out = session.set_sequence("Seq2", &s.devices, &s.settings);
        assert!(out.is_empty());
        assert_eq!(session.sequence(), "Seq2");
        assert_eq!(session.take(), 1);
    }

    #[test]
    fn test_record_start_and_stop_collects_clips() {
        let mut s = stage();
        let dir = tempdir().unwrap();
        let path = dir.path().join("recordings.json");

        let mut session =
            SessionCoordinator::new("Seq", "A", 1, RecordingManager::load(&path).unwrap(), 8000);
        session.set_description("first pass");
        session.set_map("/Game/Stage");

        let out = session.record_start(None, Some("51".to_string()), &s.devices, &s.settings);
        assert!(session.is_recording());
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[0].message.args,
            vec![
                OscArg::Str("A".to_string()),
                OscArg::Int(1),
                OscArg::Str("first pass".to_string())
            ]
        );
        assert!(session
            .record_start(None, None, &s.devices, &s.settings)
            .is_empty());

        let phone = s.phones[0];
        let device = s.devices.get_mut(phone).unwrap();
        device.on_send_target_confirmed();
        assert_eq!(device.status(), DeviceStatus::Ready);
        device.on_record_start_confirmed("00:00:01:00");
        assert_eq!(device.status(), DeviceStatus::Recording);

        let out = session.record_stop(None, &s.devices, &s.settings);
        assert!(!session.is_recording());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].message.address, address::RECORD_STOP);

        let device = s.devices.get_mut(phone).unwrap();
        let clip = device
            .on_record_stop_confirmed("00:00:05:00", vec!["take_A_1.mov".to_string()])
            .unwrap();
        assert_eq!(device.status(), DeviceStatus::Ready);
        session.on_record_stop_confirmed(clip);

        let reloaded = RecordingManager::load(&path).unwrap();
        let recording = reloaded.latest().unwrap();
        assert!(recording.matches("Seq", "A", 1));
        assert_eq!(recording.map, "/Game/Stage");
        assert_eq!(recording.changelist.as_deref(), Some("51"));
        assert_eq!(recording.devices.len(), 1);
        assert_eq!(recording.devices[0].device_name, "iPhone_1");
        assert_eq!(recording.devices[0].timecode_in.as_deref(), Some("00:00:01:00"));
        assert_eq!(recording.devices[0].timecode_out, "00:00:05:00");

        // 录过的组合不能再用
        let out = session.set_take(1, None, &s.devices, &s.settings);
        assert_eq!(session.take(), 2);
        assert_eq!(with_address(&out, address::TAKE).len(), 3);
    }

    #[test]
    fn test_record_stop_when_idle_is_ignored() {
        let s = stage();
        let dir = tempdir().unwrap();
        let path = dir.path().join("recordings.json");
        let mut session =
            SessionCoordinator::new("Seq", "A", 1, RecordingManager::load(&path).unwrap(), 8000);

        assert!(session.record_stop(None, &s.devices, &s.settings).is_empty());
        assert!(session.record_cancel(Some(ip(1)), &s.devices, &s.settings).is_empty());
        assert!(!path.exists());

        session.record_start(None, None, &s.devices, &s.settings);
        assert_eq!(session.record_stop(None, &s.devices, &s.settings).len(), 3);
        // 第二次停止不再广播
        assert!(session.record_stop(None, &s.devices, &s.settings).is_empty());
    }

    #[test]
    fn test_remote_record_start_adopts_device_session() {
        let s = stage();
        let mut session = SessionCoordinator::new("Seq", "A", 1, RecordingManager::new(), 8000);

        let out = session.on_remote_record_start(
            ip(2),
            Some("Remote"),
            Some(7),
            "from phone",
            None,
            &s.devices,
            &s.settings,
        );

        assert_eq!(session.slate(), "Remote");
        assert_eq!(session.take(), 7);
        assert_eq!(session.description(), "from phone");
        assert!(session.is_recording());
        assert!(out.iter().all(|o| o.target.ip() != ip(2)));
        assert_eq!(with_address(&out, address::RECORD_START).len(), 2);

        // "None" slate 保留当前值
        let mut session = SessionCoordinator::new("Seq", "A", 1, RecordingManager::new(), 8000);
        session.on_remote_record_start(ip(1), Some("None"), None, "", None, &s.devices, &s.settings);
        assert_eq!(session.slate(), "A");
        assert!(session.is_recording());
    }

    #[test]
    fn test_push_current_and_send_target() {
        let mut s = stage();
        s.settings
            .update_device("iPhone_1", keys::OSC_PORT, 9000i64)
            .unwrap();
        let session = SessionCoordinator::new("Seq", "A", 2, RecordingManager::new(), 8000);

        let device = s.devices.get(s.phones[0]).unwrap();
        let out = session.push_current(device, &s.settings);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, SocketAddr::new(ip(1), 9000));
        assert_eq!(out[0].message.address, address::TAKE);
        assert_eq!(out[1].message.address, address::SLATE);

        let handshake = session.add_send_target(device, &s.settings, "10.0.0.100", 6000);
        assert_eq!(handshake.message.address, address::OSC_ADD_SEND_TARGET);
        assert_eq!(
            handshake.message.args,
            vec![OscArg::Str("10.0.0.100".to_string()), OscArg::Int(6000)]
        );

        let editor = s.devices.get(s.editor).unwrap();
        assert!(session.push_current(editor, &s.settings).is_empty());
    }
}
