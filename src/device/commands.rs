//! 远程命令构造与输出解析
//!
//! 根据解析后的设置生成 start 命令（启动 / 同步 / 构建 / 版本查询），
//! 并解析 agent 回传的 stdout。

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;

use super::DeviceKind;
use crate::error::{Error, Result};
use crate::protocol::Command;
use crate::settings::{keys, SettingsContext};

pub const SYNC_ENGINE: &str = "sync_engine";
pub const SYNC_PROJECT: &str = "sync_project";
pub const BUILD_SHADERCW: &str = "build_shadercw";
pub const BUILD_PROJECT: &str = "build_project";
pub const CSTAT_ENGINE: &str = "cstat_engine";
pub const CSTAT_PROJECT: &str = "cstat_project";

pub fn is_sync(program: &str) -> bool {
    program.starts_with("sync_")
}

pub fn is_build(program: &str) -> bool {
    program.starts_with("build_")
}

pub fn is_cstat(program: &str) -> bool {
    program.starts_with("cstat_")
}

/// 同步的两段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLeg {
    Engine,
    Project,
}

impl SyncLeg {
    pub fn program_name(self) -> &'static str {
        match self {
            SyncLeg::Engine => SYNC_ENGINE,
            SyncLeg::Project => SYNC_PROJECT,
        }
    }

    pub fn cstat_name(self) -> &'static str {
        match self {
            SyncLeg::Engine => CSTAT_ENGINE,
            SyncLeg::Project => CSTAT_PROJECT,
        }
    }

    pub fn from_program(program: &str) -> Option<Self> {
        match program {
            SYNC_ENGINE | CSTAT_ENGINE => Some(SyncLeg::Engine),
            SYNC_PROJECT | CSTAT_PROJECT => Some(SyncLeg::Project),
            _ => None,
        }
    }
}

fn join(base: &str, parts: &[&str]) -> String {
    let mut path = base.trim_end_matches(['/', '\\']).to_string();
    for part in parts {
        path.push('/');
        path.push_str(part);
    }
    path
}

fn parent_dir(path: &str) -> String {
    let path = path.trim_matches('"');
    match path.rfind(['/', '\\']) {
        Some(pos) => path[..pos].to_string(),
        None => String::new(),
    }
}

/// 补全省略了地址或端口的 endpoint
pub fn expand_endpoint(endpoint: &str, default_addr: &str, default_port: u16) -> String {
    let (addr, port) = endpoint.split_once(':').unwrap_or((endpoint, ""));
    let addr = if addr.is_empty() { default_addr } else { addr };
    if port.is_empty() {
        format!("{}:{}", addr, default_port)
    } else {
        format!("{}:{}", addr, port)
    }
}

/// 启动前检查设置
pub fn check_launch_settings(settings: &SettingsContext, device: &str) -> Result<()> {
    if settings.string(keys::UPROJECT_PATH, Some(device)).trim().is_empty() {
        return Err(Error::Config(format!("{}: uproject path is not set", device)));
    }

    let extra = settings
        .string(keys::EXTRA_CMDLINE_ARGS, Some(device))
        .to_lowercase();
    if extra.contains("-udpmessaging_transport_unicast") {
        return Err(Error::Config(format!(
            "{}: Command line arguments include -UDPMESSAGING_TRANSPORT_UNICAST; use the \"Unicast Endpoint\" setting instead.",
            device
        )));
    }
    if extra.contains("-udpmessaging_transport_static") {
        return Err(Error::Config(format!(
            "{}: Command line arguments include -UDPMESSAGING_TRANSPORT_STATIC; use the \"Extra Static Endpoints\" setting instead.",
            device
        )));
    }
    Ok(())
}

/// 进程优先级
pub fn priority_modifier(settings: &SettingsContext, device: &str) -> i32 {
    match settings.string(keys::PRIORITY_MODIFIER, Some(device)).as_str() {
        "Idle" => -2,
        "BelowNormal" => -1,
        "Normal" | "" => 0,
        "AboveNormal" => 1,
        "High" => 2,
        other => {
            tracing::warn!("Invalid priority_modifier '{}', defaulting to Normal", other);
            0
        }
    }
}

/// 角色：区分项目中存在和不存在的
fn split_roles(settings: &SettingsContext, device: &str) -> (Vec<String>, Vec<String>) {
    let roles = settings.list(keys::ROLES, Some(device));
    let known = settings
        .device_setting(device, keys::ROLES)
        .map(|s| s.possible_values().to_vec())
        .unwrap_or_default();

    if known.is_empty() {
        return (roles, Vec::new());
    }
    roles.into_iter().partition(|r| known.contains(r))
}

/// 生成编辑器启动命令行，返回 (exe, args)
pub fn unreal_command_line(
    settings: &SettingsContext,
    device: &str,
    kind: DeviceKind,
    address: IpAddr,
    map: &str,
) -> (String, String) {
    let dev = Some(device);
    let engine_dir = settings.string(keys::ENGINE_DIR, dev);
    let exe = join(&engine_dir, &["Binaries", "Win64", "UnrealEditor.exe"]);

    let mut args = settings.string(keys::EXTRA_CMDLINE_ARGS, dev);
    args.push_str(&format!(" Log={}.log", device));

    let exec_cmds = settings.string(keys::EXEC_CMDS, dev);
    if !exec_cmds.trim().is_empty() {
        args.push_str(&format!(" -ExecCmds=\"{}\"", exec_cmds.trim()));
    }

    // DPCVars 可能还要追加，最后再拼
    let mut dp_cvars = settings.string(keys::DP_CVARS, dev).trim().to_string();

    let (supported, unsupported) = split_roles(settings, device);
    if !supported.is_empty() {
        args.push_str(&format!(" -VPRole={}", supported.join("|")));
    }
    if !unsupported.is_empty() {
        tracing::error!("{}: Omitted unsupported roles: {}", device, unsupported.join("|"));
    }

    if let Some(session_id) = settings.integer(keys::STAGE_SESSION_ID, dev).filter(|id| *id > 0) {
        args.push_str(&format!(" -StageSessionId={}", session_id));
    }
    args.push_str(&format!(" -StageFriendlyName={}", device));

    let max_gpu_count = settings.string(keys::MAX_GPU_COUNT, dev);
    match max_gpu_count.trim().parse::<u32>() {
        Ok(count) if count > 1 => {
            args.push_str(&format!(" -MaxGPUCount={}", count));
            if !dp_cvars.is_empty() {
                dp_cvars.push(',');
            }
            dp_cvars.push_str("r.AllowMultiGPUInEditor=1");
        }
        Ok(_) => {}
        Err(_) => tracing::warn!("{}: Invalid Number of GPUs '{}'", device, max_gpu_count),
    }

    if !dp_cvars.is_empty() {
        args.push_str(&format!(" -DPCVars=\"{}\"", dp_cvars));
    }

    if settings.boolean(keys::AUTO_DECLINE_PACKAGE_RECOVERY, dev) {
        args.push_str(" -AutoDeclinePackageRecovery");
    }

    let multicast = settings.string(keys::UDP_MULTICAST_ENDPOINT, dev);
    if !multicast.trim().is_empty() {
        args.push_str(&format!(" -UDPMESSAGING_TRANSPORT_MULTICAST=\"{}\"", multicast.trim()));
    }

    let unicast = settings.string(keys::UDP_UNICAST_ENDPOINT, dev);
    if !unicast.trim().is_empty() {
        let endpoint = expand_endpoint(unicast.trim(), &address.to_string(), 0);
        args.push_str(&format!(" -UDPMESSAGING_TRANSPORT_UNICAST=\"{}\"", endpoint));
    }

    let static_endpoints: Vec<String> = settings
        .string(keys::UDP_EXTRA_STATIC_ENDPOINTS, dev)
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if !static_endpoints.is_empty() {
        args.push_str(&format!(
            " -UDPMESSAGING_TRANSPORT_STATIC=\"{}\"",
            static_endpoints.join(",")
        ));
    }

    if kind == DeviceKind::NDisplay {
        let cfg = settings.string(keys::NDISPLAY_CONFIG_FILE, dev);
        args.push_str(&format!(
            " -game -messaging -dc_cluster -nosplash -fixedseed -dc_node={} -dc_cfg=\"{}\"",
            device, cfg
        ));
    }

    let uproject = settings.string(keys::UPROJECT_PATH, dev);
    let full = format!("\"{}\" {} {}", uproject.trim_matches('"'), map, args);
    (exe, full.replace(['\r', '\n'], " "))
}

fn start(exe: String, args: String, name: &str, caller: &str, working_dir: Option<String>, echo: bool) -> Command {
    Command::Start {
        exe,
        args,
        name: name.to_string(),
        caller: caller.to_string(),
        working_dir: working_dir.filter(|d| !d.is_empty()),
        echo_stdout: echo,
        priority_modifier: 0,
    }
}

/// 启动编辑器的 start 命令
pub fn launch_command(
    settings: &SettingsContext,
    device: &str,
    kind: DeviceKind,
    address: IpAddr,
    program: &str,
    map: &str,
) -> Command {
    let (exe, args) = unreal_command_line(settings, device, kind, address, map);
    tracing::info!("{}: Launching {} {}", device, exe, args);
    Command::Start {
        exe,
        args,
        name: program.to_string(),
        caller: device.to_string(),
        working_dir: None,
        echo_stdout: false,
        priority_modifier: priority_modifier(settings, device),
    }
}

/// 单段同步命令（通过引擎自带的 python 同步脚本）
pub fn sync_command(settings: &SettingsContext, device: &str, leg: SyncLeg, changelist: &str) -> Command {
    let dev = Some(device);
    let engine_dir = settings.string(keys::ENGINE_DIR, dev);
    let uproject = settings.string(keys::UPROJECT_PATH, dev);
    let workspace = settings.string(keys::SOURCE_CONTROL_WORKSPACE, dev);

    let python = join(&engine_dir, &["Binaries", "ThirdParty", "Python3", "Win64", "python.exe"]);
    let helper = join(
        &engine_dir,
        &["Plugins", "VirtualProduction", "Switchboard", "Source", "Switchboard", "sbl_helper.py"],
    );

    let mut args = format!(
        "\"{}\" sync --project=\"{}\" --engine-dir=\"{}\" --generate",
        helper, uproject, engine_dir
    );
    if !workspace.is_empty() {
        args.push_str(&format!(" --p4client={}", workspace));
    }
    match leg {
        SyncLeg::Engine => args.push_str(&format!(" --engine-cl={}", changelist)),
        SyncLeg::Project => {
            args.push_str(&format!(" --project-cl={} --clobber-project", changelist))
        }
    }

    start(python, args, leg.program_name(), device, Some(parent_dir(&uproject)), true)
}

/// 构建目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    ShaderCompileWorker,
    Project,
}

impl BuildTarget {
    pub fn program_name(self) -> &'static str {
        match self {
            BuildTarget::ShaderCompileWorker => BUILD_SHADERCW,
            BuildTarget::Project => BUILD_PROJECT,
        }
    }
}

/// UnrealBuildTool 命令
pub fn build_command(settings: &SettingsContext, device: &str, target: BuildTarget) -> Command {
    let dev = Some(device);
    let ubt = join(
        &settings.string(keys::ENGINE_DIR, dev),
        &["Binaries", "DotNET", "UnrealBuildTool"],
    );
    let args = match target {
        BuildTarget::ShaderCompileWorker => "ShaderCompileWorker Win64 Development -Progress".to_string(),
        BuildTarget::Project => format!(
            "Win64 Development -project=\"{}\" -TargetType=Editor -Progress -NoHotReloadFromIDE",
            settings.string(keys::UPROJECT_PATH, dev)
        ),
    };
    start(ubt, args, target.program_name(), device, None, true)
}

/// 版本号查询命令；源码管理未启用或配置不全时返回 None
pub fn cstat_command(settings: &SettingsContext, device: &str, leg: SyncLeg) -> Option<Command> {
    let dev = Some(device);
    if !settings.boolean(keys::SOURCE_CONTROL_ENABLED, None) {
        return None;
    }

    let workspace = settings.string(keys::SOURCE_CONTROL_WORKSPACE, dev);
    if workspace.is_empty() {
        tracing::warn!("{}: Missing workspace name to query the {:?} changelist", device, leg);
        return None;
    }

    let p4_path = match leg {
        SyncLeg::Engine => settings.string(keys::P4_ENGINE_PATH, None),
        SyncLeg::Project => settings.string(keys::P4_PROJECT_PATH, None),
    };
    if p4_path.is_empty() {
        tracing::warn!("{}: Missing p4 path to query the {:?} changelist", device, leg);
        return None;
    }

    let args = format!(
        "-F \"%change%\" -c {} cstat {}/...#have",
        workspace,
        p4_path.trim_end_matches('/')
    );
    let working_dir = parent_dir(&settings.string(keys::UPROJECT_PATH, dev));
    Some(start("p4".to_string(), args, leg.cstat_name(), device, Some(working_dir), false))
}

/// 角色文件路径：<项目目录>/Config/Tags/<roles_filename>
pub fn roles_file_path(settings: &SettingsContext, device: &str) -> Option<String> {
    let uproject = settings.string(keys::UPROJECT_PATH, Some(device));
    let filename = settings.string(keys::ROLES_FILENAME, Some(device));
    if uproject.trim().is_empty() || filename.is_empty() {
        return None;
    }
    Some(join(&parent_dir(&uproject), &["Config", "Tags", &filename]))
}

/// 解析 `GameplayTagList=(Tag="X",...)` 行
pub fn parse_roles(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| line.starts_with("GameplayTagList"))
        .filter_map(|line| line.split_once("Tag=").map(|(_, rest)| rest))
        .map(|rest| rest.split(',').next().unwrap_or_default().trim_matches('"').to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// 解析 cstat 输出中的最新版本号
pub fn parse_changelist(output: &str) -> Option<String> {
    if output.contains("Perforce client error:") {
        return None;
    }
    output
        .split_whitespace()
        .last()
        .and_then(|cl| cl.parse::<u64>().ok())
        .map(|cl| cl.to_string())
}

/// 构建进度：`@progress 'Compiling...' 42%`
pub fn parse_build_progress(line: &str) -> Option<(String, String)> {
    if !line.contains("@progress") {
        return None;
    }
    let parts: Vec<&str> = line.split('\'').collect();
    if parts.len() < 2 {
        return None;
    }
    let step = parts[parts.len() - 2].trim().to_string();
    let percent = line.split(' ').last()?.trim();
    percent
        .ends_with('%')
        .then(|| (step, percent.to_string()))
}

fn sync_progress_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Progress: (\d{1,3}\.\d\d%)").ok())
        .as_ref()
}

fn build_error_pattern() -> Option<&'static Regex> {
    // MSVC 错误码，如 'error C4430' / 'error LNK1104'
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"error [A-Z]{1,3}[0-9]{4}").ok())
        .as_ref()
}

/// 同步进度：`Progress: 42.50%`
pub fn parse_sync_progress(line: &str) -> Option<String> {
    sync_progress_pattern()?
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// 构建输出中的编译错误行
pub fn build_error_lines(output: &str) -> Vec<&str> {
    let Some(pattern) = build_error_pattern() else {
        return Vec::new();
    };
    output.lines().filter(|line| pattern.is_match(line)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::events::Broadcaster;
    use std::net::Ipv4Addr;

    fn settings() -> SettingsContext {
        let mut ctx = SettingsContext::with_project_defaults(Broadcaster::new());
        let descriptor = DeviceKind::Unreal.descriptor();
        ctx.register_plugin(DeviceKind::Unreal, descriptor.plugin_settings());
        ctx.register_device("Node_0", DeviceKind::Unreal, descriptor.device_settings(), descriptor.overridable)
            .unwrap();
        ctx.update(keys::UPROJECT_PATH, "C:/Proj/Proj.uproject").unwrap();
        ctx.update(keys::ENGINE_DIR, "C:/UE").unwrap();
        ctx
    }

    #[test]
    fn test_command_line_defaults() {
        let ctx = settings();
        let (exe, args) = unreal_command_line(
            &ctx,
            "Node_0",
            DeviceKind::Unreal,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            "MapA",
        );

        assert_eq!(exe, "C:/UE/Binaries/Win64/UnrealEditor.exe");
        assert!(args.starts_with("\"C:/Proj/Proj.uproject\" MapA"));
        assert!(args.contains("Log=Node_0.log"));
        assert!(args.contains("-StageFriendlyName=Node_0"));
        assert!(args.contains("-UDPMESSAGING_TRANSPORT_MULTICAST=\"230.0.0.1:6666\""));
        assert!(args.contains("-UDPMESSAGING_TRANSPORT_UNICAST=\"10.0.0.5:0\""));
        assert!(!args.contains("-MaxGPUCount"));
        assert!(!args.contains("-DPCVars"));
    }

    #[test]
    fn test_command_line_multi_gpu_and_roles() {
        let mut ctx = settings();
        ctx.override_value(keys::MAX_GPU_COUNT, "Node_0", "2").unwrap();
        ctx.update(keys::DP_CVARS, "r.ScreenPercentage=50").unwrap();
        ctx.set_possible_values("Node_0", keys::ROLES, vec!["Render".to_string()])
            .unwrap();
        ctx.update_device(
            "Node_0",
            keys::ROLES,
            vec!["Render".to_string(), "Unknown".to_string()],
        )
        .unwrap();

        let (_, args) = unreal_command_line(
            &ctx,
            "Node_0",
            DeviceKind::Unreal,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "",
        );
        assert!(args.contains("-MaxGPUCount=2"));
        assert!(args.contains("-DPCVars=\"r.ScreenPercentage=50,r.AllowMultiGPUInEditor=1\""));
        assert!(args.contains("-VPRole=Render"));
        assert!(!args.contains("Unknown"));
    }

    #[test]
    fn test_invalid_extra_args_are_rejected() {
        let mut ctx = settings();
        assert!(check_launch_settings(&ctx, "Node_0").is_ok());

        ctx.update(keys::EXTRA_CMDLINE_ARGS, "-UDPMESSAGING_TRANSPORT_STATIC=1.2.3.4")
            .unwrap();
        assert!(matches!(check_launch_settings(&ctx, "Node_0"), Err(Error::Config(_))));
    }

    #[test]
    fn test_cstat_requires_source_control() {
        let mut ctx = settings();
        assert!(cstat_command(&ctx, "Node_0", SyncLeg::Project).is_none());

        ctx.update(keys::SOURCE_CONTROL_ENABLED, true).unwrap();
        ctx.update(keys::SOURCE_CONTROL_WORKSPACE, "ws_node0").unwrap();
        ctx.update(keys::P4_PROJECT_PATH, "//Proj/Main").unwrap();

        match cstat_command(&ctx, "Node_0", SyncLeg::Project) {
            Some(Command::Start { exe, args, name, .. }) => {
                assert_eq!(exe, "p4");
                assert_eq!(name, CSTAT_PROJECT);
                assert_eq!(args, "-F \"%change%\" -c ws_node0 cstat //Proj/Main/...#have");
            }
            other => panic!("Expected start command, got {:?}", other),
        }
        // 引擎路径未配置
        assert!(cstat_command(&ctx, "Node_0", SyncLeg::Engine).is_none());
    }

    #[test]
    fn test_parse_roles() {
        let content = "[/Script/GameplayTags.GameplayTagsList]\n\
                       GameplayTagList=(Tag=\"Render\",DevComment=\"\")\n\
                       GameplayTagList=(Tag=\"Editor\",DevComment=\"\")\n";
        assert_eq!(parse_roles(content), vec!["Render", "Editor"]);
    }

    #[test]
    fn test_parse_changelist() {
        assert_eq!(parse_changelist("1201\n1204\n1230\n"), Some("1230".to_string()));
        assert_eq!(parse_changelist(""), None);
        assert_eq!(
            parse_changelist("Perforce client error: Connect to server failed; check $P4PORT."),
            None
        );
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_build_progress("@progress 'Compiling C++ source code...' 67%"),
            Some(("Compiling C++ source code...".to_string(), "67%".to_string()))
        );
        assert_eq!(parse_build_progress("@progress push 5%"), None);
        assert_eq!(
            parse_sync_progress("[sync] Progress: 42.50% (files)"),
            Some("42.50%".to_string())
        );
        assert_eq!(parse_sync_progress("Progress: 42%"), None);
    }

    #[test]
    fn test_build_error_lines() {
        let output = "Building...\nfoo.cpp(12): error C4430: missing type\nlink: error LNK1104: cannot open\nwarning C4996\n";
        assert_eq!(build_error_lines(output).len(), 2);
    }

    #[test]
    fn test_expand_endpoint() {
        assert_eq!(expand_endpoint(":0", "10.0.0.5", 0), "10.0.0.5:0");
        assert_eq!(expand_endpoint("1.2.3.4", "10.0.0.5", 9), "1.2.3.4:9");
        assert_eq!(expand_endpoint("1.2.3.4:7000", "10.0.0.5", 0), "1.2.3.4:7000");
    }

    #[test]
    fn test_roles_file_path() {
        let ctx = settings();
        assert_eq!(
            roles_file_path(&ctx, "Node_0").as_deref(),
            Some("C:/Proj/Config/Tags/VPRoles.ini")
        );
    }
}
