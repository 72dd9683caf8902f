//! 远程程序跟踪
//!
//! 程序经历 queued → starting → running 三个阶段。queued 的程序可以依赖另一个
//! 程序 id，依赖被释放后才会派发。start 命令的 id 同时作为程序 id。

use uuid::Uuid;

use crate::protocol::{Command, Envelope, ProcessInfo};

/// 由 agent 代为运行的远程程序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProgram {
    pub id: Uuid,
    pub name: String,
    pub caller: String,
    pub pid: Option<u32>,
}

impl From<&ProcessInfo> for RemoteProgram {
    fn from(process: &ProcessInfo) -> Self {
        Self {
            id: process.uuid,
            name: process.name.clone(),
            caller: process.caller.clone(),
            pid: Some(process.pid).filter(|pid| *pid != 0),
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedProgram {
    program: RemoteProgram,
    dependency: Option<Uuid>,
    envelope: Envelope,
}

/// 程序跟踪表
#[derive(Debug, Default)]
pub struct ProgramTracker {
    queued: Vec<QueuedProgram>,
    starting: Vec<RemoteProgram>,
    running: Vec<RemoteProgram>,
}

impl ProgramTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清空全部状态
    pub fn reset(&mut self) {
        self.queued.clear();
        self.starting.clear();
        self.running.clear();
    }

    pub fn clear_running(&mut self) {
        self.running.clear();
    }

    /// 加入队列，返回程序 id；依赖不存在时视为无依赖
    pub fn queue(
        &mut self,
        name: &str,
        caller: &str,
        command: Command,
        dependency: Option<Uuid>,
    ) -> Uuid {
        let envelope = Envelope::new(command);
        let id = envelope.id;

        let dependency = dependency.filter(|dep| {
            let known = self.name_of(dep).is_some();
            if !known {
                tracing::debug!("{} specified non-existent dependency on {}", name, dep);
            }
            known
        });

        self.queued.push(QueuedProgram {
            program: RemoteProgram {
                id,
                name: name.to_string(),
                caller: caller.to_string(),
                pid: None,
            },
            dependency,
            envelope,
        });
        id
    }

    /// 取出所有可以派发的程序（无依赖），转入 starting
    pub fn take_ready(&mut self) -> Vec<Envelope> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|q| q.dependency.is_none());
        self.queued = waiting;

        ready
            .into_iter()
            .map(|q| {
                self.starting.push(q.program);
                q.envelope
            })
            .collect()
    }

    /// 依赖 `id` 的程序解除依赖
    pub fn release_dependents(&mut self, id: Uuid) {
        for q in &mut self.queued {
            if q.dependency == Some(id) {
                q.dependency = None;
            }
        }
    }

    /// 丢弃依赖 `id` 的程序（递归）
    pub fn drop_dependents(&mut self, id: Uuid) -> Vec<RemoteProgram> {
        let mut dropped = Vec::new();
        let mut frontier = vec![id];

        while let Some(dep) = frontier.pop() {
            let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
                .into_iter()
                .partition(|q| q.dependency == Some(dep));
            self.queued = keep;
            for q in hit {
                frontier.push(q.program.id);
                dropped.push(q.program);
            }
        }
        dropped
    }

    /// 程序已启动：starting → running，返回程序名
    pub fn on_started(&mut self, process: &ProcessInfo) -> String {
        if let Some(pos) = self.starting.iter().position(|p| p.id == process.uuid) {
            self.starting.remove(pos);
        } else {
            tracing::debug!("{} ({}) was not in the starting list", process.name, process.uuid);
        }
        self.running.retain(|p| p.id != process.uuid);
        self.running.push(RemoteProgram::from(process));
        process.name.clone()
    }

    /// 重连后接管 agent 上已在运行的程序
    pub fn adopt(&mut self, program: RemoteProgram) {
        self.running.retain(|p| p.id != program.id);
        self.running.push(program);
    }

    /// 程序结束（或未能启动）：从所有列表移除
    pub fn on_ended(&mut self, id: Uuid) -> Option<RemoteProgram> {
        if let Some(pos) = self.starting.iter().position(|p| p.id == id) {
            return Some(self.starting.remove(pos));
        }
        if let Some(pos) = self.running.iter().position(|p| p.id == id) {
            return Some(self.running.remove(pos));
        }
        if let Some(pos) = self.queued.iter().position(|q| q.program.id == id) {
            return Some(self.queued.remove(pos).program);
        }
        None
    }

    pub fn name_of(&self, id: &Uuid) -> Option<&str> {
        self.queued
            .iter()
            .map(|q| &q.program)
            .chain(self.starting.iter())
            .chain(self.running.iter())
            .find(|p| p.id == *id)
            .map(|p| p.name.as_str())
    }

    /// 按名字查找任一阶段中的程序
    pub fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.queued
            .iter()
            .map(|q| &q.program)
            .chain(self.starting.iter())
            .chain(self.running.iter())
            .find(|p| p.name == name)
            .map(|p| p.id)
    }

    /// 是否存在名字满足条件的程序
    pub fn any_named(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.queued
            .iter()
            .map(|q| &q.program)
            .chain(self.starting.iter())
            .chain(self.running.iter())
            .any(|p| pred(&p.name))
    }

    pub fn running_named(&self, name: &str) -> Vec<Uuid> {
        self.running
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.id)
            .collect()
    }

    pub fn running(&self) -> &[RemoteProgram] {
        &self.running
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.starting.is_empty() && self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(name: &str) -> Command {
        Command::Start {
            exe: "tool".to_string(),
            args: String::new(),
            name: name.to_string(),
            caller: "Node_0".to_string(),
            working_dir: None,
            echo_stdout: true,
            priority_modifier: 0,
        }
    }

    fn process(id: Uuid, name: &str) -> ProcessInfo {
        ProcessInfo {
            uuid: id,
            name: name.to_string(),
            caller: "Node_0".to_string(),
            pid: 10,
        }
    }

    #[test]
    fn test_dependency_chain() {
        let mut tracker = ProgramTracker::new();
        let shader = tracker.queue("build_shadercw", "Node_0", start("build_shadercw"), None);
        let project = tracker.queue("build_project", "Node_0", start("build_project"), Some(shader));

        let ready = tracker.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, shader);
        assert_eq!(tracker.queued_count(), 1);

        tracker.on_started(&process(shader, "build_shadercw"));
        assert_eq!(tracker.running_named("build_shadercw"), vec![shader]);

        let ended = tracker.on_ended(shader).unwrap();
        assert_eq!(ended.name, "build_shadercw");
        tracker.release_dependents(shader);

        let ready = tracker.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, project);
    }

    #[test]
    fn test_unknown_dependency_is_dropped() {
        let mut tracker = ProgramTracker::new();
        tracker.queue("cstat_project", "Node_0", start("cstat_project"), Some(Uuid::new_v4()));
        assert_eq!(tracker.take_ready().len(), 1);
    }

    #[test]
    fn test_drop_dependents_is_recursive() {
        let mut tracker = ProgramTracker::new();
        let a = tracker.queue("sync_engine", "Node_0", start("sync_engine"), None);
        let b = tracker.queue("sync_project", "Node_0", start("sync_project"), Some(a));
        tracker.queue("after", "Node_0", start("after"), Some(b));
        tracker.take_ready();

        let dropped = tracker.drop_dependents(a);
        assert_eq!(dropped.len(), 2);
        assert_eq!(tracker.queued_count(), 0);
        assert_eq!(tracker.find_by_name("sync_engine"), Some(a));
        assert!(tracker.find_by_name("after").is_none());
    }

    #[test]
    fn test_adopt_and_reset() {
        let mut tracker = ProgramTracker::new();
        let id = Uuid::new_v4();
        tracker.adopt(RemoteProgram::from(&process(id, "unreal")));
        assert_eq!(tracker.name_of(&id), Some("unreal"));
        assert!(tracker.any_named(|n| n == "unreal"));

        tracker.reset();
        assert!(tracker.is_empty());
        assert!(tracker.on_ended(id).is_none());
    }
}
