//! Linux上のプラットフォーム実装
//!
//! すべてのトレース対象スレッドの停止を `waitpid(-1, WNOHANG | __WALL)` で
//! 集め、`OsEvent` に変換します。SIGCHLDを受けるたびに `poll_events` を
//! 呼び出す想定です。

use super::process::{self, LinuxProcess};
use crate::{ExceptionKind, OsEvent, Platform, ProcessHandle, Result};
use kokia_wire::{ProcessTreeKind, ProcessTreeRecord};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

// siginfo.si_code（SIGTRAP）
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const TRAP_HWBKPT: i32 = 4;
const SI_KERNEL: i32 = 0x80;

/// SIGTRAPの si_code から例外の種類を決める
pub fn classify_trap(si_code: i32) -> ExceptionKind {
    match si_code {
        TRAP_BRKPT | SI_KERNEL => ExceptionKind::SoftwareBreakpoint,
        TRAP_TRACE => ExceptionKind::SingleStep,
        TRAP_HWBKPT => ExceptionKind::HardwareBreakpoint,
        _ => ExceptionKind::General(Signal::SIGTRAP as i32),
    }
}

/// ptraceベースのプラットフォーム
#[derive(Default)]
pub struct LinuxPlatform {
    /// tid -> pid
    tasks: HashMap<i32, i32>,
    /// クローンイベントは届いたが最初のSIGSTOPがまだのスレッド
    awaiting_initial_stop: HashSet<i32>,
    /// クローンイベントより先に最初のSIGSTOPが届いたスレッド
    early_stopped: HashSet<i32>,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn translate(&mut self, status: WaitStatus, events: &mut Vec<OsEvent>) {
        match status {
            WaitStatus::Exited(tid, code) => self.task_exited(tid, code as i64, events),
            WaitStatus::Signaled(tid, signal, _) => {
                self.task_exited(tid, -(signal as i64), events)
            }
            WaitStatus::PtraceEvent(tid, _, event) if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 => {
                self.thread_cloned(tid, events)
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP) => self.sigstop(tid, events),
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                let kind = match ptrace::getsiginfo(tid) {
                    Ok(info) => classify_trap(info.si_code),
                    Err(e) => {
                        warn!("getsiginfo failed for {}: {}", tid, e);
                        ExceptionKind::SoftwareBreakpoint
                    }
                };
                self.exception(tid, kind, events);
            }
            WaitStatus::Stopped(tid, signal) => {
                self.exception(tid, ExceptionKind::General(signal as i32), events)
            }
            other => trace!("Ignoring wait status {:?}", other),
        }
    }

    fn pid_of(&self, tid: Pid) -> Option<u64> {
        self.tasks.get(&tid.as_raw()).map(|pid| *pid as u64)
    }

    fn exception(&mut self, tid: Pid, kind: ExceptionKind, events: &mut Vec<OsEvent>) {
        match self.pid_of(tid) {
            Some(pid) => events.push(OsEvent::Exception { pid, tid: tid.as_raw() as u64, kind }),
            None => warn!("Exception {:?} from unknown thread {}", kind, tid),
        }
    }

    fn task_exited(&mut self, tid: Pid, code: i64, events: &mut Vec<OsEvent>) {
        let Some(pid) = self.tasks.remove(&tid.as_raw()) else {
            return;
        };
        if pid == tid.as_raw() {
            // スレッドグループリーダーの終了はプロセスの終了
            self.tasks.retain(|_, p| *p != pid);
            events.push(OsEvent::ProcessExited { pid: pid as u64, code });
        } else {
            events.push(OsEvent::ThreadExited { pid: pid as u64, tid: tid.as_raw() as u64 });
        }
    }

    fn thread_cloned(&mut self, parent: Pid, events: &mut Vec<OsEvent>) {
        let new_tid = match ptrace::getevent(parent) {
            Ok(tid) => tid as i32,
            Err(e) => {
                warn!("Failed to get cloned thread id from {}: {}", parent, e);
                return;
            }
        };
        if let Some(pid) = self.tasks.get(&parent.as_raw()).copied() {
            self.tasks.insert(new_tid, pid);
            if !self.early_stopped.remove(&new_tid) {
                self.awaiting_initial_stop.insert(new_tid);
            }
            debug!("Thread {} started in process {}", new_tid, pid);
            events.push(OsEvent::ThreadStarting { pid: pid as u64, tid: new_tid as u64 });
        }
        if let Err(e) = ptrace::cont(parent, None) {
            warn!("Failed to continue {} after clone: {}", parent, e);
        }
    }

    fn sigstop(&mut self, tid: Pid, events: &mut Vec<OsEvent>) {
        let raw = tid.as_raw();
        if self.awaiting_initial_stop.remove(&raw) || !self.tasks.contains_key(&raw) {
            // 新しいスレッドの最初の停止は握りつぶす
            if !self.tasks.contains_key(&raw) {
                self.early_stopped.insert(raw);
            }
            if let Err(e) = ptrace::cont(tid, None) {
                warn!("Failed to start new thread {}: {}", tid, e);
            }
            return;
        }
        if let Some(pid) = self.pid_of(tid) {
            events.push(OsEvent::Stopped { pid, tid: raw as u64 });
        }
    }
}

impl Platform for LinuxPlatform {
    fn launch(&mut self, argv: &[String]) -> Result<Box<dyn ProcessHandle>> {
        let pid = process::spawn(argv)?;
        self.tasks.insert(pid.as_raw(), pid.as_raw());
        Ok(Box::new(LinuxProcess::new(pid)))
    }

    fn attach(&mut self, pid: u64) -> Result<Box<dyn ProcessHandle>> {
        let pid = Pid::from_raw(pid as i32);
        for tid in process::attach(pid)? {
            self.tasks.insert(tid.as_raw(), pid.as_raw());
        }
        Ok(Box::new(LinuxProcess::new(pid)))
    }

    fn process_tree(&self) -> Result<ProcessTreeRecord> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            // 列挙中に終了したプロセスは飛ばす
            if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                if let Some((ppid, name)) = parse_stat(&stat) {
                    entries.push((pid, ppid, name));
                }
            }
        }
        Ok(build_process_tree(&entries))
    }

    fn poll_events(&mut self) -> Vec<OsEvent> {
        let mut events = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => self.translate(status, &mut events),
                Err(e) => {
                    warn!("waitpid failed: {}", e);
                    break;
                }
            }
        }
        events
    }
}

/// /proc/pid/stat から (ppid, comm) を取り出す
///
/// comm は括弧で囲まれ、空白や括弧を含むことがあるので最後の ')' で区切る。
pub fn parse_stat(stat: &str) -> Option<(u64, String)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((ppid, name))
}

/// (pid, ppid, name) の一覧からプロセスツリーを組み立てる
///
/// 親が一覧にないプロセスはルート（koid 0 のジョブ）の直下に置く。
pub fn build_process_tree(entries: &[(u64, u64, String)]) -> ProcessTreeRecord {
    let known: HashSet<u64> = entries.iter().map(|(pid, _, _)| *pid).collect();
    let mut children: HashMap<u64, Vec<&(u64, u64, String)>> = HashMap::new();
    for entry in entries {
        let parent = if known.contains(&entry.1) && entry.1 != entry.0 { entry.1 } else { 0 };
        children.entry(parent).or_default().push(entry);
    }

    fn build(
        pid: u64,
        name: &str,
        kind: ProcessTreeKind,
        children: &HashMap<u64, Vec<&(u64, u64, String)>>,
    ) -> ProcessTreeRecord {
        let mut kids: Vec<ProcessTreeRecord> = children
            .get(&pid)
            .map(|list| {
                list.iter()
                    .map(|(child, _, child_name)| {
                        build(*child, child_name, ProcessTreeKind::Process, children)
                    })
                    .collect()
            })
            .unwrap_or_default();
        kids.sort_by_key(|r| r.koid);
        ProcessTreeRecord { kind, koid: pid, name: name.to_string(), children: kids }
    }

    build(0, "system", ProcessTreeKind::Job, &children)
}
