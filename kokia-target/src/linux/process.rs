//! ptraceによるプロセス・スレッド制御

use super::{memory::Memory, registers};
use crate::{ProcessHandle, Result, ThreadHandle};
use kokia_wire::{AddressRegion, Module, Register};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use tracing::{debug, warn};

fn read_comm(path: &str) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

fn ptrace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACECLONE
}

/// 実行ファイルを起動し、exec直後で停止したプロセスを返す
///
/// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
/// 指定された実行可能ファイルをexecveで実行します。
pub(crate) fn spawn(argv: &[String]) -> Result<Pid> {
    use nix::unistd::{execve, fork, ForkResult};

    let program = argv
        .first()
        .ok_or_else(|| anyhow::anyhow!("Empty argument list"))?;
    let args = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let program = CString::new(program.as_str())?;

    // 環境変数は親プロセスから継承
    let env: Vec<CString> = std::env::vars()
        .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
        .collect::<Result<Vec<_>>>()?;

    match unsafe { fork()? } {
        ForkResult::Parent { child } => match waitpid(child, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                ptrace::setoptions(child, ptrace_options())?;
                debug!("Launched process {} stopped at exec", child);
                Ok(child)
            }
            WaitStatus::Exited(_, code) => {
                Err(anyhow::anyhow!("Failed to exec {:?} (exit code {})", argv[0], code))
            }
            status => Err(anyhow::anyhow!("Unexpected wait status after execve: {:?}", status)),
        },
        ForkResult::Child => {
            if ptrace::traceme().is_err() {
                std::process::exit(126);
            }
            let _ = execve(&program, &args, &env);
            // execveが失敗した場合のみここに到達
            std::process::exit(127);
        }
    }
}

/// 既存プロセスの全スレッドにアタッチし、停止するまで待つ
pub(crate) fn attach(pid: Pid) -> Result<Vec<Pid>> {
    let mut attached: Vec<Pid> = Vec::new();

    // アタッチ中に生まれたスレッドを拾うため、増えなくなるまで繰り返す
    loop {
        let mut added = false;
        for tid in task_ids(pid)? {
            if attached.contains(&tid) {
                continue;
            }
            ptrace::attach(tid)?;
            waitpid(tid, Some(WaitPidFlag::__WALL))?;
            ptrace::setoptions(tid, ptrace_options())?;
            attached.push(tid);
            added = true;
        }
        if !added {
            break;
        }
    }

    debug!("Attached to {} thread(s) of {}", attached.len(), pid);
    Ok(attached)
}

/// /proc/pid/task のスレッドID一覧
fn task_ids(pid: Pid) -> Result<Vec<Pid>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{}/task", pid))? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort();
    Ok(tids)
}

/// ptraceで制御しているプロセス
pub struct LinuxProcess {
    pid: Pid,
    memory: Memory,
}

impl LinuxProcess {
    pub fn new(pid: Pid) -> Self {
        Self { pid, memory: Memory::new(pid) }
    }
}

impl ProcessHandle for LinuxProcess {
    fn koid(&self) -> u64 {
        self.pid.as_raw() as u64
    }

    fn name(&self) -> String {
        read_comm(&format!("/proc/{}/comm", self.pid))
    }

    fn thread_koids(&self) -> Result<Vec<u64>> {
        Ok(task_ids(self.pid)?.into_iter().map(|t| t.as_raw() as u64).collect())
    }

    fn thread(&self, koid: u64) -> Box<dyn ThreadHandle> {
        Box::new(LinuxThread { pid: self.pid, tid: Pid::from_raw(koid as i32) })
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        self.memory.read(address, size)
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.memory.write(address, data)
    }

    fn address_space(&self) -> Result<Vec<AddressRegion>> {
        Ok(super::memory::regions_from_mappings(&self.memory.mappings()?))
    }

    fn modules(&self) -> Result<Vec<Module>> {
        Ok(super::memory::modules_from_mappings(&self.memory.mappings()?))
    }

    fn kill(&self) -> Result<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        for tid in task_ids(self.pid)? {
            match ptrace::detach(tid, None) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    // 実行中のスレッドは一度止めてからデタッチする
                    tgkill(self.pid, tid, Signal::SIGSTOP)?;
                    let status = waitpid(tid, Some(WaitPidFlag::__WALL))?;
                    if !matches!(status, WaitStatus::Stopped(_, Signal::SIGSTOP)) {
                        warn!("Thread {} stopped with {:?} while detaching", tid, status);
                    }
                    ptrace::detach(tid, None)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> Result<()> {
    // SAFETY: 引数はすべて整数
    let ret = unsafe {
        nix::libc::syscall(
            nix::libc::SYS_tgkill,
            pid.as_raw(),
            tid.as_raw(),
            signal as nix::libc::c_int,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// ptraceで制御しているスレッド
pub struct LinuxThread {
    pid: Pid,
    tid: Pid,
}

impl ThreadHandle for LinuxThread {
    fn koid(&self) -> u64 {
        self.tid.as_raw() as u64
    }

    fn name(&self) -> String {
        read_comm(&format!("/proc/{}/task/{}/comm", self.pid, self.tid))
    }

    fn suspend(&self) -> Result<()> {
        tgkill(self.pid, self.tid, Signal::SIGSTOP)
    }

    fn resume(&self, single_step: bool, signal: Option<i32>) -> Result<()> {
        let signal = signal.map(Signal::try_from).transpose()?;
        if single_step {
            ptrace::step(self.tid, signal)?;
        } else {
            ptrace::cont(self.tid, signal)?;
        }
        Ok(())
    }

    fn read_registers(&self) -> Result<Vec<Register>> {
        registers::read(self.tid)
    }

    fn write_registers(&self, registers: &[Register]) -> Result<()> {
        registers::write(self.tid, registers)
    }
}
