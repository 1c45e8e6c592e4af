//! ターゲットのライフサイクルとプロセス全体の操作

use super::Session;
use crate::error::{check_status, Error, Result};
use crate::observer::SessionEvent;
use crate::process::Process;
use crate::target::{Target, TargetId, TargetState};
use kokia_wire::{
    AddressRegion, AddressSpaceRequest, AttachRequest, DetachRequest, KillRequest, LaunchRequest,
    MemoryBlock, Module, ModulesRequest, NotifyModules, NotifyProcessExiting, ProcessTreeRecord,
    ProcessTreeRequest, ReadMemoryRequest, ThreadsRequest, WriteMemoryRequest,
};
use tracing::{debug, info, warn};

impl Session {
    pub fn create_target(&mut self) -> TargetId {
        let id = self.system.allocate_target_id();
        self.system.targets.insert(id, Target::new(id));
        id
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.system.targets.get(&id)
    }

    /// 状態が None のターゲットを遷移させる
    fn begin_transition(&mut self, id: TargetId, next: TargetState) -> Result<()> {
        let target = self
            .system
            .targets
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !target.is_idle() {
            return Err(Error::BadState("target already has a process"));
        }
        target.state = next;
        Ok(())
    }

    /// 起動・アタッチの応答でターゲットを確定させる
    fn finish_transition(
        &mut self,
        id: TargetId,
        result: Result<(u64, String)>,
    ) -> Result<u64> {
        let target = self.system.targets.get_mut(&id).ok_or(Error::Abandoned)?;
        match result {
            Ok((koid, name)) => {
                info!("{} running process {} ({})", id, koid, name);
                target.state = TargetState::Running(Process::new(koid, name));
                Ok(koid)
            }
            Err(e) => {
                target.state = TargetState::None;
                Err(e)
            }
        }
    }

    pub fn launch(
        &mut self,
        id: TargetId,
        argv: Vec<String>,
        callback: impl FnOnce(&mut Session, Result<u64>) + 'static,
    ) {
        if let Err(e) = self.begin_transition(id, TargetState::Starting) {
            self.message_loop.post(move |session| callback(session, Err(e)));
            return;
        }
        self.remote.launch(
            LaunchRequest { argv },
            Box::new(move |session, reply| {
                let reply = reply.and_then(|r| {
                    check_status(r.status)?;
                    Ok((r.process_koid, r.process_name))
                });
                let result = session.finish_transition(id, reply);
                if let Ok(koid) = result {
                    session.sync_threads(koid, |_, _| {});
                    session.load_modules(koid, |_, _| {});
                }
                callback(session, result)
            }),
        );
    }

    /// 既存プロセスにアタッチする
    ///
    /// 既存スレッドは応答の直後に届くスレッド開始通知で登録されます。
    pub fn attach(
        &mut self,
        id: TargetId,
        koid: u64,
        callback: impl FnOnce(&mut Session, Result<u64>) + 'static,
    ) {
        if let Err(e) = self.begin_transition(id, TargetState::Attaching) {
            self.message_loop.post(move |session| callback(session, Err(e)));
            return;
        }
        self.remote.attach(
            AttachRequest { koid },
            Box::new(move |session, reply| {
                let reply = reply.and_then(|r| {
                    check_status(r.status)?;
                    Ok((r.process_koid, r.process_name))
                });
                let result = session.finish_transition(id, reply);
                if let Ok(koid) = result {
                    session.load_modules(koid, |_, _| {});
                }
                callback(session, result)
            }),
        );
    }

    pub fn detach(&mut self, id: TargetId, callback: impl FnOnce(&mut Session, Result<()>) + 'static) {
        self.end_process(id, false, callback)
    }

    pub fn kill(&mut self, id: TargetId, callback: impl FnOnce(&mut Session, Result<()>) + 'static) {
        self.end_process(id, true, callback)
    }

    fn end_process(
        &mut self,
        id: TargetId,
        kill: bool,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        let Some(koid) = self.target(id).and_then(|t| t.process()).map(|p| p.koid()) else {
            self.message_loop.post(move |session| {
                callback(session, Err(Error::BadState("target has no process")))
            });
            return;
        };

        let done = move |session: &mut Session, status: Result<()>| {
            if status.is_ok() {
                session.forget_process(koid);
            }
            callback(session, status)
        };
        if kill {
            self.remote.kill(
                KillRequest { process_koid: koid },
                Box::new(move |session, reply| {
                    done(session, reply.and_then(|r| check_status(r.status)))
                }),
            );
        } else {
            self.remote.detach(
                DetachRequest { process_koid: koid },
                Box::new(move |session, reply| {
                    done(session, reply.and_then(|r| check_status(r.status)))
                }),
            );
        }
    }

    /// プロセスをターゲットから外す。スレッドとコントローラも破棄される
    fn forget_process(&mut self, process_koid: u64) -> Option<TargetId> {
        let target = self
            .system
            .targets
            .values_mut()
            .find(|t| t.process().map(|p| p.koid()) == Some(process_koid))?;
        target.state = TargetState::None;
        let id = target.id();
        for bp in self.system.breakpoints.values_mut() {
            bp.forget_process(process_koid);
        }
        debug!("Process {} detached from {}", process_koid, id);
        Some(id)
    }

    /// スレッド一覧を取り直す
    pub fn sync_threads(
        &mut self,
        process_koid: u64,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        self.remote.threads(
            ThreadsRequest { process_koid },
            Box::new(move |session, reply| {
                let result = reply.and_then(|reply| {
                    check_status(reply.status)?;
                    let process = session
                        .system
                        .process_mut(process_koid)
                        .ok_or(Error::Abandoned)?;
                    process
                        .threads
                        .retain(|koid, _| reply.threads.iter().any(|r| r.thread_koid == *koid));
                    for record in &reply.threads {
                        session.upsert_thread(record);
                    }
                    Ok(())
                });
                callback(session, result)
            }),
        );
    }

    /// モジュール一覧を取り直す
    pub fn load_modules(
        &mut self,
        process_koid: u64,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        self.remote.modules(
            ModulesRequest { process_koid },
            Box::new(move |session, reply| {
                let result = reply.and_then(|reply| {
                    check_status(reply.status)?;
                    session.set_modules(process_koid, reply.modules)
                });
                callback(session, result)
            }),
        );
    }

    fn set_modules(&mut self, process_koid: u64, modules: Vec<Module>) -> Result<()> {
        for module in &modules {
            self.symbols.module_loaded(module);
        }
        let process = self
            .system
            .process_mut(process_koid)
            .ok_or(Error::Abandoned)?;
        process.modules = modules;
        self.reresolve_breakpoints(process_koid);
        self.notify(SessionEvent::ModulesChanged { process_koid });
        Ok(())
    }

    pub(super) fn on_modules(&mut self, notify: NotifyModules) {
        debug!(
            "Process {} modules changed ({} stopped threads)",
            notify.process_koid,
            notify.stopped_thread_koids.len()
        );
        if let Err(e) = self.set_modules(notify.process_koid, notify.modules) {
            warn!("Modules for unknown process {}: {}", notify.process_koid, e);
        }
    }

    pub(super) fn on_process_exiting(&mut self, notify: NotifyProcessExiting) {
        match self.forget_process(notify.process_koid) {
            Some(target) => {
                info!("Process {} exited with {}", notify.process_koid, notify.return_code);
                self.notify(SessionEvent::ProcessExited {
                    target,
                    process_koid: notify.process_koid,
                    return_code: notify.return_code,
                });
            }
            None => debug!("Exit of untracked process {}", notify.process_koid),
        }
    }

    pub fn process_tree(
        &mut self,
        callback: impl FnOnce(&mut Session, Result<ProcessTreeRecord>) + 'static,
    ) {
        self.remote.process_tree(
            ProcessTreeRequest {},
            Box::new(move |session, reply| {
                let result = reply.and_then(|r| check_status(r.status).map(|()| r.root));
                callback(session, result)
            }),
        );
    }

    pub fn read_memory(
        &mut self,
        process_koid: u64,
        address: u64,
        size: u32,
        callback: impl FnOnce(&mut Session, Result<Vec<MemoryBlock>>) + 'static,
    ) {
        self.remote.read_memory(
            ReadMemoryRequest { process_koid, address, size },
            Box::new(move |session, reply| {
                let result = reply.and_then(|r| check_status(r.status).map(|()| r.blocks));
                callback(session, result)
            }),
        );
    }

    pub fn write_memory(
        &mut self,
        process_koid: u64,
        address: u64,
        data: Vec<u8>,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        self.remote.write_memory(
            WriteMemoryRequest { process_koid, address, data },
            Box::new(move |session, reply| {
                callback(session, reply.and_then(|r| check_status(r.status)))
            }),
        );
    }

    pub fn address_space(
        &mut self,
        process_koid: u64,
        address: u64,
        callback: impl FnOnce(&mut Session, Result<Vec<AddressRegion>>) + 'static,
    ) {
        self.remote.address_space(
            AddressSpaceRequest { process_koid, address },
            Box::new(move |session, reply| {
                let result = reply.and_then(|r| check_status(r.status).map(|()| r.map));
                callback(session, result)
            }),
        );
    }
}
