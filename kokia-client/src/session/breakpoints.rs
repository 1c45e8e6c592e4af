//! ブレークポイントの解決とエージェントへの同期

use super::Session;
use crate::breakpoint::{Breakpoint, BreakpointScope, InputLocation, InternalBreakpoint, ScopeKind};
use crate::error::{Error, Result};
use crate::target::TargetId;
use crate::thread::WeakThread;
use kokia_wire::{
    AddOrChangeBreakpointRequest, BreakpointSettings, ProcessBreakpointSettings,
    RemoveBreakpointRequest, Status, Stop,
};
use tracing::{debug, warn};

impl Session {
    /// 無効でロケーションのないブレークポイントを作る
    pub fn create_breakpoint(&mut self) -> u32 {
        let id = self.system.allocate_breakpoint_id();
        self.system.breakpoints.insert(id, Breakpoint::new(id));
        id
    }

    pub fn breakpoint(&self, id: u32) -> Option<&Breakpoint> {
        self.system.breakpoints.get(&id)
    }

    fn breakpoint_mut(&mut self, id: u32) -> Result<&mut Breakpoint> {
        self.system
            .breakpoints
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("breakpoint {}", id)))
    }

    pub fn set_breakpoint_scope(
        &mut self,
        id: u32,
        kind: ScopeKind,
        target: Option<TargetId>,
        thread: Option<u64>,
    ) -> Result<()> {
        self.breakpoint_mut(id)?.set_scope(kind, target, thread)?;
        self.resync_if_enabled(id);
        Ok(())
    }

    pub fn set_breakpoint_location(&mut self, id: u32, location: InputLocation) -> Result<()> {
        self.breakpoint_mut(id)?.set_location(location)?;
        self.resync_if_enabled(id);
        Ok(())
    }

    pub fn set_breakpoint_stop_mode(&mut self, id: u32, stop_mode: Stop) -> Result<()> {
        self.breakpoint_mut(id)?.set_stop_mode(stop_mode);
        self.resync_if_enabled(id);
        Ok(())
    }

    pub fn set_breakpoint_one_shot(&mut self, id: u32, one_shot: bool) -> Result<()> {
        self.breakpoint_mut(id)?.set_one_shot(one_shot);
        self.resync_if_enabled(id);
        Ok(())
    }

    /// 有効・無効を切り替える
    ///
    /// 有効にするには解決できるロケーションが1つ以上必要です。
    pub fn set_breakpoint_enabled(
        &mut self,
        id: u32,
        enabled: bool,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        let locations = match self.system.breakpoints.get(&id) {
            Some(bp) => self.resolve_locations(bp),
            None => {
                self.message_loop.post(move |session| {
                    callback(session, Err(Error::NotFound(format!("breakpoint {}", id))))
                });
                return;
            }
        };
        if enabled && locations.is_empty() {
            self.message_loop
                .post(move |session| callback(session, Err(Error::NoResolvableLocation)));
            return;
        }
        if let Some(bp) = self.system.breakpoints.get_mut(&id) {
            bp.enabled = enabled;
        }
        self.sync_breakpoint(id, locations, callback);
    }

    /// 削除する。追加要求を送っていれば応答待ちでも削除要求を送る
    pub fn delete_breakpoint(&mut self, id: u32) -> bool {
        let Some(bp) = self.system.breakpoints.remove(&id) else {
            return false;
        };
        if bp.on_agent {
            self.send_remove(id);
        }
        true
    }

    /// スレッドだけで止まる内部ブレークポイントを置く
    pub fn add_internal_breakpoint(
        &mut self,
        weak: &WeakThread,
        address: u64,
    ) -> Result<InternalBreakpoint> {
        if self.thread(weak).is_none() {
            return Err(Error::NotFound("thread".into()));
        }
        let target = self
            .system
            .target_for_process(weak.process_koid)
            .map(|t| t.id())
            .ok_or_else(|| Error::NotFound("target".into()))?;

        let id = self.system.allocate_breakpoint_id();
        let bp = Breakpoint::new_internal(id, target, weak.thread_koid, address);
        let locations = self.resolve_locations(&bp);
        self.system.breakpoints.insert(id, bp);
        debug!("Internal breakpoint {} at {:#x}", id, address);
        self.sync_breakpoint(id, locations, |_, result| {
            if let Err(e) = result {
                warn!("Internal breakpoint failed: {}", e);
            }
        });
        Ok(InternalBreakpoint::new(id, self.message_loop.clone()))
    }

    pub(crate) fn remove_internal_breakpoint(&mut self, id: u32) {
        if self.breakpoint(id).is_some_and(|bp| bp.is_internal()) {
            debug!("Removing internal breakpoint {}", id);
            self.delete_breakpoint(id);
        }
    }

    /// スコープに含まれるプロセスごとにロケーションを解決する
    pub(crate) fn resolve_locations(&self, bp: &Breakpoint) -> Vec<ProcessBreakpointSettings> {
        let thread_koid = bp.scope().thread_koid().unwrap_or(0);
        let processes = self.system.targets().filter_map(|t| match bp.scope() {
            BreakpointScope::System => t.process(),
            BreakpointScope::Target(id) | BreakpointScope::Thread(id, _) if id == t.id() => {
                t.process()
            }
            _ => None,
        });

        let mut locations = Vec::new();
        for process in processes {
            let addresses = match bp.location() {
                InputLocation::None => Vec::new(),
                InputLocation::Address(address) => vec![*address],
                InputLocation::Symbol(name) => process
                    .modules()
                    .iter()
                    .flat_map(|m| self.symbols.resolve_function(m, name))
                    .collect(),
            };
            locations.extend(addresses.into_iter().map(|address| ProcessBreakpointSettings {
                process_koid: process.koid(),
                thread_koid,
                address,
            }));
        }
        locations
    }

    fn resync_if_enabled(&mut self, id: u32) {
        let Some(bp) = self.system.breakpoints.get(&id).filter(|bp| bp.is_enabled()) else {
            return;
        };
        let locations = self.resolve_locations(bp);
        self.sync_breakpoint(id, locations, move |_, result| {
            if let Err(e) = result {
                warn!("Breakpoint {} update failed: {}", id, e);
            }
        });
    }

    /// モジュールが変わったのでシンボル位置のブレークポイントを解決し直す
    pub(crate) fn reresolve_breakpoints(&mut self, process_koid: u64) {
        let target = self.system.target_for_process(process_koid).map(|t| t.id());
        let ids: Vec<u32> = self
            .system
            .breakpoints()
            .filter(|bp| bp.is_enabled() && matches!(bp.location(), InputLocation::Symbol(_)))
            .filter(|bp| bp.scope().target().is_none() || bp.scope().target() == target)
            .map(|bp| bp.id())
            .collect();

        for id in ids {
            let Some(bp) = self.system.breakpoints.get(&id) else { continue };
            let locations = self.resolve_locations(bp);
            if locations != bp.installed {
                debug!("Breakpoint {} re-resolved to {} locations", id, locations.len());
                self.resync(id, locations);
            }
        }
    }

    fn resync(&mut self, id: u32, locations: Vec<ProcessBreakpointSettings>) {
        self.sync_breakpoint(id, locations, move |_, result| {
            if let Err(e) = result {
                warn!("Breakpoint {} update failed: {}", id, e);
            }
        });
    }

    /// 現在の設定をエージェントに送る（無効かロケーションなしなら削除）
    fn sync_breakpoint(
        &mut self,
        id: u32,
        locations: Vec<ProcessBreakpointSettings>,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        let Some(bp) = self.system.breakpoints.get_mut(&id) else {
            self.message_loop.post(move |session| callback(session, Err(Error::Abandoned)));
            return;
        };

        if !bp.is_enabled() || locations.is_empty() {
            let on_agent = std::mem::take(&mut bp.on_agent);
            bp.installed.clear();
            if on_agent {
                self.send_remove(id);
            }
            self.message_loop.post(move |session| callback(session, Ok(())));
            return;
        }

        bp.on_agent = true;
        let settings = BreakpointSettings {
            breakpoint_id: id,
            stop: bp.stop_mode(),
            one_shot: bp.is_one_shot(),
            locations: locations.clone(),
        };
        self.remote.add_or_change_breakpoint(
            AddOrChangeBreakpointRequest { breakpoint: settings },
            Box::new(move |session, reply| {
                let result = reply.and_then(|reply| {
                    let bp = session
                        .system
                        .breakpoints
                        .get_mut(&id)
                        .ok_or(Error::Abandoned)?;
                    let failed = |loc: &ProcessBreakpointSettings| {
                        reply.location_errors.iter().any(|e| {
                            e.process_koid == loc.process_koid
                                && e.thread_koid == loc.thread_koid
                                && e.address == loc.address
                        })
                    };
                    match reply.status {
                        Status::OK | Status::PARTIAL => {
                            if reply.status == Status::PARTIAL {
                                warn!(
                                    "Breakpoint {}: {} locations failed",
                                    id,
                                    reply.location_errors.len()
                                );
                            }
                            bp.installed = locations.into_iter().filter(|l| !failed(l)).collect();
                            bp.location_errors = reply.location_errors;
                            Ok(())
                        }
                        status => {
                            bp.installed.clear();
                            bp.location_errors = reply.location_errors;
                            Err(Error::Remote(status))
                        }
                    }
                });
                callback(session, result)
            }),
        );
    }

    fn send_remove(&mut self, id: u32) {
        self.remote.remove_breakpoint(
            RemoveBreakpointRequest { breakpoint_id: id },
            Box::new(move |_, reply| match reply {
                Ok(reply) if reply.status.is_ok() || reply.status == Status::NOT_FOUND => {}
                Ok(reply) => warn!("Removing breakpoint {} failed: {}", id, reply.status),
                Err(e) => warn!("Removing breakpoint {} failed: {}", id, e),
            }),
        );
    }
}
