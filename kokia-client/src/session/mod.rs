//! デバッグセッション
//!
//! エージェントへの RemoteApi、メッセージループ、ターゲット・スレッド・
//! ブレークポイントの状態、イベントの購読者を1か所にまとめます。
//! すべての操作は非同期で、結果はメッセージループから渡されるコールバックで届きます。

mod breakpoints;
mod targets;
mod threads;

use crate::breakpoint::Breakpoint;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::message_loop::MessageLoop;
use crate::observer::{ObserverRegistry, SessionEvent, SessionObserver, SubscriptionId};
use crate::process::Process;
use crate::remote_api::RemoteApi;
use crate::symbols::{ElfSymbols, SymbolService};
use crate::target::{Target, TargetId};
use crate::thread::{Thread, WeakThread};
use kokia_wire::{Arch, HelloRequest, Notification, HELLO_SIGNATURE};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// セッションが持つデバッグ対象全体の状態
#[derive(Debug, Default)]
pub struct System {
    pub(crate) targets: BTreeMap<TargetId, Target>,
    next_target_id: u32,
    pub(crate) breakpoints: BTreeMap<u32, Breakpoint>,
    next_breakpoint_id: u32,
    next_generation: u64,
}

impl System {
    pub(crate) fn allocate_target_id(&mut self) -> TargetId {
        self.next_target_id += 1;
        TargetId(self.next_target_id)
    }

    pub(crate) fn allocate_breakpoint_id(&mut self) -> u32 {
        self.next_breakpoint_id += 1;
        self.next_breakpoint_id
    }

    pub(crate) fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// プロセスを持つターゲット
    pub fn target_for_process(&self, process_koid: u64) -> Option<&Target> {
        self.targets
            .values()
            .find(|t| t.process().map(|p| p.koid()) == Some(process_koid))
    }

    pub fn process(&self, process_koid: u64) -> Option<&Process> {
        self.target_for_process(process_koid)?.process()
    }

    pub(crate) fn process_mut(&mut self, process_koid: u64) -> Option<&mut Process> {
        self.targets
            .values_mut()
            .filter_map(|t| t.process_mut())
            .find(|p| p.koid() == process_koid)
    }

    pub(crate) fn thread_mut(&mut self, weak: &WeakThread) -> Option<&mut Thread> {
        self.process_mut(weak.process_koid)?
            .threads
            .get_mut(&weak.thread_koid)
            .filter(|t| t.weak().generation == weak.generation)
    }
}

pub struct Session {
    remote: Box<dyn RemoteApi>,
    message_loop: MessageLoop,
    config: SessionConfig,
    system: System,
    observers: ObserverRegistry,
    symbols: Box<dyn SymbolService>,
    /// Hello が成功したエージェントのアーキテクチャ
    arch: Option<Arch>,
}

impl Session {
    pub fn new(remote: Box<dyn RemoteApi>, message_loop: MessageLoop, config: SessionConfig) -> Self {
        Self {
            remote,
            message_loop,
            config,
            system: System::default(),
            observers: ObserverRegistry::new(),
            symbols: Box::new(ElfSymbols::new()),
            arch: None,
        }
    }

    pub fn with_symbols(mut self, symbols: Box<dyn SymbolService>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn message_loop(&self) -> &MessageLoop {
        &self.message_loop
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn symbols(&self) -> &dyn SymbolService {
        self.symbols.as_ref()
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch
    }

    pub fn is_connected(&self) -> bool {
        self.arch.is_some()
    }

    /// キューが空になるまでタスクを実行し、実行した数を返す
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Some(task) = self.message_loop.pop() {
            task(self);
            count += 1;
        }
        count
    }

    /// Hello を送り、シグネチャ・バージョン・アーキテクチャを確かめる
    pub fn connect(&mut self, callback: impl FnOnce(&mut Session, Result<Arch>) + 'static) {
        let version = self.config.expected_version;
        self.remote.hello(
            HelloRequest { version },
            Box::new(move |session, reply| {
                let result = reply.and_then(|reply| {
                    if reply.signature != HELLO_SIGNATURE {
                        return Err(Error::Connection(format!(
                            "unexpected hello signature {:#x}",
                            reply.signature
                        )));
                    }
                    if reply.version != version || !reply.status.is_ok() {
                        return Err(Error::VersionMismatch { local: version, remote: reply.version });
                    }
                    if !session.config.accepts(reply.arch) {
                        return Err(Error::UnsupportedArch(reply.arch));
                    }
                    Ok(reply.arch)
                });
                match &result {
                    Ok(arch) => {
                        info!("Connected to agent ({:?})", arch);
                        session.arch = Some(*arch);
                    }
                    Err(e) => warn!("Refusing agent: {}", e),
                }
                callback(session, result)
            }),
        );
    }

    pub fn add_observer(&mut self, observer: Rc<dyn SessionObserver>) -> SubscriptionId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(id)
    }

    /// 通知開始時点の購読者にイベントを配る
    pub(crate) fn notify(&mut self, event: SessionEvent) {
        for id in self.observers.snapshot() {
            if let Some(observer) = self.observers.get(id) {
                observer.on_event(self, &event);
            }
        }
    }

    /// エージェントからの通知を処理する
    pub fn handle_notification(&mut self, notification: Notification) {
        debug!("Notification: {:?}", notification);
        match notification {
            Notification::ProcessExiting(n) => self.on_process_exiting(n),
            Notification::ThreadStarting(n) => self.on_thread_starting(n.record),
            Notification::ThreadExiting(n) => self.on_thread_exiting(n.record),
            Notification::Exception(n) => self.on_exception(n),
            Notification::Modules(n) => self.on_modules(n),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("system", &self.system)
            .field("arch", &self.arch)
            .field("message_loop", &self.message_loop)
            .finish()
    }
}
