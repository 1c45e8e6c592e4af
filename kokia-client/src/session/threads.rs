//! スレッドの停止・再開とコントローラの駆動

use super::Session;
use crate::breakpoint::strongest_stop;
use crate::controller::{ContinueOp, StopOp, ThreadController};
use crate::error::{check_status, Error, Result};
use crate::observer::SessionEvent;
use crate::stack::Frame;
use crate::thread::{StopInfo, Thread, WeakThread};
use kokia_wire::{
    BacktraceRequest, NotifyException, PauseRequest, ReadRegistersRequest, Register,
    ResumeHow, ResumeRequest, Stop, ThreadRecord, WriteRegistersRequest,
};
use tracing::{debug, info, warn};

impl Session {
    /// 弱い参照からスレッドを引く（世代が違えば None）
    pub fn thread(&self, weak: &WeakThread) -> Option<&Thread> {
        self.system
            .process(weak.process_koid)?
            .thread(weak.thread_koid)
            .filter(|t| t.weak().generation == weak.generation)
    }

    /// koid からスレッドを引く
    pub fn find_thread(&self, process_koid: u64, thread_koid: u64) -> Option<&Thread> {
        self.system.process(process_koid)?.thread(thread_koid)
    }

    /// レコードでスレッドを更新し、なければ作る
    pub(crate) fn upsert_thread(&mut self, record: &ThreadRecord) -> Option<(WeakThread, bool)> {
        let generation = self.system.allocate_generation();
        let process = self.system.process_mut(record.process_koid)?;
        if let Some(thread) = process.threads.get_mut(&record.thread_koid) {
            thread.update(record);
            return Some((thread.weak(), false));
        }
        let thread = Thread::new(record, generation);
        let weak = thread.weak();
        process.threads.insert(record.thread_koid, thread);
        Some((weak, true))
    }

    pub(super) fn on_thread_starting(&mut self, record: ThreadRecord) {
        match self.upsert_thread(&record) {
            Some((weak, true)) => {
                debug!("Thread {} started in process {}", record.thread_koid, record.process_koid);
                self.notify(SessionEvent::ThreadStarting(weak));
            }
            Some((_, false)) => {}
            None => warn!(
                "Thread {} started in unknown process {}",
                record.thread_koid, record.process_koid
            ),
        }
    }

    pub(super) fn on_thread_exiting(&mut self, record: ThreadRecord) {
        let removed = self
            .system
            .process_mut(record.process_koid)
            .and_then(|p| p.threads.remove(&record.thread_koid));
        // コントローラはここで破棄され、置いたブレークポイントの削除が投入される
        if let Some(thread) = removed {
            debug!("Thread {} exited", record.thread_koid);
            self.notify(SessionEvent::ThreadExiting(thread.weak()));
        }
    }

    pub(super) fn on_exception(&mut self, notify: NotifyException) {
        let Some((weak, _)) = self.upsert_thread(&notify.thread) else {
            warn!("Exception in unknown process {}", notify.process_koid);
            return;
        };

        let mut hit_ids = Vec::new();
        let mut user_modes = Vec::new();
        for stats in &notify.hit_breakpoints {
            hit_ids.push(stats.breakpoint_id);
            let Some(bp) = self.system.breakpoints.get_mut(&stats.breakpoint_id) else {
                continue;
            };
            bp.hit_count = stats.hit_count;
            if !bp.is_internal() {
                user_modes.push(bp.stop_mode());
            }
            if stats.should_delete {
                debug!("One-shot breakpoint {} deleted by agent", stats.breakpoint_id);
                self.system.breakpoints.remove(&stats.breakpoint_id);
            }
        }
        let user_hit = !user_modes.is_empty();

        let stop = StopInfo {
            exception_type: notify.exception_type,
            hit_breakpoints: hit_ids,
            stop_mode: strongest_stop(user_modes).unwrap_or(Stop::Thread),
        };

        let controller = match self.system.thread_mut(&weak) {
            Some(thread) => {
                thread.last_stop = Some(stop.clone());
                thread.controller.take()
            }
            None => return,
        };

        match controller {
            Some(mut controller) if !user_hit => {
                let op = controller.on_thread_stop(self, &weak, &stop);
                self.apply_stop_op(&weak, controller, op, stop);
            }
            Some(controller) => {
                info!("{} abandoned by a breakpoint hit", controller.name());
                drop(controller);
                self.notify(SessionEvent::ThreadStopped { thread: weak, stop });
            }
            None if !stop.hit_breakpoints.is_empty() && !user_hit => {
                // 持ち主のいない内部ブレークポイント
                debug!("Ignoring internal breakpoint hit on thread {}", weak.thread_koid);
                self.resume_thread(&weak, ContinueOp::Continue);
            }
            None => self.notify(SessionEvent::ThreadStopped { thread: weak, stop }),
        }
    }

    /// コントローラの判断に従ってスレッドを再開するか停止を見せる
    fn apply_stop_op(
        &mut self,
        weak: &WeakThread,
        controller: Box<dyn ThreadController>,
        op: StopOp,
        stop: StopInfo,
    ) {
        match op {
            StopOp::Continue => {
                let op = controller.continue_op();
                debug!("{} continues thread {}", controller.name(), weak.thread_koid);
                if let Some(thread) = self.system.thread_mut(weak) {
                    thread.controller = Some(controller);
                    self.resume_thread(weak, op);
                }
            }
            StopOp::Wait => {
                debug!("{} waits on thread {}", controller.name(), weak.thread_koid);
                if let Some(thread) = self.system.thread_mut(weak) {
                    thread.controller = Some(controller);
                }
            }
            StopOp::Stop => {
                debug!("{} finished on thread {}", controller.name(), weak.thread_koid);
                drop(controller);
                self.notify(SessionEvent::ThreadStopped { thread: *weak, stop });
            }
        }
    }

    /// コントローラの代わりに停止中のスレッドのメモリを読む
    ///
    /// 結果はスレッドに付いているコントローラの `on_memory_read` に渡します。
    /// その前にコントローラが外れたりスレッドが再開したりしていれば捨てます。
    pub fn read_memory_for_controller(&mut self, weak: &WeakThread, address: u64, size: u32) {
        let weak = *weak;
        self.read_memory(weak.process_koid, address, size, move |session, result| {
            let Some(thread) = session.system.thread_mut(&weak) else {
                return;
            };
            let Some(stop) = thread.last_stop.clone() else {
                debug!("Thread {} resumed before the read at {:#x}", weak.thread_koid, address);
                return;
            };
            let Some(mut controller) = thread.controller.take() else {
                debug!("No controller for the read at {:#x}", address);
                return;
            };
            let op = controller.on_memory_read(session, &weak, address, result);
            session.apply_stop_op(&weak, controller, op, stop);
        });
    }

    /// 1スレッドを再開する。フレームはここで捨てる
    pub(crate) fn resume_thread(&mut self, weak: &WeakThread, op: ContinueOp) {
        let Some(thread) = self.system.thread_mut(weak) else {
            return;
        };
        thread.mark_running();

        let (how, range_begin, range_end) = match op {
            ContinueOp::Continue => (ResumeHow::Continue, 0, 0),
            ContinueOp::StepInstruction => (ResumeHow::StepInstruction, 0, 0),
            ContinueOp::StepInRange { begin, end } => (ResumeHow::StepInRange, begin, end),
        };
        self.remote.resume(
            ResumeRequest {
                process_koid: weak.process_koid,
                thread_koids: vec![weak.thread_koid],
                how,
                range_begin,
                range_end,
            },
            Box::new(|_, reply| {
                if let Err(e) = reply.and_then(|r| check_status(r.status)) {
                    warn!("Resume failed: {}", e);
                }
            }),
        );
    }

    /// バックトレース全体を取得する
    pub fn sync_frames(
        &mut self,
        weak: &WeakThread,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        if self.thread(weak).is_none() {
            self.message_loop
                .post(move |session| callback(session, Err(Error::NotFound("thread".into()))));
            return;
        }
        let weak = *weak;
        self.remote.backtrace(
            BacktraceRequest {
                process_koid: weak.process_koid,
                thread_koid: weak.thread_koid,
            },
            Box::new(move |session, reply| {
                let result = reply.and_then(|reply| {
                    check_status(reply.status)?;
                    let thread = session.system.thread_mut(&weak).ok_or(Error::Abandoned)?;
                    let frames = reply.frames.iter().map(Frame::from).collect();
                    thread.stack_mut().set_frames(frames, true);
                    Ok(())
                });
                callback(session, result)
            }),
        );
    }

    /// コントローラを付けてスレッドを再開する
    ///
    /// コントローラが全フレームを必要とする場合は先に取得します。
    pub fn continue_with(
        &mut self,
        weak: &WeakThread,
        controller: Box<dyn ThreadController>,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        let Some(thread) = self.thread(weak) else {
            self.message_loop
                .post(move |session| callback(session, Err(Error::NotFound("thread".into()))));
            return;
        };
        if !thread.is_suspended() {
            self.message_loop
                .post(move |session| callback(session, Err(Error::BadState("thread is not stopped"))));
            return;
        }

        if controller.needs_full_stack() && !thread.stack().has_all_frames() {
            let weak = *weak;
            self.sync_frames(&weak, move |session, result| match result {
                Ok(()) => session.start_controller(&weak, controller, callback),
                Err(e) => callback(session, Err(e)),
            });
            return;
        }
        self.start_controller(weak, controller, callback);
    }

    fn start_controller(
        &mut self,
        weak: &WeakThread,
        mut controller: Box<dyn ThreadController>,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        if let Err(e) = controller.init_with_thread(self, weak) {
            warn!("{} could not start: {}", controller.name(), e);
            self.message_loop.post(move |session| callback(session, Err(e)));
            return;
        }
        let op = controller.continue_op();
        debug!("Starting {} on thread {}", controller.name(), weak.thread_koid);
        match self.system.thread_mut(weak) {
            Some(thread) => thread.controller = Some(controller),
            None => {
                self.message_loop
                    .post(move |session| callback(session, Err(Error::Abandoned)));
                return;
            }
        }
        self.resume_thread(weak, op);
        self.message_loop.post(move |session| callback(session, Ok(())));
    }

    /// 実行中のコントローラを捨てる（置いたブレークポイントも消える）
    pub fn cancel_controller(&mut self, weak: &WeakThread) -> bool {
        self.system
            .thread_mut(weak)
            .and_then(|t| t.controller.take())
            .is_some()
    }

    /// 直近の停止の停止範囲に合わせて再開する
    ///
    /// All なら全プロセス、Process ならそのプロセス、Thread ならそのスレッドだけ。
    pub fn continue_after_stop(&mut self, weak: &WeakThread) -> Result<()> {
        let thread = self.thread(weak).ok_or_else(|| Error::NotFound("thread".into()))?;
        if !thread.is_suspended() {
            return Err(Error::BadState("thread is not stopped"));
        }
        let stop_mode = thread.last_stop().map(|s| s.stop_mode).unwrap_or(Stop::Thread);

        let (process_koid, thread_koids) = match stop_mode {
            Stop::All => (0, Vec::new()),
            Stop::Process => (weak.process_koid, Vec::new()),
            Stop::Thread => (weak.process_koid, vec![weak.thread_koid]),
        };
        for target in self.system.targets.values_mut() {
            let Some(process) = target.process_mut() else { continue };
            if process_koid != 0 && process.koid() != process_koid {
                continue;
            }
            for thread in process.threads.values_mut() {
                if thread_koids.is_empty() || thread_koids.contains(&thread.koid()) {
                    thread.mark_running();
                }
            }
        }

        self.remote.resume(
            ResumeRequest {
                process_koid,
                thread_koids,
                how: ResumeHow::Continue,
                range_begin: 0,
                range_end: 0,
            },
            Box::new(|_, reply| {
                if let Err(e) = reply.and_then(|r| check_status(r.status)) {
                    warn!("Resume failed: {}", e);
                }
            }),
        );
        Ok(())
    }

    /// スレッドを一時停止する。状態は停止通知かスレッド一覧の再取得で更新される
    pub fn pause_thread(
        &mut self,
        weak: &WeakThread,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        self.pause(weak.process_koid, weak.thread_koid, callback)
    }

    /// すべてのプロセスを一時停止する
    pub fn pause_all(&mut self, callback: impl FnOnce(&mut Session, Result<()>) + 'static) {
        self.pause(0, 0, callback)
    }

    fn pause(
        &mut self,
        process_koid: u64,
        thread_koid: u64,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        self.remote.pause(
            PauseRequest { process_koid, thread_koid },
            Box::new(move |session, reply| {
                callback(session, reply.and_then(|r| check_status(r.status)))
            }),
        );
    }

    pub fn read_registers(
        &mut self,
        weak: &WeakThread,
        callback: impl FnOnce(&mut Session, Result<Vec<Register>>) + 'static,
    ) {
        self.remote.read_registers(
            ReadRegistersRequest {
                process_koid: weak.process_koid,
                thread_koid: weak.thread_koid,
            },
            Box::new(move |session, reply| {
                let result = reply.and_then(|r| check_status(r.status).map(|()| r.registers));
                callback(session, result)
            }),
        );
    }

    /// レジスタを書き換える。成功したらフレームは古くなるので捨てる
    pub fn write_registers(
        &mut self,
        weak: &WeakThread,
        registers: Vec<Register>,
        callback: impl FnOnce(&mut Session, Result<()>) + 'static,
    ) {
        let weak = *weak;
        self.remote.write_registers(
            WriteRegistersRequest {
                process_koid: weak.process_koid,
                thread_koid: weak.thread_koid,
                registers,
            },
            Box::new(move |session, reply| {
                let result = reply.and_then(|r| check_status(r.status));
                if result.is_ok() {
                    if let Some(thread) = session.system.thread_mut(&weak) {
                        thread.stack_mut().clear_frames();
                    }
                }
                callback(session, result)
            }),
        );
    }
}
