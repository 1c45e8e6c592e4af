//! デバッグエージェント本体
//!
//! クライアントからの要求を処理し、OSイベントを通知に変換します。

use crate::breakpoint::{strongest_stop, Breakpoint};
use crate::config::AgentConfig;
use crate::debugged_process::DebuggedProcess;
use crate::debugged_thread::{ExceptionOutcome, RunMode, SuspendReason};
use crate::remote_api::RequestHandler;
use kokia_target::{ArchProvider, ExceptionKind, OsEvent, Platform};
use kokia_wire::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// デバッグエージェント
pub struct DebugAgent {
    platform: Box<dyn Platform>,
    arch: &'static dyn ArchProvider,
    config: AgentConfig,
    processes: BTreeMap<u64, DebuggedProcess>,
    breakpoints: BTreeMap<u32, Breakpoint>,
}

impl DebugAgent {
    pub fn new(
        platform: Box<dyn Platform>,
        arch: &'static dyn ArchProvider,
        config: AgentConfig,
    ) -> Self {
        Self {
            platform,
            arch,
            config,
            processes: BTreeMap::new(),
            breakpoints: BTreeMap::new(),
        }
    }

    pub fn process(&self, koid: u64) -> Option<&DebuggedProcess> {
        self.processes.get(&koid)
    }

    pub fn process_koids(&self) -> Vec<u64> {
        self.processes.keys().copied().collect()
    }

    pub fn breakpoint(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// 溜まっているOSイベントを処理し、通知をストリームへ書き込む
    pub fn handle_os_events(&mut self, stream: &mut Stream) {
        for event in self.platform.poll_events() {
            self.handle_event(event, stream);
        }
    }

    pub fn handle_event(&mut self, event: OsEvent, stream: &mut Stream) {
        debug!("OS event: {:?}", event);
        match event {
            OsEvent::ThreadStarting { pid, tid } => self.on_thread_starting(pid, tid, stream),
            OsEvent::ThreadExited { pid, tid } => self.on_thread_exited(pid, tid, stream),
            OsEvent::ProcessExited { pid, code } => self.on_process_exited(pid, code, stream),
            OsEvent::Exception { pid, tid, kind } => self.on_exception(pid, tid, kind, stream),
            OsEvent::Stopped { pid, tid } => {
                if let Some(process) = self.processes.get_mut(&pid) {
                    if let Err(e) = process.on_stopped(tid) {
                        warn!("Failed to handle stop of thread {}: {}", tid, e);
                    }
                }
            }
        }
    }

    fn on_thread_starting(&mut self, pid: u64, tid: u64, stream: &mut Stream) {
        let Some(process) = self.processes.get_mut(&pid) else {
            debug!("Thread {} started in unknown process {}", tid, pid);
            return;
        };
        process.add_thread(tid);
        if let Some(record) = process.thread_record(tid, self.arch, StackAmount::None, 0) {
            send(stream, &NotifyThreadStarting { record });
        }
    }

    fn on_thread_exited(&mut self, pid: u64, tid: u64, stream: &mut Stream) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if process.remove_thread(tid).is_none() {
            return;
        }
        let record = ThreadRecord {
            process_koid: pid,
            thread_koid: tid,
            state: ThreadState::Dead,
            ..Default::default()
        };
        send(stream, &NotifyThreadExiting { record });
    }

    fn on_process_exited(&mut self, pid: u64, code: i64, stream: &mut Stream) {
        if self.processes.remove(&pid).is_none() {
            return;
        }
        info!("Process {} exited with {}", pid, code);
        // 終了したプロセスのロケーションは捨てる
        for bp in self.breakpoints.values_mut() {
            let mut settings = bp.settings().clone();
            settings.locations.retain(|loc| loc.process_koid != pid);
            bp.set_settings(settings);
        }
        send(stream, &NotifyProcessExiting { process_koid: pid, return_code: code });
    }

    fn on_exception(&mut self, pid: u64, tid: u64, kind: ExceptionKind, stream: &mut Stream) {
        let arch = self.arch;
        let Some(process) = self.processes.get_mut(&pid) else {
            warn!("Exception in unknown process {}", pid);
            return;
        };
        let outcome = match process.on_exception(tid, kind, arch) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to handle exception of thread {}: {}", tid, e);
                return;
            }
        };

        let (exception_type, breakpoint_address) = match outcome {
            ExceptionOutcome::Resumed => return,
            ExceptionOutcome::Notify { exception_type, breakpoint_address } => {
                (exception_type, breakpoint_address)
            }
        };

        let mut hits = Vec::new();
        let mut stops = Vec::new();
        if let Some(address) = breakpoint_address {
            let ids = process
                .breakpoints()
                .get(address)
                .map(|bp| bp.breakpoints_for_thread(tid))
                .unwrap_or_default();
            for id in ids {
                if let Some(bp) = self.breakpoints.get_mut(&id) {
                    stops.push(bp.stop());
                    hits.push(bp.on_hit());
                }
            }
            if hits.is_empty() {
                // 他のスレッド向けのブレークポイント
                debug!("Thread {} passed a breakpoint at 0x{:x} for other threads", tid, address);
                if let Err(e) = process.continue_thread(tid, arch) {
                    warn!("Failed to continue thread {}: {}", tid, e);
                }
                return;
            }
        }

        // ブレークポイント以外の停止は当該スレッドだけ
        match strongest_stop(stops).unwrap_or(Stop::Thread) {
            Stop::All => {
                for (koid, other) in self.processes.iter_mut() {
                    if *koid == pid {
                        other.pause_all_except(tid);
                    } else {
                        other.pause(0);
                    }
                }
            }
            Stop::Process => process.pause_all_except(tid),
            Stop::Thread => {}
        }

        for stats in hits.iter().filter(|s| s.should_delete) {
            debug!("Deleting one-shot breakpoint {}", stats.breakpoint_id);
            self.delete_breakpoint(stats.breakpoint_id);
        }

        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if let Some(modules) = process.refresh_modules() {
            send(
                stream,
                &NotifyModules {
                    process_koid: pid,
                    modules,
                    stopped_thread_koids: process.suspended_thread_koids(),
                },
            );
        }
        let thread = process
            .thread_record(tid, arch, StackAmount::Minimal, self.config.max_backtrace_frames)
            .unwrap_or_default();
        send(
            stream,
            &NotifyException {
                process_koid: pid,
                thread,
                exception_type,
                hit_breakpoints: hits,
            },
        );
    }

    /// 論理ブレークポイントとその全ロケーションを削除する
    fn delete_breakpoint(&mut self, id: u32) -> bool {
        let Some(bp) = self.breakpoints.remove(&id) else {
            return false;
        };
        for loc in bp.locations() {
            if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                process.remove_breakpoint_location(id, loc.thread_koid, loc.address);
            }
        }
        true
    }

    fn pause_targets(&mut self, process_koid: u64) -> Vec<&mut DebuggedProcess> {
        if process_koid == 0 {
            self.processes.values_mut().collect()
        } else {
            self.processes.get_mut(&process_koid).into_iter().collect()
        }
    }

    /// スレッドが存在し停止していることを確認する
    fn check_suspended(&self, process_koid: u64, thread_koid: u64) -> Result<&DebuggedProcess, Status> {
        let process = self.processes.get(&process_koid).ok_or(Status::NOT_FOUND)?;
        let thread = process.thread(thread_koid).ok_or(Status::NOT_FOUND)?;
        if !thread.is_suspended() {
            return Err(Status::BAD_STATE);
        }
        Ok(process)
    }
}

fn send<M: Message>(stream: &mut Stream, message: &M) {
    stream.write(&encode_message(message, 0));
}

impl RequestHandler for DebugAgent {
    fn on_hello(&mut self, request: HelloRequest) -> HelloReply {
        let status = if request.version == PROTOCOL_VERSION {
            Status::OK
        } else {
            warn!(
                "Client protocol version {} does not match {}",
                request.version, PROTOCOL_VERSION
            );
            Status::VERSION_MISMATCH
        };
        HelloReply {
            status,
            signature: HELLO_SIGNATURE,
            version: PROTOCOL_VERSION,
            arch: self.arch.arch(),
        }
    }

    fn on_launch(&mut self, request: LaunchRequest) -> LaunchReply {
        if request.argv.is_empty() {
            return LaunchReply { status: Status::INVALID_ARGS, ..Default::default() };
        }
        let handle = match self.platform.launch(&request.argv) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to launch {:?}: {}", request.argv, e);
                return LaunchReply { status: Status::IO, ..Default::default() };
            }
        };
        match DebuggedProcess::new(handle, SuspendReason::Other) {
            Ok(process) => {
                let reply = LaunchReply {
                    status: Status::OK,
                    process_koid: process.koid(),
                    process_name: process.name(),
                };
                info!("Launched {} ({})", reply.process_name, reply.process_koid);
                self.processes.insert(process.koid(), process);
                reply
            }
            Err(e) => {
                warn!("Failed to enumerate threads of launched process: {}", e);
                LaunchReply { status: Status::IO, ..Default::default() }
            }
        }
    }

    fn on_kill(&mut self, request: KillRequest) -> KillReply {
        let Some(process) = self.processes.get(&request.process_koid) else {
            return KillReply { status: Status::NOT_FOUND };
        };
        // 実際の削除は終了イベントで行う
        match process.kill() {
            Ok(()) => KillReply { status: Status::OK },
            Err(e) => {
                warn!("Failed to kill {}: {}", request.process_koid, e);
                KillReply { status: Status::IO }
            }
        }
    }

    fn on_attach(&mut self, transaction_id: u32, bytes: &[u8], stream: &mut Stream) {
        let request = match decode_message::<AttachRequest>(bytes) {
            Ok((_, request)) => request,
            Err(e) => {
                warn!("Dropping malformed Attach request: {}", e);
                return;
            }
        };

        if self.processes.contains_key(&request.koid) {
            let reply = AttachReply { status: Status::ALREADY_EXISTS, ..Default::default() };
            stream.write(&encode_message(&reply, transaction_id));
            return;
        }

        let process = self
            .platform
            .attach(request.koid)
            .and_then(|handle| DebuggedProcess::new(handle, SuspendReason::Other));
        let process = match process {
            Ok(process) => process,
            Err(e) => {
                warn!("Failed to attach to {}: {}", request.koid, e);
                let reply = AttachReply { status: Status::IO, ..Default::default() };
                stream.write(&encode_message(&reply, transaction_id));
                return;
            }
        };

        let reply = AttachReply {
            status: Status::OK,
            process_koid: process.koid(),
            process_name: process.name(),
        };
        info!("Attached to {} ({})", reply.process_name, reply.process_koid);
        stream.write(&encode_message(&reply, transaction_id));

        for record in process.thread_records(self.arch, StackAmount::None, 0) {
            send(stream, &NotifyThreadStarting { record });
        }
        self.processes.insert(process.koid(), process);
    }

    fn on_detach(&mut self, request: DetachRequest) -> DetachReply {
        let Some(process) = self.processes.remove(&request.process_koid) else {
            return DetachReply { status: Status::NOT_FOUND };
        };
        match process.detach() {
            Ok(()) => DetachReply { status: Status::OK },
            Err(e) => {
                warn!("Failed to detach from {}: {}", request.process_koid, e);
                DetachReply { status: Status::IO }
            }
        }
    }

    fn on_modules(&mut self, request: ModulesRequest) -> ModulesReply {
        let Some(process) = self.processes.get_mut(&request.process_koid) else {
            return ModulesReply { status: Status::NOT_FOUND, modules: Vec::new() };
        };
        match process.load_modules() {
            Ok(modules) => ModulesReply { status: Status::OK, modules },
            Err(e) => {
                warn!("Failed to read modules of {}: {}", request.process_koid, e);
                ModulesReply { status: Status::IO, modules: Vec::new() }
            }
        }
    }

    fn on_pause(&mut self, request: PauseRequest) -> PauseReply {
        let targets = self.pause_targets(request.process_koid);
        if targets.is_empty() && request.process_koid != 0 {
            return PauseReply { status: Status::NOT_FOUND };
        }
        for process in targets {
            process.pause(request.thread_koid);
        }
        PauseReply { status: Status::OK }
    }

    fn on_resume(&mut self, request: ResumeRequest) -> ResumeReply {
        if request.how == ResumeHow::StepInRange && request.range_begin >= request.range_end {
            return ResumeReply { status: Status::INVALID_ARGS };
        }
        let mode = RunMode::from_request(request.how, request.range_begin, request.range_end);
        let arch = self.arch;

        if request.process_koid == 0 {
            for process in self.processes.values_mut() {
                process.resume(&[], mode, arch);
            }
            return ResumeReply { status: Status::OK };
        }

        let Some(process) = self.processes.get_mut(&request.process_koid) else {
            return ResumeReply { status: Status::NOT_FOUND };
        };
        process.resume(&request.thread_koids, mode, arch);
        ResumeReply { status: Status::OK }
    }

    fn on_process_tree(&mut self, _request: ProcessTreeRequest) -> ProcessTreeReply {
        match self.platform.process_tree() {
            Ok(root) => ProcessTreeReply { status: Status::OK, root },
            Err(e) => {
                warn!("Failed to build process tree: {}", e);
                ProcessTreeReply { status: Status::IO, ..Default::default() }
            }
        }
    }

    fn on_threads(&mut self, request: ThreadsRequest) -> ThreadsReply {
        let Some(process) = self.processes.get(&request.process_koid) else {
            return ThreadsReply { status: Status::NOT_FOUND, threads: Vec::new() };
        };
        ThreadsReply {
            status: Status::OK,
            threads: process.thread_records(self.arch, StackAmount::Minimal, 0),
        }
    }

    fn on_read_memory(&mut self, request: ReadMemoryRequest) -> ReadMemoryReply {
        let Some(process) = self.processes.get(&request.process_koid) else {
            return ReadMemoryReply { status: Status::NOT_FOUND, blocks: Vec::new() };
        };
        if request.size > MAX_READ_MEMORY_SIZE {
            debug!("ReadMemory of {} bytes exceeds the limit", request.size);
            return ReadMemoryReply { status: Status::INVALID_ARGS, blocks: Vec::new() };
        }
        ReadMemoryReply {
            status: Status::OK,
            blocks: process.read_memory(request.address, request.size),
        }
    }

    fn on_write_memory(&mut self, request: WriteMemoryRequest) -> WriteMemoryReply {
        let Some(process) = self.processes.get(&request.process_koid) else {
            return WriteMemoryReply { status: Status::NOT_FOUND };
        };
        match process.write_memory(request.address, &request.data) {
            Ok(()) => WriteMemoryReply { status: Status::OK },
            Err(e) => {
                debug!("WriteMemory at 0x{:x} failed: {}", request.address, e);
                WriteMemoryReply { status: Status::IO }
            }
        }
    }

    fn on_read_registers(&mut self, request: ReadRegistersRequest) -> ReadRegistersReply {
        let process = match self.check_suspended(request.process_koid, request.thread_koid) {
            Ok(process) => process,
            Err(status) => return ReadRegistersReply { status, registers: Vec::new() },
        };
        match process.read_registers(request.thread_koid) {
            Ok(registers) => ReadRegistersReply { status: Status::OK, registers },
            Err(e) => {
                warn!("Failed to read registers of {}: {}", request.thread_koid, e);
                ReadRegistersReply { status: Status::IO, registers: Vec::new() }
            }
        }
    }

    fn on_write_registers(&mut self, request: WriteRegistersRequest) -> WriteRegistersReply {
        if let Err(status) = self.check_suspended(request.process_koid, request.thread_koid) {
            return WriteRegistersReply { status };
        }
        let arch = self.arch;
        let Some(process) = self.processes.get_mut(&request.process_koid) else {
            return WriteRegistersReply { status: Status::NOT_FOUND };
        };
        match process.write_registers(request.thread_koid, &request.registers, arch) {
            Ok(()) => WriteRegistersReply { status: Status::OK },
            Err(e) => {
                warn!("Failed to write registers of {}: {}", request.thread_koid, e);
                WriteRegistersReply { status: Status::IO }
            }
        }
    }

    fn on_add_or_change_breakpoint(
        &mut self,
        request: AddOrChangeBreakpointRequest,
    ) -> AddOrChangeBreakpointReply {
        let mut settings = request.breakpoint;
        let id = settings.breakpoint_id;
        if id == 0 || settings.locations.is_empty() {
            return AddOrChangeBreakpointReply {
                status: Status::INVALID_ARGS,
                location_errors: Vec::new(),
            };
        }

        let previous: Vec<ProcessBreakpointSettings> = self
            .breakpoints
            .get(&id)
            .map(|bp| bp.locations().to_vec())
            .unwrap_or_default();

        for loc in previous.iter().filter(|loc| !settings.locations.contains(loc)) {
            if let Some(process) = self.processes.get_mut(&loc.process_koid) {
                process.remove_breakpoint_location(id, loc.thread_koid, loc.address);
            }
        }

        let arch = self.arch;
        let mut applied = Vec::new();
        let mut location_errors = Vec::new();
        for loc in settings.locations.drain(..) {
            if applied.contains(&loc) {
                continue;
            }
            if previous.contains(&loc) {
                applied.push(loc);
                continue;
            }
            let result = match self.processes.get_mut(&loc.process_koid) {
                None => Err(Status::NOT_FOUND),
                Some(process) => process
                    .add_breakpoint_location(id, loc.thread_koid, loc.address, arch)
                    .map_err(|e| {
                        warn!("Failed to install breakpoint at 0x{:x}: {}", loc.address, e);
                        Status::IO
                    }),
            };
            match result {
                Ok(()) => applied.push(loc),
                Err(status) => location_errors.push(LocationError {
                    process_koid: loc.process_koid,
                    thread_koid: loc.thread_koid,
                    address: loc.address,
                    status,
                }),
            }
        }

        if applied.is_empty() {
            self.breakpoints.remove(&id);
            let status = location_errors.first().map(|e| e.status).unwrap_or(Status::INVALID_ARGS);
            return AddOrChangeBreakpointReply { status, location_errors };
        }

        settings.locations = applied;
        match self.breakpoints.get_mut(&id) {
            Some(bp) => bp.set_settings(settings),
            None => {
                self.breakpoints.insert(id, Breakpoint::new(settings));
            }
        }

        let status = if location_errors.is_empty() { Status::OK } else { Status::PARTIAL };
        AddOrChangeBreakpointReply { status, location_errors }
    }

    fn on_remove_breakpoint(&mut self, request: RemoveBreakpointRequest) -> RemoveBreakpointReply {
        if self.delete_breakpoint(request.breakpoint_id) {
            RemoveBreakpointReply { status: Status::OK }
        } else {
            RemoveBreakpointReply { status: Status::NOT_FOUND }
        }
    }

    fn on_backtrace(&mut self, request: BacktraceRequest) -> BacktraceReply {
        let process = match self.check_suspended(request.process_koid, request.thread_koid) {
            Ok(process) => process,
            Err(status) => return BacktraceReply { status, frames: Vec::new() },
        };
        match process.backtrace(request.thread_koid, self.arch, self.config.max_backtrace_frames) {
            Ok(frames) => BacktraceReply { status: Status::OK, frames },
            Err(e) => {
                warn!("Failed to unwind thread {}: {}", request.thread_koid, e);
                BacktraceReply { status: Status::IO, frames: Vec::new() }
            }
        }
    }

    fn on_address_space(&mut self, request: AddressSpaceRequest) -> AddressSpaceReply {
        let Some(process) = self.processes.get(&request.process_koid) else {
            return AddressSpaceReply { status: Status::NOT_FOUND, map: Vec::new() };
        };
        match process.handle().address_space() {
            Ok(mut map) => {
                if request.address != 0 {
                    map.retain(|r| r.base <= request.address && request.address - r.base < r.size);
                }
                AddressSpaceReply { status: Status::OK, map }
            }
            Err(e) => {
                warn!("Failed to read address space of {}: {}", request.process_koid, e);
                AddressSpaceReply { status: Status::IO, map: Vec::new() }
            }
        }
    }
}
