//! テスト用の RemoteApi
//!
//! 要求を記録し、設定された内容で即座に応答します。応答もメッセージループ経由で
//! 届くので、呼び出しの中でコールバックが走ることはありません。

use crate::message_loop::MessageLoop;
use crate::remote_api::{Callback, RemoteApi};
use kokia_wire::*;
use std::cell::RefCell;
use std::rc::Rc;

/// モックが記録する状態と返す内容
#[derive(Debug, Default)]
pub struct MockState {
    pub resume_count: usize,
    pub pause_count: usize,
    pub breakpoint_add_count: usize,
    pub breakpoint_remove_count: usize,
    pub last_breakpoint_id: u32,
    /// 直近に追加されたブレークポイントの先頭ロケーション
    pub last_breakpoint_address: u64,
    pub last_breakpoint: Option<BreakpointSettings>,
    pub last_resume: Option<ResumeRequest>,
    /// 受け取った要求の種類（順番通り）
    pub requests: Vec<MsgType>,

    pub arch: Option<Arch>,
    pub version: Option<u32>,
    /// 次の起動・アタッチで返すプロセス
    pub process_koid: u64,
    pub process_name: String,
    pub threads: Vec<ThreadRecord>,
    pub modules: Vec<Module>,
    pub frames: Vec<StackFrame>,
    pub registers: Vec<Register>,
    pub memory: Vec<MemoryBlock>,
    /// 次のブレークポイント追加の応答
    pub breakpoint_status: Status,
    pub location_errors: Vec<LocationError>,
}

/// 呼び出しを記録するモック
#[derive(Clone, Default)]
pub struct MockRemoteApi {
    state: Rc<RefCell<MockState>>,
    message_loop: MessageLoop,
}

impl MockRemoteApi {
    pub fn new(message_loop: MessageLoop) -> Self {
        Self {
            state: Rc::default(),
            message_loop,
        }
    }

    pub fn state(&self) -> Rc<RefCell<MockState>> {
        self.state.clone()
    }

    fn record(&self, msg_type: MsgType) {
        self.state.borrow_mut().requests.push(msg_type);
    }

    fn reply<T: 'static>(&self, callback: Callback<T>, reply: T) {
        self.message_loop.post(move |session| callback(session, Ok(reply)));
    }
}

impl RemoteApi for MockRemoteApi {
    fn hello(&mut self, _request: HelloRequest, callback: Callback<HelloReply>) {
        self.record(MsgType::Hello);
        let state = self.state.borrow();
        let reply = HelloReply {
            status: Status::OK,
            signature: HELLO_SIGNATURE,
            version: state.version.unwrap_or(PROTOCOL_VERSION),
            arch: state.arch.unwrap_or(Arch::X64),
        };
        drop(state);
        self.reply(callback, reply);
    }

    fn launch(&mut self, _request: LaunchRequest, callback: Callback<LaunchReply>) {
        self.record(MsgType::Launch);
        let state = self.state.borrow();
        let reply = LaunchReply {
            status: Status::OK,
            process_koid: state.process_koid,
            process_name: state.process_name.clone(),
        };
        drop(state);
        self.reply(callback, reply);
    }

    fn kill(&mut self, _request: KillRequest, callback: Callback<KillReply>) {
        self.record(MsgType::Kill);
        self.reply(callback, KillReply { status: Status::OK });
    }

    fn attach(&mut self, request: AttachRequest, callback: Callback<AttachReply>) {
        self.record(MsgType::Attach);
        let name = self.state.borrow().process_name.clone();
        self.reply(
            callback,
            AttachReply {
                status: Status::OK,
                process_koid: request.koid,
                process_name: name,
            },
        );
    }

    fn detach(&mut self, _request: DetachRequest, callback: Callback<DetachReply>) {
        self.record(MsgType::Detach);
        self.reply(callback, DetachReply { status: Status::OK });
    }

    fn modules(&mut self, _request: ModulesRequest, callback: Callback<ModulesReply>) {
        self.record(MsgType::Modules);
        let modules = self.state.borrow().modules.clone();
        self.reply(callback, ModulesReply { status: Status::OK, modules });
    }

    fn pause(&mut self, _request: PauseRequest, callback: Callback<PauseReply>) {
        self.record(MsgType::Pause);
        self.state.borrow_mut().pause_count += 1;
        self.reply(callback, PauseReply { status: Status::OK });
    }

    fn resume(&mut self, request: ResumeRequest, callback: Callback<ResumeReply>) {
        self.record(MsgType::Resume);
        {
            let mut state = self.state.borrow_mut();
            state.resume_count += 1;
            state.last_resume = Some(request);
        }
        self.reply(callback, ResumeReply { status: Status::OK });
    }

    fn threads(&mut self, _request: ThreadsRequest, callback: Callback<ThreadsReply>) {
        self.record(MsgType::Threads);
        let threads = self.state.borrow().threads.clone();
        self.reply(callback, ThreadsReply { status: Status::OK, threads });
    }

    fn read_memory(&mut self, _request: ReadMemoryRequest, callback: Callback<ReadMemoryReply>) {
        self.record(MsgType::ReadMemory);
        let blocks = self.state.borrow().memory.clone();
        self.reply(callback, ReadMemoryReply { status: Status::OK, blocks });
    }

    fn read_registers(
        &mut self,
        _request: ReadRegistersRequest,
        callback: Callback<ReadRegistersReply>,
    ) {
        self.record(MsgType::ReadRegisters);
        let registers = self.state.borrow().registers.clone();
        self.reply(callback, ReadRegistersReply { status: Status::OK, registers });
    }

    fn add_or_change_breakpoint(
        &mut self,
        request: AddOrChangeBreakpointRequest,
        callback: Callback<AddOrChangeBreakpointReply>,
    ) {
        self.record(MsgType::AddOrChangeBreakpoint);
        let reply = {
            let mut state = self.state.borrow_mut();
            state.breakpoint_add_count += 1;
            state.last_breakpoint_id = request.breakpoint.breakpoint_id;
            state.last_breakpoint_address = request
                .breakpoint
                .locations
                .first()
                .map(|loc| loc.address)
                .unwrap_or(0);
            state.last_breakpoint = Some(request.breakpoint);
            AddOrChangeBreakpointReply {
                status: std::mem::take(&mut state.breakpoint_status),
                location_errors: std::mem::take(&mut state.location_errors),
            }
        };
        self.reply(callback, reply);
    }

    fn remove_breakpoint(
        &mut self,
        _request: RemoveBreakpointRequest,
        callback: Callback<RemoveBreakpointReply>,
    ) {
        self.record(MsgType::RemoveBreakpoint);
        self.state.borrow_mut().breakpoint_remove_count += 1;
        self.reply(callback, RemoveBreakpointReply { status: Status::OK });
    }

    fn backtrace(&mut self, _request: BacktraceRequest, callback: Callback<BacktraceReply>) {
        self.record(MsgType::Backtrace);
        let frames = self.state.borrow().frames.clone();
        self.reply(callback, BacktraceReply { status: Status::OK, frames });
    }
}
