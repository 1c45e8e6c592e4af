//! 要求・応答・通知メッセージ

use crate::{
    decode_message, wire_record, AddressRegion, Arch, BreakpointSettings, BreakpointStats,
    ExceptionType, LocationError, MemoryBlock, Message, Module, MsgHeader, MsgType,
    ProcessTreeRecord, Register, Request, ResumeHow, StackFrame, Status, ThreadRecord, WireError,
};

wire_record! {
    pub struct HelloRequest {
        pub version: u32,
    }
}

wire_record! {
    pub struct HelloReply {
        pub status: Status,
        pub signature: u64,
        pub version: u32,
        pub arch: Arch,
    }
}

wire_record! {
    pub struct LaunchRequest {
        /// argv[0] が実行ファイル
        pub argv: Vec<String>,
    }
}

wire_record! {
    pub struct LaunchReply {
        pub status: Status,
        pub process_koid: u64,
        pub process_name: String,
    }
}

wire_record! {
    pub struct KillRequest {
        pub process_koid: u64,
    }
}

wire_record! {
    pub struct KillReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct AttachRequest {
        pub koid: u64,
    }
}

wire_record! {
    /// 既存スレッドごとの `NotifyThreadStarting` が後に続く
    pub struct AttachReply {
        pub status: Status,
        pub process_koid: u64,
        pub process_name: String,
    }
}

wire_record! {
    pub struct DetachRequest {
        pub process_koid: u64,
    }
}

wire_record! {
    pub struct DetachReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct ModulesRequest {
        pub process_koid: u64,
    }
}

wire_record! {
    pub struct ModulesReply {
        pub status: Status,
        pub modules: Vec<Module>,
    }
}

wire_record! {
    /// koid = 0 はすべて
    pub struct PauseRequest {
        pub process_koid: u64,
        pub thread_koid: u64,
    }
}

wire_record! {
    pub struct PauseReply {
        pub status: Status,
    }
}

wire_record! {
    /// process_koid = 0 は全プロセス、thread_koids が空なら全スレッド
    pub struct ResumeRequest {
        pub process_koid: u64,
        pub thread_koids: Vec<u64>,
        pub how: ResumeHow,
        pub range_begin: u64,
        pub range_end: u64,
    }
}

wire_record! {
    pub struct ResumeReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct ProcessTreeRequest {}
}

wire_record! {
    pub struct ProcessTreeReply {
        pub status: Status,
        pub root: ProcessTreeRecord,
    }
}

wire_record! {
    pub struct ThreadsRequest {
        pub process_koid: u64,
    }
}

wire_record! {
    pub struct ThreadsReply {
        pub status: Status,
        pub threads: Vec<ThreadRecord>,
    }
}

wire_record! {
    pub struct ReadMemoryRequest {
        pub process_koid: u64,
        pub address: u64,
        pub size: u32,
    }
}

wire_record! {
    pub struct ReadMemoryReply {
        pub status: Status,
        pub blocks: Vec<MemoryBlock>,
    }
}

wire_record! {
    pub struct WriteMemoryRequest {
        pub process_koid: u64,
        pub address: u64,
        pub data: Vec<u8>,
    }
}

wire_record! {
    pub struct WriteMemoryReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct ReadRegistersRequest {
        pub process_koid: u64,
        pub thread_koid: u64,
    }
}

wire_record! {
    pub struct ReadRegistersReply {
        pub status: Status,
        pub registers: Vec<Register>,
    }
}

wire_record! {
    pub struct WriteRegistersRequest {
        pub process_koid: u64,
        pub thread_koid: u64,
        pub registers: Vec<Register>,
    }
}

wire_record! {
    pub struct WriteRegistersReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct AddOrChangeBreakpointRequest {
        pub breakpoint: BreakpointSettings,
    }
}

wire_record! {
    pub struct AddOrChangeBreakpointReply {
        pub status: Status,
        pub location_errors: Vec<LocationError>,
    }
}

wire_record! {
    pub struct RemoveBreakpointRequest {
        pub breakpoint_id: u32,
    }
}

wire_record! {
    pub struct RemoveBreakpointReply {
        pub status: Status,
    }
}

wire_record! {
    pub struct BacktraceRequest {
        pub process_koid: u64,
        pub thread_koid: u64,
    }
}

wire_record! {
    pub struct BacktraceReply {
        pub status: Status,
        pub frames: Vec<StackFrame>,
    }
}

wire_record! {
    /// address = 0 ならマップ全体
    pub struct AddressSpaceRequest {
        pub process_koid: u64,
        pub address: u64,
    }
}

wire_record! {
    pub struct AddressSpaceReply {
        pub status: Status,
        pub map: Vec<AddressRegion>,
    }
}

wire_record! {
    pub struct NotifyProcessExiting {
        pub process_koid: u64,
        pub return_code: i64,
    }
}

wire_record! {
    pub struct NotifyThreadStarting {
        pub record: ThreadRecord,
    }
}

wire_record! {
    pub struct NotifyThreadExiting {
        pub record: ThreadRecord,
    }
}

wire_record! {
    pub struct NotifyException {
        pub process_koid: u64,
        pub thread: ThreadRecord,
        pub exception_type: ExceptionType,
        pub hit_breakpoints: Vec<BreakpointStats>,
    }
}

wire_record! {
    pub struct NotifyModules {
        pub process_koid: u64,
        pub modules: Vec<Module>,
        pub stopped_thread_koids: Vec<u64>,
    }
}

macro_rules! impl_requests {
    ($($ty:ident: $req:ident => $reply:ident),* $(,)?) => {
        $(
            impl Message for $req {
                const TYPE: MsgType = MsgType::$ty;
            }

            impl Message for $reply {
                const TYPE: MsgType = MsgType::$ty;
            }

            impl Request for $req {
                type Reply = $reply;
            }
        )*
    };
}

impl_requests! {
    Hello: HelloRequest => HelloReply,
    Launch: LaunchRequest => LaunchReply,
    Kill: KillRequest => KillReply,
    Attach: AttachRequest => AttachReply,
    Detach: DetachRequest => DetachReply,
    Modules: ModulesRequest => ModulesReply,
    Pause: PauseRequest => PauseReply,
    Resume: ResumeRequest => ResumeReply,
    ProcessTree: ProcessTreeRequest => ProcessTreeReply,
    Threads: ThreadsRequest => ThreadsReply,
    ReadMemory: ReadMemoryRequest => ReadMemoryReply,
    WriteMemory: WriteMemoryRequest => WriteMemoryReply,
    ReadRegisters: ReadRegistersRequest => ReadRegistersReply,
    WriteRegisters: WriteRegistersRequest => WriteRegistersReply,
    AddOrChangeBreakpoint: AddOrChangeBreakpointRequest => AddOrChangeBreakpointReply,
    RemoveBreakpoint: RemoveBreakpointRequest => RemoveBreakpointReply,
    Backtrace: BacktraceRequest => BacktraceReply,
    AddressSpace: AddressSpaceRequest => AddressSpaceReply,
}

macro_rules! impl_notifications {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Message for $ty {
                const TYPE: MsgType = MsgType::$ty;
            }
        )*
    };
}

impl_notifications! {
    NotifyProcessExiting,
    NotifyThreadStarting,
    NotifyThreadExiting,
    NotifyException,
    NotifyModules,
}

/// エージェントからの非同期通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ProcessExiting(NotifyProcessExiting),
    ThreadStarting(NotifyThreadStarting),
    ThreadExiting(NotifyThreadExiting),
    Exception(NotifyException),
    Modules(NotifyModules),
}

impl Notification {
    /// 受信済みのメッセージを通知としてデコードする
    pub fn decode(header: &MsgHeader, bytes: &[u8]) -> Result<Self, WireError> {
        match header.msg_type {
            MsgType::NotifyProcessExiting => {
                Ok(Self::ProcessExiting(decode_message(bytes)?.1))
            }
            MsgType::NotifyThreadStarting => {
                Ok(Self::ThreadStarting(decode_message(bytes)?.1))
            }
            MsgType::NotifyThreadExiting => Ok(Self::ThreadExiting(decode_message(bytes)?.1)),
            MsgType::NotifyException => Ok(Self::Exception(decode_message(bytes)?.1)),
            MsgType::NotifyModules => Ok(Self::Modules(decode_message(bytes)?.1)),
            MsgType::None
            | MsgType::Hello
            | MsgType::Launch
            | MsgType::Kill
            | MsgType::Attach
            | MsgType::Detach
            | MsgType::Modules
            | MsgType::Pause
            | MsgType::Resume
            | MsgType::ProcessTree
            | MsgType::Threads
            | MsgType::ReadMemory
            | MsgType::WriteMemory
            | MsgType::ReadRegisters
            | MsgType::WriteRegisters
            | MsgType::AddOrChangeBreakpoint
            | MsgType::RemoveBreakpoint
            | MsgType::Backtrace
            | MsgType::AddressSpace
            | MsgType::NumMessages => Err(WireError::NotNotification(header.msg_type)),
        }
    }
}
