//! エージェントへの要求を抽象化したトレイト
//!
//! 本番ではストリーム越しに送る [`RemoteApiImpl`](crate::RemoteApiImpl)、
//! テストでは呼び出しを記録する [`MockRemoteApi`](crate::MockRemoteApi) を使います。
//! 実装されていない動詞はパニックするので、テストで想定外の経路を通ればすぐにわかります。

use crate::error::Result;
use crate::session::Session;
use kokia_wire::*;

/// 応答を受け取るコールバック
pub type Callback<T> = Box<dyn FnOnce(&mut Session, Result<T>)>;

fn unimplemented_verb(verb: &str) -> ! {
    panic!("RemoteApi::{} is not implemented by this backend", verb)
}

/// 動詞ごとの非同期要求
///
/// どのメソッドもすぐに戻り、コールバックは後でメッセージループから呼ばれます。
pub trait RemoteApi {
    fn hello(&mut self, _request: HelloRequest, _callback: Callback<HelloReply>) {
        unimplemented_verb("hello")
    }

    fn launch(&mut self, _request: LaunchRequest, _callback: Callback<LaunchReply>) {
        unimplemented_verb("launch")
    }

    fn kill(&mut self, _request: KillRequest, _callback: Callback<KillReply>) {
        unimplemented_verb("kill")
    }

    fn attach(&mut self, _request: AttachRequest, _callback: Callback<AttachReply>) {
        unimplemented_verb("attach")
    }

    fn detach(&mut self, _request: DetachRequest, _callback: Callback<DetachReply>) {
        unimplemented_verb("detach")
    }

    fn modules(&mut self, _request: ModulesRequest, _callback: Callback<ModulesReply>) {
        unimplemented_verb("modules")
    }

    fn pause(&mut self, _request: PauseRequest, _callback: Callback<PauseReply>) {
        unimplemented_verb("pause")
    }

    fn resume(&mut self, _request: ResumeRequest, _callback: Callback<ResumeReply>) {
        unimplemented_verb("resume")
    }

    fn process_tree(&mut self, _request: ProcessTreeRequest, _callback: Callback<ProcessTreeReply>) {
        unimplemented_verb("process_tree")
    }

    fn threads(&mut self, _request: ThreadsRequest, _callback: Callback<ThreadsReply>) {
        unimplemented_verb("threads")
    }

    fn read_memory(&mut self, _request: ReadMemoryRequest, _callback: Callback<ReadMemoryReply>) {
        unimplemented_verb("read_memory")
    }

    fn write_memory(&mut self, _request: WriteMemoryRequest, _callback: Callback<WriteMemoryReply>) {
        unimplemented_verb("write_memory")
    }

    fn read_registers(
        &mut self,
        _request: ReadRegistersRequest,
        _callback: Callback<ReadRegistersReply>,
    ) {
        unimplemented_verb("read_registers")
    }

    fn write_registers(
        &mut self,
        _request: WriteRegistersRequest,
        _callback: Callback<WriteRegistersReply>,
    ) {
        unimplemented_verb("write_registers")
    }

    fn add_or_change_breakpoint(
        &mut self,
        _request: AddOrChangeBreakpointRequest,
        _callback: Callback<AddOrChangeBreakpointReply>,
    ) {
        unimplemented_verb("add_or_change_breakpoint")
    }

    fn remove_breakpoint(
        &mut self,
        _request: RemoveBreakpointRequest,
        _callback: Callback<RemoveBreakpointReply>,
    ) {
        unimplemented_verb("remove_breakpoint")
    }

    fn backtrace(&mut self, _request: BacktraceRequest, _callback: Callback<BacktraceReply>) {
        unimplemented_verb("backtrace")
    }

    fn address_space(
        &mut self,
        _request: AddressSpaceRequest,
        _callback: Callback<AddressSpaceReply>,
    ) {
        unimplemented_verb("address_space")
    }
}
