//! エージェントが受け付ける要求のハンドラ

use kokia_wire::*;

/// 要求ごとのハンドラ
///
/// 各メソッドは要求を受け取って応答を返し、ディスパッチャが同じ
/// トランザクションIDで応答を書き込みます。Attachだけは応答の直後に
/// スレッド通知を続ける必要があるため、生のバイト列とストリームを受け取ります。
pub trait RequestHandler {
    fn on_hello(&mut self, request: HelloRequest) -> HelloReply;

    fn on_launch(&mut self, request: LaunchRequest) -> LaunchReply;

    fn on_kill(&mut self, request: KillRequest) -> KillReply;

    /// 応答と、既存スレッドごとの `NotifyThreadStarting` を自分で書き込む
    fn on_attach(&mut self, transaction_id: u32, bytes: &[u8], stream: &mut Stream);

    fn on_detach(&mut self, request: DetachRequest) -> DetachReply;

    fn on_modules(&mut self, request: ModulesRequest) -> ModulesReply;

    fn on_pause(&mut self, request: PauseRequest) -> PauseReply;

    fn on_resume(&mut self, request: ResumeRequest) -> ResumeReply;

    fn on_process_tree(&mut self, request: ProcessTreeRequest) -> ProcessTreeReply;

    fn on_threads(&mut self, request: ThreadsRequest) -> ThreadsReply;

    fn on_read_memory(&mut self, request: ReadMemoryRequest) -> ReadMemoryReply;

    fn on_write_memory(&mut self, request: WriteMemoryRequest) -> WriteMemoryReply;

    fn on_read_registers(&mut self, request: ReadRegistersRequest) -> ReadRegistersReply;

    fn on_write_registers(&mut self, request: WriteRegistersRequest) -> WriteRegistersReply;

    fn on_add_or_change_breakpoint(
        &mut self,
        request: AddOrChangeBreakpointRequest,
    ) -> AddOrChangeBreakpointReply;

    fn on_remove_breakpoint(&mut self, request: RemoveBreakpointRequest) -> RemoveBreakpointReply;

    fn on_backtrace(&mut self, request: BacktraceRequest) -> BacktraceReply;

    fn on_address_space(&mut self, request: AddressSpaceRequest) -> AddressSpaceReply;
}
