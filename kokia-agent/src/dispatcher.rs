//! 受信バイト列を要求に振り分けるディスパッチャ

use crate::remote_api::RequestHandler;
use kokia_wire::{
    decode_message, encode_message, read_message, Framed, HelloRequest, MsgHeader, MsgType,
    Request, Stream,
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Helloの成功待ち
    AwaitingHello,
    Ready,
    /// プロトコル違反またはバージョン不一致で停止した
    Halted,
}

/// 1接続分のディスパッチャ
#[derive(Debug)]
pub struct Dispatcher {
    state: DispatchState,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { state: DispatchState::AwaitingHello }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == DispatchState::Halted
    }

    /// ストリームにある完全なメッセージをすべて処理する
    ///
    /// データが足りなければ何も消費せずに戻ります。追加のデータが届いたら再度呼び出します。
    pub fn process<H: RequestHandler + ?Sized>(&mut self, stream: &mut Stream, handler: &mut H) {
        while self.state != DispatchState::Halted {
            match read_message(stream) {
                Framed::Pending => return,
                Framed::Invalid(e) => {
                    error!("Protocol error, stopping dispatch: {}", e);
                    self.state = DispatchState::Halted;
                    return;
                }
                Framed::Message(header, bytes) => self.dispatch(&header, &bytes, stream, handler),
            }
        }
    }

    fn dispatch<H: RequestHandler + ?Sized>(
        &mut self,
        header: &MsgHeader,
        bytes: &[u8],
        stream: &mut Stream,
        handler: &mut H,
    ) {
        debug!(
            "Dispatching {:?} (transaction {})",
            header.msg_type, header.transaction_id
        );

        if self.state == DispatchState::AwaitingHello && header.msg_type != MsgType::Hello {
            warn!("Dropping {:?} received before Hello", header.msg_type);
            return;
        }

        match header.msg_type {
            MsgType::Hello => self.hello(header, bytes, stream, handler),
            MsgType::Launch => reply(header, bytes, stream, |r| handler.on_launch(r)),
            MsgType::Kill => reply(header, bytes, stream, |r| handler.on_kill(r)),
            MsgType::Attach => handler.on_attach(header.transaction_id, bytes, stream),
            MsgType::Detach => reply(header, bytes, stream, |r| handler.on_detach(r)),
            MsgType::Modules => reply(header, bytes, stream, |r| handler.on_modules(r)),
            MsgType::Pause => reply(header, bytes, stream, |r| handler.on_pause(r)),
            MsgType::Resume => reply(header, bytes, stream, |r| handler.on_resume(r)),
            MsgType::ProcessTree => reply(header, bytes, stream, |r| handler.on_process_tree(r)),
            MsgType::Threads => reply(header, bytes, stream, |r| handler.on_threads(r)),
            MsgType::ReadMemory => reply(header, bytes, stream, |r| handler.on_read_memory(r)),
            MsgType::WriteMemory => reply(header, bytes, stream, |r| handler.on_write_memory(r)),
            MsgType::ReadRegisters => {
                reply(header, bytes, stream, |r| handler.on_read_registers(r))
            }
            MsgType::WriteRegisters => {
                reply(header, bytes, stream, |r| handler.on_write_registers(r))
            }
            MsgType::AddOrChangeBreakpoint => {
                reply(header, bytes, stream, |r| handler.on_add_or_change_breakpoint(r))
            }
            MsgType::RemoveBreakpoint => {
                reply(header, bytes, stream, |r| handler.on_remove_breakpoint(r))
            }
            MsgType::Backtrace => reply(header, bytes, stream, |r| handler.on_backtrace(r)),
            MsgType::AddressSpace => reply(header, bytes, stream, |r| handler.on_address_space(r)),
            MsgType::NotifyProcessExiting
            | MsgType::NotifyThreadStarting
            | MsgType::NotifyThreadExiting
            | MsgType::NotifyException
            | MsgType::NotifyModules => {
                warn!("Ignoring inbound notification {:?}", header.msg_type);
            }
            MsgType::None | MsgType::NumMessages => {
                error!("Invalid message type {:?} passed framing", header.msg_type);
            }
        }
    }

    fn hello<H: RequestHandler + ?Sized>(
        &mut self,
        header: &MsgHeader,
        bytes: &[u8],
        stream: &mut Stream,
        handler: &mut H,
    ) {
        let request = match decode_message::<HelloRequest>(bytes) {
            Ok((_, request)) => request,
            Err(e) => {
                warn!("Dropping malformed Hello: {}", e);
                return;
            }
        };
        let response = handler.on_hello(request);
        stream.write(&encode_message(&response, header.transaction_id));

        if response.status.is_ok() {
            self.state = DispatchState::Ready;
        } else {
            error!("Hello failed ({}), stopping dispatch", response.status);
            self.state = DispatchState::Halted;
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// 要求をデコードしてハンドラを呼び、同じトランザクションIDで応答を書く
fn reply<R: Request>(
    header: &MsgHeader,
    bytes: &[u8],
    stream: &mut Stream,
    handle: impl FnOnce(R) -> R::Reply,
) {
    let request = match decode_message::<R>(bytes) {
        Ok((_, request)) => request,
        Err(e) => {
            warn!("Dropping malformed {:?} request: {}", header.msg_type, e);
            return;
        }
    };
    let response = handle(request);
    stream.write(&encode_message(&response, header.transaction_id));
}
