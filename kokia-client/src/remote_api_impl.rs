//! ストリーム越しにエージェントと通信する RemoteApi の実装

use crate::error::{Error, Result};
use crate::message_loop::MessageLoop;
use crate::remote_api::{Callback, RemoteApi};
use crate::session::Session;
use kokia_wire::*;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, error, warn};

type PendingReply = Box<dyn FnOnce(&mut Session, Result<Vec<u8>>)>;

/// 1本の接続の状態
struct Connection {
    stream: Stream,
    next_transaction_id: u32,
    /// 応答待ちの要求（トランザクションIDがキー）
    pending: BTreeMap<u32, PendingReply>,
    /// プロトコル違反で使えなくなった理由
    broken: Option<WireError>,
}

impl Connection {
    /// 0と使用中のIDを避けて次のIDを払い出す
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_transaction_id;
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// ストリームを使う RemoteApi
///
/// クローンは同じ接続を共有します。I/O層はクローンの1つを持って
/// `add_read_data` と `take_write_data` でバイト列をやり取りします。
#[derive(Clone)]
pub struct RemoteApiImpl {
    connection: Rc<RefCell<Connection>>,
    message_loop: MessageLoop,
}

impl RemoteApiImpl {
    pub fn new(message_loop: MessageLoop) -> Self {
        Self {
            connection: Rc::new(RefCell::new(Connection {
                stream: Stream::new(),
                next_transaction_id: 1,
                pending: BTreeMap::new(),
                broken: None,
            })),
            message_loop,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.connection.borrow().pending.len()
    }

    pub fn is_broken(&self) -> bool {
        self.connection.borrow().broken.is_some()
    }

    /// 送信待ちのバイト列を取り出す
    pub fn take_write_data(&self) -> Vec<u8> {
        self.connection.borrow_mut().stream.take_write_data()
    }

    /// 受信したバイト列を渡し、揃ったメッセージをタスクとして投入する
    pub fn add_read_data(&self, data: &[u8]) {
        let mut conn = self.connection.borrow_mut();
        if conn.broken.is_some() {
            return;
        }
        conn.stream.add_read_data(data);

        loop {
            match read_message(&mut conn.stream) {
                Framed::Pending => break,
                Framed::Invalid(e) => {
                    error!("Protocol error from agent: {}", e);
                    // 接続は回復できないので応答待ちをすべて失敗させる
                    for (_, pending) in std::mem::take(&mut conn.pending) {
                        let err = Error::Wire(e.clone());
                        self.message_loop.post(move |session| pending(session, Err(err)));
                    }
                    conn.broken = Some(e);
                    break;
                }
                Framed::Message(header, bytes) => self.route(&mut conn, header, bytes),
            }
        }
    }

    fn route(&self, conn: &mut Connection, header: MsgHeader, bytes: Vec<u8>) {
        if header.transaction_id == 0 {
            match Notification::decode(&header, &bytes) {
                Ok(notification) => self
                    .message_loop
                    .post(move |session| session.handle_notification(notification)),
                Err(e) => warn!("Dropping malformed {:?} notification: {}", header.msg_type, e),
            }
            return;
        }

        match conn.pending.remove(&header.transaction_id) {
            Some(pending) => self.message_loop.post(move |session| pending(session, Ok(bytes))),
            None => warn!(
                "Dropping {:?} reply for unknown transaction {}",
                header.msg_type, header.transaction_id
            ),
        }
    }

    fn send<R>(&mut self, request: R, callback: Callback<R::Reply>)
    where
        R: Request,
        R::Reply: 'static,
    {
        let mut conn = self.connection.borrow_mut();
        if let Some(e) = &conn.broken {
            let err = Error::Connection(e.to_string());
            self.message_loop.post(move |session| callback(session, Err(err)));
            return;
        }

        let id = conn.allocate_id();
        debug!("Sending {:?} (transaction {})", R::TYPE, id);
        conn.stream.write(&encode_message(&request, id));
        conn.pending.insert(
            id,
            Box::new(move |session: &mut Session, bytes: Result<Vec<u8>>| {
                let reply = bytes.and_then(|bytes| {
                    decode_message::<R::Reply>(&bytes)
                        .map(|(_, reply)| reply)
                        .map_err(Error::from)
                });
                callback(session, reply)
            }),
        );
    }
}

impl RemoteApi for RemoteApiImpl {
    fn hello(&mut self, request: HelloRequest, callback: Callback<HelloReply>) {
        self.send(request, callback)
    }

    fn launch(&mut self, request: LaunchRequest, callback: Callback<LaunchReply>) {
        self.send(request, callback)
    }

    fn kill(&mut self, request: KillRequest, callback: Callback<KillReply>) {
        self.send(request, callback)
    }

    fn attach(&mut self, request: AttachRequest, callback: Callback<AttachReply>) {
        self.send(request, callback)
    }

    fn detach(&mut self, request: DetachRequest, callback: Callback<DetachReply>) {
        self.send(request, callback)
    }

    fn modules(&mut self, request: ModulesRequest, callback: Callback<ModulesReply>) {
        self.send(request, callback)
    }

    fn pause(&mut self, request: PauseRequest, callback: Callback<PauseReply>) {
        self.send(request, callback)
    }

    fn resume(&mut self, request: ResumeRequest, callback: Callback<ResumeReply>) {
        self.send(request, callback)
    }

    fn process_tree(&mut self, request: ProcessTreeRequest, callback: Callback<ProcessTreeReply>) {
        self.send(request, callback)
    }

    fn threads(&mut self, request: ThreadsRequest, callback: Callback<ThreadsReply>) {
        self.send(request, callback)
    }

    fn read_memory(&mut self, request: ReadMemoryRequest, callback: Callback<ReadMemoryReply>) {
        self.send(request, callback)
    }

    fn write_memory(&mut self, request: WriteMemoryRequest, callback: Callback<WriteMemoryReply>) {
        self.send(request, callback)
    }

    fn read_registers(
        &mut self,
        request: ReadRegistersRequest,
        callback: Callback<ReadRegistersReply>,
    ) {
        self.send(request, callback)
    }

    fn write_registers(
        &mut self,
        request: WriteRegistersRequest,
        callback: Callback<WriteRegistersReply>,
    ) {
        self.send(request, callback)
    }

    fn add_or_change_breakpoint(
        &mut self,
        request: AddOrChangeBreakpointRequest,
        callback: Callback<AddOrChangeBreakpointReply>,
    ) {
        self.send(request, callback)
    }

    fn remove_breakpoint(
        &mut self,
        request: RemoveBreakpointRequest,
        callback: Callback<RemoveBreakpointReply>,
    ) {
        self.send(request, callback)
    }

    fn backtrace(&mut self, request: BacktraceRequest, callback: Callback<BacktraceReply>) {
        self.send(request, callback)
    }

    fn address_space(
        &mut self,
        request: AddressSpaceRequest,
        callback: Callback<AddressSpaceReply>,
    ) {
        self.send(request, callback)
    }
}
