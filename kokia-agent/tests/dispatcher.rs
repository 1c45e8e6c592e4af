//! ディスパッチャのフレーミングとハンドシェイク

mod common;

use common::*;
use kokia_agent::{AgentConfig, DebugAgent, DispatchState, Dispatcher};
use kokia_wire::*;

fn agent() -> DebugAgent {
    DebugAgent::new(
        Box::new(FakePlatform { world: World::new(&[1]) }),
        &ARCH,
        AgentConfig::default(),
    )
}

/// 書き込まれたメッセージのヘッダ
fn written_headers(stream: &mut Stream) -> Vec<MsgHeader> {
    let out = stream.take_write_data();
    let mut headers = Vec::new();
    let mut pos = 0;
    while pos < out.len() {
        let header = decode_header(&out[pos..]).unwrap();
        pos += header.size as usize;
        headers.push(header);
    }
    headers
}

fn hello() -> Vec<u8> {
    encode_message(&HelloRequest { version: PROTOCOL_VERSION }, 1)
}

#[test]
fn test_partial_header_waits() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    let bytes = hello();

    stream.add_read_data(&bytes[..5]);
    dispatcher.process(&mut stream, &mut agent);
    assert_eq!(stream.available(), 5);
    assert!(!stream.has_write_data());

    stream.add_read_data(&bytes[5..]);
    dispatcher.process(&mut stream, &mut agent);
    assert_eq!(stream.available(), 0);
    assert_eq!(dispatcher.state(), DispatchState::Ready);

    let out = stream.take_write_data();
    let (header, reply) = decode_message::<HelloReply>(&out).unwrap();
    assert_eq!(header.transaction_id, 1);
    assert_eq!(reply.status, Status::OK);
    assert_eq!(reply.signature, HELLO_SIGNATURE);
    assert_eq!(reply.arch, Arch::X64);
}

#[test]
fn test_byte_at_a_time_delivery() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    let mut bytes = hello();
    bytes.extend(encode_message(&ProcessTreeRequest {}, 2));
    bytes.extend(encode_message(&ThreadsRequest { process_koid: 42 }, 3));

    for b in &bytes {
        stream.add_read_data(std::slice::from_ref(b));
        dispatcher.process(&mut stream, &mut agent);
    }

    let headers = written_headers(&mut stream);
    let ids: Vec<(MsgType, u32)> = headers.iter().map(|h| (h.msg_type, h.transaction_id)).collect();
    assert_eq!(
        ids,
        vec![(MsgType::Hello, 1), (MsgType::ProcessTree, 2), (MsgType::Threads, 3)]
    );
}

#[test]
fn test_invalid_type_halts_without_consuming() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&hello());

    let mut bad = encode_header(MsgType::Kill, 9).to_vec();
    bad[4..8].copy_from_slice(&200u32.to_le_bytes());
    stream.add_read_data(&bad);
    stream.add_read_data(&encode_message(&ProcessTreeRequest {}, 10));

    dispatcher.process(&mut stream, &mut agent);
    assert!(dispatcher.is_halted());
    // 不正なヘッダ以降は読まれない
    assert_eq!(stream.available(), bad.len() + HEADER_SIZE);
    assert_eq!(written_headers(&mut stream).len(), 1);

    dispatcher.process(&mut stream, &mut agent);
    assert!(!stream.has_write_data());
}

#[test]
fn test_oversized_message_halts() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&hello());

    let mut header = encode_header(MsgType::WriteMemory, 2).to_vec();
    header[0..4].copy_from_slice(&(MAX_MESSAGE_SIZE + 1).to_le_bytes());
    stream.add_read_data(&header);
    dispatcher.process(&mut stream, &mut agent);
    assert!(dispatcher.is_halted());
}

#[test]
fn test_requests_before_hello_are_dropped() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&encode_message(&ProcessTreeRequest {}, 5));
    dispatcher.process(&mut stream, &mut agent);
    assert_eq!(stream.available(), 0);
    assert!(!stream.has_write_data());
    assert_eq!(dispatcher.state(), DispatchState::AwaitingHello);
}

#[test]
fn test_version_mismatch_halts_after_reply() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&encode_message(&HelloRequest { version: PROTOCOL_VERSION + 1 }, 1));
    stream.add_read_data(&encode_message(&ProcessTreeRequest {}, 2));
    dispatcher.process(&mut stream, &mut agent);

    assert!(dispatcher.is_halted());
    let out = stream.take_write_data();
    let (_, reply) = decode_message::<HelloReply>(&out).unwrap();
    assert_eq!(reply.status, Status::VERSION_MISMATCH);
    assert_eq!(reply.version, PROTOCOL_VERSION);
    assert_eq!(out.len(), reply_len());
}

fn reply_len() -> usize {
    encode_message(&HelloReply::default(), 0).len()
}

#[test]
fn test_inbound_notifications_are_ignored() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&hello());
    stream.add_read_data(&encode_message(
        &NotifyProcessExiting { process_koid: 1, return_code: 0 },
        0,
    ));
    stream.add_read_data(&encode_message(&ProcessTreeRequest {}, 2));
    dispatcher.process(&mut stream, &mut agent);

    let types: Vec<MsgType> = written_headers(&mut stream).iter().map(|h| h.msg_type).collect();
    assert_eq!(types, vec![MsgType::Hello, MsgType::ProcessTree]);
    assert_eq!(dispatcher.state(), DispatchState::Ready);
}

#[test]
fn test_malformed_payload_is_dropped() {
    let mut agent = agent();
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    stream.add_read_data(&hello());

    // 文字列長が残りより長いLaunch要求
    let mut writer = MessageWriter::new(MsgType::Launch, 2);
    writer.payload().write_u32(1);
    writer.payload().write_u32(1000);
    stream.add_read_data(&writer.finish());
    stream.add_read_data(&encode_message(&ProcessTreeRequest {}, 3));
    dispatcher.process(&mut stream, &mut agent);

    let ids: Vec<u32> = written_headers(&mut stream).iter().map(|h| h.transaction_id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(dispatcher.state(), DispatchState::Ready);
}

#[test]
fn test_process_tree_reply() {
    let mut h = Harness::new(&[1]);
    let reply = h.call(&ProcessTreeRequest {});
    assert_eq!(reply.status, Status::OK);
    assert_eq!(reply.root.kind, ProcessTreeKind::Job);
    assert_eq!(reply.root.children[0].koid, PID);
}
