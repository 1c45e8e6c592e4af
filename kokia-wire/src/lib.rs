//! Kokia デバッグプロトコル
//!
//! エージェントとクライアントの間で交わされるバイナリメッセージの
//! 定義とエンコード・デコード、非ブロッキングなストリームを提供します。
//!
//! すべてのメッセージは12バイトのヘッダ（サイズ・種別・トランザクションID）で始まり、
//! 数値はリトルエンディアンで格納されます。

pub mod codec;
pub mod error;
pub mod header;
pub mod messages;
pub mod records;
pub mod status;
pub mod stream;

pub use codec::{Deserialize, Reader, Serialize, Writer};
pub use error::WireError;
pub use header::{
    decode_header, decode_message, encode_header, encode_message, Message, MessageWriter,
    MsgHeader, MsgType, Request, HEADER_SIZE, MAX_MESSAGE_SIZE,
    MAX_READ_MEMORY_SIZE,
};
pub use messages::*;
pub use records::*;
pub use status::Status;
pub use stream::{read_message, Framed, Stream};

/// プロトコルバージョン（Helloで交換される）
pub const PROTOCOL_VERSION: u32 = 1;

/// Hello応答に含まれるシグネチャ（"kokiaIPC" をリトルエンディアンのu64として読んだ値）
pub const HELLO_SIGNATURE: u64 = u64::from_le_bytes(*b"kokiaIPC");
