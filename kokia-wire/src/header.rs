//! メッセージヘッダとメッセージ単位のエンコード

use crate::{wire_enum, Deserialize, Reader, Serialize, WireError, Writer};

/// ヘッダのバイト数
pub const HEADER_SIZE: usize = 12;

/// 1メッセージの最大サイズ（これを超えるヘッダはプロトコル違反）
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// 1回の ReadMemory で読める最大バイト数
///
/// ページごとにブロックが分かれても応答が [`MAX_MESSAGE_SIZE`] に収まる大きさ。
pub const MAX_READ_MEMORY_SIZE: u32 = MAX_MESSAGE_SIZE / 2;

wire_enum! {
    /// メッセージ種別（序数がワイヤ上の値）
    pub enum MsgType {
        None = 0,
        Hello = 1,
        Launch = 2,
        Kill = 3,
        Attach = 4,
        Detach = 5,
        Modules = 6,
        Pause = 7,
        Resume = 8,
        ProcessTree = 9,
        Threads = 10,
        ReadMemory = 11,
        WriteMemory = 12,
        ReadRegisters = 13,
        WriteRegisters = 14,
        AddOrChangeBreakpoint = 15,
        RemoveBreakpoint = 16,
        Backtrace = 17,
        AddressSpace = 18,
        NotifyProcessExiting = 19,
        NotifyThreadStarting = 20,
        NotifyThreadExiting = 21,
        NotifyException = 22,
        NotifyModules = 23,
        NumMessages = 24,
    }
}

impl MsgType {
    /// `None` と `NumMessages` の間にある有効な種別か
    pub fn is_valid(self) -> bool {
        self != MsgType::None && self != MsgType::NumMessages
    }

    /// エージェントからの通知か
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            MsgType::NotifyProcessExiting
                | MsgType::NotifyThreadStarting
                | MsgType::NotifyThreadExiting
                | MsgType::NotifyException
                | MsgType::NotifyModules
        )
    }
}

/// メッセージヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// ヘッダを含む総バイト数
    pub size: u32,
    pub msg_type: MsgType,
    /// 0は通知用に予約されている
    pub transaction_id: u32,
}

/// ヘッダをエンコードする（サイズはヘッダのみ）
pub fn encode_header(msg_type: MsgType, transaction_id: u32) -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    bytes[4..8].copy_from_slice(&(msg_type as u32).to_le_bytes());
    bytes[8..12].copy_from_slice(&transaction_id.to_le_bytes());
    bytes
}

/// ヘッダをデコードして検証する
///
/// 種別が範囲外、サイズがヘッダ未満または上限超過の場合はエラーを返します。
pub fn decode_header(bytes: &[u8]) -> Result<MsgHeader, WireError> {
    let mut r = Reader::new(bytes);
    let size = r.read_u32()?;
    let raw_type = r.read_u32()?;
    let transaction_id = r.read_u32()?;

    let msg_type = MsgType::from_u32(raw_type)
        .filter(|t| t.is_valid())
        .ok_or(WireError::InvalidMessageType(raw_type))?;
    if (size as usize) < HEADER_SIZE || size > MAX_MESSAGE_SIZE {
        return Err(WireError::InvalidSize(size));
    }

    Ok(MsgHeader { size, msg_type, transaction_id })
}

/// ヘッダ領域を確保してからペイロードを書き込むライター
///
/// `finish` でサイズフィールドを埋め戻します。
pub struct MessageWriter {
    writer: Writer,
}

impl MessageWriter {
    pub fn new(msg_type: MsgType, transaction_id: u32) -> Self {
        let mut writer = Writer::new();
        writer.write_u32(0);
        writer.write_u32(msg_type as u32);
        writer.write_u32(transaction_id);
        Self { writer }
    }

    /// ペイロード書き込み用のライター
    pub fn payload(&mut self) -> &mut Writer {
        &mut self.writer
    }

    /// サイズを確定してバイト列を返す
    pub fn finish(mut self) -> Vec<u8> {
        let size = self.writer.len() as u32;
        self.writer.patch_u32(0, size);
        self.writer.into_inner()
    }
}

/// 種別を持つメッセージ
pub trait Message: Serialize + Deserialize {
    const TYPE: MsgType;
}

/// 応答型と対応づけられた要求
pub trait Request: Message {
    type Reply: Message;
}

/// メッセージをヘッダ付きでエンコードする
pub fn encode_message<M: Message>(msg: &M, transaction_id: u32) -> Vec<u8> {
    let mut writer = MessageWriter::new(M::TYPE, transaction_id);
    msg.serialize(writer.payload());
    writer.finish()
}

/// ヘッダ付きのバイト列からメッセージをデコードする
pub fn decode_message<M: Message>(bytes: &[u8]) -> Result<(MsgHeader, M), WireError> {
    let header = decode_header(bytes)?;
    if header.msg_type != M::TYPE {
        return Err(WireError::UnexpectedMessageType {
            expected: M::TYPE,
            found: header.msg_type,
        });
    }
    let size = header.size as usize;
    if bytes.len() < size {
        return Err(WireError::TruncatedMessage {
            needed: size,
            remaining: bytes.len(),
        });
    }
    let mut r = Reader::new(&bytes[HEADER_SIZE..size]);
    let msg = M::deserialize(&mut r)?;
    Ok((header, msg))
}
