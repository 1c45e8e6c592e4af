//! 非ブロッキングなバイトストリーム
//!
//! I/O層が受信したバイトを `add_read_data` で流し込み、
//! 送信すべきバイトを `take_write_data` で取り出します。
//! ストリーム自体はソケットを知らず、ブロックすることもありません。

use crate::{decode_header, MsgHeader, WireError, HEADER_SIZE};

/// 部分的にバッファリングされた双方向ストリーム
#[derive(Debug, Default)]
pub struct Stream {
    read_buffer: Vec<u8>,
    read_offset: usize,
    write_buffer: Vec<u8>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// 受信データを追加する
    pub fn add_read_data(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// 未読のバイト数
    pub fn available(&self) -> usize {
        self.read_buffer.len() - self.read_offset
    }

    pub fn is_available(&self, n: usize) -> bool {
        self.available() >= n
    }

    /// 消費せずに先頭 `n` バイトを覗く
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if !self.is_available(n) {
            return None;
        }
        Some(&self.read_buffer[self.read_offset..self.read_offset + n])
    }

    /// 先頭 `n` バイトを消費する
    pub fn read(&mut self, n: usize) -> Option<Vec<u8>> {
        if !self.is_available(n) {
            return None;
        }
        let data = self.read_buffer[self.read_offset..self.read_offset + n].to_vec();
        self.read_offset += n;
        if self.read_offset == self.read_buffer.len() {
            self.read_buffer.clear();
            self.read_offset = 0;
        } else if self.read_offset > self.read_buffer.len() / 2 {
            self.read_buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
        Some(data)
    }

    /// 送信データを書き込む
    pub fn write(&mut self, data: &[u8]) {
        self.write_buffer.extend_from_slice(data);
    }

    pub fn has_write_data(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// 送信待ちのデータをすべて取り出す
    pub fn take_write_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_buffer)
    }
}

/// フレーミングの結果
#[derive(Debug, PartialEq, Eq)]
pub enum Framed {
    /// データ不足（何も消費していない）
    Pending,
    /// ヘッダを含むメッセージ全体
    Message(MsgHeader, Vec<u8>),
    /// ヘッダが不正（何も消費していない）
    Invalid(WireError),
}

/// ストリームから1メッセージ分を取り出す
///
/// ヘッダを覗いて検証し、メッセージ全体が揃ったときだけ `size` バイトを消費します。
pub fn read_message(stream: &mut Stream) -> Framed {
    let header = match stream.peek(HEADER_SIZE) {
        None => return Framed::Pending,
        Some(bytes) => match decode_header(bytes) {
            Ok(header) => header,
            Err(e) => return Framed::Invalid(e),
        },
    };

    match stream.read(header.size as usize) {
        Some(bytes) => Framed::Message(header, bytes),
        None => Framed::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_message, KillRequest, MsgType};

    #[test]
    fn test_peek_does_not_consume() {
        let mut stream = Stream::new();
        stream.add_read_data(&[1, 2, 3]);
        assert_eq!(stream.peek(2), Some(&[1u8, 2][..]));
        assert_eq!(stream.peek(4), None);
        assert_eq!(stream.available(), 3);
        assert_eq!(stream.read(2), Some(vec![1, 2]));
        assert_eq!(stream.available(), 1);
        assert_eq!(stream.read(2), None);
        assert_eq!(stream.read(1), Some(vec![3]));
        assert!(!stream.is_available(1));
    }

    #[test]
    fn test_write_buffer() {
        let mut stream = Stream::new();
        stream.write(&[1, 2]);
        stream.write(&[3]);
        assert!(stream.has_write_data());
        assert_eq!(stream.take_write_data(), vec![1, 2, 3]);
        assert!(!stream.has_write_data());
    }

    #[test]
    fn test_read_message_waits_for_full_size() {
        let bytes = encode_message(&KillRequest { process_koid: 99 }, 5);
        let mut stream = Stream::new();

        for &b in &bytes[..bytes.len() - 1] {
            stream.add_read_data(&[b]);
            assert_eq!(read_message(&mut stream), Framed::Pending);
        }
        stream.add_read_data(&bytes[bytes.len() - 1..]);

        match read_message(&mut stream) {
            Framed::Message(header, data) => {
                assert_eq!(header.msg_type, MsgType::Kill);
                assert_eq!(header.transaction_id, 5);
                assert_eq!(data, bytes);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(stream.available(), 0);
    }

    #[test]
    fn test_read_message_consumes_exactly_one() {
        let first = encode_message(&KillRequest { process_koid: 1 }, 1);
        let second = encode_message(&KillRequest { process_koid: 2 }, 2);
        let mut stream = Stream::new();
        stream.add_read_data(&first);
        stream.add_read_data(&second[..4]);

        assert!(matches!(read_message(&mut stream), Framed::Message(h, _) if h.transaction_id == 1));
        assert_eq!(read_message(&mut stream), Framed::Pending);
        assert_eq!(stream.available(), 4);
    }

    #[test]
    fn test_invalid_header_consumes_nothing() {
        let mut stream = Stream::new();
        let mut bytes = encode_message(&KillRequest { process_koid: 1 }, 1);
        bytes[4..8].copy_from_slice(&77u32.to_le_bytes());
        stream.add_read_data(&bytes);

        assert_eq!(
            read_message(&mut stream),
            Framed::Invalid(WireError::InvalidMessageType(77))
        );
        assert_eq!(stream.available(), bytes.len());
    }
}
