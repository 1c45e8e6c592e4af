//! ワイヤプロトコルのエラー型

use crate::MsgType;

/// シリアライズ・デシリアライズ時のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// 宣言された長さがバッファの残りを超えている
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    TruncatedMessage { needed: usize, remaining: usize },
    /// 範囲外のメッセージ種別
    #[error("invalid message type {0}")]
    InvalidMessageType(u32),
    /// ヘッダのサイズフィールドが不正
    #[error("invalid message size {0}")]
    InvalidSize(u32),
    /// 列挙型の値が不正
    #[error("invalid value {value} for {name}")]
    InvalidEnum { name: &'static str, value: u32 },
    /// boolが0/1以外
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    /// 文字列がUTF-8ではない
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    /// 期待と異なるメッセージ種別
    #[error("expected {expected:?} message, found {found:?}")]
    UnexpectedMessageType { expected: MsgType, found: MsgType },
    /// 通知として解釈できないメッセージ種別
    #[error("{0:?} is not a notification")]
    NotNotification(MsgType),
    /// 再帰するレコードの入れ子が深すぎる
    #[error("record nesting exceeds {0} levels")]
    NestingTooDeep(usize),
}
