//! クライアントのエラー型

use kokia_wire::{Arch, Status, WireError};

/// クライアント操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// 応答がデコードできない、または接続上のプロトコル違反
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
    /// エージェントが失敗のステータスを返した
    #[error("agent returned {0}")]
    Remote(Status),
    #[error("invalid breakpoint scope: {0}")]
    InvalidScope(&'static str),
    #[error("invalid breakpoint location: {0}")]
    InvalidLocation(&'static str),
    #[error("breakpoint has no resolvable location")]
    NoResolvableLocation,
    #[error("{0} not found")]
    NotFound(String),
    #[error("bad state: {0}")]
    BadState(&'static str),
    /// 完全なバックトレースがないと計算できないフレームを要求した
    #[error("frame {0} is not available without the full stack")]
    FramesUnavailable(usize),
    #[error("agent protocol version {remote} does not match {local}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("unsupported architecture {0:?}")]
    UnsupportedArch(Arch),
    #[error("connection error: {0}")]
    Connection(String),
    /// 操作の対象が完了前に消えた
    #[error("operation abandoned")]
    Abandoned,
}

/// クライアント操作の結果型
pub type Result<T> = std::result::Result<T, Error>;

/// 応答のステータスを結果に変換する
pub fn check_status(status: Status) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(Error::Remote(status))
    }
}
