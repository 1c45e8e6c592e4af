//! 応答に含まれるステータスコード

use crate::{Deserialize, Reader, Serialize, WireError, Writer};
use std::fmt;

/// マシンステータス
///
/// プロトコルレベルの成否とは別に、要求された操作の結果を表します。
/// 未知の値もそのまま保持します。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const NOT_FOUND: Status = Status(1);
    pub const BAD_STATE: Status = Status(2);
    pub const INVALID_ARGS: Status = Status(3);
    pub const IO: Status = Status(4);
    pub const NOT_SUPPORTED: Status = Status(5);
    pub const ALREADY_EXISTS: Status = Status(6);
    /// ブレークポイントの一部のロケーションだけが適用された
    pub const PARTIAL: Status = Status(7);
    pub const VERSION_MISMATCH: Status = Status(8);

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Status::OK => "ok",
            Status::NOT_FOUND => "not found",
            Status::BAD_STATE => "bad state",
            Status::INVALID_ARGS => "invalid arguments",
            Status::IO => "i/o error",
            Status::NOT_SUPPORTED => "not supported",
            Status::ALREADY_EXISTS => "already exists",
            Status::PARTIAL => "partially applied",
            Status::VERSION_MISMATCH => "version mismatch",
            Status(other) => return write!(f, "status {}", other),
        };
        f.write_str(name)
    }
}

impl Serialize for Status {
    fn serialize(&self, w: &mut Writer) {
        w.write_i32(self.0);
    }
}

impl Deserialize for Status {
    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Status(r.read_i32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_is_preserved() {
        let mut w = Writer::new();
        Status(-17).serialize(&mut w);
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        let status = Status::deserialize(&mut r).unwrap();
        assert_eq!(status, Status(-17));
        assert_eq!(status.to_string(), "status -17");
    }
}
