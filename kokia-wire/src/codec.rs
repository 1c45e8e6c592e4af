//! バイナリシリアライズ
//!
//! 数値は固定幅リトルエンディアン、文字列は `u32` 長 + 生バイト列、
//! ベクタは `u32` 要素数 + 要素列で表現します。

use crate::WireError;

/// 値を書き込むバッファ
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// 空のライターを作成する
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// 書き込み済みのバイト数
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 書き込み済みのバイト列
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// 内部バッファを取り出す
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// 指定位置の `u32` を書き換える（ヘッダのサイズ埋め戻し用）
    pub(crate) fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// 長さ付きバイト列を書き込む
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// 長さ付き文字列を書き込む（終端NULなし）
    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }
}

/// バイト列から値を読み出すカーソル
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// 残りのバイト数
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.remaining() {
            return Err(WireError::TruncatedMessage {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let s = self.take(8)?;
        Ok(u64::from_le_bytes([
            s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
        ]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    /// 要素数・長さフィールドを読む
    ///
    /// 1要素は最低1バイトなので、残りバイト数を超える宣言はその場で拒否する。
    pub fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(WireError::TruncatedMessage {
                needed: len,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_len()?;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}

/// ライターへの書き込み
pub trait Serialize {
    fn serialize(&self, w: &mut Writer);
}

/// リーダーからの読み出し
pub trait Deserialize: Sized {
    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError>;
}

macro_rules! impl_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Serialize for $ty {
            fn serialize(&self, w: &mut Writer) {
                w.$write(*self);
            }
        }

        impl Deserialize for $ty {
            fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
                r.$read()
            }
        }
    };
}

impl_primitive!(bool, write_bool, read_bool);
impl_primitive!(u8, write_u8, read_u8);
impl_primitive!(u32, write_u32, read_u32);
impl_primitive!(u64, write_u64, read_u64);
impl_primitive!(i32, write_i32, read_i32);
impl_primitive!(i64, write_i64, read_i64);

impl Serialize for String {
    fn serialize(&self, w: &mut Writer) {
        w.write_str(self);
    }
}

impl Deserialize for String {
    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.read_string()
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize(&self, w: &mut Writer) {
        w.write_u32(self.len() as u32);
        for item in self {
            item.serialize(w);
        }
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = r.read_len()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::deserialize(r)?);
        }
        Ok(items)
    }
}

/// フィールド順にシリアライズされるレコード構造体を定義する
#[macro_export]
macro_rules! wire_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                pub $field:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $fty,
            )*
        }

        impl $crate::Serialize for $name {
            #[allow(unused_variables)]
            fn serialize(&self, w: &mut $crate::Writer) {
                $($crate::Serialize::serialize(&self.$field, w);)*
            }
        }

        impl $crate::Deserialize for $name {
            #[allow(unused_variables)]
            fn deserialize(r: &mut $crate::Reader<'_>) -> Result<Self, $crate::WireError> {
                Ok(Self {
                    $($field: $crate::Deserialize::deserialize(r)?,)*
                })
            }
        }
    };
}

/// `u32` の序数で表現される列挙型を定義する（先頭のバリアントがデフォルト）
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(#[$first_meta:meta])*
            $first:ident = $first_value:literal
            $(
                ,
                $(#[$vmeta:meta])*
                $variant:ident = $value:literal
            )* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $(#[$first_meta])*
            $first = $first_value,
            $(
                $(#[$vmeta])*
                $variant = $value,
            )*
        }

        impl $name {
            /// 序数から変換する
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $first_value => Some(Self::$first),
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$first
            }
        }

        impl $crate::Serialize for $name {
            fn serialize(&self, w: &mut $crate::Writer) {
                w.write_u32(*self as u32);
            }
        }

        impl $crate::Deserialize for $name {
            fn deserialize(r: &mut $crate::Reader<'_>) -> Result<Self, $crate::WireError> {
                let value = r.read_u32()?;
                Self::from_u32(value).ok_or($crate::WireError::InvalidEnum {
                    name: stringify!($name),
                    value,
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut w = Writer::new();
        w.write_u32(0x0403_0201);
        w.write_u64(0x0807_0605_0403_0201);
        assert_eq!(
            w.as_bytes(),
            &[1, 2, 3, 4, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_string_has_no_terminator() {
        let mut w = Writer::new();
        "abc".to_string().serialize(&mut w);
        assert_eq!(w.as_bytes(), &[3, 0, 0, 0, b'a', b'b', b'c']);

        let mut w = Writer::new();
        String::new().serialize(&mut w);
        assert_eq!(w.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_string() {
        // 長さ10と宣言しているが実体は3バイト
        let bytes = [10, 0, 0, 0, b'a', b'b', b'c'];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            r.read_string(),
            Err(WireError::TruncatedMessage { needed: 10, remaining: 3 })
        );
    }

    #[test]
    fn test_huge_vector_count_is_rejected() {
        // 要素数 0xFFFFFFFF を宣言してもアロケーションせずにエラーになる
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 1, 2];
        let mut r = Reader::new(&bytes);
        let result = Vec::<u64>::deserialize(&mut r);
        assert!(matches!(result, Err(WireError::TruncatedMessage { .. })));
    }

    #[test]
    fn test_vector_element_truncated() {
        // 要素数2、u64が1つ半しかない
        let mut bytes = vec![2, 0, 0, 0];
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            Vec::<u64>::deserialize(&mut r),
            Err(WireError::TruncatedMessage { needed: 8, remaining: 4 })
        ));
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = Reader::new(&[2]);
        assert_eq!(r.read_bool(), Err(WireError::InvalidBool(2)));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [2, 0, 0, 0, 0xC3, 0x28];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string(), Err(WireError::InvalidUtf8));
    }
}
