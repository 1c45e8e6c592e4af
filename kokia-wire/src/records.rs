//! メッセージの中で使われるレコード型

use crate::{wire_enum, wire_record, Deserialize, Reader, Serialize, Status, WireError, Writer};

wire_enum! {
    /// スレッドの状態
    pub enum ThreadState {
        Running = 0,
        Suspended = 1,
        Blocked = 2,
        Dying = 3,
        Dead = 4,
    }
}

wire_enum! {
    /// スレッドレコードに含まれるスタックの量
    pub enum StackAmount {
        None = 0,
        /// 先頭2フレーム（存在する場合）
        Minimal = 1,
        Full = 2,
    }
}

wire_enum! {
    pub enum ProcessTreeKind {
        Job = 0,
        Process = 1,
    }
}

wire_enum! {
    /// ブレークポイントヒット時に停止させる範囲
    pub enum Stop {
        /// 全プロセスの全スレッド
        All = 0,
        /// ヒットしたプロセスの全スレッド
        Process = 1,
        /// ヒットしたスレッドのみ
        Thread = 2,
    }
}

wire_enum! {
    /// 例外の種類
    pub enum ExceptionType {
        General = 0,
        Hardware = 1,
        SingleStep = 2,
        Software = 3,
    }
}

wire_enum! {
    /// 再開方法
    pub enum ResumeHow {
        Continue = 0,
        StepInstruction = 1,
        /// IPが `[range_begin, range_end)` にある間シングルステップを続ける
        StepInRange = 2,
    }
}

wire_enum! {
    pub enum Arch {
        Unknown = 0,
        X64 = 1,
        Arm64 = 2,
    }
}

wire_record! {
    /// スタックフレーム（bp = 0 は不明）
    pub struct StackFrame {
        pub ip: u64,
        pub sp: u64,
        pub bp: u64,
    }
}

impl StackFrame {
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        Self { ip, sp, bp }
    }
}

wire_record! {
    pub struct ThreadRecord {
        pub process_koid: u64,
        pub thread_koid: u64,
        pub name: String,
        pub state: ThreadState,
        pub stack_amount: StackAmount,
        pub frames: Vec<StackFrame>,
    }
}

/// プロセスツリーの入れ子の上限（これより深い応答はデコードエラー）
pub const MAX_TREE_DEPTH: usize = 256;

/// プロセスツリーのノード
///
/// 再帰するので深さを数えながらデコードする。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTreeRecord {
    pub kind: ProcessTreeKind,
    pub koid: u64,
    pub name: String,
    pub children: Vec<ProcessTreeRecord>,
}

impl ProcessTreeRecord {
    fn deserialize_at(r: &mut Reader<'_>, depth: usize) -> Result<Self, WireError> {
        if depth >= MAX_TREE_DEPTH {
            return Err(WireError::NestingTooDeep(MAX_TREE_DEPTH));
        }
        let kind = ProcessTreeKind::deserialize(r)?;
        let koid = u64::deserialize(r)?;
        let name = String::deserialize(r)?;
        let count = r.read_len()?;
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(Self::deserialize_at(r, depth + 1)?);
        }
        Ok(Self { kind, koid, name, children })
    }
}

impl Serialize for ProcessTreeRecord {
    fn serialize(&self, w: &mut Writer) {
        self.kind.serialize(w);
        self.koid.serialize(w);
        self.name.serialize(w);
        self.children.serialize(w);
    }
}

impl Deserialize for ProcessTreeRecord {
    fn deserialize(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Self::deserialize_at(r, 0)
    }
}

wire_record! {
    /// 読み取ったメモリ領域（valid = false なら data は空）
    pub struct MemoryBlock {
        pub address: u64,
        pub valid: bool,
        pub size: u32,
        pub data: Vec<u8>,
    }
}

wire_record! {
    pub struct Module {
        pub name: String,
        pub base: u64,
    }
}

wire_record! {
    pub struct AddressRegion {
        pub name: String,
        pub base: u64,
        pub size: u64,
        pub depth: u64,
    }
}

wire_record! {
    /// レジスタ値（リトルエンディアンのバイト列）
    pub struct Register {
        pub id: u32,
        pub data: Vec<u8>,
    }
}

impl Register {
    pub fn from_u64(id: u32, value: u64) -> Self {
        Self { id, data: value.to_le_bytes().to_vec() }
    }

    /// 先頭8バイトまでを数値として読む
    pub fn value(&self) -> u64 {
        let mut bytes = [0u8; 8];
        let len = self.data.len().min(8);
        bytes[..len].copy_from_slice(&self.data[..len]);
        u64::from_le_bytes(bytes)
    }
}

wire_record! {
    /// 1つのロケーション（thread_koid = 0 は全スレッド）
    pub struct ProcessBreakpointSettings {
        pub process_koid: u64,
        pub thread_koid: u64,
        pub address: u64,
    }
}

wire_record! {
    pub struct BreakpointSettings {
        pub breakpoint_id: u32,
        pub stop: Stop,
        pub one_shot: bool,
        pub locations: Vec<ProcessBreakpointSettings>,
    }
}

wire_record! {
    pub struct BreakpointStats {
        pub breakpoint_id: u32,
        pub hit_count: u32,
        /// ワンショットのため削除された
        pub should_delete: bool,
    }
}

wire_record! {
    /// 適用できなかったロケーション
    pub struct LocationError {
        pub process_koid: u64,
        pub thread_koid: u64,
        pub address: u64,
        pub status: Status,
    }
}
