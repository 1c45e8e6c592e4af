//! OSサービスの抽象化
//!
//! エージェントはプロセス・スレッド・メモリをこれらのトレイト越しに操作します。
//! テストでは偽の実装に差し替えられます。

use crate::Result;
use kokia_wire::{AddressRegion, ExceptionType, Module, ProcessTreeRecord, Register};

/// スレッドの停止要因となった例外の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// ブレークポイント命令によるトラップ
    SoftwareBreakpoint,
    /// シングルステップ完了
    SingleStep,
    HardwareBreakpoint,
    /// その他のシグナル（再開時に配送する）
    General(i32),
}

impl ExceptionKind {
    pub fn exception_type(self) -> ExceptionType {
        match self {
            ExceptionKind::SoftwareBreakpoint => ExceptionType::Software,
            ExceptionKind::SingleStep => ExceptionType::SingleStep,
            ExceptionKind::HardwareBreakpoint => ExceptionType::Hardware,
            ExceptionKind::General(_) => ExceptionType::General,
        }
    }
}

/// OSから届くイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsEvent {
    ThreadStarting { pid: u64, tid: u64 },
    ThreadExited { pid: u64, tid: u64 },
    ProcessExited { pid: u64, code: i64 },
    Exception { pid: u64, tid: u64, kind: ExceptionKind },
    /// サスペンド要求による停止
    Stopped { pid: u64, tid: u64 },
}

/// プロセスの起動・アタッチとイベント取得
pub trait Platform {
    /// 実行ファイルを起動する（最初のスレッドは停止状態）
    fn launch(&mut self, argv: &[String]) -> Result<Box<dyn ProcessHandle>>;

    /// 既存プロセスにアタッチする（全スレッドは停止状態）
    fn attach(&mut self, pid: u64) -> Result<Box<dyn ProcessHandle>>;

    fn process_tree(&self) -> Result<ProcessTreeRecord>;

    /// 溜まっているイベントをブロックせずに取り出す
    fn poll_events(&mut self) -> Vec<OsEvent>;
}

/// デバッグ対象プロセス
pub trait ProcessHandle {
    fn koid(&self) -> u64;

    fn name(&self) -> String;

    fn thread_koids(&self) -> Result<Vec<u64>>;

    fn thread(&self, koid: u64) -> Box<dyn ThreadHandle>;

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()>;

    fn address_space(&self) -> Result<Vec<AddressRegion>>;

    fn modules(&self) -> Result<Vec<Module>>;

    fn kill(&self) -> Result<()>;

    fn detach(&self) -> Result<()>;
}

/// デバッグ対象スレッド
pub trait ThreadHandle {
    fn koid(&self) -> u64;

    fn name(&self) -> String;

    /// 停止を要求する
    ///
    /// 非同期であり、戻った時点で停止しているとは限りません。
    /// 停止すると `OsEvent::Stopped` が届きます。
    fn suspend(&self) -> Result<()>;

    /// 実行を再開する（`signal` は配送するシグナル）
    fn resume(&self, single_step: bool, signal: Option<i32>) -> Result<()>;

    fn read_registers(&self) -> Result<Vec<Register>>;

    /// 指定されたレジスタだけを書き換える
    fn write_registers(&self, registers: &[Register]) -> Result<()>;
}
