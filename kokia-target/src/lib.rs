//! Kokia ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! アーキテクチャごとのブレークポイント命令の扱いと、プロセス・スレッド・メモリを
//! 操作するOSサービスのトレイト、およびそのptraceによる実装を含みます。

pub mod arch;
pub mod os;

#[cfg(target_os = "linux")]
pub mod linux;

pub use arch::{ArchProvider, Arm64Arch, X64Arch};
pub use os::{ExceptionKind, OsEvent, Platform, ProcessHandle, ThreadHandle};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
