//! Kokia デバッグエージェント
//!
//! デバッグ対象の隣で動き、クライアントからの要求を受けてスレッドとメモリを操作します。
//!
//! - [`Dispatcher`]: 受信バイト列をメッセージに切り出して [`RequestHandler`] に振り分ける
//! - [`DebugAgent`]: 要求の処理とOSイベントの通知への変換
//! - [`DebuggedThread`]: スレッドごとの停止理由とブレークポイント踏み越えの状態機械

pub mod agent;
pub mod breakpoint;
pub mod config;
pub mod debugged_process;
pub mod debugged_thread;
pub mod dispatcher;
pub mod process_breakpoint;
pub mod remote_api;
pub mod unwind;

pub use agent::DebugAgent;
pub use breakpoint::Breakpoint;
pub use config::AgentConfig;
pub use debugged_process::DebuggedProcess;
pub use debugged_thread::{
    AfterBreakpointStep, DebuggedThread, ExceptionOutcome, RunMode, SuspendReason, ThreadContext,
};
pub use dispatcher::{DispatchState, Dispatcher};
pub use process_breakpoint::{ProcessBreakpoint, ProcessBreakpoints};
pub use remote_api::RequestHandler;

/// エージェントの結果型
pub type Result<T> = anyhow::Result<T>;
