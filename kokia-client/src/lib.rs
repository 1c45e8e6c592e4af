//! Kokia デバッガクライアント
//!
//! エージェントにプロトコルで要求を送り、ターゲット・スレッド・ブレークポイントの
//! 状態を保ちながらステップ実行を制御します。処理はすべて単一スレッドの
//! メッセージループ上で行われます。

pub mod breakpoint;
pub mod config;
pub mod controller;
pub mod error;
pub mod message_loop;
pub mod mock_remote_api;
pub mod observer;
pub mod process;
pub mod remote_api;
pub mod remote_api_impl;
pub mod session;
pub mod stack;
pub mod symbols;
pub mod target;
pub mod thread;

pub use breakpoint::{Breakpoint, BreakpointScope, InputLocation, InternalBreakpoint, ScopeKind};
pub use config::SessionConfig;
pub use controller::{
    ContinueOp, FinishController, StepController, StepInRangeController, StepMode,
    StepOverController, StopOp, ThreadController, UntilController,
};
pub use error::{Error, Result};
pub use message_loop::MessageLoop;
pub use mock_remote_api::{MockRemoteApi, MockState};
pub use observer::{SessionEvent, SessionObserver, SubscriptionId};
pub use process::Process;
pub use remote_api::{Callback, RemoteApi};
pub use remote_api_impl::RemoteApiImpl;
pub use session::{Session, System};
pub use stack::{Frame, FrameFingerprint, Stack};
pub use symbols::{ElfSymbols, FunctionSymbol, NoSymbols, SymbolService};
pub use target::{Target, TargetId, TargetState};
pub use thread::{StopInfo, Thread, WeakThread};
