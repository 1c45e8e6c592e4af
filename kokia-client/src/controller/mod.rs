//! スレッドコントローラ
//!
//! ステップ実行の方針を表すオブジェクトです。スレッドに1つだけ付き、停止のたびに
//! 透過的に再開するか、ユーザーに停止を見せるかを決めます。`Stop` を返すか、
//! ユーザーのブレークポイントで止まるか、スレッドが消えると破棄されます。

mod finish;
mod step;
mod step_in_range;
mod step_over;
mod until;

pub use finish::FinishController;
pub use step::{StepController, StepMode};
pub use step_in_range::StepInRangeController;
pub use step_over::StepOverController;
pub use until::UntilController;

use crate::error::Result;
use crate::session::Session;
use crate::stack::FrameFingerprint;
use crate::thread::{StopInfo, WeakThread};
use kokia_wire::MemoryBlock;

/// 停止に対する判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOp {
    /// 透過的に再開する
    Continue,
    /// 停止をユーザーに見せる（コントローラは終了）
    Stop,
    /// スレッドを止めたまま、依頼したメモリの読み出しを待つ
    ///
    /// 結果は [`ThreadController::on_memory_read`] に届き、その戻り値で続きが決まる。
    Wait,
}

/// コントローラが付いている間の再開方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOp {
    Continue,
    StepInstruction,
    /// IPが `[begin, end)` を出るまでエージェント側でステップする
    StepInRange { begin: u64, end: u64 },
}

pub trait ThreadController {
    fn name(&self) -> &'static str;

    /// 開始前に全フレームが必要か
    fn needs_full_stack(&self) -> bool {
        false
    }

    /// スレッドに付くときに1度だけ呼ばれる
    fn init_with_thread(&mut self, session: &mut Session, thread: &WeakThread) -> Result<()>;

    fn continue_op(&self) -> ContinueOp;

    fn on_thread_stop(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        stop: &StopInfo,
    ) -> StopOp;

    /// [`Session::read_memory_for_controller`] で依頼した読み出しの結果
    fn on_memory_read(
        &mut self,
        _session: &mut Session,
        _thread: &WeakThread,
        _address: u64,
        _blocks: Result<Vec<MemoryBlock>>,
    ) -> StopOp {
        StopOp::Stop
    }
}

/// スレッドの現在のIPとフレーム0のフィンガープリント
pub(crate) fn current_position(
    session: &Session,
    thread: &WeakThread,
) -> Option<(u64, FrameFingerprint)> {
    let thread = session.thread(thread)?;
    let ip = thread.ip()?;
    let fingerprint = thread.stack().fingerprint(0).ok()?;
    Some((ip, fingerprint))
}

/// `[begin, end)` に含まれるか（終端は含まない）
pub fn in_range(ip: u64, begin: u64, end: u64) -> bool {
    begin <= ip && ip < end
}
