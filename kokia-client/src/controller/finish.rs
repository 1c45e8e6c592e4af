//! フレームから抜けるまで実行（ステップアウト）

use super::{ContinueOp, StopOp, ThreadController, UntilController};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::thread::{StopInfo, WeakThread};

/// フレーム N の戻り先まで実行する
///
/// 戻り先はフレーム N+1 のIP、しきい値はフレーム N+1 のフィンガープリントです。
/// 深いフレームのフィンガープリントを使うので全フレームが必要です。
#[derive(Debug)]
pub struct FinishController {
    frame: usize,
    until: Option<UntilController>,
}

impl FinishController {
    pub fn new(frame: usize) -> Self {
        Self { frame, until: None }
    }
}

impl ThreadController for FinishController {
    fn name(&self) -> &'static str {
        "Finish"
    }

    fn needs_full_stack(&self) -> bool {
        true
    }

    fn init_with_thread(&mut self, session: &mut Session, thread: &WeakThread) -> Result<()> {
        let stack = session
            .thread(thread)
            .ok_or_else(|| Error::NotFound("thread".into()))?
            .stack();
        let caller = self.frame + 1;
        let return_address = stack
            .frame(caller)
            .map(|f| f.ip)
            .ok_or(Error::BadState("no calling frame to return to"))?;
        let threshold = stack.fingerprint(caller)?;

        let mut until = UntilController::with_threshold(return_address, threshold);
        until.init_with_thread(session, thread)?;
        self.until = Some(until);
        Ok(())
    }

    fn continue_op(&self) -> ContinueOp {
        ContinueOp::Continue
    }

    fn on_thread_stop(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        stop: &StopInfo,
    ) -> StopOp {
        match self.until.as_mut() {
            Some(until) => until.on_thread_stop(session, thread, stop),
            None => StopOp::Stop,
        }
    }
}
