//! ステップイン

use super::{current_position, in_range, ContinueOp, StopOp, ThreadController};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stack::FrameFingerprint;
use crate::thread::{StopInfo, WeakThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// 1命令だけ進める
    Instruction,
    /// 範囲を出るか呼び出しに入るまで進める
    Range { begin: u64, end: u64 },
}

#[derive(Debug)]
pub struct StepController {
    mode: StepMode,
    start: Option<FrameFingerprint>,
}

impl StepController {
    pub fn new(mode: StepMode) -> Self {
        Self { mode, start: None }
    }
}

impl ThreadController for StepController {
    fn name(&self) -> &'static str {
        "Step"
    }

    fn init_with_thread(&mut self, session: &mut Session, thread: &WeakThread) -> Result<()> {
        if let StepMode::Range { begin, end } = self.mode {
            if begin >= end {
                return Err(Error::BadState("empty step range"));
            }
            let thread = session.thread(thread).ok_or_else(|| Error::NotFound("thread".into()))?;
            self.start = Some(thread.stack().fingerprint(0)?);
        }
        Ok(())
    }

    fn continue_op(&self) -> ContinueOp {
        match self.mode {
            StepMode::Instruction => ContinueOp::StepInstruction,
            StepMode::Range { begin, end } => ContinueOp::StepInRange { begin, end },
        }
    }

    fn on_thread_stop(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        _stop: &StopInfo,
    ) -> StopOp {
        let StepMode::Range { begin, end } = self.mode else {
            return StopOp::Stop;
        };
        let (Some(start), Some((ip, fingerprint))) = (self.start, current_position(session, thread))
        else {
            return StopOp::Stop;
        };
        // 呼び出し先に入ったらそこで止まる
        if fingerprint.is_newer_than(start) || !in_range(ip, begin, end) {
            StopOp::Stop
        } else {
            StopOp::Continue
        }
    }
}
