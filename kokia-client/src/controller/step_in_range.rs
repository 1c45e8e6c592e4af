//! 範囲内ステップ

use super::{current_position, in_range, ContinueOp, StopOp, ThreadController};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::thread::{StopInfo, WeakThread};
use tracing::debug;

/// IPが `[begin, end)` にある間は再開し、出たら止まる
#[derive(Debug)]
pub struct StepInRangeController {
    begin: u64,
    end: u64,
}

impl StepInRangeController {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }
}

impl ThreadController for StepInRangeController {
    fn name(&self) -> &'static str {
        "StepInRange"
    }

    fn init_with_thread(&mut self, _session: &mut Session, _thread: &WeakThread) -> Result<()> {
        if self.begin >= self.end {
            return Err(Error::BadState("empty step range"));
        }
        Ok(())
    }

    fn continue_op(&self) -> ContinueOp {
        ContinueOp::StepInRange { begin: self.begin, end: self.end }
    }

    fn on_thread_stop(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        _stop: &StopInfo,
    ) -> StopOp {
        match current_position(session, thread) {
            Some((ip, _)) if in_range(ip, self.begin, self.end) => {
                debug!("Spurious stop at {:#x} inside range", ip);
                StopOp::Continue
            }
            _ => StopOp::Stop,
        }
    }
}
