//! 指定アドレスまで実行

use super::{current_position, ContinueOp, StopOp, ThreadController};
use crate::breakpoint::InternalBreakpoint;
use crate::error::Result;
use crate::session::Session;
use crate::stack::FrameFingerprint;
use crate::thread::{StopInfo, WeakThread};
use kokia_wire::ExceptionType;
use tracing::debug;

/// アドレスにブレークポイントを置いて走らせる
///
/// しきい値があれば、それより新しいフレームでのヒット（再帰の内側）は無視します。
#[derive(Debug)]
pub struct UntilController {
    address: u64,
    threshold: Option<FrameFingerprint>,
    breakpoint: Option<InternalBreakpoint>,
}

impl UntilController {
    pub fn new(address: u64) -> Self {
        Self { address, threshold: None, breakpoint: None }
    }

    pub fn with_threshold(address: u64, threshold: FrameFingerprint) -> Self {
        Self { address, threshold: Some(threshold), breakpoint: None }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn threshold(&self) -> Option<FrameFingerprint> {
        self.threshold
    }
}

impl ThreadController for UntilController {
    fn name(&self) -> &'static str {
        "Until"
    }

    fn init_with_thread(&mut self, session: &mut Session, thread: &WeakThread) -> Result<()> {
        self.breakpoint = Some(session.add_internal_breakpoint(thread, self.address)?);
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
        let ours = self
            .breakpoint
            .as_ref()
            .is_some_and(|bp| stop.hit_breakpoints.contains(&bp.id()));
        if !ours {
            return match stop.exception_type {
                ExceptionType::SingleStep => StopOp::Continue,
                _ => StopOp::Stop,
            };
        }

        if let (Some(threshold), Some((ip, fingerprint))) =
            (self.threshold, current_position(session, thread))
        {
            if fingerprint.is_newer_than(threshold) {
                debug!("Hit {:#x} in a newer frame, continuing", ip);
                return StopOp::Continue;
            }
        }
        StopOp::Stop
    }
}
