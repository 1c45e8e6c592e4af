//! ステップオーバー

use super::{current_position, in_range, ContinueOp, StopOp, ThreadController};
use crate::breakpoint::InternalBreakpoint;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stack::{Frame, FrameFingerprint};
use crate::thread::{StopInfo, WeakThread};
use kokia_wire::MemoryBlock;
use tracing::{debug, warn};

/// 戻りアドレスのバイト数
const RETURN_ADDRESS_SIZE: u32 = 8;

/// 範囲をステップし、呼び出しは戻り先まで実行してしまう
///
/// 新しいフレームは命令のデコードではなくフレームの比較で見つけます。
/// プロローグ前の呼び出し先はベースポインタが呼び出し元のままなので、
/// フレームポインタの巻き戻しでは呼び出し元のフレームが見えません。
/// ベースポインタが開始時と同じでスタックポインタだけが下がっていれば
/// `[sp]` の戻りアドレスを読み、範囲内からの呼び出しなら戻り先で待ちます。
#[derive(Debug)]
pub struct StepOverController {
    begin: u64,
    end: u64,
    start: Option<FrameFingerprint>,
    /// 開始時のフレーム0
    start_frame: Option<Frame>,
    /// 呼び出しの戻り先に置いたブレークポイント
    return_breakpoint: Option<InternalBreakpoint>,
}

impl StepOverController {
    pub fn new(begin: u64, end: u64) -> Self {
        Self {
            begin,
            end,
            start: None,
            start_frame: None,
            return_breakpoint: None,
        }
    }

    pub fn is_waiting_for_return(&self) -> bool {
        self.return_breakpoint.is_some()
    }

    /// 戻り先にブレークポイントを置いて呼び出し先を走らせる
    fn run_to_return(&mut self, session: &mut Session, thread: &WeakThread, return_address: u64) -> StopOp {
        match session.add_internal_breakpoint(thread, return_address) {
            Ok(bp) => {
                debug!("Stepping over call, return at {:#x}", return_address);
                self.return_breakpoint = Some(bp);
                StopOp::Continue
            }
            Err(e) => {
                warn!("Cannot plant return breakpoint: {}", e);
                StopOp::Stop
            }
        }
    }

    /// プロローグ前の呼び出し先に入ったばかりに見えるか
    fn entered_without_frame(&self, frame: &Frame) -> bool {
        let Some(start) = &self.start_frame else {
            return false;
        };
        start.bp != 0 && frame.bp == start.bp && frame.sp < start.sp
    }
}

impl ThreadController for StepOverController {
    fn name(&self) -> &'static str {
        "StepOver"
    }

    fn init_with_thread(&mut self, session: &mut Session, thread: &WeakThread) -> Result<()> {
        if self.begin >= self.end {
            return Err(Error::BadState("empty step range"));
        }
        let thread = session.thread(thread).ok_or_else(|| Error::NotFound("thread".into()))?;
        self.start = Some(thread.stack().fingerprint(0)?);
        self.start_frame = thread.stack().frame(0).copied();
        Ok(())
    }

    fn continue_op(&self) -> ContinueOp {
        if self.return_breakpoint.is_some() {
            ContinueOp::Continue
        } else {
            ContinueOp::StepInRange { begin: self.begin, end: self.end }
        }
    }

    fn on_thread_stop(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        stop: &StopInfo,
    ) -> StopOp {
        let (Some(start), Some((ip, fingerprint))) = (self.start, current_position(session, thread))
        else {
            return StopOp::Stop;
        };

        if let Some(bp) = &self.return_breakpoint {
            if !stop.hit_breakpoints.contains(&bp.id()) {
                return StopOp::Continue;
            }
            if fingerprint.is_newer_than(start) {
                // 再帰呼び出しの中で戻り先に来た
                return StopOp::Continue;
            }
            debug!("Returned to {:#x}, resuming range stepping", ip);
            self.return_breakpoint = None;
        }

        if fingerprint.is_newer_than(start) {
            let return_address = session
                .thread(thread)
                .and_then(|t| t.stack().frame(1))
                .map(|f| f.ip);
            let Some(return_address) = return_address else {
                warn!("No return address for the call at {:#x}", ip);
                return StopOp::Stop;
            };
            return self.run_to_return(session, thread, return_address);
        }

        if start.is_newer_than(fingerprint) {
            // 関数から戻った
            return StopOp::Stop;
        }
        if in_range(ip, self.begin, self.end) {
            return StopOp::Continue;
        }

        let frame0 = session.thread(thread).and_then(|t| t.stack().frame(0)).copied();
        match frame0 {
            Some(frame) if self.entered_without_frame(&frame) => {
                debug!("Possible call into {:#x} before its prologue", ip);
                session.read_memory_for_controller(thread, frame.sp, RETURN_ADDRESS_SIZE);
                StopOp::Wait
            }
            _ => StopOp::Stop,
        }
    }

    fn on_memory_read(
        &mut self,
        session: &mut Session,
        thread: &WeakThread,
        address: u64,
        blocks: Result<Vec<MemoryBlock>>,
    ) -> StopOp {
        let return_address = blocks.ok().and_then(|blocks| {
            let block = blocks.into_iter().next().filter(|b| b.valid)?;
            let bytes: [u8; 8] = block.data.get(..8)?.try_into().ok()?;
            Some(u64::from_le_bytes(bytes))
        });
        match return_address {
            // 範囲内の call の次の命令（範囲の終端も含む）
            Some(ra) if self.begin < ra && ra <= self.end => self.run_to_return(session, thread, ra),
            Some(ra) => {
                debug!("[{:#x}] = {:#x} is not a return into the range", address, ra);
                StopOp::Stop
            }
            None => {
                warn!("Cannot read the return address at {:#x}", address);
                StopOp::Stop
            }
        }
    }
}
