//! デバッグ対象スレッドの状態機械
//!
//! スレッドはOSからの例外イベントとクライアントからの要求だけで遷移します。
//!
//! - 実行中: `SuspendReason::None`
//! - 例外で停止: `SuspendReason::Exception`
//! - Pause要求で停止: `SuspendReason::Other`
//!
//! ブレークポイントで止まったスレッドを再開するときは、そのアドレスの
//! ブレークポイントを一時的に外して1命令だけ実行し、戻してから
//! `AfterBreakpointStep` に従って黙って再開するか通知します。

use crate::process_breakpoint::ProcessBreakpoints;
use crate::unwind;
use anyhow::Result;
use kokia_target::{ArchProvider, ExceptionKind, ProcessHandle, ThreadHandle};
use kokia_wire::{
    ExceptionType, Register, ResumeHow, StackAmount, StackFrame, ThreadRecord, ThreadState,
};
use tracing::{debug, trace};

/// 停止の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// デバッガが止めたのではない（再開もできない）
    None,
    /// デバッガが原因の例外・ブレークポイントで止まった
    Exception,
    /// Pause要求で止めた
    Other,
}

/// ブレークポイントを踏み越えた後の動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterBreakpointStep {
    /// 実行モードに従って黙って続ける
    Continue,
    /// シングルステップの停止として通知する
    Break,
}

/// 再開後の実行モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continue,
    StepInstruction,
    /// IPが `[begin, end)` にある間シングルステップを続ける
    StepInRange { begin: u64, end: u64 },
}

impl RunMode {
    pub fn from_request(how: ResumeHow, begin: u64, end: u64) -> Self {
        match how {
            ResumeHow::Continue => RunMode::Continue,
            ResumeHow::StepInstruction => RunMode::StepInstruction,
            ResumeHow::StepInRange => RunMode::StepInRange { begin, end },
        }
    }
}

/// 例外処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOutcome {
    /// 通知せずに再開した
    Resumed,
    /// クライアントに通知する（ブレークポイントなら `breakpoint_address` が入る）
    Notify {
        exception_type: ExceptionType,
        breakpoint_address: Option<u64>,
    },
}

impl ExceptionOutcome {
    fn notify(exception_type: ExceptionType) -> Self {
        ExceptionOutcome::Notify { exception_type, breakpoint_address: None }
    }
}

/// スレッド操作に必要なプロセス側の資源
pub struct ThreadContext<'a> {
    pub process: &'a dyn ProcessHandle,
    pub breakpoints: &'a mut ProcessBreakpoints,
    pub arch: &'a dyn ArchProvider,
}

/// デバッグ対象スレッド
pub struct DebuggedThread {
    handle: Box<dyn ThreadHandle>,
    koid: u64,
    suspend_reason: SuspendReason,
    run_mode: RunMode,
    /// 踏み越え待ち・踏み越え中のブレークポイントのアドレス
    current_breakpoint: Option<u64>,
    stepping_over: bool,
    after_breakpoint_step: AfterBreakpointStep,
    /// 再開時に配送するシグナル
    pending_signal: Option<i32>,
}

impl DebuggedThread {
    pub fn new(handle: Box<dyn ThreadHandle>, suspend_reason: SuspendReason) -> Self {
        Self {
            koid: handle.koid(),
            handle,
            suspend_reason,
            run_mode: RunMode::Continue,
            current_breakpoint: None,
            stepping_over: false,
            after_breakpoint_step: AfterBreakpointStep::Continue,
            pending_signal: None,
        }
    }

    pub fn koid(&self) -> u64 {
        self.koid
    }

    pub fn suspend_reason(&self) -> SuspendReason {
        self.suspend_reason
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_reason != SuspendReason::None
    }

    pub fn current_breakpoint(&self) -> Option<u64> {
        self.current_breakpoint
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// 停止を要求する（停止済みなら何もしない）
    pub fn pause(&mut self) -> Result<()> {
        if self.is_suspended() {
            return Ok(());
        }
        self.suspend_reason = SuspendReason::Other;
        self.handle.suspend()
    }

    /// クライアントからの再開要求
    ///
    /// デバッガが止めていないスレッドに対しては何もしない。
    pub fn resume(&mut self, ctx: &mut ThreadContext<'_>, mode: RunMode) -> Result<()> {
        if !self.is_suspended() {
            return Ok(());
        }
        self.run_mode = mode;
        self.continue_execution(ctx)
    }

    /// 現在の実行モードのまま再開する
    pub fn continue_execution(&mut self, ctx: &mut ThreadContext<'_>) -> Result<()> {
        self.suspend_reason = SuspendReason::None;
        self.issue_resume(ctx)
    }

    fn issue_resume(&mut self, ctx: &mut ThreadContext<'_>) -> Result<()> {
        if let Some(address) = self.current_breakpoint {
            if !self.stepping_over {
                if let Some(bp) = ctx.breakpoints.get_mut(address) {
                    bp.begin_step_over(ctx.process);
                }
                self.stepping_over = true;
                self.after_breakpoint_step = if self.run_mode == RunMode::StepInstruction {
                    AfterBreakpointStep::Break
                } else {
                    AfterBreakpointStep::Continue
                };
                trace!("Thread {} stepping over breakpoint at 0x{:x}", self.koid, address);
            }
            return self.handle.resume(true, self.pending_signal.take());
        }

        let single_step = self.run_mode != RunMode::Continue;
        self.handle.resume(single_step, self.pending_signal.take())
    }

    /// OSからの例外を処理する
    pub fn on_exception(
        &mut self,
        ctx: &mut ThreadContext<'_>,
        kind: ExceptionKind,
    ) -> Result<ExceptionOutcome> {
        self.suspend_reason = SuspendReason::Exception;
        match kind {
            ExceptionKind::SingleStep => self.on_single_step(ctx),
            ExceptionKind::SoftwareBreakpoint => self.on_software_breakpoint(ctx),
            ExceptionKind::HardwareBreakpoint => Ok(ExceptionOutcome::notify(ExceptionType::Hardware)),
            ExceptionKind::General(signal) => {
                self.pending_signal = Some(signal);
                Ok(ExceptionOutcome::notify(ExceptionType::General))
            }
        }
    }

    fn on_single_step(&mut self, ctx: &mut ThreadContext<'_>) -> Result<ExceptionOutcome> {
        // 再開の判断より先にブレークポイントとの関連を切る
        let stepped_over = self.current_breakpoint.take();
        if let Some(address) = stepped_over {
            self.stepping_over = false;
            if let Some(bp) = ctx.breakpoints.get_mut(address) {
                bp.end_step_over(ctx.process, ctx.arch);
            }
            if self.after_breakpoint_step == AfterBreakpointStep::Break {
                return Ok(ExceptionOutcome::notify(ExceptionType::SingleStep));
            }
        }

        let resume = match self.run_mode {
            RunMode::Continue => stepped_over.is_some(),
            RunMode::StepInstruction => false,
            RunMode::StepInRange { begin, end } => {
                let ip = self.ip(ctx)?;
                begin <= ip && ip < end
            }
        };

        if resume {
            self.continue_execution(ctx)?;
            Ok(ExceptionOutcome::Resumed)
        } else {
            Ok(ExceptionOutcome::notify(ExceptionType::SingleStep))
        }
    }

    fn on_software_breakpoint(&mut self, ctx: &mut ThreadContext<'_>) -> Result<ExceptionOutcome> {
        let ip = self.ip(ctx)?;
        let address = ctx.arch.breakpoint_address_for_exception(ip);

        if ctx.breakpoints.contains(address) {
            // 元の命令から実行し直せるようにIPを戻す
            if ip != address {
                self.set_ip(ctx, address)?;
            }
            self.current_breakpoint = Some(address);
            return Ok(ExceptionOutcome::Notify {
                exception_type: ExceptionType::Software,
                breakpoint_address: Some(address),
            });
        }

        let len = ctx.arch.breakpoint_instruction().len();
        let hardcoded = ctx
            .process
            .read_memory(address, len)
            .map(|bytes| ctx.arch.is_breakpoint_instruction(&bytes))
            .unwrap_or(false);
        if hardcoded {
            // プログラム自身のトラップ命令は飛ばして次の命令から再開する
            let next = ctx.arch.next_instruction_for_software_exception(ip);
            if next != ip {
                self.set_ip(ctx, next)?;
            }
            return Ok(ExceptionOutcome::notify(ExceptionType::Software));
        }

        // 例外の報告前にブレークポイントが外された
        debug!("Thread {} hit a removed breakpoint at 0x{:x}", self.koid, address);
        if ip != address {
            self.set_ip(ctx, address)?;
        }
        self.continue_execution(ctx)?;
        Ok(ExceptionOutcome::Resumed)
    }

    /// サスペンド要求による停止
    pub fn on_stopped(&mut self) -> Result<()> {
        if self.is_suspended() {
            return Ok(());
        }
        // Pauseの後に再開されていた。直前の再開をやり直す
        let single_step = self.stepping_over || self.run_mode != RunMode::Continue;
        self.handle.resume(single_step, None)
    }

    pub fn read_registers(&self) -> Result<Vec<Register>> {
        self.handle.read_registers()
    }

    /// レジスタを書き換える
    ///
    /// IPをブレークポイント以外の場所へ動かした場合、踏み越えは不要になる。
    pub fn write_registers(
        &mut self,
        ctx: &mut ThreadContext<'_>,
        registers: &[Register],
    ) -> Result<()> {
        let ip_id = ctx.arch.ip_register();
        if let Some(ip) = registers.iter().find(|r| r.id == ip_id) {
            if Some(ip.value()) != self.current_breakpoint {
                if let Some(address) = self.current_breakpoint.take() {
                    if self.stepping_over {
                        self.stepping_over = false;
                        if let Some(bp) = ctx.breakpoints.get_mut(address) {
                            bp.end_step_over(ctx.process, ctx.arch);
                        }
                    }
                }
            }
        }
        self.handle.write_registers(registers)
    }

    fn register(&self, id: u32) -> Result<u64> {
        self.handle
            .read_registers()?
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.value())
            .ok_or_else(|| anyhow::anyhow!("Register {} not available", id))
    }

    fn ip(&self, ctx: &ThreadContext<'_>) -> Result<u64> {
        self.register(ctx.arch.ip_register())
    }

    fn set_ip(&self, ctx: &ThreadContext<'_>, ip: u64) -> Result<()> {
        self.handle
            .write_registers(&[Register::from_u64(ctx.arch.ip_register(), ip)])
    }

    /// フレームポインタをたどってスタックを取得する
    pub fn frames(
        &self,
        process: &dyn ProcessHandle,
        arch: &dyn ArchProvider,
        max_frames: usize,
    ) -> Result<Vec<StackFrame>> {
        let registers = self.handle.read_registers()?;
        let value = |id: u32| registers.iter().find(|r| r.id == id).map(|r| r.value());
        let ip = value(arch.ip_register())
            .ok_or_else(|| anyhow::anyhow!("Instruction pointer not available"))?;
        let sp = value(arch.sp_register()).unwrap_or(0);
        let bp = value(arch.bp_register()).unwrap_or(0);

        Ok(unwind::unwind(ip, sp, bp, max_frames, |address| {
            let bytes = process.read_memory(address, 8).ok()?;
            Some(u64::from_le_bytes(bytes.as_slice().try_into().ok()?))
        }))
    }

    /// スレッドレコードを作る（停止中のときだけスタックを含める）
    pub fn record(
        &self,
        process: &dyn ProcessHandle,
        arch: &dyn ArchProvider,
        stack_amount: StackAmount,
        max_frames: usize,
    ) -> ThreadRecord {
        let state = if self.is_suspended() { ThreadState::Suspended } else { ThreadState::Running };
        let limit = match stack_amount {
            StackAmount::None => 0,
            StackAmount::Minimal => 2,
            StackAmount::Full => max_frames,
        };
        let (stack_amount, frames) = if self.is_suspended() && limit > 0 {
            match self.frames(process, arch, limit) {
                Ok(frames) => (stack_amount, frames),
                Err(e) => {
                    debug!("No stack for thread {}: {}", self.koid, e);
                    (StackAmount::None, Vec::new())
                }
            }
        } else {
            (StackAmount::None, Vec::new())
        };

        ThreadRecord {
            process_koid: process.koid(),
            thread_koid: self.koid,
            name: self.handle.name(),
            state,
            stack_amount,
            frames,
        }
    }
}
