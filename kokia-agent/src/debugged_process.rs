//! デバッグ対象プロセス

use crate::debugged_thread::{DebuggedThread, ExceptionOutcome, RunMode, SuspendReason, ThreadContext};
use crate::process_breakpoint::ProcessBreakpoints;
use anyhow::Result;
use kokia_target::{ArchProvider, ExceptionKind, ProcessHandle};
use kokia_wire::{MemoryBlock, Module, Register, StackAmount, StackFrame, ThreadRecord};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// ReadMemoryが失敗したときに分割して読み直す単位
const PAGE_SIZE: u64 = 4096;

/// デバッグ対象プロセス
///
/// スレッド表とブレークポイントを所有します。
pub struct DebuggedProcess {
    handle: Box<dyn ProcessHandle>,
    threads: BTreeMap<u64, DebuggedThread>,
    breakpoints: ProcessBreakpoints,
    /// 最後にクライアントへ通知したモジュール一覧
    modules: Vec<Module>,
}

impl DebuggedProcess {
    /// 既存のスレッドをすべて登録する
    pub fn new(handle: Box<dyn ProcessHandle>, initial_reason: SuspendReason) -> Result<Self> {
        let mut threads = BTreeMap::new();
        for koid in handle.thread_koids()? {
            threads.insert(koid, DebuggedThread::new(handle.thread(koid), initial_reason));
        }
        Ok(Self {
            handle,
            threads,
            breakpoints: ProcessBreakpoints::new(),
            modules: Vec::new(),
        })
    }

    pub fn koid(&self) -> u64 {
        self.handle.koid()
    }

    pub fn name(&self) -> String {
        self.handle.name()
    }

    pub fn handle(&self) -> &dyn ProcessHandle {
        self.handle.as_ref()
    }

    pub fn thread(&self, koid: u64) -> Option<&DebuggedThread> {
        self.threads.get(&koid)
    }

    pub fn thread_koids(&self) -> Vec<u64> {
        self.threads.keys().copied().collect()
    }

    pub fn breakpoints(&self) -> &ProcessBreakpoints {
        &self.breakpoints
    }

    /// スレッドとそれを操作するための資源を同時に借りる
    fn split<'a>(
        &'a mut self,
        koid: u64,
        arch: &'a dyn ArchProvider,
    ) -> Option<(&'a mut DebuggedThread, ThreadContext<'a>)> {
        let thread = self.threads.get_mut(&koid)?;
        let ctx = ThreadContext {
            process: self.handle.as_ref(),
            breakpoints: &mut self.breakpoints,
            arch,
        };
        Some((thread, ctx))
    }

    pub fn add_thread(&mut self, koid: u64) -> &DebuggedThread {
        let handle = self.handle.thread(koid);
        self.threads
            .entry(koid)
            .or_insert_with(|| DebuggedThread::new(handle, SuspendReason::None))
    }

    pub fn remove_thread(&mut self, koid: u64) -> Option<DebuggedThread> {
        self.threads.remove(&koid)
    }

    pub fn thread_record(
        &self,
        koid: u64,
        arch: &dyn ArchProvider,
        stack_amount: StackAmount,
        max_frames: usize,
    ) -> Option<ThreadRecord> {
        let thread = self.threads.get(&koid)?;
        Some(thread.record(self.handle.as_ref(), arch, stack_amount, max_frames))
    }

    pub fn thread_records(
        &self,
        arch: &dyn ArchProvider,
        stack_amount: StackAmount,
        max_frames: usize,
    ) -> Vec<ThreadRecord> {
        self.threads
            .values()
            .map(|t| t.record(self.handle.as_ref(), arch, stack_amount, max_frames))
            .collect()
    }

    pub fn suspended_thread_koids(&self) -> Vec<u64> {
        self.threads
            .iter()
            .filter(|(_, t)| t.is_suspended())
            .map(|(koid, _)| *koid)
            .collect()
    }

    /// スレッドを止める（thread_koid = 0 なら全スレッド）
    ///
    /// 止めたスレッドのkoidを返します。
    pub fn pause(&mut self, thread_koid: u64) -> Vec<u64> {
        let mut paused = Vec::new();
        for (koid, thread) in self.threads.iter_mut() {
            if thread_koid != 0 && *koid != thread_koid {
                continue;
            }
            if thread.is_suspended() {
                continue;
            }
            match thread.pause() {
                Ok(()) => paused.push(*koid),
                Err(e) => warn!("Failed to suspend thread {}: {}", koid, e),
            }
        }
        paused
    }

    /// 指定スレッド以外を止める
    pub fn pause_all_except(&mut self, except: u64) {
        for (koid, thread) in self.threads.iter_mut() {
            if *koid == except {
                continue;
            }
            if let Err(e) = thread.pause() {
                warn!("Failed to suspend thread {}: {}", koid, e);
            }
        }
    }

    /// スレッドを再開する（空なら全スレッド）
    pub fn resume(&mut self, thread_koids: &[u64], mode: RunMode, arch: &dyn ArchProvider) {
        let targets = if thread_koids.is_empty() {
            self.thread_koids()
        } else {
            thread_koids.to_vec()
        };
        for koid in targets {
            let Some((thread, mut ctx)) = self.split(koid, arch) else {
                debug!("Resume for unknown thread {}", koid);
                continue;
            };
            // 停止要求が届く前の再開は失敗しうるが、届いた停止は on_stopped で再開される
            if let Err(e) = thread.resume(&mut ctx, mode) {
                warn!("Failed to resume thread {}: {}", koid, e);
            }
        }
    }

    /// 例外を処理する
    pub fn on_exception(
        &mut self,
        thread_koid: u64,
        kind: ExceptionKind,
        arch: &dyn ArchProvider,
    ) -> Result<ExceptionOutcome> {
        let (thread, mut ctx) = self
            .split(thread_koid, arch)
            .ok_or_else(|| anyhow::anyhow!("Unknown thread {}", thread_koid))?;
        thread.on_exception(&mut ctx, kind)
    }

    /// 通知せずにスレッドを再開する（他スレッド向けのブレークポイントなど）
    pub fn continue_thread(&mut self, thread_koid: u64, arch: &dyn ArchProvider) -> Result<()> {
        let (thread, mut ctx) = self
            .split(thread_koid, arch)
            .ok_or_else(|| anyhow::anyhow!("Unknown thread {}", thread_koid))?;
        thread.continue_execution(&mut ctx)
    }

    pub fn on_stopped(&mut self, thread_koid: u64) -> Result<()> {
        match self.threads.get_mut(&thread_koid) {
            Some(thread) => thread.on_stopped(),
            None => Ok(()),
        }
    }

    pub fn read_registers(&self, thread_koid: u64) -> Result<Vec<Register>> {
        self.suspended_thread(thread_koid)?.read_registers()
    }

    pub fn write_registers(
        &mut self,
        thread_koid: u64,
        registers: &[Register],
        arch: &dyn ArchProvider,
    ) -> Result<()> {
        self.suspended_thread(thread_koid)?;
        let (thread, mut ctx) = self
            .split(thread_koid, arch)
            .ok_or_else(|| anyhow::anyhow!("Unknown thread {}", thread_koid))?;
        thread.write_registers(&mut ctx, registers)
    }

    pub fn backtrace(
        &self,
        thread_koid: u64,
        arch: &dyn ArchProvider,
        max_frames: usize,
    ) -> Result<Vec<StackFrame>> {
        self.suspended_thread(thread_koid)?
            .frames(self.handle.as_ref(), arch, max_frames)
    }

    fn suspended_thread(&self, koid: u64) -> Result<&DebuggedThread> {
        let thread = self
            .threads
            .get(&koid)
            .ok_or_else(|| anyhow::anyhow!("Unknown thread {}", koid))?;
        if !thread.is_suspended() {
            anyhow::bail!("Thread {} is not suspended", koid);
        }
        Ok(thread)
    }

    pub fn add_breakpoint_location(
        &mut self,
        breakpoint_id: u32,
        thread_koid: u64,
        address: u64,
        arch: &dyn ArchProvider,
    ) -> Result<()> {
        self.breakpoints
            .add_location(breakpoint_id, thread_koid, address, self.handle.as_ref(), arch)
    }

    pub fn remove_breakpoint_location(&mut self, breakpoint_id: u32, thread_koid: u64, address: u64) {
        self.breakpoints
            .remove_location(breakpoint_id, thread_koid, address, self.handle.as_ref());
    }

    /// メモリを読む
    ///
    /// 読めない範囲はページ単位で `valid = false` のブロックになり、
    /// 設置したブレークポイント命令は元のバイトに見せる。
    pub fn read_memory(&self, address: u64, size: u32) -> Vec<MemoryBlock> {
        let mut blocks: Vec<MemoryBlock> = Vec::new();
        if size == 0 {
            return blocks;
        }

        let chunks: Vec<(u64, u64)> = match self.handle.read_memory(address, size as usize) {
            Ok(mut data) => {
                self.breakpoints.hide(address, &mut data);
                return vec![MemoryBlock { address, valid: true, size, data }];
            }
            Err(_) => {
                // アドレス空間の末尾を越える分は読まない
                let end = address.saturating_add(size as u64);
                let mut chunks = Vec::new();
                let mut cur = address;
                while cur < end {
                    let next = (cur / PAGE_SIZE + 1).checked_mul(PAGE_SIZE).unwrap_or(u64::MAX);
                    let chunk_end = next.min(end);
                    chunks.push((cur, chunk_end));
                    cur = chunk_end;
                }
                chunks
            }
        };

        for (start, end) in chunks {
            let len = end - start;
            let block = match self.handle.read_memory(start, len as usize) {
                Ok(mut data) => {
                    self.breakpoints.hide(start, &mut data);
                    MemoryBlock { address: start, valid: true, size: len as u32, data }
                }
                Err(_) => MemoryBlock { address: start, valid: false, size: len as u32, data: Vec::new() },
            };
            // 同じ有効性の隣接ブロックはまとめる
            match blocks.last_mut() {
                Some(last) if last.valid == block.valid => {
                    last.size += block.size;
                    last.data.extend(block.data);
                }
                _ => blocks.push(block),
            }
        }
        blocks
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.handle.write_memory(address, data)
    }

    /// モジュール一覧を読む（通知済みの一覧も更新する）
    pub fn load_modules(&mut self) -> Result<Vec<Module>> {
        let modules = self.handle.modules()?;
        self.modules = modules.clone();
        Ok(modules)
    }

    /// モジュール一覧を読み直し、前回から変わっていれば返す
    pub fn refresh_modules(&mut self) -> Option<Vec<Module>> {
        match self.handle.modules() {
            Ok(modules) if modules != self.modules => {
                self.modules = modules.clone();
                Some(modules)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Failed to read modules of {}: {}", self.koid(), e);
                None
            }
        }
    }

    /// ブレークポイントを外してデタッチする
    pub fn detach(mut self) -> Result<()> {
        self.breakpoints.uninstall_all(self.handle.as_ref());
        self.handle.detach()
    }

    pub fn kill(&self) -> Result<()> {
        self.handle.kill()
    }
}
