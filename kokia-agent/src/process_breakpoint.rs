//! プロセス内の1アドレスに設置されたソフトウェアブレークポイント

use anyhow::Result;
use kokia_target::{ArchProvider, ProcessHandle};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 1アドレス分のブレークポイント命令
///
/// 複数の論理ブレークポイントが同じアドレスを共有でき、
/// それぞれがスレッドフィルタ（0は全スレッド）を持ちます。
#[derive(Debug)]
pub struct ProcessBreakpoint {
    address: u64,
    original: Vec<u8>,
    installed: bool,
    /// このアドレスを踏み越えるためにシングルステップ中のスレッド数
    step_over_count: u32,
    /// breakpoint_id -> 対象スレッド
    owners: BTreeMap<u32, Vec<u64>>,
}

impl ProcessBreakpoint {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original: Vec::new(),
            installed: false,
            step_over_count: 0,
            owners: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// 元の命令を保存してブレークポイント命令で置き換える
    pub fn install(&mut self, process: &dyn ProcessHandle, arch: &dyn ArchProvider) -> Result<()> {
        if self.installed {
            return Ok(());
        }
        let instruction = arch.breakpoint_instruction();
        self.original = process.read_memory(self.address, instruction.len())?;
        process.write_memory(self.address, instruction)?;
        self.installed = true;
        Ok(())
    }

    /// 元の命令に戻す
    pub fn uninstall(&mut self, process: &dyn ProcessHandle) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        process.write_memory(self.address, &self.original)?;
        self.installed = false;
        Ok(())
    }

    /// スレッドが元の命令を実行できるよう一時的に外す
    pub fn begin_step_over(&mut self, process: &dyn ProcessHandle) {
        if self.step_over_count == 0 {
            if let Err(e) = self.uninstall(process) {
                warn!("Failed to remove breakpoint at 0x{:x} for step over: {}", self.address, e);
            }
        }
        self.step_over_count += 1;
    }

    pub fn end_step_over(&mut self, process: &dyn ProcessHandle, arch: &dyn ArchProvider) {
        self.step_over_count = self.step_over_count.saturating_sub(1);
        if self.step_over_count == 0 && !self.owners.is_empty() {
            if let Err(e) = self.install(process, arch) {
                warn!("Failed to restore breakpoint at 0x{:x}: {}", self.address, e);
            }
        }
    }

    /// 読み取ったメモリ内のブレークポイント命令を元のバイトに戻す
    pub fn hide(&self, address: u64, data: &mut [u8]) {
        if !self.installed {
            return;
        }
        for (i, byte) in self.original.iter().enumerate() {
            let addr = self.address.wrapping_add(i as u64);
            if addr >= address && addr < address.saturating_add(data.len() as u64) {
                data[(addr - address) as usize] = *byte;
            }
        }
    }

    /// スレッドに適用される論理ブレークポイントのID
    pub fn breakpoints_for_thread(&self, thread_koid: u64) -> Vec<u32> {
        self.owners
            .iter()
            .filter(|(_, threads)| threads.iter().any(|t| *t == 0 || *t == thread_koid))
            .map(|(id, _)| *id)
            .collect()
    }

    fn add_owner(&mut self, breakpoint_id: u32, thread_koid: u64) {
        let threads = self.owners.entry(breakpoint_id).or_default();
        if !threads.contains(&thread_koid) {
            threads.push(thread_koid);
        }
    }

    /// 所有者がいなくなったら true
    fn remove_owner(&mut self, breakpoint_id: u32, thread_koid: u64) -> bool {
        if let Some(threads) = self.owners.get_mut(&breakpoint_id) {
            threads.retain(|t| *t != thread_koid);
            if threads.is_empty() {
                self.owners.remove(&breakpoint_id);
            }
        }
        self.owners.is_empty()
    }
}

/// プロセスに設置されたブレークポイントの集合（アドレスがキー）
#[derive(Debug, Default)]
pub struct ProcessBreakpoints {
    by_address: BTreeMap<u64, ProcessBreakpoint>,
}

impl ProcessBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u64) -> Option<&ProcessBreakpoint> {
        self.by_address.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut ProcessBreakpoint> {
        self.by_address.get_mut(&address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.by_address.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// 論理ブレークポイントのロケーションを追加する（設置済みなら所有者を増やすだけ）
    pub fn add_location(
        &mut self,
        breakpoint_id: u32,
        thread_koid: u64,
        address: u64,
        process: &dyn ProcessHandle,
        arch: &dyn ArchProvider,
    ) -> Result<()> {
        let bp = self
            .by_address
            .entry(address)
            .or_insert_with(|| ProcessBreakpoint::new(address));
        if !bp.installed && bp.step_over_count == 0 {
            if let Err(e) = bp.install(process, arch) {
                if bp.owners.is_empty() {
                    self.by_address.remove(&address);
                }
                return Err(e);
            }
            debug!("Installed breakpoint at 0x{:x}", address);
        }
        bp.add_owner(breakpoint_id, thread_koid);
        Ok(())
    }

    /// ロケーションを外す（最後の所有者なら命令を元に戻す）
    pub fn remove_location(
        &mut self,
        breakpoint_id: u32,
        thread_koid: u64,
        address: u64,
        process: &dyn ProcessHandle,
    ) {
        let Some(bp) = self.by_address.get_mut(&address) else {
            return;
        };
        if bp.remove_owner(breakpoint_id, thread_koid) {
            if let Err(e) = bp.uninstall(process) {
                warn!("Failed to uninstall breakpoint at 0x{:x}: {}", address, e);
            }
            self.by_address.remove(&address);
            debug!("Removed breakpoint at 0x{:x}", address);
        }
    }

    /// すべて元の命令に戻す
    pub fn uninstall_all(&mut self, process: &dyn ProcessHandle) {
        for bp in self.by_address.values_mut() {
            if let Err(e) = bp.uninstall(process) {
                warn!("Failed to uninstall breakpoint at 0x{:x}: {}", bp.address, e);
            }
        }
        self.by_address.clear();
    }

    pub fn hide(&self, address: u64, data: &mut [u8]) {
        let end = address.saturating_add(data.len() as u64);
        // 命令長は最大でも数バイトなので、少し手前から探す
        let start = address.saturating_sub(16);
        for (_, bp) in self.by_address.range(start..end) {
            bp.hide(address, data);
        }
    }
}
