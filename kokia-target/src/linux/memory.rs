//! メモリアクセスとメモリマップの解析

use crate::Result;
use kokia_wire::{AddressRegion, Module};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報（/proc/pid/maps の1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub offset: u64,
    /// 無名マッピングでは空
    pub path: String,
}

/// /proc/pid/maps の内容を解析する
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps(contents: &str) -> Vec<MemoryMapping> {
    let mut mappings = Vec::new();

    for line in contents.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end), Ok(offset)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
            u64::from_str_radix(parts[2], 16),
        ) else {
            continue;
        };

        let perms = parts[1].as_bytes();
        mappings.push(MemoryMapping {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            // パスに空白が含まれることがある
            path: parts[5..].join(" "),
        });
    }

    mappings
}

/// ファイルの先頭がマップされた位置をモジュールのベースとする
pub fn modules_from_mappings(mappings: &[MemoryMapping]) -> Vec<Module> {
    let mut modules: Vec<Module> = Vec::new();
    for m in mappings {
        if !m.path.starts_with('/') || m.offset != 0 {
            continue;
        }
        if modules.iter().any(|module| module.name == m.path) {
            continue;
        }
        modules.push(Module { name: m.path.clone(), base: m.start });
    }
    modules
}

pub fn regions_from_mappings(mappings: &[MemoryMapping]) -> Vec<AddressRegion> {
    mappings
        .iter()
        .map(|m| AddressRegion {
            name: m.path.clone(),
            base: m.start,
            size: m.end - m.start,
            depth: 0,
        })
        .collect()
}

/// プロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAでword単位に読み取る
    fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr as usize + offset, e)
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// メモリにデータを書き込む（読み取り専用のテキスト領域にも書ける）
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;
        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;

        Ok(())
    }

    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let contents = std::fs::read_to_string(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        Ok(parse_maps(&contents))
    }
}
