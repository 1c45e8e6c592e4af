//! アーキテクチャ依存の情報
//!
//! ブレークポイント命令のエンコーディングと、例外アドレスから
//! ブレークポイントアドレスを求める計算をアーキテクチャごとに提供します。
//! エージェント本体は `&dyn ArchProvider` を通してのみこれらを参照します。

use kokia_wire::Arch;

/// アーキテクチャサービス
pub trait ArchProvider {
    fn arch(&self) -> Arch;

    /// 標準のブレークポイント命令
    fn breakpoint_instruction(&self) -> &'static [u8];

    /// 指定のバイト列（アドレス位置から読んだもの）がブレークポイント相当の命令か
    ///
    /// 他のツールが書き込んだ別のトラップ命令も含めて判定します。
    fn is_breakpoint_instruction(&self, memory: &[u8]) -> bool;

    /// ソフトウェア例外のアドレスからブレークポイント命令のアドレスを求める
    fn breakpoint_address_for_exception(&self, exception_address: u64) -> u64;

    /// ソフトウェア例外のアドレスから次の命令のアドレスを求める
    fn next_instruction_for_software_exception(&self, exception_address: u64) -> u64;

    /// 命令ポインタのレジスタ番号（DWARF番号）
    fn ip_register(&self) -> u32;
    fn sp_register(&self) -> u32;
    fn bp_register(&self) -> u32;
}

/// x86-64
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Arch;

/// INT3
const X64_BREAKPOINT: [u8; 1] = [0xCC];

impl X64Arch {
    pub const RBP: u32 = 6;
    pub const RSP: u32 = 7;
    pub const RIP: u32 = 16;
}

impl ArchProvider for X64Arch {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn breakpoint_instruction(&self) -> &'static [u8] {
        &X64_BREAKPOINT
    }

    fn is_breakpoint_instruction(&self, memory: &[u8]) -> bool {
        memory.first() == Some(&X64_BREAKPOINT[0])
    }

    fn breakpoint_address_for_exception(&self, exception_address: u64) -> u64 {
        // INT3実行後のRIPは命令の直後を指す
        exception_address.wrapping_sub(X64_BREAKPOINT.len() as u64)
    }

    fn next_instruction_for_software_exception(&self, exception_address: u64) -> u64 {
        exception_address
    }

    fn ip_register(&self) -> u32 {
        Self::RIP
    }

    fn sp_register(&self) -> u32 {
        Self::RSP
    }

    fn bp_register(&self) -> u32 {
        Self::RBP
    }
}

/// ARM64
#[derive(Debug, Default, Clone, Copy)]
pub struct Arm64Arch;

/// BRK #0
const ARM64_BREAKPOINT: [u8; 4] = 0xD420_0000u32.to_le_bytes();
/// BRK #imm16 の即値部分を除いたマスク
const ARM64_BRK_MASK: u32 = 0xFFE0_001F;

impl Arm64Arch {
    /// x29（フレームポインタ）
    pub const FP: u32 = 29;
    pub const SP: u32 = 31;
    pub const PC: u32 = 32;
}

impl ArchProvider for Arm64Arch {
    fn arch(&self) -> Arch {
        Arch::Arm64
    }

    fn breakpoint_instruction(&self) -> &'static [u8] {
        &ARM64_BREAKPOINT
    }

    fn is_breakpoint_instruction(&self, memory: &[u8]) -> bool {
        let Some(bytes) = memory.get(..4) else {
            return false;
        };
        let insn = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        insn & ARM64_BRK_MASK == u32::from_le_bytes(ARM64_BREAKPOINT)
    }

    fn breakpoint_address_for_exception(&self, exception_address: u64) -> u64 {
        // BRKではPCは命令自身を指したまま
        exception_address
    }

    fn next_instruction_for_software_exception(&self, exception_address: u64) -> u64 {
        exception_address.wrapping_add(ARM64_BREAKPOINT.len() as u64)
    }

    fn ip_register(&self) -> u32 {
        Self::PC
    }

    fn sp_register(&self) -> u32 {
        Self::SP
    }

    fn bp_register(&self) -> u32 {
        Self::FP
    }
}

/// ビルド対象のアーキテクチャ
pub fn current() -> Option<&'static dyn ArchProvider> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(&X64Arch)
    }
    #[cfg(target_arch = "aarch64")]
    {
        Some(&Arm64Arch)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        None
    }
}
