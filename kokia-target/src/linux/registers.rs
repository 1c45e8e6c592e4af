//! レジスタアクセス
//!
//! `user_regs_struct` とDWARFレジスタ番号の対応表で変換します。

use crate::Result;
use kokia_wire::Register;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

#[cfg(target_arch = "x86_64")]
macro_rules! register_table {
    ($($id:literal => $field:ident),* $(,)?) => {
        fn to_registers(regs: &user_regs_struct) -> Vec<Register> {
            vec![$(Register::from_u64($id, regs.$field as u64)),*]
        }

        /// 対応するフィールドがなければ false
        fn apply_register(regs: &mut user_regs_struct, reg: &Register) -> bool {
            match reg.id {
                $($id => {
                    regs.$field = reg.value() as _;
                    true
                })*
                _ => false,
            }
        }
    };
}

#[cfg(target_arch = "x86_64")]
register_table! {
    0 => rax,
    1 => rdx,
    2 => rcx,
    3 => rbx,
    4 => rsi,
    5 => rdi,
    6 => rbp,
    7 => rsp,
    8 => r8,
    9 => r9,
    10 => r10,
    11 => r11,
    12 => r12,
    13 => r13,
    14 => r14,
    15 => r15,
    16 => rip,
    49 => eflags,
}

#[cfg(target_arch = "x86_64")]
fn get_regs(tid: Pid) -> Result<user_regs_struct> {
    Ok(nix::sys::ptrace::getregs(tid)?)
}

#[cfg(target_arch = "x86_64")]
fn set_regs(tid: Pid, regs: user_regs_struct) -> Result<()> {
    nix::sys::ptrace::setregs(tid, regs)?;
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn to_registers(regs: &user_regs_struct) -> Vec<Register> {
    let mut list: Vec<Register> = regs
        .regs
        .iter()
        .enumerate()
        .map(|(i, value)| Register::from_u64(i as u32, *value))
        .collect();
    list.push(Register::from_u64(31, regs.sp));
    list.push(Register::from_u64(32, regs.pc));
    list
}

#[cfg(target_arch = "aarch64")]
fn apply_register(regs: &mut user_regs_struct, reg: &Register) -> bool {
    match reg.id {
        id @ 0..=30 => regs.regs[id as usize] = reg.value(),
        31 => regs.sp = reg.value(),
        32 => regs.pc = reg.value(),
        _ => return false,
    }
    true
}

#[cfg(target_arch = "aarch64")]
fn regset_request(tid: Pid, request: nix::libc::c_uint, regs: &mut user_regs_struct) -> Result<()> {
    use nix::libc;

    let mut iov = libc::iovec {
        iov_base: regs as *mut user_regs_struct as *mut libc::c_void,
        iov_len: std::mem::size_of::<user_regs_struct>(),
    };
    // SAFETY: iovは呼び出しの間だけ有効なregsを指している
    let ret = unsafe {
        libc::ptrace(
            request,
            tid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec as *mut libc::c_void,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn get_regs(tid: Pid) -> Result<user_regs_struct> {
    // SAFETY: user_regs_structはPOD
    let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
    regset_request(tid, nix::libc::PTRACE_GETREGSET, &mut regs)?;
    Ok(regs)
}

#[cfg(target_arch = "aarch64")]
fn set_regs(tid: Pid, mut regs: user_regs_struct) -> Result<()> {
    regset_request(tid, nix::libc::PTRACE_SETREGSET, &mut regs)
}

/// スレッドの汎用レジスタを読み取る
pub fn read(tid: Pid) -> Result<Vec<Register>> {
    Ok(to_registers(&get_regs(tid)?))
}

/// 指定されたレジスタだけを書き換える
pub fn write(tid: Pid, registers: &[Register]) -> Result<()> {
    let mut regs = get_regs(tid)?;
    for reg in registers {
        if !apply_register(&mut regs, reg) {
            anyhow::bail!("Unknown register id {}", reg.id);
        }
    }
    set_regs(tid, regs)
}
