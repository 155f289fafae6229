//! Seccomp-bpf syscall allow-list
//!
//! The filter is assembled by hand as a classic BPF program:
//!
//! ```text
//!   ld  [arch]          ; seccomp_data.arch
//!   jeq AUDIT_ARCH, 1   ; foreign ABI -> kill
//!   ret KILL_PROCESS
//!   ld  [nr]            ; seccomp_data.nr
//!   jeq <nr>, 0, 1      ; one pair per allowed syscall
//!   ret ALLOW
//!   ...
//!   ret ERRNO(EPERM)
//! ```
//!
//! Denied syscalls fail with `EPERM` instead of killing the program, so a
//! libc probing for optional features degrades instead of crashing.

use crate::errors::SandboxError;

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// Offsets into struct seccomp_data.
const NR_OFFSET: u32 = 0;
const ARCH_OFFSET: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xC000_003E;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xC000_00B7;

/// Syscalls with the same name on every supported architecture.
const COMMON_SYSCALLS: &[(&str, libc::c_long)] = &[
    ("read", libc::SYS_read),
    ("write", libc::SYS_write),
    ("readv", libc::SYS_readv),
    ("writev", libc::SYS_writev),
    ("close", libc::SYS_close),
    ("mmap", libc::SYS_mmap),
    ("munmap", libc::SYS_munmap),
    ("mprotect", libc::SYS_mprotect),
    ("mremap", libc::SYS_mremap),
    ("madvise", libc::SYS_madvise),
    ("brk", libc::SYS_brk),
    ("openat", libc::SYS_openat),
    ("newfstatat", libc::SYS_newfstatat),
    ("fstat", libc::SYS_fstat),
    ("pread64", libc::SYS_pread64),
    ("lseek", libc::SYS_lseek),
    ("fcntl", libc::SYS_fcntl),
    ("ioctl", libc::SYS_ioctl),
    ("readlinkat", libc::SYS_readlinkat),
    ("set_tid_address", libc::SYS_set_tid_address),
    ("set_robust_list", libc::SYS_set_robust_list),
    ("rseq", libc::SYS_rseq),
    ("getrandom", libc::SYS_getrandom),
    ("clock_gettime", libc::SYS_clock_gettime),
    ("clock_nanosleep", libc::SYS_clock_nanosleep),
    ("nanosleep", libc::SYS_nanosleep),
    ("exit", libc::SYS_exit),
    ("exit_group", libc::SYS_exit_group),
    ("execve", libc::SYS_execve),
    ("execveat", libc::SYS_execveat),
    ("rt_sigaction", libc::SYS_rt_sigaction),
    ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
    ("rt_sigreturn", libc::SYS_rt_sigreturn),
    ("sigaltstack", libc::SYS_sigaltstack),
    ("futex", libc::SYS_futex),
    ("prlimit64", libc::SYS_prlimit64),
    ("uname", libc::SYS_uname),
    ("getpid", libc::SYS_getpid),
    ("gettid", libc::SYS_gettid),
    ("sched_yield", libc::SYS_sched_yield),
];

#[cfg(target_arch = "x86_64")]
const ARCH_SYSCALLS: &[(&str, libc::c_long)] = &[
    ("arch_prctl", libc::SYS_arch_prctl),
    ("open", libc::SYS_open),
    ("stat", libc::SYS_stat),
    ("access", libc::SYS_access),
    ("readlink", libc::SYS_readlink),
];
#[cfg(not(target_arch = "x86_64"))]
const ARCH_SYSCALLS: &[(&str, libc::c_long)] = &[];

/// Names that only exist on some supported architecture; skipped elsewhere.
const LEGACY_SYSCALLS: &[&str] = &["arch_prctl", "open", "stat", "access", "readlink"];

/// Resolve a syscall name to its number on this architecture.
///
/// `Ok(None)` means the syscall does not exist here and can be left out of
/// the filter.
pub fn syscall_number(name: &str) -> Result<Option<u32>, SandboxError> {
    let found = COMMON_SYSCALLS
        .iter()
        .chain(ARCH_SYSCALLS)
        .find(|(known, _)| *known == name);
    match found {
        Some((_, nr)) => Ok(Some(*nr as u32)),
        None if LEGACY_SYSCALLS.contains(&name) => Ok(None),
        None => Err(SandboxError::UnknownSyscall(name.to_string())),
    }
}

/// A compiled allow-list filter
#[derive(Debug, Clone)]
pub struct SeccompFilter {
    program: Vec<libc::sock_filter>,
}

impl SeccompFilter {
    /// Build a default-deny filter allowing exactly `names`.
    pub fn allow_list<S: AsRef<str>>(names: &[S]) -> Result<Self, SandboxError> {
        let mut numbers = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match syscall_number(name)? {
                Some(nr) if !numbers.contains(&nr) => numbers.push(nr),
                Some(_) => {}
                None => log::debug!("Syscall {} does not exist on this architecture", name),
            }
        }

        // The kernel caps filters at BPF_MAXINSNS (4096) instructions.
        if numbers.is_empty() || numbers.len() * 2 + 5 > 4096 {
            return Err(SandboxError::InvalidLimit(format!(
                "syscall allow-list must contain between 1 and 2045 entries, got {}",
                numbers.len()
            )));
        }

        let mut program = vec![
            stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET),
            jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH, 1, 0),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
            stmt(BPF_LD | BPF_W | BPF_ABS, NR_OFFSET),
        ];
        for nr in &numbers {
            program.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *nr, 0, 1));
            program.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        }
        program.push(stmt(
            BPF_RET | BPF_K,
            SECCOMP_RET_ERRNO | libc::EPERM as u32,
        ));

        Ok(Self { program })
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    pub(crate) fn instructions(&self) -> &[libc::sock_filter] {
        &self.program
    }
}

/// Install `program` on the calling thread.
///
/// Runs in the forked child before exec: no allocation, raw syscalls only.
pub(crate) fn install(program: &[libc::sock_filter]) -> std::io::Result<()> {
    let prog = libc::sock_fprog {
        len: program.len() as libc::c_ushort,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };
    unsafe {
        if libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        ) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_ulong,
            &prog as *const libc::sock_fprog,
        ) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}
