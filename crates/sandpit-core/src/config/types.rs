//! Configuration type definitions for the playground
//!
//! Every field has a default so a minimal (even empty) YAML file is a valid
//! configuration. The sections mirror the subsystems: where artifacts live
//! and how long they are kept, how the external compiler is invoked, how many
//! untrusted processes may run and for how long, and which kernel
//! restrictions are applied to them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandpitConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    /// Directory served under `/` for the browser client, if any.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            static_dir: None,
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Scratch directory for compiled executables. Wiped on startup.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// How long an unused artifact is kept before it is reclaimed.
    #[serde(default = "default_cache_duration_secs")]
    pub cache_duration_secs: u64,
}

impl ArtifactsConfig {
    pub fn cache_duration(&self) -> Duration {
        Duration::from_secs(self.cache_duration_secs)
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            cache_duration_secs: default_cache_duration_secs(),
        }
    }
}

/// How the external compiler is invoked.
///
/// The final command line is `program args.. -o <output> link_flags..` with
/// the source text on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    #[serde(default = "default_compiler_program")]
    pub program: String,
    #[serde(default = "default_compiler_args")]
    pub args: Vec<String>,
    #[serde(default = "default_link_flags")]
    pub link_flags: Vec<String>,
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
    #[serde(default = "default_compile_timeout_secs")]
    pub timeout_secs: u64,
}

impl CompilerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: default_compiler_program(),
            args: default_compiler_args(),
            link_flags: default_link_flags(),
            version_args: default_version_args(),
            timeout_secs: default_compile_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Grace period for output relays to drain after the process is gone.
    #[serde(default = "default_output_drain_ms")]
    pub output_drain_ms: u64,
}

impl ExecutionConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            max_concurrent_processes: default_max_concurrent_processes(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            output_drain_ms: default_output_drain_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Install a default-deny seccomp filter before exec.
    #[serde(default = "default_syscall_filter")]
    pub syscall_filter: bool,
    #[serde(default = "default_allowed_syscalls")]
    pub allowed_syscalls: Vec<String>,
    #[serde(default)]
    pub cgroup: CgroupConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            syscall_filter: default_syscall_filter(),
            allowed_syscalls: default_allowed_syscalls(),
            cgroup: CgroupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Parent cgroup under which one child group per run is created.
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
    #[serde(default = "default_cpu_limit_percent")]
    pub cpu_limit_percent: u64,
    #[serde(default = "default_cpu_period_us")]
    pub period_us: u64,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_cgroup_root(),
            memory_limit_bytes: default_memory_limit_bytes(),
            cpu_limit_percent: default_cpu_limit_percent(),
            period_us: default_cpu_period_us(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_source_log_length")]
    pub max_source_log_length: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_source_log_length: default_max_source_log_length(),
        }
    }
}

impl SandpitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "Invalid bind address: {}",
                self.server.bind_addr
            )));
        }

        if self.artifacts.scratch_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "Scratch directory cannot be empty".to_string(),
            ));
        }

        if self.compiler.program.is_empty() {
            return Err(ConfigError::Invalid(
                "Compiler program cannot be empty".to_string(),
            ));
        }

        if self.execution.max_concurrent_processes == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_processes must be at least 1".to_string(),
            ));
        }

        if self.execution.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "run_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.sandbox.syscall_filter && self.sandbox.allowed_syscalls.is_empty() {
            return Err(ConfigError::Invalid(
                "Syscall filtering is enabled but the allow-list is empty".to_string(),
            ));
        }

        let cgroup = &self.sandbox.cgroup;
        if cgroup.enabled {
            if cgroup.cpu_limit_percent == 0 || cgroup.cpu_limit_percent > 100 {
                return Err(ConfigError::Invalid(format!(
                    "cpu_limit_percent must be within 1..=100, got {}",
                    cgroup.cpu_limit_percent
                )));
            }
            if cgroup.period_us == 0 {
                return Err(ConfigError::Invalid(
                    "Cgroup period_us must be greater than 0".to_string(),
                ));
            }
            if cgroup.memory_limit_bytes == 0 {
                return Err(ConfigError::Invalid(
                    "Cgroup memory_limit_bytes must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_bind_addr() -> String { "127.0.0.1:8080".to_string() }
fn default_max_body_size() -> usize { 1024 * 1024 }
fn default_scratch_dir() -> PathBuf { PathBuf::from("playground_executables") }
fn default_cache_duration_secs() -> u64 { 60 }
fn default_compiler_program() -> String { "cc".to_string() }
fn default_compiler_args() -> Vec<String> { vec!["-x".to_string(), "c".to_string(), "-".to_string()] }
fn default_link_flags() -> Vec<String> { vec!["-static".to_string()] }
fn default_version_args() -> Vec<String> { vec!["--version".to_string()] }
fn default_compile_timeout_secs() -> u64 { 30 }
fn default_run_timeout_secs() -> u64 { 60 }
fn default_max_concurrent_processes() -> usize { 50 }
fn default_acquire_timeout_ms() -> u64 { 3000 }
fn default_output_drain_ms() -> u64 { 500 }
fn default_syscall_filter() -> bool { cfg!(target_os = "linux") }
fn default_cgroup_root() -> PathBuf { PathBuf::from("/sys/fs/cgroup/sandpit") }
fn default_memory_limit_bytes() -> u64 { 4 * 1024 * 1024 * 1024 }
fn default_cpu_limit_percent() -> u64 { 50 }
fn default_cpu_period_us() -> u64 { 100_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_max_source_log_length() -> usize { 100 }

pub fn default_allowed_syscalls() -> Vec<String> {
    [
        "read",
        "write",
        "mmap",
        "munmap",
        "mprotect",
        "mremap",
        "brk",
        "close",
        "openat",
        "newfstatat",
        "fstat",
        "pread64",
        "lseek",
        "arch_prctl",
        "set_tid_address",
        "set_robust_list",
        "rseq",
        "getrandom",
        "clock_gettime",
        "clock_nanosleep",
        "nanosleep",
        "exit",
        "exit_group",
        "execve",
        "execveat",
        "rt_sigaction",
        "rt_sigprocmask",
        "rt_sigreturn",
        "sigaltstack",
        "futex",
        "prlimit64",
        "ioctl",
        "readlinkat",
        "uname",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}
