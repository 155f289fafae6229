//! Error types for the compile-and-run subsystem
//!
//! Errors are grouped by the component that raises them. None of them is fatal
//! to the service on its own: per-run and per-compile failures are reported
//! to the requesting connection, and only the startup paths (opening the
//! scratch directory, locating the compiler, initialising the cgroup root)
//! turn them into process-level failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Could not remove stale scratch directory {path}: {source}")]
    WipeScratchDir {
        path: String,
        source: std::io::Error,
    },
    #[error("Could not create scratch directory {path}: {source}")]
    CreateScratchDir {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Compiler '{program}' not found: {source}")]
    NotFound {
        program: String,
        source: which::Error,
    },
    #[error("Failed to invoke compiler '{program}': {source}")]
    Invoke {
        program: String,
        source: std::io::Error,
    },
    #[error("Failed to feed source to the compiler: {0}")]
    Stdin(std::io::Error),
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Unknown syscall in allow-list: {0}")]
    UnknownSyscall(String),
    #[error("Syscall filtering is not supported on this platform")]
    SeccompUnsupported,
    #[error("Cgroup v2 is not available at {0}")]
    CgroupUnavailable(String),
    #[error("Cgroup operation failed on {path}: {source}")]
    Cgroup {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid sandbox limit: {0}")]
    InvalidLimit(String),
}

impl SandboxError {
    pub(crate) fn cgroup(path: &std::path::Path, source: std::io::Error) -> Self {
        SandboxError::Cgroup {
            path: path.display().to_string(),
            source,
        }
    }
}
