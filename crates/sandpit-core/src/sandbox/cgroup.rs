//! Cgroup v2 resource limits
//!
//! All runs share one limited group, mirroring a single budget for every
//! untrusted process on the host. Each run gets its own leaf below it so the
//! child can be placed and the group cleaned up independently; the leaf
//! inherits the root's memory and CPU ceilings.

use crate::config::CgroupConfig;
use crate::errors::SandboxError;
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

const CONTROLLERS: &str = "+memory +cpu";

/// Limits written to the shared root group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    pub memory_max: u64,
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
}

impl CgroupLimits {
    pub fn from_config(config: &CgroupConfig) -> Result<Self, SandboxError> {
        if !(1..=100).contains(&config.cpu_limit_percent) {
            return Err(SandboxError::InvalidLimit(format!(
                "cpu limit must be between 1 and 100 percent, got {}",
                config.cpu_limit_percent
            )));
        }
        if config.period_us == 0 || config.memory_limit_bytes == 0 {
            return Err(SandboxError::InvalidLimit(
                "cpu period and memory limit must be positive".to_string(),
            ));
        }
        Ok(Self {
            memory_max: config.memory_limit_bytes,
            cpu_quota_us: config.period_us * config.cpu_limit_percent / 100,
            cpu_period_us: config.period_us,
        })
    }

    /// Contents of `cpu.max`: `<quota> <period>`
    pub fn cpu_max(&self) -> String {
        format!("{} {}", self.cpu_quota_us, self.cpu_period_us)
    }
}

/// The shared group every run is placed under
#[derive(Debug)]
pub struct CgroupRoot {
    path: PathBuf,
    limits: CgroupLimits,
}

impl CgroupRoot {
    /// Create the root group and apply the configured limits.
    pub fn init(config: &CgroupConfig) -> Result<Self, SandboxError> {
        let limits = CgroupLimits::from_config(config)?;
        let path = config.root.clone();

        let parent = path
            .parent()
            .ok_or_else(|| SandboxError::CgroupUnavailable(path.display().to_string()))?;
        if !parent.join("cgroup.controllers").exists() {
            return Err(SandboxError::CgroupUnavailable(parent.display().to_string()));
        }

        fs::create_dir_all(&path).map_err(|e| SandboxError::cgroup(&path, e))?;

        // Limits on the root only take effect if the parent delegates them.
        enable_controllers(parent)?;
        write_file(&path.join("memory.max"), &limits.memory_max.to_string())?;
        write_file(&path.join("memory.high"), &limits.memory_max.to_string())?;
        write_file(&path.join("cpu.max"), &limits.cpu_max())?;
        enable_controllers(&path)?;

        log::info!(
            "Cgroup {} ready: memory.max={} cpu.max=\"{}\"",
            path.display(),
            limits.memory_max,
            limits.cpu_max()
        );

        Ok(Self { path, limits })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limits(&self) -> CgroupLimits {
        self.limits
    }

    /// Create the leaf group for one run.
    pub fn create_run_group(&self, run_id: u64) -> Result<RunGroup, SandboxError> {
        let path = self.path.join(format!("run-{}", run_id));
        fs::create_dir(&path).map_err(|e| SandboxError::cgroup(&path, e))?;

        let oom_group = path.join("memory.oom.group");
        if oom_group.exists() {
            if let Err(e) = fs::write(&oom_group, "1") {
                log::warn!("Could not set {}: {}", oom_group.display(), e);
            }
        }

        let procs = path.join("cgroup.procs");
        let procs = CString::new(procs.as_os_str().as_encoded_bytes()).map_err(|_| {
            SandboxError::CgroupUnavailable(format!("{} contains a NUL byte", path.display()))
        })?;

        Ok(RunGroup { path, procs })
    }

    /// Remove the root group. Fails while runs are still inside it.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::cgroup(&self.path, e)),
        }
    }
}

/// A per-run leaf group, removed when dropped
#[derive(Debug)]
pub struct RunGroup {
    path: PathBuf,
    procs: CString,
}

impl RunGroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `cgroup.procs`, prepared for use between fork and exec
    pub(crate) fn procs_path(&self) -> &CString {
        &self.procs
    }
}

impl Drop for RunGroup {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not remove cgroup {}: {}", self.path.display(), e);
            }
        }
    }
}

fn enable_controllers(group: &Path) -> Result<(), SandboxError> {
    write_file(&group.join("cgroup.subtree_control"), CONTROLLERS)
}

fn write_file(path: &Path, contents: &str) -> Result<(), SandboxError> {
    fs::write(path, contents).map_err(|e| SandboxError::cgroup(path, e))
}

/// Move the calling process into the group whose `cgroup.procs` is `procs`.
///
/// Runs in the forked child before exec, so it only issues raw syscalls.
#[cfg(unix)]
pub(crate) fn join_group(procs: &CString) -> std::io::Result<()> {
    // Writing "0" to cgroup.procs moves the writer itself.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let result = if written == 1 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        };
        libc::close(fd);
        result
    }
}
