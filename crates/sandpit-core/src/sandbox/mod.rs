//! Process confinement for untrusted programs
//!
//! A [`Sandbox`] turns configuration into a per-run [`Confinement`], which is
//! applied to the child's `Command` and installed between fork and exec.
//! Syscall filtering and cgroups only exist on Linux; elsewhere the
//! [`NoopSandbox`] keeps the engine usable for development.

pub mod cgroup;
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod seccomp;

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use cgroup::{CgroupRoot, RunGroup};
use std::fmt;
use std::sync::Arc;
use tokio::process::Command;

/// Builds the confinement for each run
pub trait Sandbox: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Prepare everything a run needs before its process is started.
    fn prepare(&self, run_id: u64) -> Result<Confinement, SandboxError>;
}

/// Restrictions for one child process
///
/// Holds the run's cgroup leaf; dropping the confinement after the child has
/// been reaped removes it.
#[derive(Debug, Default)]
pub struct Confinement {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    filter: Option<seccomp::SeccompFilter>,
    group: Option<RunGroup>,
}

impl Confinement {
    /// No restrictions at all
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        !self.has_filter() && self.group.is_none()
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    fn has_filter(&self) -> bool {
        false
    }

    /// Install the restrictions on `command`.
    ///
    /// The child first joins its cgroup, then drops the ability to gain
    /// privileges and loads the syscall filter; exec is the next syscall.
    /// A failure in the child surfaces as a spawn error.
    pub fn apply(&self, command: &mut Command) {
        if self.is_unrestricted() {
            return;
        }

        #[cfg(unix)]
        {
            let procs = self.group.as_ref().map(|g| g.procs_path().clone());
            #[cfg(all(
                target_os = "linux",
                any(target_arch = "x86_64", target_arch = "aarch64")
            ))]
            let program = self.filter.as_ref().map(|f| f.instructions().to_vec());

            // SAFETY: the closure only issues raw syscalls on data prepared
            // before the fork.
            unsafe {
                command.pre_exec(move || {
                    if let Some(procs) = &procs {
                        cgroup::join_group(procs)?;
                    }
                    #[cfg(all(
                        target_os = "linux",
                        any(target_arch = "x86_64", target_arch = "aarch64")
                    ))]
                    {
                        if let Some(program) = &program {
                            seccomp::install(program)?;
                        }
                    }
                    Ok(())
                });
            }
        }
    }
}

/// Leaves processes unconfined
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSandbox;

impl Sandbox for NoopSandbox {
    fn name(&self) -> &'static str {
        "none"
    }

    fn prepare(&self, _run_id: u64) -> Result<Confinement, SandboxError> {
        Ok(Confinement::none())
    }
}

/// Seccomp allow-list plus an optional shared cgroup
#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[derive(Debug)]
pub struct LinuxSandbox {
    filter: Option<seccomp::SeccompFilter>,
    cgroup: Option<CgroupRoot>,
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
impl LinuxSandbox {
    pub fn new(filter: Option<seccomp::SeccompFilter>, cgroup: Option<CgroupRoot>) -> Self {
        Self { filter, cgroup }
    }

    pub fn cgroup(&self) -> Option<&CgroupRoot> {
        self.cgroup.as_ref()
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
impl Sandbox for LinuxSandbox {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn prepare(&self, run_id: u64) -> Result<Confinement, SandboxError> {
        let group = match &self.cgroup {
            Some(root) => Some(root.create_run_group(run_id)?),
            None => None,
        };
        Ok(Confinement {
            filter: self.filter.clone(),
            group,
        })
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
impl Drop for LinuxSandbox {
    fn drop(&mut self) {
        if let Some(root) = &self.cgroup {
            if let Err(e) = root.destroy() {
                log::warn!("Could not remove cgroup root: {}", e);
            }
        }
    }
}

/// Build the sandbox described by `config`.
///
/// Fails when a requested restriction cannot be provided on this host, so
/// the service never silently runs programs with less isolation than
/// configured.
pub fn build_sandbox(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    if !config.syscall_filter && !config.cgroup.enabled {
        log::warn!("Sandbox disabled: untrusted programs run without restrictions");
        return Ok(Arc::new(NoopSandbox));
    }

    platform_sandbox(config)
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn platform_sandbox(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    let filter = if config.syscall_filter {
        let filter = seccomp::SeccompFilter::allow_list(&config.allowed_syscalls)?;
        log::info!("Syscall filter built with {} instructions", filter.len());
        Some(filter)
    } else {
        None
    };
    let cgroup = if config.cgroup.enabled {
        Some(CgroupRoot::init(&config.cgroup)?)
    } else {
        None
    };
    Ok(Arc::new(LinuxSandbox::new(filter, cgroup)))
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn platform_sandbox(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    if config.cgroup.enabled {
        return Err(SandboxError::CgroupUnavailable(
            config.cgroup.root.display().to_string(),
        ));
    }
    Err(SandboxError::SeccompUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_config_yields_noop() {
        let config = SandboxConfig {
            syscall_filter: false,
            ..SandboxConfig::default()
        };
        let sandbox = build_sandbox(&config).unwrap();
        assert_eq!(sandbox.name(), "none");
        assert!(sandbox.prepare(1).unwrap().is_unrestricted());
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_filter_only_sandbox() {
        let config = SandboxConfig {
            syscall_filter: true,
            ..SandboxConfig::default()
        };
        let sandbox = build_sandbox(&config).unwrap();
        assert_eq!(sandbox.name(), "linux");

        let confinement = sandbox.prepare(1).unwrap();
        assert!(!confinement.is_unrestricted());
        assert!(confinement.group.is_none());
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_bad_allow_list_fails_setup() {
        let config = SandboxConfig {
            syscall_filter: true,
            allowed_syscalls: vec!["no_such_call".to_string()],
            ..SandboxConfig::default()
        };
        assert!(matches!(
            build_sandbox(&config),
            Err(SandboxError::UnknownSyscall(_))
        ));
    }
}
