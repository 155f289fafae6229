//! External compiler invocation
//!
//! The compiler is a black box: it reads source on stdin and writes an
//! executable to the path given after `-o`. A zero exit status together with
//! a file at that path is success; anything else is a failed compile whose
//! diagnostics are handed back to the caller untouched.

use crate::config::CompilerConfig;
use crate::errors::CompileError;
use crate::registry::remove_artifact;
use sandpit_types::{CompileResponse, CompilerStatus, Token};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

#[cfg(unix)]
const GROUP_EXIT_POLLS: usize = 100;
#[cfg(unix)]
const GROUP_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of one compiler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Present when the compiler exited non-zero, was killed or timed out
    pub error: Option<String>,
}

impl CompileOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_response(self, token: Token) -> CompileResponse {
        CompileResponse {
            return_code: self.return_code,
            stdout: self.stdout,
            stderr: self.stderr,
            error: self.error,
            token,
        }
    }
}

/// Invokes the configured compiler
#[derive(Debug, Clone)]
pub struct Compiler {
    program: String,
    args: Vec<String>,
    link_flags: Vec<String>,
    version_args: Vec<String>,
    timeout: Duration,
}

impl Compiler {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            link_flags: config.link_flags.clone(),
            version_args: config.version_args.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolve the compiler executable, failing if it is not installed.
    pub fn locate(&self) -> Result<PathBuf, CompileError> {
        which::which(&self.program).map_err(|source| CompileError::NotFound {
            program: self.program.clone(),
            source,
        })
    }

    /// Compile `source` into `target`.
    ///
    /// On any failure the file at `target` is removed before returning.
    /// `Err` is reserved for the compiler not being runnable at all.
    pub async fn compile(
        &self,
        source: &str,
        token: Token,
        target: &Path,
    ) -> Result<CompileOutcome, CompileError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("-o")
            .arg(target)
            .args(&self.link_flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so a timeout also reaches the linker and friends.
        #[cfg(unix)]
        command.process_group(0);

        log::debug!("Compiling token {} into {}", token, target.display());

        let mut child = command.spawn().map_err(|source| CompileError::Invoke {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let source = source.as_bytes().to_vec();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&source).await {
                Ok(()) => stdin.shutdown().await,
                // The compiler may bail out before reading all of its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e),
            }
        };

        let run = async {
            tokio::join!(feed, read_pipe(stdout), read_pipe(stderr), child.wait())
        };

        let finished = tokio::time::timeout(self.timeout, run).await;
        let outcome = match finished {
            Err(_) => {
                log::warn!(
                    "Compiler for token {} timed out after {:?}",
                    token,
                    self.timeout
                );
                terminate(&mut child).await;
                CompileOutcome {
                    return_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("compiler timed out after {:?}", self.timeout)),
                }
            }
            Ok((fed, stdout, stderr, status)) => {
                let invoke_error = |source| CompileError::Invoke {
                    program: self.program.clone(),
                    source,
                };
                let status = status.map_err(invoke_error)?;
                let stdout = stdout.map_err(invoke_error)?;
                let stderr = stderr.map_err(invoke_error)?;
                if let Err(e) = fed {
                    remove_artifact(target);
                    return Err(CompileError::Stdin(e));
                }
                CompileOutcome {
                    return_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    error: status_error(status),
                }
            }
        };

        if !outcome.succeeded() {
            remove_artifact(target);
        }

        Ok(outcome)
    }

    /// Ask the compiler for its version; used by the health check.
    pub async fn version(&self) -> CompilerStatus {
        let mut command = Command::new(&self.program);
        command
            .args(&self.version_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => return unhealthy("compiler version probe timed out".to_string()),
            Ok(Err(e)) => return unhealthy(format!("failed to run {}: {}", self.program, e)),
            Ok(Ok(output)) => output,
        };

        let text = if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        let version = String::from_utf8_lossy(text)
            .lines()
            .next()
            .map(|line| line.trim().to_string());

        CompilerStatus {
            healthy: output.status.success(),
            error: status_error(output.status),
            version,
            exit_status: output.status.code(),
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Kill the compiler's whole process group and reap the compiler.
///
/// Returns once no member of the group is left alive (bounded), so nothing
/// can write to the target after the caller removes it.
#[cfg(unix)]
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = pid as libc::pid_t;
    // SAFETY: signals the group created for this child by `process_group(0)`.
    unsafe { libc::killpg(group, libc::SIGKILL) };
    if let Err(e) = child.wait().await {
        log::warn!("Failed to reap timed out compiler: {}", e);
    }
    for _ in 0..GROUP_EXIT_POLLS {
        // SAFETY: signal 0 only checks whether the group still exists.
        if unsafe { libc::killpg(group, 0) } != 0 {
            return;
        }
        tokio::time::sleep(GROUP_EXIT_POLL_INTERVAL).await;
    }
    log::warn!("Compiler process group {} outlived SIGKILL", group);
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill timed out compiler: {}", e);
    }
}

fn unhealthy(error: String) -> CompilerStatus {
    CompilerStatus {
        healthy: false,
        error: Some(error),
        version: None,
        exit_status: None,
    }
}

fn status_error(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    Some(match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "compiler was terminated by a signal".to_string(),
    })
}
