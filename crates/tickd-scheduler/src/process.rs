//! Process spawning and signalling.
//!
//! Everything that touches OS processes goes through [`Spawner`] or the free
//! functions here, so the scheduler can be driven by a fake in tests.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tickd_core::config::RunnerConfig;
use tokio::process::Command;
use tracing::{debug, warn};

/// Everything needed to start one run.
#[derive(Debug)]
pub struct SpawnRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlaid on the inherited environment.
    pub env: Option<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
    pub stdout: File,
    pub stderr: File,
}

/// How a child ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    /// Signal name when the child was terminated by one.
    pub signal: Option<String>,
    pub error: Option<String>,
}

pub struct SpawnedProcess {
    pub pid: u32,
    /// Resolves once the child has been reaped.
    pub exit: BoxFuture<'static, ExitOutcome>,
}

/// Starts processes for runs.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedProcess>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellMode {
    /// `<shell> -lc '<argv>'`
    Login { shell: String },
    Direct,
}

/// [`Spawner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    mode: ShellMode,
}

impl ShellSpawner {
    pub fn from_config(config: &RunnerConfig) -> Self {
        if config.login_shell && cfg!(unix) {
            let shell = config
                .shell
                .clone()
                .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
                .unwrap_or_else(|| "/bin/sh".to_string());
            Self::login(shell)
        } else {
            Self::direct()
        }
    }

    /// Run argv through `shell -lc` so profile PATH changes apply.
    pub fn login(shell: impl Into<String>) -> Self {
        Self {
            mode: ShellMode::Login {
                shell: shell.into(),
            },
        }
    }

    /// Exec argv directly.
    pub fn direct() -> Self {
        Self {
            mode: ShellMode::Direct,
        }
    }

    fn command(&self, argv: &[String]) -> Command {
        match &self.mode {
            ShellMode::Login { shell } if cfg!(unix) => {
                let mut cmd = Command::new(shell);
                cmd.arg("-lc").arg(shell_command(argv));
                cmd
            }
            _ => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
        }
    }
}

impl Spawner for ShellSpawner {
    fn spawn(&self, request: SpawnRequest) -> io::Result<SpawnedProcess> {
        if request.argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        }

        let mut cmd = self.command(&request.argv);
        if let Some(ref cwd) = request.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = request.env {
            cmd.envs(env);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(request.stdout))
            .stderr(Stdio::from(request.stderr));
        // Own process group, so signals reach grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
        debug!(pid, argv = ?request.argv, "process spawned");

        let timeout = request.timeout;
        let exit = async move {
            let mut timed_out = None;
            let waited = match timeout {
                None => child.wait().await,
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(waited) => waited,
                    Err(_elapsed) => {
                        let limit_ms = limit.as_millis() as u64;
                        warn!(pid, timeout_ms = limit_ms, "run timed out, killing");
                        if let Err(e) = send_signal(pid, ProcessSignal::Kill) {
                            warn!(pid, "timeout kill failed: {e}");
                        }
                        timed_out = Some(format!("timed out after {limit_ms}ms"));
                        child.wait().await
                    }
                },
            };
            match waited {
                Ok(status) => ExitOutcome {
                    error: timed_out,
                    ..outcome_from_status(status)
                },
                Err(e) => ExitOutcome {
                    error: Some(format!("wait failed: {e}")),
                    ..Default::default()
                },
            }
        }
        .boxed();

        Ok(SpawnedProcess { pid, exit })
    }
}

fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(signal_name)
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitOutcome {
        exit_code: status.code(),
        signal,
        error: None,
    }
}

/// Quote `arg` for a POSIX shell.
pub fn escape_shell_arg(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn shell_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| escape_shell_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Signal the process group led by `pid`, falling back to the single process
/// when no such group exists.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: ProcessSignal) -> io::Result<()> {
    let sig = match signal {
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    // Safety: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pid, sig) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: ProcessSignal) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pid.to_string()]);
    if signal == ProcessSignal::Kill {
        cmd.arg("/F");
    }
    let status = cmd.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// Liveness check. A process we may not signal (EPERM) still exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Safety: signal 0 performs the permission and existence checks only.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Conventional name for a signal number, e.g. `SIGKILL`.
pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        let name = match signal {
            libc::SIGHUP => "SIGHUP",
            libc::SIGINT => "SIGINT",
            libc::SIGQUIT => "SIGQUIT",
            libc::SIGABRT => "SIGABRT",
            libc::SIGKILL => "SIGKILL",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGPIPE => "SIGPIPE",
            libc::SIGALRM => "SIGALRM",
            libc::SIGTERM => "SIGTERM",
            libc::SIGUSR1 => "SIGUSR1",
            libc::SIGUSR2 => "SIGUSR2",
            _ => return format!("SIG{signal}"),
        };
        name.to_string()
    }
    #[cfg(not(unix))]
    {
        format!("SIG{signal}")
    }
}
