//! External probe process execution with timeout and cancellation.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

/// How long a terminated probe gets to exit before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Runs one probe invocation and returns its stdout.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run(
        &self,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ProbeError>;
}

/// Runs `nmap` in its own process group so that a stop reaches every
/// helper it forked.
#[derive(Debug, Clone)]
pub struct NmapRunner {
    program: PathBuf,
}

impl NmapRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

enum Outcome {
    Finished(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProbeRunner for NmapRunner {
    async fn run(
        &self,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let program = self.program.display().to_string();
        info!(command = %program, ?args, "audit: launching probe");
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| ProbeError::Spawn { program, source })?;

        let outcome = tokio::select! {
            res = collect(&mut child) => Outcome::Finished(res),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Finished(res) => {
                let (status, stdout, stderr) = res?;
                if status.success() {
                    return Ok(String::from_utf8_lossy(&stdout).into_owned());
                }
                if terminated(&status) {
                    return Err(ProbeError::Cancelled);
                }
                Err(ProbeError::Exit {
                    status: status.to_string(),
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                })
            }
            Outcome::TimedOut => {
                warn!(?timeout, "probe timed out, terminating");
                terminate(&mut child).await;
                Err(ProbeError::Timeout(timeout))
            }
            Outcome::Cancelled => {
                debug!("probe cancelled, terminating");
                terminate(&mut child).await;
                Err(ProbeError::Cancelled)
            }
        }
    }
}

async fn collect(child: &mut Child) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out = Vec::new();
    let mut err = Vec::new();

    let read_out = async {
        if let Some(s) = stdout.as_mut() {
            s.read_to_end(&mut out).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let read_err = async {
        if let Some(s) = stderr.as_mut() {
            s.read_to_end(&mut err).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (r_out, r_err, status) = tokio::join!(read_out, read_err, child.wait());
    r_out?;
    r_err?;
    Ok((status?, out, err))
}

/// Exit caused by SIGTERM/SIGKILL, directly or as reported by a wrapper.
fn terminated(status: &ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if matches!(status.signal(), Some(9) | Some(15)) {
            return true;
        }
    }
    matches!(status.code(), Some(137) | Some(143))
}

/// SIGTERM the whole process group, then kill the leader if it lingers.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "failed to signal probe group");
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "probe already gone");
    }
    let _ = child.wait().await;
}
