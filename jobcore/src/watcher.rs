//! Completion watching: how a job's exit gets recorded.
//!
//! Two strategies, chosen per job and stored in its metadata:
//!
//! - **Detached**: a supervisor process (the `jobcore-supervisor` binary, or `jobctl
//!   supervise`) is started in its own process group, spawns the command, reports the pid over a
//!   pipe, waits on the child and publishes the real exit status. It outlives whatever started
//!   it, and enforces the run timeout.
//! - **Liveness probe**: the command is spawned directly and nobody waits on it. Pollers check
//!   whether the recorded pid is still alive and, once it is not, publish [`Outcome::Unknown`].
//!   The exit code is lost. On Linux the recorded start time guards against pid reuse; on other
//!   platforms a reused pid keeps the job "running" until that unrelated process exits.

use crate::config::{RunnerConfig, SupervisorCommand, WatchStrategy};
use crate::errors::{JobError, LaunchError, Result};
use crate::launcher::LaunchPlan;
use crate::process::{self, ProcessRecord};
use crate::status::{Completion, Outcome};
use crate::store::{JobDir, JobMeta};
use serde::{Deserialize, Serialize};
use std::{
    io,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    select,
    signal::unix::{signal, SignalKind},
    time,
};
use tracing::{debug, error, info, warn};

/// Time between SIGTERM and SIGKILL when the supervisor stops a job or is itself stopped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long a launcher waits for an abandoned supervisor to exit after SIGTERM. Longer than
/// [`KILL_GRACE`] so the supervisor can escalate on its child first.
const SUPERVISOR_STOP_GRACE: Duration = Duration::from_secs(8);

/// One JSON line the supervisor writes back after trying to spawn the command.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    Spawned { pid: u32, start_ticks: Option<u64> },
    Failed { reason: String, errno: Option<i32> },
}

/// Process records produced by a successful spawn.
#[derive(Clone, Copy, Debug)]
pub struct Launched {
    pub process: ProcessRecord,
    pub supervisor: Option<ProcessRecord>,
}

pub enum CompletionWatcher<'a> {
    Detached {
        supervisor: &'a SupervisorCommand,
        handshake_timeout: Duration,
    },
    LivenessProbe,
}

impl<'a> CompletionWatcher<'a> {
    pub fn from_config(config: &'a RunnerConfig) -> std::result::Result<Self, LaunchError> {
        match config.strategy() {
            WatchStrategy::Detached => {
                let supervisor = config.supervisor().ok_or_else(|| {
                    LaunchError::Supervisor("no supervisor command configured".into())
                })?;
                Ok(CompletionWatcher::Detached {
                    supervisor,
                    handshake_timeout: config.handshake_timeout(),
                })
            }
            WatchStrategy::LivenessProbe => Ok(CompletionWatcher::LivenessProbe),
        }
    }

    pub fn strategy(&self) -> WatchStrategy {
        match self {
            CompletionWatcher::Detached { .. } => WatchStrategy::Detached,
            CompletionWatcher::LivenessProbe => WatchStrategy::LivenessProbe,
        }
    }

    /// Spawn the command described by `plan` with its output going to the job log.
    pub async fn spawn(
        &self,
        dir: &JobDir,
        plan: &LaunchPlan,
    ) -> std::result::Result<Launched, LaunchError> {
        match self {
            CompletionWatcher::Detached {
                supervisor,
                handshake_timeout,
            } => spawn_supervised(dir, plan, supervisor, *handshake_timeout).await,
            CompletionWatcher::LivenessProbe => {
                warn!(
                    job_id = %dir.id(),
                    "liveness-probe strategy: the exit code will not be captured and a reused pid can misreport completion"
                );
                let child = spawn_logged(dir, plan)
                    .await
                    .map_err(|source| LaunchError::Spawn {
                        program: plan.program.display().to_string(),
                        source,
                    })?;
                let pid = child_pid(&child)?;
                // tokio reaps the dropped child in the background
                drop(child);
                Ok(Launched {
                    process: ProcessRecord::capture(pid),
                    supervisor: None,
                })
            }
        }
    }
}

fn child_pid(child: &Child) -> std::result::Result<u32, LaunchError> {
    child
        .id()
        .ok_or_else(|| LaunchError::Supervisor("child exited before its pid was read".into()))
}

/// Spawn the plan's command as its own process group leader with stdout and stderr appended
/// to the job log.
async fn spawn_logged(dir: &JobDir, plan: &LaunchPlan) -> io::Result<Child> {
    let stdout = dir.open_log_for_append().await?;
    let stderr = stdout.try_clone()?;
    plan.command()
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .kill_on_drop(false)
        .spawn()
}

async fn spawn_supervised(
    dir: &JobDir,
    plan: &LaunchPlan,
    supervisor: &SupervisorCommand,
    handshake_timeout: Duration,
) -> std::result::Result<Launched, LaunchError> {
    let diagnostics = tokio::fs::File::create(dir.supervisor_log_path())
        .await
        .map_err(LaunchError::Store)?
        .into_std()
        .await;
    let mut child = Command::new(&supervisor.program)
        .args(&supervisor.args)
        .arg(dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(diagnostics)
        .process_group(0)
        .kill_on_drop(false)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: supervisor.program.display().to_string(),
            source,
        })?;
    let supervisor_record = ProcessRecord::capture(child_pid(&child)?);

    match time::timeout(handshake_timeout, exchange(&mut child, plan)).await {
        Ok(Ok(Handshake::Spawned { pid, start_ticks })) => {
            debug!(job_id = %dir.id(), pid, supervisor_pid = supervisor_record.pid, "supervisor confirmed spawn");
            Ok(Launched {
                process: ProcessRecord { pid, start_ticks },
                supervisor: Some(supervisor_record),
            })
        }
        Ok(Ok(Handshake::Failed { reason, errno })) => {
            let _ = child.wait().await;
            let source = match errno {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(io::ErrorKind::Other, reason),
            };
            Err(LaunchError::Spawn {
                program: plan.program.display().to_string(),
                source,
            })
        }
        Ok(Err(err)) => {
            stop_supervisor(&mut child).await;
            Err(LaunchError::Supervisor(err.to_string()))
        }
        Err(_) => {
            warn!(job_id = %dir.id(), supervisor_pid = supervisor_record.pid, "supervisor handshake timed out");
            stop_supervisor(&mut child).await;
            Err(LaunchError::Supervisor(format!(
                "no answer within {handshake_timeout:?}"
            )))
        }
    }
}

/// Stop a supervisor whose launch is being abandoned.
///
/// SIGTERM first: a supervisor that already spawned the job forwards it to the job's group, and
/// one that has not yet answered stops its child once the handshake pipe is found closed. SIGKILL
/// only if it does not exit within [`SUPERVISOR_STOP_GRACE`].
async fn stop_supervisor(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(err) = process::terminate_group(pid) {
            debug!(pid, %err, "cannot signal supervisor");
        }
    }
    if time::timeout(SUPERVISOR_STOP_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}

/// Send the plan to the supervisor and read its one-line answer.
async fn exchange(child: &mut Child, plan: &LaunchPlan) -> io::Result<Handshake> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "supervisor stdin missing"))?;
    let payload =
        serde_json::to_vec(plan).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    stdin.write_all(&payload).await?;
    stdin.shutdown().await?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "supervisor stdout missing"))?;
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "supervisor exited without answering",
        ));
    }
    serde_json::from_str(&line).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn outcome_from_status(status: ExitStatus) -> Outcome {
    if let Some(code) = status.code() {
        Outcome::Exited { code }
    } else if let Some(signal) = status.signal() {
        Outcome::Signaled { signal }
    } else {
        Outcome::Unknown
    }
}

/// Write the handshake line. Returns `false` if the launcher is no longer listening.
async fn send_handshake(handshake: &Handshake) -> bool {
    let mut stdout = tokio::io::stdout();
    let mut line = match serde_json::to_vec(handshake) {
        Ok(line) => line,
        Err(err) => {
            error!(%err, "cannot encode handshake");
            return false;
        }
    };
    line.push(b'\n');
    let sent = async {
        stdout.write_all(&line).await?;
        stdout.flush().await
    }
    .await;
    match sent {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "launcher did not receive the handshake");
            false
        }
    }
}

enum Deadline {
    /// Waiting for the run timeout.
    Run,
    /// SIGTERM was sent; SIGKILL when this expires.
    Kill,
}

/// Body of the detached waiter.
///
/// Reads a [`LaunchPlan`] from stdin, spawns it into the job at `job_dir`, answers with a
/// [`Handshake`] line on stdout, then waits for the child and publishes its outcome.
/// SIGTERM is forwarded to the child's process group; SIGHUP is ignored. A job still running
/// when the plan's timeout expires is terminated, and killed [`KILL_GRACE`] later.
pub async fn supervise(job_dir: &Path) -> Result<Outcome> {
    let dir = JobDir::at(job_dir)?;

    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .map_err(|err| JobError::io("<stdin>", err))?;
    let plan: LaunchPlan = serde_json::from_slice(&raw).map_err(|source| JobError::Corrupt {
        path: "<stdin>".into(),
        source,
    })?;

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|err| JobError::io(dir.path(), err))?;
    let mut hangup = signal(SignalKind::hangup()).map_err(|err| JobError::io(dir.path(), err))?;

    let mut child = match spawn_logged(&dir, &plan).await {
        Ok(child) => child,
        Err(err) => {
            error!(job_id = %dir.id(), program = %plan.program.display(), %err, "spawn failed");
            send_handshake(&Handshake::Failed {
                reason: err.to_string(),
                errno: err.raw_os_error(),
            })
            .await;
            return Err(LaunchError::Spawn {
                program: plan.program.display().to_string(),
                source: err,
            }
            .into());
        }
    };
    let Some(pid) = child.id() else {
        send_handshake(&Handshake::Failed {
            reason: "child exited before its pid was read".into(),
            errno: None,
        })
        .await;
        return Err(LaunchError::Supervisor("child pid unavailable".into()).into());
    };
    let delivered = send_handshake(&Handshake::Spawned {
        pid,
        start_ticks: process::start_ticks(pid),
    })
    .await;
    if !delivered {
        // the launcher gave up on this job and is removing its directory
        warn!(job_id = %dir.id(), pid, "launch abandoned, stopping job");
        stop_job(&mut child, pid).await;
        return Err(LaunchError::Supervisor("launcher went away before the handshake".into()).into());
    }
    info!(job_id = %dir.id(), pid, timeout = ?plan.timeout, "supervising");

    let timer = time::sleep(plan.timeout.unwrap_or(KILL_GRACE));
    tokio::pin!(timer);
    let mut deadline = plan.timeout.map(|_| Deadline::Run);
    let mut timed_out = false;

    let status = loop {
        select! {
            _ = terminate.recv() => {
                warn!(job_id = %dir.id(), pid, "SIGTERM received, forwarding to job");
                if let Err(err) = process::terminate_group(pid) {
                    warn!(job_id = %dir.id(), pid, %err, "cannot signal job");
                }
                timer.as_mut().reset(time::Instant::now() + KILL_GRACE);
                deadline = Some(Deadline::Kill);
            }
            _ = hangup.recv() => {
                debug!(job_id = %dir.id(), "ignoring SIGHUP");
            }
            _ = &mut timer, if deadline.is_some() => {
                match deadline.take() {
                    Some(Deadline::Run) => {
                        warn!(job_id = %dir.id(), pid, "run timeout reached, terminating job");
                        timed_out = true;
                        if let Err(err) = process::terminate_group(pid) {
                            warn!(job_id = %dir.id(), pid, %err, "cannot signal job");
                        }
                        timer.as_mut().reset(time::Instant::now() + KILL_GRACE);
                        deadline = Some(Deadline::Kill);
                    }
                    Some(Deadline::Kill) => {
                        warn!(job_id = %dir.id(), pid, "job outlived SIGTERM, killing it");
                        if let Err(err) = process::signal_group(pid, libc::SIGKILL) {
                            warn!(job_id = %dir.id(), pid, %err, "cannot kill job");
                        }
                    }
                    None => {}
                }
            }
            status = child.wait() => break status,
        }
    };

    let cancelled = dir.cancel_requested().await;
    let outcome = match status {
        Ok(_) if cancelled => Outcome::Cancelled,
        Ok(_) if timed_out => Outcome::TimedOut,
        Ok(status) => outcome_from_status(status),
        Err(err) => {
            error!(job_id = %dir.id(), pid, %err, "wait failed");
            Outcome::Unknown
        }
    };
    if outcome == Outcome::TimedOut {
        let secs = plan.timeout.map_or(0, |t| t.as_secs());
        let line = format!("ERROR: Execution timed out after {secs}s\n");
        if let Err(err) = dir.append_log(line.as_bytes()).await {
            warn!(job_id = %dir.id(), %err, "cannot note the timeout in the log");
        }
    }

    // the log is final here: the child is gone, so the marker may go up
    if dir.publish_completion(&Completion::now(outcome)).await? {
        info!(job_id = %dir.id(), pid, ?outcome, "job finished");
    } else {
        info!(job_id = %dir.id(), pid, ?outcome, "job finished after a completion was already recorded");
    }
    Ok(outcome)
}

/// SIGTERM the job's group, then SIGKILL if it is still running after [`KILL_GRACE`].
async fn stop_job(child: &mut Child, pid: u32) {
    if let Err(err) = process::terminate_group(pid) {
        warn!(pid, %err, "cannot signal job");
    }
    if time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        if let Err(err) = process::signal_group(pid, libc::SIGKILL) {
            warn!(pid, %err, "cannot kill job");
        }
        let _ = child.wait().await;
    }
}

/// Probe-based completion for a job with no marker yet.
///
/// For liveness-probe jobs: once the child is gone, publish [`Outcome::Unknown`], or
/// [`Outcome::Cancelled`] if cancellation was requested. For detached jobs: only if the
/// supervisor died without writing a marker and the child is gone too.
/// Returns the marker that ends up on disk, whoever wrote it.
pub async fn reconcile(dir: &JobDir, meta: &JobMeta) -> Result<Option<Completion>> {
    let Some(child) = meta.process else {
        return Ok(None);
    };
    let gone = match meta.strategy {
        WatchStrategy::LivenessProbe => !process::is_alive(&child),
        WatchStrategy::Detached => match meta.supervisor {
            Some(supervisor) => !process::is_alive(&supervisor) && !process::is_alive(&child),
            None => false,
        },
    };
    if !gone {
        return Ok(None);
    }
    // the supervisor may have published between the caller's read and the probe
    if let Some(completion) = dir.read_completion().await? {
        return Ok(Some(completion));
    }
    let outcome = if dir.cancel_requested().await {
        info!(job_id = %dir.id(), pid = child.pid, "cancelled process is gone");
        Outcome::Cancelled
    } else {
        match meta.strategy {
            WatchStrategy::LivenessProbe => warn!(
                job_id = %dir.id(),
                pid = child.pid,
                "process gone; liveness probe records completion with unknown exit code"
            ),
            WatchStrategy::Detached => error!(
                job_id = %dir.id(),
                pid = child.pid,
                "supervisor vanished without recording an exit code"
            ),
        }
        Outcome::Unknown
    };
    dir.publish_completion(&Completion::now(outcome)).await?;
    dir.read_completion().await
}
