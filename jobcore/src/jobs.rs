use crate::config::RunnerConfig;
use crate::errors::{JobError, LaunchError, Result};
use crate::launcher::Launcher;
use crate::poller::{PollResult, Poller};
use crate::process;
use crate::request::StartJobRequest;
use crate::status::{Completion, JobStatus};
use crate::store::{JobDir, JobMeta, JobStore};
use crate::types::{JobId, Offset, OutputBlob};
use crate::watcher;
use futures::Stream;
use std::{io, sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Time between checks while a cancelled job shuts down.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Signal the job's process group. A group that is already gone is not an error.
fn signal_job(dir: &JobDir, pid: u32, signal: libc::c_int) -> Result<()> {
    match process::signal_group(pid, signal) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        Err(err) => Err(JobError::io(dir.path(), err)),
    }
}

/// What a [`Jobs::prune`] pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<JobId>,
    pub still_running: usize,
    pub staging_removed: usize,
}

/// Entry point for request handlers: start, observe, cancel and clean up jobs.
///
/// Holds nothing but the config and paths derived from it. Two `Jobs` values built from the
/// same config in different processes see exactly the same jobs.
#[derive(Clone)]
pub struct Jobs {
    config: Arc<RunnerConfig>,
    store: JobStore,
    launcher: Launcher,
    poller: Poller,
}

impl Jobs {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        let store = JobStore::new(config.root());
        Self {
            launcher: Launcher::new(config.clone()),
            poller: Poller::new(store.clone(), config.max_poll_bytes()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn start_job(&self, request: StartJobRequest) -> std::result::Result<JobId, LaunchError> {
        self.launcher.start(&request).await
    }

    pub async fn poll(&self, id: &JobId, offset: Offset) -> Result<PollResult> {
        self.poller.poll(id, offset).await
    }

    pub async fn full_log(&self, id: &JobId) -> Result<OutputBlob> {
        self.poller.full_log(id).await
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.poller.status(id).await
    }

    pub async fn meta(&self, id: &JobId) -> Result<JobMeta> {
        self.store.open(id).await?.read_meta().await
    }

    /// Terminate a running job and wait until it is recorded as finished.
    ///
    /// Cancellation is requested durably first, then the job's process group gets SIGTERM and,
    /// after the configured grace period, SIGKILL. The marker is only published once the process
    /// is gone, so no output can follow it. For detached jobs the supervisor publishes it; for
    /// liveness-probe jobs this call does. A natural exit racing the request is recorded as
    /// cancelled as well.
    pub async fn cancel(&self, id: &JobId) -> Result<Completion> {
        let dir = self.store.open(id).await?;
        let meta = dir.read_meta().await?;
        if let Some(reason) = meta.launch_error {
            return Err(JobError::LaunchFailed {
                id: id.clone(),
                reason,
            });
        }
        if dir.read_completion().await?.is_some() {
            return Err(JobError::NotRunning(id.clone()));
        }
        let Some(child) = meta.process else {
            return Err(JobError::NotRunning(id.clone()));
        };

        dir.request_cancel().await?;
        signal_job(&dir, child.pid, libc::SIGTERM)?;
        info!(job_id = %id, pid = child.pid, "cancellation requested");

        let grace = self.config.cancel_grace();
        let mut deadline = Instant::now() + grace;
        let mut killed = false;
        loop {
            if let Some(completion) = self.poller.completion(&dir, &meta).await? {
                info!(job_id = %id, outcome = ?completion.outcome, "job cancelled");
                return Ok(completion);
            }
            if Instant::now() >= deadline {
                if killed {
                    return Err(JobError::StillRunning(id.clone()));
                }
                warn!(job_id = %id, pid = child.pid, "job ignored SIGTERM, killing it");
                signal_job(&dir, child.pid, libc::SIGKILL)?;
                killed = true;
                deadline = Instant::now() + grace;
            }
            sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    /// Poll `id` from offset 0 until the job is done and its log drained.
    ///
    /// Waits `interval` between polls that returned everything available; a poll that was cut
    /// short by the chunk limit is followed immediately.
    pub fn follow(&self, id: JobId, interval: Duration) -> impl Stream<Item = Result<PollResult>> {
        let start = (self.clone(), id, 0 as Offset, false);
        futures::stream::unfold(Some(start), move |state| async move {
            let (jobs, id, offset, wait) = state?;
            if wait {
                tokio::time::sleep(interval).await;
            }
            match jobs.poll(&id, offset).await {
                Ok(result) => {
                    let next = (!result.finished()).then(|| (jobs, id, result.offset, result.drained));
                    Some((Ok(result), next))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Delete finished jobs older than `older_than`.
    ///
    /// Removes jobs whose completion is older than the cutoff, launch-failed records and jobs
    /// that never got a pid, plus abandoned staging directories. Running jobs are never touched.
    pub async fn prune(&self, older_than: Duration) -> Result<PruneReport> {
        let age = chrono::Duration::from_std(older_than).map_err(|err| {
            JobError::io(
                self.store.root(),
                io::Error::new(io::ErrorKind::InvalidInput, err),
            )
        })?;
        let cutoff = chrono::Utc::now() - age;
        let mut report = PruneReport::default();

        for id in self.store.list().await? {
            let dir = match self.store.open(&id).await {
                Ok(dir) => dir,
                Err(JobError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let meta = match dir.read_meta().await {
                Ok(meta) => meta,
                Err(JobError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(job_id = %id, %err, "skipping unreadable job");
                    continue;
                }
            };
            let completion = match dir.read_completion().await? {
                Some(completion) => Some(completion),
                None => watcher::reconcile(&dir, &meta).await?,
            };
            let expired = match completion {
                Some(completion) => completion.finished_at < cutoff,
                None if meta.launch_error.is_some() || meta.process.is_none() => {
                    meta.started_at < cutoff
                }
                None => {
                    report.still_running += 1;
                    false
                }
            };
            if expired {
                match self.store.remove(&id).await {
                    Ok(()) | Err(JobError::NotFound(_)) => report.removed.push(id),
                    Err(err) => warn!(job_id = %id, %err, "cannot remove expired job"),
                }
            }
        }

        let staging_cutoff = std::time::SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(std::time::UNIX_EPOCH);
        report.staging_removed = self.store.remove_stale_staging(staging_cutoff).await?;
        info!(
            removed = report.removed.len(),
            still_running = report.still_running,
            staging_removed = report.staging_removed,
            "prune finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchStrategy;
    use crate::identity;
    use crate::process::ProcessRecord;
    use crate::request::CommandDescriptor;
    use crate::status::Outcome;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn jobs(root: &std::path::Path) -> Jobs {
        let config = RunnerConfig::builder(root)
            .strategy(WatchStrategy::LivenessProbe)
            .build()
            .unwrap();
        Jobs::new(Arc::new(config))
    }

    async fn seeded(jobs: &Jobs, process: Option<ProcessRecord>, completion: Option<Completion>) -> JobId {
        let mut meta = JobMeta::new(
            identity::generate(),
            CommandDescriptor {
                program: "true".into(),
                args: vec![],
                working_dir: "/".into(),
                env_keys: vec![],
            },
            WatchStrategy::Detached,
        );
        meta.process = process;
        meta.supervisor = process;
        let dir = jobs.store.create(&meta).await.unwrap();
        if let Some(completion) = completion {
            dir.publish_completion(&completion).await.unwrap();
        }
        meta.id
    }

    #[tokio::test]
    async fn cancel_rejects_finished_and_unknown_jobs() {
        let tmp = TempDir::new().unwrap();
        let jobs = jobs(tmp.path());
        let done = seeded(
            &jobs,
            Some(ProcessRecord::capture(std::process::id())),
            Some(Completion::now(Outcome::Exited { code: 0 })),
        )
        .await;
        assert!(matches!(jobs.cancel(&done).await, Err(JobError::NotRunning(_))));
        assert!(jobs.cancel(&identity::generate()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn prune_keeps_running_jobs() {
        let tmp = TempDir::new().unwrap();
        let jobs = jobs(tmp.path());
        let finished = seeded(
            &jobs,
            Some(ProcessRecord::capture(std::process::id())),
            Some(Completion::now(Outcome::Exited { code: 1 })),
        )
        .await;
        let running = seeded(&jobs, Some(ProcessRecord::capture(std::process::id())), None).await;

        let report = jobs.prune(Duration::from_secs(3600)).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.still_running, 1);

        let report = jobs.prune(Duration::ZERO).await.unwrap();
        assert_eq!(report.removed, vec![finished.clone()]);
        assert_eq!(report.still_running, 1);
        assert!(jobs.status(&finished).await.unwrap_err().is_not_found());
        assert!(matches!(
            jobs.status(&running).await.unwrap(),
            JobStatus::Running { .. }
        ));
    }

    #[tokio::test]
    async fn follow_ends_after_drain() {
        let tmp = TempDir::new().unwrap();
        let jobs = jobs(tmp.path());
        let id = seeded(
            &jobs,
            Some(ProcessRecord::capture(std::process::id())),
            Some(Completion::now(Outcome::Exited { code: 0 })),
        )
        .await;
        jobs.store
            .open(&id)
            .await
            .unwrap()
            .append_log(b"all of it\n")
            .await
            .unwrap();

        let results: Vec<_> = jobs
            .follow(id, Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        let last = results.into_iter().next().unwrap().unwrap();
        assert_eq!(&last.appended[..], b"all of it\n");
        assert!(last.finished());
    }
}
