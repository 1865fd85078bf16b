//! Stateless, offset-based reads of a job's output and status.
//!
//! The caller owns the cursor: every call names the offset it has consumed up to, so any number
//! of independent readers can follow the same job without affecting each other.

use crate::errors::{JobError, Result};
use crate::status::{Completion, JobStatus, Outcome};
use crate::store::{JobDir, JobMeta, JobStore};
use crate::types::{JobId, Offset, OutputBlob};
use crate::watcher;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollResult {
    /// Offset to pass to the next poll. Never below the requested offset.
    pub offset: Offset,
    /// Log bytes in `[requested offset, offset)`.
    pub appended: OutputBlob,
    pub elapsed_seconds: u64,
    pub done: bool,
    pub return_code: Option<i32>,
    pub outcome: Option<Outcome>,
    /// `offset` reached the end of the log as it was at read time.
    pub drained: bool,
}

impl PollResult {
    /// Nothing more will ever be appended past `offset`.
    pub fn finished(&self) -> bool {
        self.done && self.drained
    }
}

#[derive(Clone, Debug)]
pub struct Poller {
    store: JobStore,
    max_chunk: usize,
}

impl Poller {
    pub fn new(store: JobStore, max_chunk: usize) -> Self {
        Self { store, max_chunk }
    }

    async fn open(&self, id: &JobId) -> Result<(JobDir, JobMeta)> {
        let dir = self.store.open(id).await?;
        let meta = dir.read_meta().await?;
        if let Some(reason) = &meta.launch_error {
            return Err(JobError::LaunchFailed {
                id: id.clone(),
                reason: reason.clone(),
            });
        }
        Ok((dir, meta))
    }

    /// The job's marker, publishing one first if the job is found dead without it.
    pub(crate) async fn completion(
        &self,
        dir: &JobDir,
        meta: &JobMeta,
    ) -> Result<Option<Completion>> {
        let found = match dir.read_completion().await {
            Ok(found) => found,
            Err(JobError::Io { path, source }) => {
                warn!(job_id = %dir.id(), path = %path.display(), err = %source, "marker unreadable, treating job as running");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        match found {
            Some(completion) => Ok(Some(completion)),
            None => match watcher::reconcile(dir, meta).await {
                Ok(found) => Ok(found),
                Err(JobError::Io { path, source }) => {
                    warn!(job_id = %dir.id(), path = %path.display(), err = %source, "cannot record probed completion");
                    Ok(None)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Read whatever was appended at or after `from`, together with the job's status.
    pub async fn poll(&self, id: &JobId, from: Offset) -> Result<PollResult> {
        let (dir, meta) = self.open(id).await?;
        // marker first: if it is present the child has exited and the log below is final
        let completion = self.completion(&dir, &meta).await?;

        let (appended, offset, drained) = match dir.read_log_from(from, self.max_chunk).await {
            Ok(chunk) => {
                let drained = chunk.drained();
                (chunk.bytes, chunk.next_offset, drained)
            }
            Err(err) => {
                warn!(job_id = %id, offset = from, %err, "log unreadable, reporting no new output");
                (Bytes::new(), from, false)
            }
        };

        let until = completion.map_or_else(Utc::now, |c| c.finished_at);
        let elapsed_seconds = (until - meta.started_at).num_seconds().max(0) as u64;
        let outcome = completion.map(|c| c.outcome);
        debug!(job_id = %id, from, offset, done = completion.is_some(), "poll");

        Ok(PollResult {
            offset,
            appended,
            elapsed_seconds,
            done: completion.is_some(),
            return_code: outcome.and_then(|o| o.return_code()),
            outcome,
            drained,
        })
    }

    /// The complete log as it stands.
    pub async fn full_log(&self, id: &JobId) -> Result<OutputBlob> {
        let (dir, _) = self.open(id).await?;
        dir.read_full_log()
            .await
            .map_err(|err| JobError::io(dir.log_path(), err))
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        let (dir, meta) = self.open(id).await?;
        Ok(match self.completion(&dir, &meta).await? {
            Some(completion) => JobStatus::Completed(completion),
            None => match meta.process {
                Some(process) => JobStatus::Running { pid: process.pid },
                None => JobStatus::Created,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchStrategy;
    use crate::identity;
    use crate::process::ProcessRecord;
    use crate::request::CommandDescriptor;
    use crate::store::COMPLETION_FILE;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        poller: Poller,
        dir: JobDir,
    }

    /// A detached job whose supervisor is this test process, so it stays "running" until a
    /// marker is written by hand.
    async fn running_job(max_chunk: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::new(tmp.path());
        let mut meta = JobMeta::new(
            identity::generate(),
            CommandDescriptor {
                program: "sh".into(),
                args: vec![],
                working_dir: "/".into(),
                env_keys: vec![],
            },
            WatchStrategy::Detached,
        );
        let dir = store.create(&meta).await.unwrap();
        let me = ProcessRecord::capture(std::process::id());
        meta.process = Some(me);
        meta.supervisor = Some(me);
        dir.write_meta(&meta).await.unwrap();
        Fixture {
            _tmp: tmp,
            poller: Poller::new(store, max_chunk),
            dir,
        }
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let fx = running_job(1024).await;
        let err = fx.poller.poll(&identity::generate(), 0).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(fx
            .poller
            .full_log(&identity::generate())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn no_output_yet_is_not_an_error() {
        let fx = running_job(1024).await;
        let result = fx.poller.poll(fx.dir.id(), 0).await.unwrap();
        assert_eq!(result.offset, 0);
        assert!(result.appended.is_empty());
        assert!(!result.done);
        assert_eq!(result.return_code, None);
        assert_eq!(
            fx.poller.status(fx.dir.id()).await.unwrap(),
            JobStatus::Running {
                pid: std::process::id()
            }
        );
    }

    #[tokio::test]
    async fn incremental_reads_reassemble_the_log() {
        let fx = running_job(5).await;
        let id = fx.dir.id().clone();
        let mut seen = Vec::new();
        let mut offset = 0;
        for piece in [&b"alpha\n"[..], b"beta\n", b"", b"gamma\n"] {
            fx.dir.append_log(piece).await.unwrap();
            loop {
                let result = fx.poller.poll(&id, offset).await.unwrap();
                assert!(result.offset >= offset);
                assert_eq!(result.offset - offset, result.appended.len() as u64);
                seen.extend_from_slice(&result.appended);
                offset = result.offset;
                if result.drained {
                    break;
                }
            }
        }
        assert_eq!(seen, b"alpha\nbeta\ngamma\n");
    }

    #[tokio::test]
    async fn done_is_stable_and_idempotent() {
        let fx = running_job(1024).await;
        let id = fx.dir.id().clone();
        fx.dir.append_log(b"bye\n").await.unwrap();
        fx.dir
            .publish_completion(&Completion::now(Outcome::Exited { code: 2 }))
            .await
            .unwrap();

        let first = fx.poller.poll(&id, 0).await.unwrap();
        assert!(first.done && first.drained);
        assert_eq!(first.return_code, Some(2));
        assert_eq!(&first.appended[..], b"bye\n");

        let again = fx.poller.poll(&id, first.offset).await.unwrap();
        let again2 = fx.poller.poll(&id, first.offset).await.unwrap();
        assert_eq!(again, again2);
        assert!(again.appended.is_empty());
        assert_eq!(again.offset, first.offset);
        assert_eq!(again.return_code, Some(2));
        assert!(again.finished());
        assert_eq!(
            fx.poller.full_log(&id).await.unwrap(),
            Bytes::from_static(b"bye\n")
        );
    }

    #[tokio::test]
    async fn unreadable_log_is_no_data_yet() {
        let fx = running_job(1024).await;
        let id = fx.dir.id().clone();
        fx.dir.append_log(b"first\n").await.unwrap();
        let first = fx.poller.poll(&id, 0).await.unwrap();
        assert_eq!(first.offset, 6);

        tokio::fs::remove_file(fx.dir.log_path()).await.unwrap();
        let missing = fx.poller.poll(&id, first.offset).await.unwrap();
        assert!(missing.appended.is_empty());
        assert_eq!(missing.offset, first.offset);
        assert!(!missing.done);
        assert!(!missing.drained);

        tokio::fs::write(fx.dir.log_path(), b"first\nsecond\n")
            .await
            .unwrap();
        let back = fx.poller.poll(&id, missing.offset).await.unwrap();
        assert_eq!(&back.appended[..], b"second\n");
        assert_eq!(back.offset, 13);
        assert!(back.drained);
    }

    #[tokio::test]
    async fn unreadable_marker_reads_as_running() {
        let fx = running_job(1024).await;
        tokio::fs::create_dir(fx.dir.path().join(COMPLETION_FILE))
            .await
            .unwrap();
        let result = fx.poller.poll(fx.dir.id(), 0).await.unwrap();
        assert!(!result.done);
        assert_eq!(result.return_code, None);
        assert!(matches!(
            fx.poller.status(fx.dir.id()).await.unwrap(),
            JobStatus::Running { .. }
        ));
    }

    #[tokio::test]
    async fn launch_failed_jobs_report_their_reason() {
        let fx = running_job(1024).await;
        let mut meta = fx.dir.read_meta().await.unwrap();
        meta.launch_error = Some("spawn failed".into());
        fx.dir.write_meta(&meta).await.unwrap();
        assert!(matches!(
            fx.poller.poll(fx.dir.id(), 0).await,
            Err(JobError::LaunchFailed { .. })
        ));
    }
}
