//! Durable per-job directories.
//!
//! Layout under the jobs root:
//!
//! ```text
//! .staging/<id>/        creation in progress, never visible as a job
//! <id>/meta.json        JobMeta, replaced by temp-file + rename
//! <id>/output.log       merged stdout/stderr, append-only
//! <id>/exit.json        completion marker, published once by hard link
//! <id>/cancel           present once cancellation was requested
//! <id>/supervisor.log   diagnostics from the detached waiter
//! ```
//!
//! No operation here takes a lock. Readers rely on rename and link being atomic and on the log
//! only ever growing.

use crate::config::WatchStrategy;
use crate::errors::{JobError, Result};
use crate::process::ProcessRecord;
use crate::request::CommandDescriptor;
use crate::status::Completion;
use crate::types::{JobId, Offset, OutputBlob};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

pub const META_FILE: &str = "meta.json";
pub const LOG_FILE: &str = "output.log";
pub const COMPLETION_FILE: &str = "exit.json";
pub const SUPERVISOR_LOG_FILE: &str = "supervisor.log";
pub const CANCEL_FILE: &str = "cancel";
pub const STAGING_DIR: &str = ".staging";

/// Everything known about a job apart from its output and outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: JobId,
    pub command: CommandDescriptor,
    pub started_at: DateTime<Utc>,
    pub strategy: WatchStrategy,
    /// The job's command. `None` until the launch is confirmed.
    pub process: Option<ProcessRecord>,
    /// The detached waiter, if any.
    pub supervisor: Option<ProcessRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_error: Option<String>,
}

impl JobMeta {
    pub fn new(id: JobId, command: CommandDescriptor, strategy: WatchStrategy) -> Self {
        Self {
            id,
            command,
            started_at: Utc::now(),
            strategy,
            process: None,
            supervisor: None,
            launch_error: None,
        }
    }
}

/// Bytes read from a log in one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogChunk {
    pub bytes: OutputBlob,
    /// Offset just past `bytes`. Never smaller than the requested offset.
    pub next_offset: Offset,
    /// Committed log length when the read happened.
    pub log_len: u64,
}

impl LogChunk {
    fn empty_at(offset: Offset, log_len: u64) -> Self {
        Self {
            bytes: Bytes::new(),
            next_offset: offset,
            log_len,
        }
    }

    pub fn drained(&self) -> bool {
        self.next_offset >= self.log_len
    }
}

#[derive(Clone, Debug)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Create a job directory holding `meta` and an empty log.
    ///
    /// The directory is assembled under `.staging` and renamed into place, so an observer sees
    /// either nothing or a complete job. Fails with `AlreadyExists` if the id is taken.
    pub async fn create(&self, meta: &JobMeta) -> io::Result<JobDir> {
        let staging = self.staging_root().join(meta.id.as_str());
        let target = self.root.join(meta.id.as_str());
        fs::create_dir_all(self.staging_root()).await?;
        if fs::try_exists(&target).await? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("job {} already exists", meta.id),
            ));
        }
        fs::create_dir(&staging).await?;

        let result = async {
            fs::File::create(staging.join(LOG_FILE)).await?;
            write_atomic(&staging, META_FILE, &encode(meta)?).await?;
            fs::rename(&staging, &target).await.map_err(|err| {
                if matches!(err.raw_os_error(), Some(libc::EEXIST) | Some(libc::ENOTEMPTY)) {
                    io::Error::new(io::ErrorKind::AlreadyExists, err)
                } else {
                    err
                }
            })
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        debug!(job_id = %meta.id, path = %target.display(), "job directory published");
        Ok(JobDir {
            id: meta.id.clone(),
            path: target,
        })
    }

    pub async fn open(&self, id: &JobId) -> Result<JobDir> {
        let path = self.root.join(id.as_str());
        match fs::metadata(&path).await {
            Ok(md) if md.is_dir() => Ok(JobDir {
                id: id.clone(),
                path,
            }),
            Ok(_) => Err(JobError::NotFound(id.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(JobError::NotFound(id.to_string()))
            }
            Err(err) => Err(JobError::io(path, err)),
        }
    }

    /// Like [`JobStore::open`] for an untrusted id string. Malformed ids are simply not found.
    pub async fn open_str(&self, raw: &str) -> Result<JobDir> {
        let id = JobId::parse(raw).ok_or_else(|| JobError::NotFound(raw.to_string()))?;
        self.open(&id).await
    }

    /// Ids of all published jobs, oldest id first.
    pub async fn list(&self) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(JobError::io(&self.root, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| JobError::io(&self.root, err))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(JobId::parse) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn remove(&self, id: &JobId) -> Result<()> {
        let path = self.root.join(id.as_str());
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(JobError::NotFound(id.to_string()))
            }
            Err(err) => Err(JobError::io(path, err)),
        }
    }

    /// Remove staging directories last modified before `cutoff`. Returns how many were removed.
    pub async fn remove_stale_staging(&self, cutoff: SystemTime) -> Result<usize> {
        let staging_root = self.staging_root();
        let mut entries = match fs::read_dir(&staging_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(JobError::io(staging_root, err)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| JobError::io(&staging_root, err))?
        {
            let modified = entry.metadata().await.and_then(|md| md.modified());
            if matches!(modified, Ok(at) if at < cutoff) {
                match fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %entry.path().display(), %err, "cannot remove stale staging dir"),
                }
            }
        }
        Ok(removed)
    }
}

/// Handle to one published job directory.
#[derive(Clone, Debug)]
pub struct JobDir {
    id: JobId,
    path: PathBuf,
}

impl JobDir {
    /// Address an existing job directory directly by path.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(JobId::parse)
            .ok_or_else(|| JobError::NotFound(path.display().to_string()))?;
        if !path.is_dir() {
            return Err(JobError::NotFound(id.to_string()));
        }
        Ok(Self { id, path })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub fn supervisor_log_path(&self) -> PathBuf {
        self.path.join(SUPERVISOR_LOG_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.path.join(META_FILE)
    }

    fn completion_path(&self) -> PathBuf {
        self.path.join(COMPLETION_FILE)
    }

    pub async fn read_meta(&self) -> Result<JobMeta> {
        let path = self.meta_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            // pruned underneath us
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(JobError::NotFound(self.id.to_string()))
            }
            Err(err) => return Err(JobError::io(path, err)),
        };
        serde_json::from_slice(&raw).map_err(|source| JobError::Corrupt { path, source })
    }

    pub async fn write_meta(&self, meta: &JobMeta) -> Result<()> {
        let bytes = encode(meta).map_err(|err| JobError::io(self.meta_path(), err))?;
        write_atomic(&self.path, META_FILE, &bytes)
            .await
            .map_err(|err| JobError::io(self.meta_path(), err))
    }

    /// Append handle to the log, converted to a std file so it can become a child's
    /// stdout/stderr.
    pub async fn open_log_for_append(&self) -> io::Result<std::fs::File> {
        let file = fs::OpenOptions::new()
            .append(true)
            .open(self.log_path())
            .await?;
        Ok(file.into_std().await)
    }

    pub async fn append_log(&self, bytes: &[u8]) -> Result<()> {
        let path = self.log_path();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|err| JobError::io(&path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| JobError::io(&path, err))?;
        file.flush().await.map_err(|err| JobError::io(&path, err))
    }

    /// Read at most `max` committed bytes starting at `offset`.
    ///
    /// The log length is sampled once, so bytes appended during the read are left for the next
    /// call. An offset past the end yields an empty chunk at that same offset.
    pub async fn read_log_from(&self, offset: Offset, max: usize) -> io::Result<LogChunk> {
        let mut file = fs::File::open(self.log_path()).await?;
        let log_len = file.metadata().await?.len();
        if offset >= log_len {
            return Ok(LogChunk::empty_at(offset, log_len));
        }
        let want = (log_len - offset).min(max as u64);
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(want as usize);
        file.take(want).read_to_end(&mut buf).await?;
        let next_offset = offset + buf.len() as u64;
        Ok(LogChunk {
            bytes: Bytes::from(buf),
            next_offset,
            log_len,
        })
    }

    pub async fn read_full_log(&self) -> io::Result<OutputBlob> {
        fs::read(self.log_path()).await.map(Bytes::from)
    }

    pub async fn read_completion(&self) -> Result<Option<Completion>> {
        let path = self.completion_path();
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| JobError::Corrupt { path, source }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(JobError::io(path, err)),
        }
    }

    /// Publish the completion marker unless one already exists.
    ///
    /// Returns `true` if this call wrote the marker. The marker is linked into place from a
    /// fully written temp file, so readers never see a partial record and a second writer
    /// cannot clobber the first.
    pub async fn publish_completion(&self, completion: &Completion) -> Result<bool> {
        let path = self.completion_path();
        let bytes = encode(completion).map_err(|err| JobError::io(&path, err))?;
        let temp = write_temp(&self.path, COMPLETION_FILE, &bytes)
            .await
            .map_err(|err| JobError::io(&path, err))?;
        let linked = fs::hard_link(&temp, &path).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(JobError::io(path, err)),
        }
    }

    /// Record that the job should be cancelled. Whoever publishes the marker afterwards
    /// records [`crate::Outcome::Cancelled`] instead of the raw exit status.
    pub async fn request_cancel(&self) -> Result<()> {
        let path = self.path.join(CANCEL_FILE);
        write_atomic(&self.path, CANCEL_FILE, b"")
            .await
            .map_err(|err| JobError::io(path, err))
    }

    pub async fn cancel_requested(&self) -> bool {
        fs::try_exists(self.path.join(CANCEL_FILE))
            .await
            .unwrap_or(false)
    }
}

fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

async fn write_temp(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let temp = dir.join(format!(
        ".{name}.tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let mut file = fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(temp)
}

async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let temp = write_temp(dir, name, bytes).await?;
    if let Err(err) = fs::rename(&temp, dir.join(name)).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::status::Outcome;
    use tempfile::TempDir;

    fn meta(id: JobId) -> JobMeta {
        JobMeta::new(
            id,
            CommandDescriptor {
                program: "echo".into(),
                args: vec!["hi".into()],
                working_dir: "/tmp".into(),
                env_keys: vec![],
            },
            WatchStrategy::Detached,
        )
    }

    async fn store_with_job() -> (TempDir, JobStore, JobDir) {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::new(tmp.path());
        let dir = store.create(&meta(identity::generate())).await.unwrap();
        (tmp, store, dir)
    }

    #[tokio::test]
    async fn create_publishes_complete_job() {
        let (_tmp, store, dir) = store_with_job().await;
        let opened = store.open(dir.id()).await.unwrap();
        let read = opened.read_meta().await.unwrap();
        assert_eq!(&read.id, dir.id());
        assert_eq!(read.process, None);
        assert_eq!(opened.read_full_log().await.unwrap().len(), 0);
        assert_eq!(opened.read_completion().await.unwrap(), None);
        assert_eq!(store.list().await.unwrap(), vec![dir.id().clone()]);

        let staging = store.root().join(STAGING_DIR).join(dir.id().as_str());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn create_refuses_existing_id() {
        let (_tmp, store, dir) = store_with_job().await;
        let err = store.create(&meta(dir.id().clone())).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::new(tmp.path());
        assert!(store.open(&identity::generate()).await.unwrap_err().is_not_found());
        assert!(store.open_str("../../etc").await.unwrap_err().is_not_found());
        assert!(store.open_str(STAGING_DIR).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn read_log_from_is_offset_bounded() {
        let (_tmp, _store, dir) = store_with_job().await;
        dir.append_log(b"hello ").await.unwrap();
        dir.append_log(b"world\n").await.unwrap();

        let chunk = dir.read_log_from(0, 4).await.unwrap();
        assert_eq!(&chunk.bytes[..], b"hell");
        assert_eq!(chunk.next_offset, 4);
        assert!(!chunk.drained());

        let chunk = dir.read_log_from(4, 1024).await.unwrap();
        assert_eq!(&chunk.bytes[..], b"o world\n");
        assert_eq!(chunk.next_offset, 12);
        assert!(chunk.drained());

        let past_end = dir.read_log_from(50, 1024).await.unwrap();
        assert!(past_end.bytes.is_empty());
        assert_eq!(past_end.next_offset, 50);
    }

    #[tokio::test]
    async fn completion_is_write_once() {
        let (_tmp, _store, dir) = store_with_job().await;
        let first = Completion::now(Outcome::Exited { code: 0 });
        assert!(dir.publish_completion(&first).await.unwrap());
        let second = Completion::now(Outcome::Unknown);
        assert!(!dir.publish_completion(&second).await.unwrap());
        assert_eq!(dir.read_completion().await.unwrap(), Some(first));

        // no temp files left behind
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.contains(".tmp-"), "leftover {name}");
        }
    }

    #[tokio::test]
    async fn cancel_request_is_durable() {
        let (_tmp, store, dir) = store_with_job().await;
        assert!(!dir.cancel_requested().await);
        dir.request_cancel().await.unwrap();
        dir.request_cancel().await.unwrap();
        let reopened = store.open(dir.id()).await.unwrap();
        assert!(reopened.cancel_requested().await);
    }

    #[tokio::test]
    async fn meta_rewrite_is_visible() {
        let (_tmp, _store, dir) = store_with_job().await;
        let mut meta = dir.read_meta().await.unwrap();
        meta.process = Some(ProcessRecord {
            pid: 42,
            start_ticks: Some(7),
        });
        dir.write_meta(&meta).await.unwrap();
        assert_eq!(dir.read_meta().await.unwrap().process, meta.process);
    }

    #[tokio::test]
    async fn remove_and_stale_staging() {
        let (_tmp, store, dir) = store_with_job().await;
        store.remove(dir.id()).await.unwrap();
        assert!(store.open(dir.id()).await.unwrap_err().is_not_found());
        assert!(store.remove(dir.id()).await.unwrap_err().is_not_found());

        let leftover = store.root().join(STAGING_DIR).join("123-abandoned");
        fs::create_dir_all(&leftover).await.unwrap();
        let future = SystemTime::now() + std::time::Duration::from_secs(60);
        assert_eq!(store.remove_stale_staging(future).await.unwrap(), 1);
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn job_dir_at_path() {
        let (_tmp, _store, dir) = store_with_job().await;
        let again = JobDir::at(dir.path()).unwrap();
        assert_eq!(again.id(), dir.id());
        assert!(JobDir::at("/definitely/not/here-1").is_err());
    }
}
