//! Starting jobs.
//!
//! [`Launcher::start`] validates the request against the config, publishes the job directory,
//! hands the spawn to the configured [`CompletionWatcher`] and records the child's pid before
//! returning. It never waits for the command to finish.

use crate::config::RunnerConfig;
use crate::errors::{JobError, LaunchError};
use crate::identity;
use crate::request::StartJobRequest;
use crate::store::{JobDir, JobMeta, JobStore};
use crate::types::{Args, Envs, JobId};
use crate::watcher::{CompletionWatcher, Launched};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs, process};
use tracing::{error, info, warn};

/// Attempts at finding an unused job id before giving up.
const CREATE_ATTEMPTS: usize = 3;

/// Everything needed to exec the command, secrets included. Never written to disk; the
/// detached waiter receives it over a pipe.
#[derive(Clone, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Args,
    pub working_dir: PathBuf,
    pub env: Envs,
    pub inherit_env: bool,
    /// Wall-clock limit enforced by the supervisor.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl LaunchPlan {
    pub fn command(&self) -> process::Command {
        let mut command = process::Command::new(&self.program);
        command.args(&self.args).current_dir(&self.working_dir);
        if !self.inherit_env {
            command.env_clear();
        }
        command.envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }
}

#[derive(Clone)]
pub struct Launcher {
    config: Arc<RunnerConfig>,
    store: JobStore,
}

impl Launcher {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        let store = JobStore::new(config.root());
        Self { config, store }
    }

    pub async fn start(&self, request: &StartJobRequest) -> Result<JobId, LaunchError> {
        if !self.config.is_allowed(request.program()) {
            return Err(LaunchError::NotAllowed(request.program().to_string()));
        }
        let plan = self.plan(request).await?;
        let watcher = CompletionWatcher::from_config(&self.config)?;
        let descriptor = request.descriptor(self.config.redact_markers());

        let (dir, mut meta) = self.create(descriptor, &watcher).await?;
        let Launched { process, supervisor } = match watcher.spawn(&dir, &plan).await {
            Ok(launched) => launched,
            Err(err) => {
                self.abandon(&dir, &mut meta, &err).await;
                return Err(err);
            }
        };

        meta.process = Some(process);
        meta.supervisor = supervisor;
        if let Err(err) = dir.write_meta(&meta).await {
            error!(job_id = %meta.id, %err, "cannot record pid, terminating job");
            let _ = crate::process::terminate_group(process.pid);
            let err = LaunchError::Store(io::Error::new(io::ErrorKind::Other, err));
            self.abandon(&dir, &mut meta, &err).await;
            return Err(err);
        }

        info!(
            job_id = %meta.id,
            pid = process.pid,
            strategy = %meta.strategy,
            command = %meta.command.display_line(),
            "job started"
        );
        Ok(meta.id)
    }

    /// Resolve the executable and environment, and check the working directory.
    pub async fn plan(&self, request: &StartJobRequest) -> Result<LaunchPlan, LaunchError> {
        let mut env: Envs = self
            .config
            .base_env()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(request.env().map(|(k, v)| (k.to_string(), v.to_string())));

        let working_dir = request.working_dir();
        match fs::metadata(working_dir).await {
            Ok(md) if md.is_dir() => {}
            Ok(_) => {
                return Err(LaunchError::InvalidWorkingDirectory {
                    path: working_dir.to_path_buf(),
                    reason: "not a directory".into(),
                })
            }
            Err(err) => {
                return Err(LaunchError::InvalidWorkingDirectory {
                    path: working_dir.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        }

        let search_path = env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| OsString::from(v))
            .or_else(|| {
                self.config
                    .inherit_env()
                    .then(|| std::env::var_os("PATH"))
                    .flatten()
            });
        let program = resolve_executable(request.program(), working_dir, search_path).await?;

        Ok(LaunchPlan {
            program,
            args: request.args(),
            working_dir: working_dir.to_path_buf(),
            env,
            inherit_env: self.config.inherit_env(),
            timeout: self.config.run_timeout(),
        })
    }

    async fn create(
        &self,
        descriptor: crate::request::CommandDescriptor,
        watcher: &CompletionWatcher<'_>,
    ) -> Result<(JobDir, JobMeta), LaunchError> {
        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            let meta = JobMeta::new(identity::generate(), descriptor.clone(), watcher.strategy());
            match self.store.create(&meta).await {
                Ok(dir) => return Ok((dir, meta)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(job_id = %meta.id, "job id collision, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(LaunchError::Store(err)),
            }
        }
        Err(LaunchError::Store(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "no free job id")
        })))
    }

    /// Roll back a job whose launch failed. If the directory cannot be removed it is left
    /// marked with the failure so pollers report it instead of waiting forever.
    async fn abandon(&self, dir: &JobDir, meta: &mut JobMeta, cause: &LaunchError) {
        match self.store.remove(dir.id()).await {
            Ok(()) | Err(JobError::NotFound(_)) => {}
            Err(err) => {
                warn!(job_id = %dir.id(), %err, "cannot remove failed job, marking it");
                meta.launch_error = Some(cause.to_string());
                if let Err(err) = dir.write_meta(meta).await {
                    error!(job_id = %dir.id(), %err, "cannot mark failed job");
                }
            }
        }
    }
}

async fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find the file `program` refers to, the way `execvp` would: names containing a slash are
/// paths (relative to the job's working directory), bare names are searched in `search_path`.
pub async fn resolve_executable(
    program: &str,
    working_dir: &Path,
    search_path: Option<OsString>,
) -> Result<PathBuf, LaunchError> {
    if program.contains('/') {
        let path = working_dir.join(program);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(LaunchError::ExecutableNotFound(program.to_string()));
        }
        if !is_executable(&path).await {
            return Err(LaunchError::NotExecutable(path));
        }
        return Ok(path);
    }
    let dirs: Vec<PathBuf> = search_path
        .as_deref()
        .map(|paths| std::env::split_paths(paths).collect())
        .unwrap_or_default();
    for dir in dirs {
        let candidate = dir.join(program);
        if is_executable(&candidate).await {
            return Ok(candidate);
        }
    }
    Err(LaunchError::ExecutableNotFound(program.to_string()))
}
