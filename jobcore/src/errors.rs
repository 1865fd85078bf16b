use crate::types::JobId;
use std::{io, path::PathBuf, result};
use thiserror::Error;

/// A request field that failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct Invalid {
    pub field: &'static str,
    pub reason: String,
}

impl Invalid {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors reported synchronously by `start_job`. No job is visible after any of these.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Invalid(#[from] Invalid),
    #[error("program {0:?} is not in the allowed list")]
    NotAllowed(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("invalid working directory {}: {reason}", .path.display())]
    InvalidWorkingDirectory { path: PathBuf, reason: String },
    #[error("cannot create job record: {0}")]
    Store(#[source] io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("supervisor did not confirm the launch: {0}")]
    Supervisor(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("no such job: {0}")]
    NotFound(String),
    #[error("job {0} is not running")]
    NotRunning(JobId),
    #[error("job {0} is still running after SIGKILL")]
    StillRunning(JobId),
    #[error("job {id} failed to launch: {reason}")]
    LaunchFailed { id: JobId, reason: String },
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt job record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("jobs root must be an absolute path, got {}", .0.display())]
    RelativeRoot(PathBuf),
    #[error("the detached strategy needs a supervisor command")]
    MissingSupervisor,
    #[error("supervisor program not found: {}", .0.display())]
    SupervisorNotFound(PathBuf),
    #[error("allowed program entries must not be empty")]
    EmptyAllowedProgram,
    #[error("invalid base environment: {0}")]
    BaseEnv(#[source] Invalid),
    #[error("max_poll_bytes must be greater than zero")]
    ZeroPollBytes,
    #[error("unknown watch strategy {0:?}")]
    UnknownStrategy(String),
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = result::Result<T, JobError>;
