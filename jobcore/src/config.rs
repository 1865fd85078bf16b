//! Runner configuration.
//!
//! A [`RunnerConfig`] is built once at process start, validated by [`RunnerConfigBuilder::build`]
//! and shared read-only afterwards. Every [`crate::Jobs`] operation reads it; none mutates it.

use crate::errors::ConfigError;
use crate::request;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_MAX_POLL_BYTES: usize = 1 << 20;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_REDACT_MARKERS: [&str; 4] = ["password", "passwd", "secret", "token"];

/// How a job's exit code gets recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStrategy {
    /// A supervisor process owns the child, waits on it and writes the real exit code.
    #[default]
    Detached,
    /// Degraded mode: the child is spawned directly and pollers infer completion from
    /// process liveness. The exit code is never known.
    LivenessProbe,
}

impl FromStr for WatchStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detached" => Ok(WatchStrategy::Detached),
            "probe" | "liveness_probe" | "liveness-probe" => Ok(WatchStrategy::LivenessProbe),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for WatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchStrategy::Detached => f.write_str("detached"),
            WatchStrategy::LivenessProbe => f.write_str("liveness_probe"),
        }
    }
}

/// Program plus leading arguments used to start the detached supervisor.
/// The job directory is appended as the final argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SupervisorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    root: PathBuf,
    strategy: WatchStrategy,
    supervisor: Option<SupervisorCommand>,
    allowed_programs: Option<BTreeSet<String>>,
    base_env: BTreeMap<String, String>,
    inherit_env: bool,
    redact_markers: Vec<String>,
    max_poll_bytes: usize,
    handshake_timeout: Duration,
    run_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl RunnerConfig {
    pub fn builder(root: impl Into<PathBuf>) -> RunnerConfigBuilder {
        RunnerConfigBuilder {
            root: root.into(),
            strategy: WatchStrategy::default(),
            supervisor: None,
            allowed_programs: None,
            base_env: BTreeMap::new(),
            inherit_env: true,
            redact_markers: DEFAULT_REDACT_MARKERS.iter().map(|m| m.to_string()).collect(),
            max_poll_bytes: DEFAULT_MAX_POLL_BYTES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            run_timeout: Some(DEFAULT_RUN_TIMEOUT),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn strategy(&self) -> WatchStrategy {
        self.strategy
    }

    pub fn supervisor(&self) -> Option<&SupervisorCommand> {
        self.supervisor.as_ref()
    }

    /// `true` if `program` may be launched. With no allow-list everything is allowed.
    /// Entries match either the program as given or its file name.
    pub fn is_allowed(&self, program: &str) -> bool {
        match &self.allowed_programs {
            None => true,
            Some(allowed) => {
                let file_name = Path::new(program)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(program);
                allowed.contains(program) || allowed.contains(file_name)
            }
        }
    }

    pub fn base_env(&self) -> &BTreeMap<String, String> {
        &self.base_env
    }

    pub fn inherit_env(&self) -> bool {
        self.inherit_env
    }

    pub fn redact_markers(&self) -> &[String] {
        &self.redact_markers
    }

    pub fn max_poll_bytes(&self) -> usize {
        self.max_poll_bytes
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Wall-clock limit for a job; `None` lets jobs run forever. Enforced by the detached
    /// supervisor only.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    /// How long cancellation waits after SIGTERM before escalating to SIGKILL.
    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfigBuilder {
    root: PathBuf,
    strategy: WatchStrategy,
    supervisor: Option<SupervisorCommand>,
    allowed_programs: Option<BTreeSet<String>>,
    base_env: BTreeMap<String, String>,
    inherit_env: bool,
    redact_markers: Vec<String>,
    max_poll_bytes: usize,
    handshake_timeout: Duration,
    run_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl RunnerConfigBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn strategy(mut self, strategy: WatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn supervisor(mut self, supervisor: SupervisorCommand) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn allow_program(mut self, program: impl Into<String>) -> Self {
        self.allowed_programs
            .get_or_insert_with(BTreeSet::new)
            .insert(program.into());
        self
    }

    pub fn base_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.insert(name.into(), value.into());
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn redact_marker(mut self, marker: impl Into<String>) -> Self {
        self.redact_markers.push(marker.into().to_ascii_lowercase());
        self
    }

    pub fn max_poll_bytes(mut self, max: usize) -> Self {
        self.max_poll_bytes = max;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Apply the settings of a parsed config file on top of this builder.
    pub fn merge_file(mut self, file: ConfigFile) -> Self {
        if let Some(root) = file.root {
            self.root = root;
        }
        if let Some(strategy) = file.strategy {
            self.strategy = strategy;
        }
        for program in file.allowed_programs {
            self = self.allow_program(program);
        }
        self.base_env.extend(file.env);
        if let Some(inherit) = file.inherit_env {
            self.inherit_env = inherit;
        }
        for marker in file.redact_markers {
            self = self.redact_marker(marker);
        }
        if let Some(max) = file.max_poll_bytes {
            self.max_poll_bytes = max;
        }
        if let Some(secs) = file.handshake_timeout_secs {
            self.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.run_timeout_secs {
            self.run_timeout = (secs > 0).then_some(Duration::from_secs(secs));
        }
        if let Some(secs) = file.cancel_grace_secs {
            self.cancel_grace = Duration::from_secs(secs);
        }
        self
    }

    pub fn build(self) -> Result<RunnerConfig, ConfigError> {
        if !self.root.is_absolute() {
            return Err(ConfigError::RelativeRoot(self.root));
        }
        if self.strategy == WatchStrategy::Detached {
            let supervisor = self
                .supervisor
                .as_ref()
                .ok_or(ConfigError::MissingSupervisor)?;
            if !supervisor.program.is_file() {
                return Err(ConfigError::SupervisorNotFound(supervisor.program.clone()));
            }
        }
        if let Some(allowed) = &self.allowed_programs {
            if allowed.iter().any(|p| p.trim().is_empty()) {
                return Err(ConfigError::EmptyAllowedProgram);
            }
        }
        for name in self.base_env.keys() {
            request::validate_env_name(name).map_err(ConfigError::BaseEnv)?;
        }
        if self.max_poll_bytes == 0 {
            return Err(ConfigError::ZeroPollBytes);
        }
        Ok(RunnerConfig {
            root: self.root,
            strategy: self.strategy,
            supervisor: self.supervisor,
            allowed_programs: self.allowed_programs,
            base_env: self.base_env,
            inherit_env: self.inherit_env,
            redact_markers: self.redact_markers,
            max_poll_bytes: self.max_poll_bytes,
            handshake_timeout: self.handshake_timeout,
            run_timeout: self.run_timeout,
            cancel_grace: self.cancel_grace,
        })
    }
}

/// On-disk TOML form of the configuration.
///
/// ```toml
/// root = "/var/lib/jobctl"
/// strategy = "detached"
/// allowed_programs = ["ansible-playbook"]
///
/// [env]
/// LANG = "C.UTF-8"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub root: Option<PathBuf>,
    pub strategy: Option<WatchStrategy>,
    #[serde(default)]
    pub allowed_programs: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub inherit_env: Option<bool>,
    #[serde(default)]
    pub redact_markers: Vec<String>,
    pub max_poll_bytes: Option<usize>,
    pub handshake_timeout_secs: Option<u64>,
    /// `0` disables the run timeout.
    pub run_timeout_secs: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}
