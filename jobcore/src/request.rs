//! Validated start requests and their redacted, persisted form.

use crate::errors::Invalid;
use crate::types::{Args, Program};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const REDACTED: &str = "***";

pub fn validate_program(program: &str) -> Result<(), Invalid> {
    if program.trim().is_empty() {
        return Err(Invalid::new("program", "must not be empty"));
    }
    if program.contains('\0') {
        return Err(Invalid::new("program", "must not contain NUL"));
    }
    Ok(())
}

pub fn validate_arg(arg: &str) -> Result<(), Invalid> {
    if arg.contains('\0') {
        return Err(Invalid::new("argument", "must not contain NUL"));
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<(), Invalid> {
    if name.is_empty() {
        return Err(Invalid::new("environment", "variable name must not be empty"));
    }
    if name.contains('=') || name.contains('\0') {
        return Err(Invalid::new(
            "environment",
            format!("variable name {name:?} must not contain '=' or NUL"),
        ));
    }
    Ok(())
}

pub fn validate_env_value(value: &str) -> Result<(), Invalid> {
    if value.contains('\0') {
        return Err(Invalid::new("environment", "value must not contain NUL"));
    }
    Ok(())
}

pub fn validate_working_dir(dir: &Path) -> Result<(), Invalid> {
    if !dir.is_absolute() {
        return Err(Invalid::new(
            "working_dir",
            format!("{} is not an absolute path", dir.display()),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct CommandArg {
    value: String,
    secret: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct EnvVar {
    name: String,
    value: String,
}

/// A start request that has passed every field validator.
///
/// Secret arguments and all environment values stay in memory only; see
/// [`StartJobRequest::descriptor`] for what gets persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct StartJobRequest {
    program: Program,
    args: Vec<CommandArg>,
    working_dir: PathBuf,
    env: Vec<EnvVar>,
}

impl StartJobRequest {
    pub fn builder(program: impl Into<Program>) -> StartJobRequestBuilder {
        StartJobRequestBuilder {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Convenience for a plain argument vector: `argv[0]` is the program.
    pub fn from_argv<I, S>(argv: I, working_dir: impl Into<PathBuf>) -> Result<Self, Invalid>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .ok_or_else(|| Invalid::new("program", "argument vector is empty"))?;
        argv.fold(Self::builder(program), |b, arg| b.arg(arg))
            .working_dir(working_dir)
            .build()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> Args {
        self.args.iter().map(|a| a.value.clone()).collect()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// The persisted form: secret args masked, `key=value` args whose key contains one of
    /// `markers` masked, environment reduced to variable names.
    pub fn descriptor(&self, markers: &[String]) -> CommandDescriptor {
        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg.secret {
                    REDACTED.to_string()
                } else {
                    redact_assignment(&arg.value, markers)
                }
            })
            .collect();
        let mut env_keys: Vec<String> = self.env.iter().map(|e| e.name.clone()).collect();
        env_keys.sort();
        env_keys.dedup();
        CommandDescriptor {
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
            env_keys,
        }
    }
}

// Hand-written so secrets never reach logs through `{:?}`.
impl std::fmt::Debug for StartJobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let markers: Vec<String> = crate::config::DEFAULT_REDACT_MARKERS
            .iter()
            .map(|m| m.to_string())
            .collect();
        f.debug_struct("StartJobRequest")
            .field("command", &self.descriptor(&markers))
            .finish()
    }
}

pub struct StartJobRequestBuilder {
    program: Program,
    args: Vec<CommandArg>,
    working_dir: Option<PathBuf>,
    env: Vec<EnvVar>,
}

impl StartJobRequestBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg {
            value: arg.into(),
            secret: false,
        });
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |b, arg| b.arg(arg))
    }

    /// An argument that is passed to the program but never persisted or echoed.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(CommandArg {
            value: arg.into(),
            secret: true,
        });
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn build(self) -> Result<StartJobRequest, Invalid> {
        validate_program(&self.program)?;
        for arg in &self.args {
            validate_arg(&arg.value)?;
        }
        for var in &self.env {
            validate_env_name(&var.name)?;
            validate_env_value(&var.value)?;
        }
        let working_dir = self
            .working_dir
            .ok_or_else(|| Invalid::new("working_dir", "is required"))?;
        validate_working_dir(&working_dir)?;
        Ok(StartJobRequest {
            program: self.program,
            args: self.args,
            working_dir,
            env: self.env,
        })
    }
}

/// Redacted command as stored in job metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub program: Program,
    pub args: Args,
    pub working_dir: PathBuf,
    pub env_keys: Vec<String>,
}

impl CommandDescriptor {
    /// Shell-like one-line rendering for logs and status output.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn redact_assignment(arg: &str, markers: &[String]) -> String {
    // `-e ansible_password=x` arrives as a separate `key=value` argument
    let Some((key, _)) = arg.split_once('=') else {
        return arg.to_string();
    };
    let lowered = key.to_ascii_lowercase();
    if markers.iter().any(|m| !m.is_empty() && lowered.contains(m.as_str())) {
        format!("{key}={REDACTED}")
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["password".into(), "token".into()]
    }

    #[test]
    fn from_argv_splits_program() {
        let req = StartJobRequest::from_argv(["echo", "hello"], "/tmp").unwrap();
        assert_eq!(req.program(), "echo");
        assert_eq!(req.args(), vec!["hello".to_string()]);
        assert!(StartJobRequest::from_argv(Vec::<String>::new(), "/tmp").is_err());
    }

    #[test]
    fn validators_report_the_field() {
        let err = StartJobRequest::builder("").working_dir("/tmp").build().unwrap_err();
        assert_eq!(err.field, "program");

        let err = StartJobRequest::builder("ls").working_dir("tmp").build().unwrap_err();
        assert_eq!(err.field, "working_dir");

        let err = StartJobRequest::builder("ls").build().unwrap_err();
        assert_eq!(err.field, "working_dir");

        let err = StartJobRequest::builder("ls")
            .working_dir("/tmp")
            .env("BAD=NAME", "x")
            .build()
            .unwrap_err();
        assert_eq!(err.field, "environment");

        let err = StartJobRequest::builder("ls")
            .working_dir("/tmp")
            .arg("a\0b")
            .build()
            .unwrap_err();
        assert_eq!(err.field, "argument");
    }

    #[test]
    fn descriptor_masks_secrets() {
        let req = StartJobRequest::builder("ansible-playbook")
            .args(["-i", "inv.ini", "site.yml", "-e"])
            .arg("ansible_password=hunter2")
            .secret_arg("--vault=opaque")
            .arg("API_TOKEN=abc")
            .arg("user=admin")
            .env("ANSIBLE_BECOME_PASS", "hunter2")
            .working_dir("/srv")
            .build()
            .unwrap();
        let descriptor = req.descriptor(&markers());
        assert_eq!(
            descriptor.args,
            vec![
                "-i",
                "inv.ini",
                "site.yml",
                "-e",
                "ansible_password=***",
                "***",
                "API_TOKEN=***",
                "user=admin",
            ]
        );
        assert_eq!(descriptor.env_keys, vec!["ANSIBLE_BECOME_PASS".to_string()]);
        let persisted = serde_json::to_string(&descriptor).unwrap();
        assert!(!persisted.contains("hunter2"));
        assert!(!persisted.contains("opaque"));
        assert!(!format!("{req:?}").contains("hunter2"));
    }
}
