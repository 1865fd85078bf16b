use clap::{ArgEnum, Args, Parser, Subcommand};
use jobcore::{JobId, WatchStrategy};
use std::path::PathBuf;

/// Start long-running commands and follow their output from later, unrelated invocations
#[derive(Debug, Parser)]
#[clap(name = "jobctl", version)]
pub struct ArgParser {
    /// Directory holding one sub-directory per job
    #[clap(long, env = "JOBCTL_ROOT", parse(from_os_str))]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[clap(long, env = "JOBCTL_CONFIG", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// How job exit codes are captured
    #[clap(long, arg_enum, env = "JOBCTL_STRATEGY")]
    pub strategy: Option<Strategy>,

    /// Supervisor executable; defaults to this binary's hidden `supervise` command
    #[clap(long, env = "JOBCTL_SUPERVISOR", parse(from_os_str))]
    pub supervisor: Option<PathBuf>,

    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct CommandArgs {
    /// working directory for the command
    #[clap(long, default_value = ".", parse(from_os_str))]
    pub dir: PathBuf,

    /// environment variable for the command, VAR=VAL; only the name is recorded
    #[clap(long = "env", short = 'e', parse(try_from_str = var_eq_val))]
    pub envs: Vec<(String, String)>,

    /// argument passed to the command after the positional ones, never persisted
    #[clap(long = "secret-arg")]
    pub secret_args: Vec<String>,

    /// the command and its arguments, after `--`
    #[clap(required = true, last = true, multiple_values = true)]
    pub command: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// start a new job and print its id
    Start {
        #[clap(flatten)]
        command: CommandArgs,
    },
    /// start a new job and follow it to completion
    Run {
        #[clap(flatten)]
        command: CommandArgs,

        /// milliseconds between polls
        #[clap(long, default_value = "2000")]
        interval_ms: u64,
    },
    /// print output appended since an offset, as JSON
    Poll {
        #[clap(parse(try_from_str = self::job_id))]
        job_id: JobId,

        /// byte offset already consumed
        #[clap(long, default_value = "0")]
        offset: u64,
    },
    /// print a job's complete output
    Log {
        #[clap(parse(try_from_str = self::job_id))]
        job_id: JobId,
    },
    /// get a job's status
    Status {
        #[clap(parse(try_from_str = self::job_id))]
        job_id: JobId,
    },
    /// terminate a running job
    Cancel {
        #[clap(parse(try_from_str = self::job_id))]
        job_id: JobId,
    },
    /// stream a job's output until it finishes; exits with the job's code
    Watch {
        #[clap(parse(try_from_str = self::job_id))]
        job_id: JobId,

        /// milliseconds between polls
        #[clap(long, default_value = "2000")]
        interval_ms: u64,
    },
    /// delete finished jobs
    Prune {
        /// only jobs that finished more than this many hours ago
        #[clap(long, default_value = "168")]
        older_than_hours: u64,
    },
    /// run as the detached waiter of one job (started by `start`)
    #[clap(hide = true)]
    Supervise {
        #[clap(parse(from_os_str))]
        job_dir: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ArgEnum)]
pub enum Strategy {
    /// a supervisor process records the real exit code
    Detached,
    /// infer completion from process liveness; exit codes are lost
    Probe,
}

impl From<Strategy> for WatchStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Detached => WatchStrategy::Detached,
            Strategy::Probe => WatchStrategy::LivenessProbe,
        }
    }
}

/// try_from_str parse function for command env variables
fn var_eq_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((var, val)) if !var.is_empty() => Ok((var.to_string(), val.to_string())),
        _ => Err("Required format is VAR=VAL".to_string()),
    }
}

/// try_from_str parse function for job ids
fn job_id(s: &str) -> Result<JobId, String> {
    JobId::parse(s).ok_or_else(|| format!("no such job: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_takes_command_after_double_dash() {
        let args = ArgParser::try_parse_from([
            "jobctl", "--root", "/srv/jobs", "start", "--dir", "/tmp", "-e", "A=1", "--env",
            "B=x=y", "--", "echo", "--not-a-flag", "hello",
        ])
        .unwrap();
        assert_eq!(args.root, Some(PathBuf::from("/srv/jobs")));
        let SubCommand::Start { command } = args.sub_command else {
            panic!("expected start");
        };
        assert_eq!(command.dir, PathBuf::from("/tmp"));
        assert_eq!(
            command.envs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert_eq!(command.command, vec!["echo", "--not-a-flag", "hello"]);
    }

    #[test]
    fn start_requires_a_command() {
        assert!(ArgParser::try_parse_from(["jobctl", "start"]).is_err());
    }

    #[test]
    fn poll_parses_id_and_offset() {
        let args =
            ArgParser::try_parse_from(["jobctl", "poll", "1760000000-00ff", "--offset", "42"])
                .unwrap();
        assert_eq!(
            args.sub_command,
            SubCommand::Poll {
                job_id: JobId::parse("1760000000-00ff").unwrap(),
                offset: 42
            }
        );
        assert!(ArgParser::try_parse_from(["jobctl", "poll", "../etc"]).is_err());
    }

    #[test]
    fn strategy_flag() {
        let args = ArgParser::try_parse_from([
            "jobctl",
            "--strategy",
            "probe",
            "status",
            "1-a",
        ])
        .unwrap();
        assert_eq!(
            args.strategy.map(WatchStrategy::from),
            Some(WatchStrategy::LivenessProbe)
        );
    }

    #[test]
    fn var_eq_val_format() {
        assert_eq!(var_eq_val("K=V"), Ok(("K".into(), "V".into())));
        assert_eq!(var_eq_val("K="), Ok(("K".into(), "".into())));
        assert!(var_eq_val("K").is_err());
        assert!(var_eq_val("=V").is_err());
    }
}
