mod arg_parser;
mod commands;

use arg_parser::{ArgParser, SubCommand};
use commands::JobsCli;

use anyhow::Context;
use clap::Parser;
use jobcore::{config::ConfigFile, Jobs, RunnerConfig, SupervisorCommand};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = ArgParser::parse();

    // the supervisor's stderr is the job's supervisor log, so it is allowed to be chatty
    if let SubCommand::Supervise { job_dir } = &args.sub_command {
        jobcore::logging::init("info");
        jobcore::watcher::supervise(job_dir).await?;
        return Ok(ExitCode::SUCCESS);
    }
    jobcore::logging::init("warn");

    let config = load_config(&args)?;
    debug!(root = %config.root().display(), strategy = %config.strategy(), "configured");
    let cli = JobsCli::new(Jobs::new(Arc::new(config)));

    match args.sub_command {
        SubCommand::Start { command } => {
            let job_id = cli.start_job(&command).await?;
            println!("{}", job_id);
        }
        SubCommand::Run {
            command,
            interval_ms,
        } => {
            let job_id = cli.start_job(&command).await?;
            eprintln!("Started job id: {}", job_id);
            return cli.watch(job_id, Duration::from_millis(interval_ms)).await;
        }
        SubCommand::Poll { job_id, offset } => {
            cli.poll(&job_id, offset).await?;
        }
        SubCommand::Log { job_id } => {
            cli.write_log(&job_id).await?;
        }
        SubCommand::Status { job_id } => {
            cli.query_status(&job_id).await?;
        }
        SubCommand::Cancel { job_id } => {
            cli.cancel_job(&job_id).await?;
        }
        SubCommand::Watch {
            job_id,
            interval_ms,
        } => {
            return cli.watch(job_id, Duration::from_millis(interval_ms)).await;
        }
        SubCommand::Prune { older_than_hours } => {
            cli.prune(prune_age(older_than_hours)?).await?;
        }
        SubCommand::Supervise { .. } => unreachable!("handled before configuration"),
    }

    Ok(ExitCode::SUCCESS)
}

/// Defaults, then the config file, then flags and their environment variables.
fn load_config(args: &ArgParser) -> anyhow::Result<RunnerConfig> {
    let mut builder = RunnerConfig::builder(std::env::temp_dir().join("jobctl"));
    if let Some(path) = &args.config {
        builder = builder.merge_file(ConfigFile::load(path)?);
    }
    if let Some(root) = &args.root {
        builder = builder.root(absolute(root)?);
    }
    if let Some(strategy) = args.strategy {
        builder = builder.strategy(strategy.into());
    }
    let supervisor = match &args.supervisor {
        Some(program) => SupervisorCommand::new(absolute(program)?),
        None => {
            let exe = std::env::current_exe().context("cannot locate the jobctl executable")?;
            SupervisorCommand::new(exe).arg("supervise")
        }
    };
    Ok(builder.supervisor(supervisor).build()?)
}

fn prune_age(hours: u64) -> anyhow::Result<Duration> {
    let secs = hours
        .checked_mul(3600)
        .with_context(|| format!("--older-than-hours {} is too large", hours))?;
    Ok(Duration::from_secs(secs))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot resolve the current directory")?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_age_rejects_overflow() {
        assert_eq!(prune_age(168).unwrap(), Duration::from_secs(168 * 3600));
        assert!(prune_age(u64::MAX).is_err());
        assert!(prune_age(u64::MAX / 3600 + 1).is_err());
    }
}
