//! Detached waiter for a single job. Started by the launcher, never by hand:
//! `jobcore-supervisor <job-dir>` with the launch plan on stdin.

use std::{path::PathBuf, process::ExitCode};
use tracing::error;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    jobcore::logging::init("info");

    let Some(job_dir) = std::env::args_os().nth(1).map(PathBuf::from) else {
        error!("usage: jobcore-supervisor <job-dir>");
        return ExitCode::from(2);
    };
    match jobcore::watcher::supervise(&job_dir).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(job_dir = %job_dir.display(), %err, "supervisor failed");
            ExitCode::FAILURE
        }
    }
}
