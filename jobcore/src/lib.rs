pub mod config;
pub mod errors;
pub mod identity;
mod jobs;
pub mod launcher;
pub mod logging;
pub mod poller;
pub mod process;
pub mod request;
pub mod status;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::{RunnerConfig, SupervisorCommand, WatchStrategy};
pub use errors::{JobError, LaunchError};
pub use jobs::{Jobs, PruneReport};
pub use poller::PollResult;
pub use request::StartJobRequest;
pub use status::{Completion, JobStatus, Outcome};
pub use types::JobId;

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn basic() {
        let root = tempfile::tempdir().unwrap();
        let config = RunnerConfig::builder(root.path())
            .strategy(WatchStrategy::LivenessProbe)
            .build()
            .unwrap();
        let jobs = Jobs::new(Arc::new(config));

        let echo_str = "hello world!";
        let no_trailing_newline = "-n";
        let request = StartJobRequest::from_argv(["echo", no_trailing_newline, echo_str], "/tmp")
            .expect("valid request");
        let job_id = jobs.start_job(request).await.expect("job start err");

        let mut updates = Box::pin(jobs.follow(job_id, Duration::from_millis(20)));
        let mut output_bytes = vec![];
        let mut last = None;
        while let Some(update) = updates.next().await {
            let update = update.expect("poll failed");
            output_bytes.extend_from_slice(&update.appended);
            last = Some(update);
        }
        assert_eq!(String::from_utf8_lossy(&output_bytes), echo_str);
        let last = last.expect("at least one poll");
        // the probe strategy cannot see exit codes
        assert_eq!(last.outcome, Some(Outcome::Unknown));
    }
}
