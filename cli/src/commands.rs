use crate::arg_parser::CommandArgs;

use anyhow::{Context, Result};
use futures::StreamExt;
use jobcore::{JobId, JobStatus, Jobs, Outcome, PollResult, StartJobRequest};
use serde_json::json;
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

pub struct JobsCli {
    jobs: Jobs,
}

impl JobsCli {
    pub fn new(jobs: Jobs) -> Self {
        Self { jobs }
    }

    pub async fn start_job(&self, command: &CommandArgs) -> Result<JobId> {
        let request = request(command)?;
        let job_id = self.jobs.start_job(request).await?;
        Ok(job_id)
    }

    pub async fn poll(&self, job_id: &JobId, offset: u64) -> Result<()> {
        let result = self.jobs.poll(job_id, offset).await?;
        let (appended, offset, drained) = printable(&result);
        let line = json!({
            "offset": offset,
            "appended": appended,
            "elapsed_seconds": result.elapsed_seconds,
            "done": result.done,
            "return_code": result.return_code,
            "drained": drained,
        });
        println!("{}", line);
        Ok(())
    }

    pub async fn write_log(&self, job_id: &JobId) -> Result<()> {
        let log = self.jobs.full_log(job_id).await?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&log)?;
        stdout.flush()?;
        Ok(())
    }

    pub async fn query_status(&self, job_id: &JobId) -> Result<()> {
        match self.jobs.status(job_id).await? {
            JobStatus::Created => println!("Starting"),
            JobStatus::Running { pid } => println!("Running (pid {})", pid),
            JobStatus::Completed(completion) => println!("{}", describe(completion.outcome)),
        }
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let completion = self.jobs.cancel(job_id).await?;
        println!("Cancelled job id: {}", job_id);
        println!("{}", describe(completion.outcome));
        Ok(())
    }

    /// Copy the job's output to stdout as it arrives, then exit the way the job did.
    pub async fn watch(&self, job_id: JobId, interval: Duration) -> Result<ExitCode> {
        let mut updates = Box::pin(self.jobs.follow(job_id, interval));
        let mut outcome = None;
        while let Some(update) = updates.next().await {
            let update = update?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&update.appended)?;
            stdout.flush()?;
            outcome = update.outcome;
        }
        let outcome = outcome.unwrap_or(Outcome::Unknown);
        eprintln!("{}", describe(outcome));
        Ok(exit_code(outcome))
    }

    pub async fn prune(&self, older_than: Duration) -> Result<()> {
        let report = self.jobs.prune(older_than).await?;
        for job_id in &report.removed {
            println!("Removed job id: {}", job_id);
        }
        if report.still_running > 0 {
            println!("{} job(s) still running", report.still_running);
        }
        Ok(())
    }
}

fn request(command: &CommandArgs) -> Result<StartJobRequest> {
    let (program, args) = command
        .command
        .split_first()
        .context("no command given")?;
    let working_dir = if command.dir.is_absolute() {
        command.dir.clone()
    } else {
        let cwd = std::env::current_dir().context("cannot resolve the working directory")?;
        if command.dir == PathBuf::from(".") {
            cwd
        } else {
            cwd.join(&command.dir)
        }
    };
    let mut builder = StartJobRequest::builder(program.clone())
        .args(args.iter().cloned())
        .working_dir(working_dir);
    for arg in &command.secret_args {
        builder = builder.secret_arg(arg.clone());
    }
    for (name, value) in &command.envs {
        builder = builder.env(name.clone(), value.clone());
    }
    Ok(builder.build()?)
}

/// Text for one poll and the offset to resume from.
///
/// A multi-byte character cut off at the end of the chunk is held back for the next poll, unless
/// nothing more will ever be appended; then it is shown lossily. Invalid bytes elsewhere in the
/// chunk are always replaced.
fn printable(result: &PollResult) -> (String, u64, bool) {
    let bytes = &result.appended[..];
    if !result.finished() {
        let held = incomplete_tail(bytes);
        if held > 0 {
            let keep = bytes.len() - held;
            let text = String::from_utf8_lossy(&bytes[..keep]).into_owned();
            return (text, result.offset - held as u64, false);
        }
    }
    (
        String::from_utf8_lossy(bytes).into_owned(),
        result.offset,
        result.drained,
    )
}

/// Length of a truncated UTF-8 sequence at the very end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            Err(err) => match err.error_len() {
                None => return rest.len() - err.valid_up_to(),
                Some(invalid) => rest = &rest[err.valid_up_to() + invalid..],
            },
        }
    }
}

fn describe(outcome: Outcome) -> String {
    match outcome {
        Outcome::Exited { code } => format!("Exited with code: {}", code),
        Outcome::Signaled { signal } => format!("Killed by signal: {}", signal),
        Outcome::Cancelled => "Cancelled".to_string(),
        Outcome::TimedOut => "Timed out".to_string(),
        Outcome::Unknown => "Finished, exit code unknown".to_string(),
    }
}

fn exit_code(outcome: Outcome) -> ExitCode {
    outcome
        .return_code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn result(appended: &'static [u8], offset: u64, done: bool) -> PollResult {
        PollResult {
            offset,
            appended: Bytes::from_static(appended),
            elapsed_seconds: 0,
            done,
            return_code: done.then_some(0),
            outcome: done.then_some(Outcome::Exited { code: 0 }),
            drained: true,
        }
    }

    #[test]
    fn split_character_is_held_back() {
        // "hé" with the second byte of 'é' not yet written
        let (text, offset, drained) = printable(&result(b"h\xc3", 12, false));
        assert_eq!(text, "h");
        assert_eq!(offset, 11);
        assert!(!drained);
    }

    #[test]
    fn split_character_is_flushed_once_finished() {
        let (text, offset, drained) = printable(&result(b"h\xc3", 12, true));
        assert_eq!(text, "h\u{fffd}");
        assert_eq!(offset, 12);
        assert!(drained);
    }

    #[test]
    fn split_character_after_invalid_byte_is_held_back() {
        let (text, offset, drained) = printable(&result(b"a\xffb\xc3", 20, false));
        assert_eq!(text, "a\u{fffd}b");
        assert_eq!(offset, 19);
        assert!(!drained);
    }

    #[test]
    fn invalid_bytes_alone_are_not_held_back() {
        let (text, offset, _) = printable(&result(b"a\xff", 7, false));
        assert_eq!(text, "a\u{fffd}");
        assert_eq!(offset, 7);
    }

    #[test]
    fn complete_text_passes_through() {
        let (text, offset, _) = printable(&result("hé\n".as_bytes(), 4, false));
        assert_eq!(text, "hé\n");
        assert_eq!(offset, 4);
    }

    #[test]
    fn relative_dir_is_resolved() {
        let command = CommandArgs {
            dir: PathBuf::from("."),
            envs: vec![("A".into(), "1".into())],
            secret_args: vec!["token=abc".into()],
            command: vec!["echo".into(), "hi".into()],
        };
        let request = request(&command).unwrap();
        assert!(request.working_dir().is_absolute());
        assert_eq!(request.program(), "echo");
        assert_eq!(request.args(), vec!["hi".to_string(), "token=abc".to_string()]);
    }

    #[test]
    fn unknown_outcome_exits_with_failure() {
        assert_eq!(exit_code(Outcome::Exited { code: 3 }), ExitCode::from(3));
        assert_eq!(exit_code(Outcome::Unknown), ExitCode::FAILURE);
    }

    #[test]
    fn timed_out_jobs_exit_like_timeout() {
        assert_eq!(describe(Outcome::TimedOut), "Timed out");
        assert_eq!(exit_code(Outcome::TimedOut), ExitCode::from(124));
    }
}
