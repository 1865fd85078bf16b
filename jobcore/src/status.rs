use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit status of 128 + SIGTERM, the shell convention for a terminated command.
pub const CANCELLED_RETURN_CODE: i32 = 128 + libc::SIGTERM;

/// Exit status reported for a job killed by the run timeout, as `timeout(1)` does.
pub const TIMED_OUT_RETURN_CODE: i32 = 124;

/// How a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Exited { code: i32 },
    Signaled { signal: i32 },
    Cancelled,
    /// Killed after running longer than the configured run timeout.
    TimedOut,
    /// The process is gone but its exit status could not be captured.
    Unknown,
}

impl Outcome {
    pub fn return_code(&self) -> Option<i32> {
        match *self {
            Outcome::Exited { code } => Some(code),
            Outcome::Signaled { signal } => Some(128 + signal),
            Outcome::Cancelled => Some(CANCELLED_RETURN_CODE),
            Outcome::TimedOut => Some(TIMED_OUT_RETURN_CODE),
            Outcome::Unknown => None,
        }
    }

    pub fn success(&self) -> bool {
        self.return_code() == Some(0)
    }
}

/// Contents of the completion marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(flatten)]
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    pub fn now(outcome: Outcome) -> Self {
        Self {
            outcome,
            finished_at: Utc::now(),
        }
    }
}

/// `Created -> Running -> Completed`. A nonzero exit is still `Completed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running { pid: u32 },
    Completed(Completion),
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Completed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes() {
        assert_eq!(Outcome::Exited { code: 3 }.return_code(), Some(3));
        assert_eq!(Outcome::Signaled { signal: 9 }.return_code(), Some(137));
        assert_eq!(Outcome::Cancelled.return_code(), Some(143));
        assert_eq!(Outcome::TimedOut.return_code(), Some(124));
        assert_eq!(Outcome::Unknown.return_code(), None);
        assert!(!Outcome::Exited { code: 1 }.success());
    }

    #[test]
    fn marker_format_is_flat() {
        let completion = Completion::now(Outcome::Exited { code: 0 });
        let value = serde_json::to_value(completion).unwrap();
        assert_eq!(value["outcome"], "exited");
        assert_eq!(value["code"], 0);
        let back: Completion = serde_json::from_value(value).unwrap();
        assert_eq!(back, completion);
    }
}
