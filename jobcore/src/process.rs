//! Process-id bookkeeping: liveness checks and group signalling.

use serde::{Deserialize, Serialize};
use std::io;

/// A process as recorded in job metadata.
///
/// `start_ticks` is the kernel start time of the process (Linux only). A live pid whose start
/// time differs is a different process that happens to reuse the number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub start_ticks: Option<u64>,
}

impl ProcessRecord {
    pub fn capture(pid: u32) -> Self {
        Self {
            pid,
            start_ticks: start_ticks(pid),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ProcStat {
    state: char,
    start_ticks: u64,
}

fn parse_stat(stat: &str) -> Option<ProcStat> {
    // the command name may contain spaces and parens, so split after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); starttime is field 22
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_ticks })
}

#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<ProcStat> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_stat(_pid: u32) -> Option<ProcStat> {
    None
}

pub fn start_ticks(pid: u32) -> Option<u64> {
    read_stat(pid).map(|stat| stat.start_ticks)
}

fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the pid exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Best-effort liveness check for a recorded process.
///
/// Zombies count as dead. On Linux a start-time mismatch counts as dead (pid reuse); elsewhere
/// a reused pid is reported alive.
pub fn is_alive(record: &ProcessRecord) -> bool {
    if !pid_exists(record.pid) {
        return false;
    }
    match read_stat(record.pid) {
        Some(stat) if stat.state == 'Z' || stat.state == 'X' => false,
        Some(stat) => record
            .start_ticks
            .map_or(true, |recorded| recorded == stat.start_ticks),
        None => true,
    }
}

/// Send `signal` to the process group led by `pid`.
pub fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn terminate_group(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}
