// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use thiserror::Error as ThisError;
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ProcessControlPort, ProcessInfo, SpawnSpec};

#[derive(Debug, ThisError)]
pub enum ProcError {
    #[error("spawn of '{program}' failed: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("pid table query failed: {0}")]
    Query(io::Error),
}

fn map_proc_error(err: ProcError) -> AppError {
    match err {
        ProcError::Spawn { .. } => AppError::with_message(
            AppErrorKind::Internal,
            codes::PROCESS_SPAWN_FAILURE,
            err.to_string(),
        ),
        ProcError::Query(_) => AppError::with_message(
            AppErrorKind::Internal,
            codes::LOCAL_ERROR,
            err.to_string(),
        ),
    }
}

/// Process control over the local OS: direct child handles for spawning,
/// /proc for inspection, pgrep(1)/kill(1) for the shell-dependent rest.
/// Everything shell-shaped lives here so it can be swapped per platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

impl OsProcessControl {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessControlPort for OsProcessControl {
    async fn spawn_detached(&self, spec: &SpawnSpec) -> AppResult<u32> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // The child must outlive this daemon; health checks and
            // restart recovery pick it up again by PID.
            .kill_on_drop(false);
        let child = command.spawn().map_err(|source| {
            map_proc_error(ProcError::Spawn {
                program: spec.program.clone(),
                source,
            })
        })?;
        match child.id() {
            Some(pid) => Ok(pid),
            None => Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::PROCESS_SPAWN_FAILURE,
                format!("'{}' exited before its pid could be read", spec.program),
            )),
        }
    }

    async fn find_pid(&self, patterns: &[String]) -> AppResult<Option<u32>> {
        let Some(first) = patterns.first() else {
            return Ok(None);
        };
        // pgrep narrows the candidates; the full pattern match runs against
        // /proc cmdlines because pgrep -f takes a single regex.
        let output = Command::new("pgrep")
            .arg("-f")
            .arg(first)
            .output()
            .await
            .map_err(|err| map_proc_error(ProcError::Query(err)))?;
        let own_pid = std::process::id();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(pid) = line.trim().parse::<u32>() else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let Some(command_line) = read_cmdline(pid).await else {
                continue;
            };
            if patterns.iter().all(|p| command_line.contains(p.as_str())) {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }

    async fn process_info(&self, pid: u32) -> AppResult<Option<ProcessInfo>> {
        let stat = match tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
            Ok(stat) => stat,
            // Vanished or inaccessible both mean "not ours to track".
            Err(err)
                if err.kind() == io::ErrorKind::NotFound
                    || err.kind() == io::ErrorKind::PermissionDenied =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::LOCAL_ERROR,
                    format!("reading /proc/{pid}/stat failed: {err}"),
                ));
            }
        };
        let Some(parsed) = parse_proc_stat(&stat) else {
            return Ok(None);
        };
        if parsed.state == 'Z' {
            // A zombie is as dead as a missing pid for our purposes.
            return Ok(None);
        }
        let command = read_cmdline(pid).await.unwrap_or_default();
        Ok(Some(ProcessInfo {
            pid,
            command,
            rss_kb: parsed.rss_pages.saturating_mul(4),
            cpu_ticks: parsed.utime.saturating_add(parsed.stime),
        }))
    }

    async fn signal_terminate(&self, pid: u32) -> AppResult<bool> {
        deliver_signal("-TERM", pid).await
    }

    async fn signal_kill(&self, pid: u32) -> AppResult<bool> {
        deliver_signal("-KILL", pid).await
    }
}

async fn deliver_signal(signal: &str, pid: u32) -> AppResult<bool> {
    let status = Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|err| map_proc_error(ProcError::Query(err)))?;
    Ok(status.success())
}

async fn read_cmdline(pid: u32) -> Option<String> {
    let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let command = raw
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    if command.is_empty() { None } else { Some(command) }
}

struct ProcStat {
    state: char,
    utime: u64,
    stime: u64,
    rss_pages: u64,
}

/// Parse /proc/<pid>/stat. The comm field is parenthesized and may itself
/// contain spaces or parentheses, so fields are counted from the last ')'.
fn parse_proc_stat(stat: &str) -> Option<ProcStat> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Field numbering per proc(5): state is field 3, utime 14, stime 15,
    // rss 24; after stripping pid and comm they sit at 0, 11, 12 and 21.
    let state = fields.first()?.chars().next()?;
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    let rss_pages = fields.get(21)?.parse().ok()?;
    Some(ProcStat {
        state,
        utime,
        stime,
        rss_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleep_spec(seconds: &str) -> SpawnSpec {
        SpawnSpec::new("sleep", vec![seconds.to_string()])
    }

    #[tokio::test]
    async fn spawns_and_inspects_a_real_process() {
        let control = OsProcessControl::new();
        let pid = control
            .spawn_detached(&sleep_spec("30"))
            .await
            .expect("spawn sleep");

        let info = control
            .process_info(pid)
            .await
            .expect("process info")
            .expect("process is alive");
        assert_eq!(info.pid, pid);
        assert!(info.command.contains("sleep"));

        assert!(control.signal_kill(pid).await.expect("kill"));
    }

    #[tokio::test]
    async fn terminate_then_info_reports_gone() {
        let control = OsProcessControl::new();
        let pid = control
            .spawn_detached(&sleep_spec("30"))
            .await
            .expect("spawn sleep");

        assert!(control.signal_terminate(pid).await.expect("terminate"));
        // Give the kernel a moment to reap; tokio reaps detached children.
        for _ in 0..20 {
            if control
                .process_info(pid)
                .await
                .expect("process info")
                .is_none()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {pid} still visible after SIGTERM");
    }

    #[tokio::test]
    async fn vanished_pid_is_none_not_error() {
        let control = OsProcessControl::new();
        // PIDs near the default pid_max are unlikely to exist.
        let info = control.process_info(4_000_000).await.expect("process info");
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn locator_matches_full_pattern() {
        let control = OsProcessControl::new();
        let pid = control
            .spawn_detached(&sleep_spec("31.618"))
            .await
            .expect("spawn sleep");

        let found = control
            .find_pid(&["sleep".to_string(), "31.618".to_string()])
            .await
            .expect("find_pid");
        assert_eq!(found, Some(pid));

        let missing = control
            .find_pid(&["sleep".to_string(), "27.182".to_string()])
            .await
            .expect("find_pid");
        assert_eq!(missing, None);

        control.signal_kill(pid).await.expect("kill");
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_errors() {
        let control = OsProcessControl::new();
        let err = control
            .spawn_detached(&SpawnSpec::new("causewayd-no-such-binary", Vec::new()))
            .await
            .expect_err("missing binary must fail");
        assert_eq!(err.code(), codes::PROCESS_SPAWN_FAILURE);
    }

    #[test]
    fn parses_proc_stat_with_hostile_comm() {
        let stat = "1234 (a) b) c) R 1 1234 1234 0 -1 4194304 100 0 0 0 7 3 0 0 20 0 1 0 100 1000000 256 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let parsed = parse_proc_stat(stat).expect("parse");
        assert_eq!(parsed.state, 'R');
        assert_eq!(parsed.utime, 7);
        assert_eq!(parsed.stime, 3);
        assert_eq!(parsed.rss_pages, 256);
    }

    #[test]
    fn zombie_state_is_parsed() {
        let stat = "99 (sleep) Z 1 99 99 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 0 0 0 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let parsed = parse_proc_stat(stat).expect("parse");
        assert_eq!(parsed.state, 'Z');
    }
}
