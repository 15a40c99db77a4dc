// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Rendered command line, used for logging and for pattern matching
    /// against a live process table.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub rss_kb: u64,
    /// Cumulative CPU time in clock ticks (utime + stime).
    pub cpu_ticks: u64,
}

/// OS process lifecycle boundary.
///
/// Spawned children are detached: they keep running if this daemon exits
/// and their PIDs stay valid for later health checks. `find_pid` is the
/// process-table locator used only to rediscover processes that outlived
/// a daemon restart; everything spawned in-process keeps its direct handle
/// PID instead.
#[async_trait]
pub trait ProcessControlPort: Send + Sync {
    async fn spawn_detached(&self, spec: &SpawnSpec) -> AppResult<u32>;
    /// First PID whose command line contains every pattern, excluding the
    /// calling process.
    async fn find_pid(&self, patterns: &[String]) -> AppResult<Option<u32>>;
    /// `Ok(None)` for vanished, zombie, or permission-denied processes;
    /// never an error for "not found".
    async fn process_info(&self, pid: u32) -> AppResult<Option<ProcessInfo>>;
    /// Delivers SIGTERM. `Ok(false)` when the signal could not be delivered
    /// (usually: already gone).
    async fn signal_terminate(&self, pid: u32) -> AppResult<bool>;
    /// Delivers SIGKILL.
    async fn signal_kill(&self, pid: u32) -> AppResult<bool>;
}
