// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde::{Deserialize, Serialize};

/// Lifecycle state of an interactive container job.
///
/// Stored as the canonical uppercase string; parsed back through
/// [`JobStatus::parse`], which maps anything unrecognized to `Unknown`
/// instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Configuring,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Configuring => "CONFIGURING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => JobStatus::Pending,
            "CONFIGURING" => JobStatus::Configuring,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => JobStatus::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Configuring | JobStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a batch simulation task. Superset of [`JobStatus`]:
/// adds TIMEOUT and the three waiting-for-retry states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Configuring,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    ErrorRetry1,
    ErrorRetry2,
    ErrorRetry3,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Configuring => "CONFIGURING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::ErrorRetry1 => "ERROR_RETRY_1",
            TaskStatus::ErrorRetry2 => "ERROR_RETRY_2",
            TaskStatus::ErrorRetry3 => "ERROR_RETRY_3",
            TaskStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TaskStatus::Pending,
            "CONFIGURING" => TaskStatus::Configuring,
            "RUNNING" => TaskStatus::Running,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            "TIMEOUT" => TaskStatus::Timeout,
            "ERROR_RETRY_1" => TaskStatus::ErrorRetry1,
            "ERROR_RETRY_2" => TaskStatus::ErrorRetry2,
            "ERROR_RETRY_3" => TaskStatus::ErrorRetry3,
            _ => TaskStatus::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Configuring | TaskStatus::Running
        )
    }

    /// Waiting for a delayed resubmission. Whether `ERROR_RETRY_3` is final
    /// or still waiting is decided by `next_retry_at` on the record.
    pub fn is_retry_wait(self) -> bool {
        matches!(
            self,
            TaskStatus::ErrorRetry1 | TaskStatus::ErrorRetry2 | TaskStatus::ErrorRetry3
        )
    }

    pub fn retry_ordinal(retry_count: i64) -> Self {
        match retry_count {
            1 => TaskStatus::ErrorRetry1,
            2 => TaskStatus::ErrorRetry2,
            _ => TaskStatus::ErrorRetry3,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary tunnel state. Health is tracked on a separate axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Pending,
    Connecting,
    Active,
    Dead,
    Failed,
    Closed,
}

impl TunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Pending => "PENDING",
            TunnelStatus::Connecting => "CONNECTING",
            TunnelStatus::Active => "ACTIVE",
            TunnelStatus::Dead => "DEAD",
            TunnelStatus::Failed => "FAILED",
            TunnelStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(TunnelStatus::Pending),
            "CONNECTING" => Some(TunnelStatus::Connecting),
            "ACTIVE" => Some(TunnelStatus::Active),
            "DEAD" => Some(TunnelStatus::Dead),
            "FAILED" => Some(TunnelStatus::Failed),
            "CLOSED" => Some(TunnelStatus::Closed),
            _ => None,
        }
    }

    /// A tunnel in one of these states still owns its ports.
    pub fn holds_ports(self) -> bool {
        matches!(
            self,
            TunnelStatus::Pending | TunnelStatus::Connecting | TunnelStatus::Active
        )
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelHealth {
    Pending,
    Healthy,
    Unhealthy,
    Degraded,
    Unknown,
}

impl TunnelHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelHealth::Pending => "PENDING",
            TunnelHealth::Healthy => "HEALTHY",
            TunnelHealth::Unhealthy => "UNHEALTHY",
            TunnelHealth::Degraded => "DEGRADED",
            TunnelHealth::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TunnelHealth::Pending,
            "HEALTHY" => TunnelHealth::Healthy,
            "UNHEALTHY" => TunnelHealth::Unhealthy,
            "DEGRADED" => TunnelHealth::Degraded,
            _ => TunnelHealth::Unknown,
        }
    }
}

impl std::fmt::Display for TunnelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources requested from the scheduler, shared by jobs and tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: i64,
    pub memory_gb: i64,
    pub gpus: i64,
    pub nodes: i64,
    /// "HH:MM:SS", scheduler syntax.
    pub time_limit: String,
}

/// Payload for creating an interactive container job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Scheduler job id, known once the submit response is parsed.
    pub scheduler_id: Option<String>,
    /// Full scheduler-visible job name (carries the naming convention).
    pub name: String,
    /// Sanitized container name, unique per owner among active jobs.
    pub container_name: String,
    pub partition: String,
    pub resources: ResourceRequest,
    pub owner_id: i64,
    /// Container port reserved for the workload, if already allocated.
    pub port: Option<u16>,
}

/// Full stored container job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: i64,
    pub scheduler_id: Option<String>,
    pub name: String,
    pub container_name: String,
    pub status: JobStatus,
    /// Compute node the scheduler placed the job on; None until scheduled.
    pub node: Option<String>,
    pub port: Option<u16>,
    pub partition: String,
    pub resources: ResourceRequest,
    pub owner_id: i64,
    pub domain_ready: bool,
    pub time_used: Option<String>,
    pub time_left: Option<String>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

/// One failed run of a task, kept in the record's attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub state: String,
    pub node: Option<String>,
    pub finished_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    /// Generated task id ("sim-" prefix + random suffix).
    pub id: String,
    pub name: String,
    /// Input file as the container sees it.
    pub input_path: String,
    /// Same file translated to the host filesystem.
    pub host_input_path: String,
    /// Pre-generated batch script submitted to the scheduler.
    pub script_path: String,
    pub resources: ResourceRequest,
    pub owner_id: i64,
    pub output_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    pub scheduler_id: Option<String>,
    pub name: String,
    pub input_path: String,
    pub host_input_path: String,
    pub script_path: String,
    pub status: TaskStatus,
    pub resources: ResourceRequest,
    /// Number of retries consumed so far, in [0, 3].
    pub retry_count: i64,
    pub next_retry_at: Option<String>,
    pub attempts: Vec<TaskAttempt>,
    pub progress: i64,
    pub output_dir: String,
    pub results_path: Option<String>,
    pub node: Option<String>,
    pub owner_id: i64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRecord {
    /// Terminal means no further reconciliation will touch the status.
    /// `ERROR_RETRY_3` is terminal only once its retry slot is spent.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::ErrorRetry3 => self.next_retry_at.is_none(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTunnel {
    pub job_id: i64,
    pub internal_port: u16,
    pub external_port: u16,
    pub remote_port: u16,
    pub remote_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRecord {
    pub id: i64,
    pub job_id: i64,
    /// Local end of the SSH port-forward.
    pub internal_port: u16,
    /// Public-facing end republished by the forwarder.
    pub external_port: u16,
    /// Port on the compute node.
    pub remote_port: u16,
    pub remote_host: String,
    pub status: TunnelStatus,
    pub health: TunnelHealth,
    pub ssh_pid: Option<u32>,
    pub forwarder_pid: Option<u32>,
    pub last_health_check: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

/// One validated row of the scheduler's active-job listing.
///
/// All fields are the raw scheduler strings; interpretation (state mapping,
/// node-list expansion) happens in `services::slurm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub scheduler_id: String,
    pub partition: String,
    pub name: String,
    pub user: String,
    pub state: String,
    pub memory: String,
    pub time_used: String,
    pub time_left: String,
    pub nodes: String,
    pub submit_time: String,
    pub start_time: Option<String>,
    pub reason: Option<String>,
}
