// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteExecPort};
use crate::app::services::breaker::{BreakerConfig, CircuitBreaker};
use crate::app::services::slurm;
use crate::app::types::JobSnapshot;

/// Remote scheduler operations, all guarded by one circuit breaker.
///
/// Stateless besides the breaker: one `exec_capture` per operation. The
/// active-job listing is issued once per reconciliation cycle and is that
/// cycle's sole source of truth; there are no per-job queries.
pub struct SchedulerClient {
    remote: Arc<dyn RemoteExecPort>,
    breaker: CircuitBreaker,
}

impl SchedulerClient {
    pub fn new(remote: Arc<dyn RemoteExecPort>, breaker_config: BreakerConfig) -> Self {
        Self {
            remote,
            breaker: CircuitBreaker::new("scheduler", breaker_config),
        }
    }

    /// Every active job owned by the invoking credential, as validated
    /// snapshot records. Malformed listing lines are logged and dropped,
    /// never column-shifted into a record.
    pub async fn get_all_active_jobs(&self) -> AppResult<Vec<JobSnapshot>> {
        let capture = self.run(slurm::LIST_ACTIVE_JOBS_CMD).await?;
        if capture.exit_code != 0 {
            return Err(remote_error(
                "active-job listing",
                capture.exit_code,
                &capture.stderr,
            ));
        }
        let output = String::from_utf8_lossy(&capture.stdout);
        let parse = slurm::parse_active_jobs(&output);
        for line in &parse.rejected {
            tracing::warn!("rejected malformed scheduler listing line: {line}");
        }
        Ok(parse.jobs)
    }

    /// Submit a batch script; returns the scheduler job id parsed out of
    /// the "Submitted batch job <id>" response.
    pub async fn submit(&self, script_path: &str) -> AppResult<String> {
        let command = format!("sbatch {script_path}");
        let capture = self.run(&command).await?;
        if capture.exit_code != 0 {
            return Err(remote_error("sbatch", capture.exit_code, &capture.stderr));
        }
        let stdout = String::from_utf8_lossy(&capture.stdout);
        slurm::parse_submitted_job_id(&stdout).ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!("sbatch output had no job id: {}", stdout.trim()),
            )
        })
    }

    /// Cancel a scheduler job. `Ok(false)` when the scheduler refused the
    /// cancellation (typically: the job already left the queue).
    pub async fn cancel(&self, scheduler_id: &str) -> AppResult<bool> {
        let command = format!("scancel {scheduler_id}");
        let capture = self.run(&command).await?;
        if capture.exit_code != 0 {
            tracing::warn!(
                "scancel {scheduler_id} exited {}: {}",
                capture.exit_code,
                String::from_utf8_lossy(&capture.stderr).trim()
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether calls would currently fail fast. Surfaces as a degraded
    /// cluster indicator instead of hard errors.
    pub async fn is_degraded(&self) -> bool {
        self.breaker.is_open().await
    }

    async fn run(&self, command: &str) -> AppResult<ExecCapture> {
        self.breaker.call(self.remote.exec_capture(command)).await
    }
}

fn remote_error(what: &str, exit_code: i32, stderr: &[u8]) -> AppError {
    let detail = String::from_utf8_lossy(stderr);
    let detail = detail.trim();
    AppError::with_message(
        AppErrorKind::Aborted,
        codes::REMOTE_ERROR,
        if detail.is_empty() {
            format!("{what} failed with exit code {exit_code}")
        } else {
            format!("{what} failed with exit code {exit_code}: {detail}")
        },
    )
}
