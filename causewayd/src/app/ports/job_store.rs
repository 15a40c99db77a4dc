// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{JobRecord, JobStatus, NewJob};

#[async_trait]
pub trait JobStorePort: Send + Sync {
    async fn insert_job(&self, job: &NewJob) -> AppResult<i64>;
    async fn get_job(&self, id: i64) -> AppResult<Option<JobRecord>>;
    async fn get_job_by_scheduler_id(&self, scheduler_id: &str) -> AppResult<Option<JobRecord>>;
    async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>>;
    async fn active_job_exists(&self, owner_id: i64, container_name: &str) -> AppResult<bool>;
    async fn update_job_status(&self, id: i64, status: JobStatus) -> AppResult<()>;
    /// One write per reconciliation observation: status plus the scheduler's
    /// latest placement and accounting columns.
    async fn update_job_observation(
        &self,
        id: i64,
        status: JobStatus,
        node: Option<&str>,
        time_used: Option<&str>,
        time_left: Option<&str>,
    ) -> AppResult<()>;
    async fn set_job_port(&self, id: i64, port: Option<u16>) -> AppResult<()>;
    async fn set_domain_ready(&self, id: i64, ready: bool) -> AppResult<()>;
    async fn delete_job(&self, id: i64) -> AppResult<bool>;
}
