// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{NewTask, TaskAttempt, TaskRecord, TaskStatus};

#[async_trait]
pub trait TaskStorePort: Send + Sync {
    async fn insert_task(&self, task: &NewTask) -> AppResult<()>;
    async fn get_task(&self, id: &str) -> AppResult<Option<TaskRecord>>;
    async fn get_task_by_scheduler_id(&self, scheduler_id: &str) -> AppResult<Option<TaskRecord>>;
    async fn list_active_tasks(&self) -> AppResult<Vec<TaskRecord>>;
    /// Tasks eligible for (re)submission: never-submitted PENDING rows plus
    /// retry-wait rows whose `next_retry_at` is at or before `now`.
    async fn list_submittable_tasks(&self, now: &str) -> AppResult<Vec<TaskRecord>>;
    async fn update_task_observation(
        &self,
        id: &str,
        status: TaskStatus,
        node: Option<&str>,
    ) -> AppResult<()>;
    /// Records a successful scheduler submission: sets the scheduler id,
    /// moves to CONFIGURING and clears any pending retry deadline.
    async fn update_task_submission(&self, id: &str, scheduler_id: &str) -> AppResult<()>;
    /// One failed attempt: bumps the retry counter, appends to the attempt
    /// history and schedules (or withholds) the next run.
    async fn schedule_task_retry(
        &self,
        id: &str,
        retry_count: i64,
        status: TaskStatus,
        next_retry_at: Option<&str>,
        attempt: &TaskAttempt,
    ) -> AppResult<()>;
    async fn set_task_started(&self, id: &str, started_at: &str) -> AppResult<()>;
    async fn set_task_finished(
        &self,
        id: &str,
        status: TaskStatus,
        finished_at: &str,
    ) -> AppResult<()>;
    async fn set_task_progress(&self, id: &str, progress: i64) -> AppResult<()>;
    async fn delete_task(&self, id: &str) -> AppResult<bool>;
}
