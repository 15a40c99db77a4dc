// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{Store, StoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{JobStorePort, TaskStorePort, TunnelStorePort, UserStorePort};
use crate::app::types::{
    JobRecord, JobStatus, NewJob, NewTask, NewTunnel, TaskAttempt, TaskRecord, TaskStatus,
    TunnelHealth, TunnelRecord, TunnelStatus, UserRecord,
};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<Store>,
}

impl SqliteStoreAdapter {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Outbound adapter boundary: persistence-specific errors (StoreError,
/// sqlx) are translated into app-level errors here so the core stays free
/// of DB details.
fn map_store_error(err: StoreError) -> AppError {
    match err {
        StoreError::EmptyName
        | StoreError::EmptyUsername
        | StoreError::EmptyTaskId
        | StoreError::EqualTunnelPorts(_) => {
            AppError::new(AppErrorKind::InvalidArgument, codes::INVALID_ARGUMENT)
        }
        StoreError::ActiveNameConflict(name) => AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            format!("an active job named '{name}' already exists for this user"),
        ),
        StoreError::InvalidStatus(_) | StoreError::Serde(_) | StoreError::Sqlx(_) => {
            AppError::new(AppErrorKind::Internal, codes::INTERNAL_ERROR)
        }
    }
}

#[async_trait]
impl UserStorePort for SqliteStoreAdapter {
    async fn get_or_create_user(&self, username: &str) -> AppResult<UserRecord> {
        self.store
            .get_or_create_user(username)
            .await
            .map_err(map_store_error)
    }

    async fn get_user(&self, id: i64) -> AppResult<Option<UserRecord>> {
        self.store.get_user(id).await.map_err(map_store_error)
    }
}

#[async_trait]
impl JobStorePort for SqliteStoreAdapter {
    async fn insert_job(&self, job: &NewJob) -> AppResult<i64> {
        self.store.insert_job(job).await.map_err(map_store_error)
    }

    async fn get_job(&self, id: i64) -> AppResult<Option<JobRecord>> {
        self.store.get_job(id).await.map_err(map_store_error)
    }

    async fn get_job_by_scheduler_id(&self, scheduler_id: &str) -> AppResult<Option<JobRecord>> {
        self.store
            .get_job_by_scheduler_id(scheduler_id)
            .await
            .map_err(map_store_error)
    }

    async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>> {
        self.store.list_active_jobs().await.map_err(map_store_error)
    }

    async fn active_job_exists(&self, owner_id: i64, container_name: &str) -> AppResult<bool> {
        self.store
            .active_job_exists(owner_id, container_name)
            .await
            .map_err(map_store_error)
    }

    async fn update_job_status(&self, id: i64, status: JobStatus) -> AppResult<()> {
        self.store
            .update_job_status(id, status)
            .await
            .map_err(map_store_error)
    }

    async fn update_job_observation(
        &self,
        id: i64,
        status: JobStatus,
        node: Option<&str>,
        time_used: Option<&str>,
        time_left: Option<&str>,
    ) -> AppResult<()> {
        self.store
            .update_job_observation(id, status, node, time_used, time_left)
            .await
            .map_err(map_store_error)
    }

    async fn set_job_port(&self, id: i64, port: Option<u16>) -> AppResult<()> {
        self.store
            .set_job_port(id, port)
            .await
            .map_err(map_store_error)
    }

    async fn set_domain_ready(&self, id: i64, ready: bool) -> AppResult<()> {
        self.store
            .set_domain_ready(id, ready)
            .await
            .map_err(map_store_error)
    }

    async fn delete_job(&self, id: i64) -> AppResult<bool> {
        self.store.delete_job(id).await.map_err(map_store_error)
    }
}

#[async_trait]
impl TaskStorePort for SqliteStoreAdapter {
    async fn insert_task(&self, task: &NewTask) -> AppResult<()> {
        self.store.insert_task(task).await.map_err(map_store_error)
    }

    async fn get_task(&self, id: &str) -> AppResult<Option<TaskRecord>> {
        self.store.get_task(id).await.map_err(map_store_error)
    }

    async fn get_task_by_scheduler_id(&self, scheduler_id: &str) -> AppResult<Option<TaskRecord>> {
        self.store
            .get_task_by_scheduler_id(scheduler_id)
            .await
            .map_err(map_store_error)
    }

    async fn list_active_tasks(&self) -> AppResult<Vec<TaskRecord>> {
        self.store
            .list_active_tasks()
            .await
            .map_err(map_store_error)
    }

    async fn list_submittable_tasks(&self, now: &str) -> AppResult<Vec<TaskRecord>> {
        self.store
            .list_submittable_tasks(now)
            .await
            .map_err(map_store_error)
    }

    async fn update_task_observation(
        &self,
        id: &str,
        status: TaskStatus,
        node: Option<&str>,
    ) -> AppResult<()> {
        self.store
            .update_task_observation(id, status, node)
            .await
            .map_err(map_store_error)
    }

    async fn update_task_submission(&self, id: &str, scheduler_id: &str) -> AppResult<()> {
        self.store
            .update_task_submission(id, scheduler_id)
            .await
            .map_err(map_store_error)
    }

    async fn schedule_task_retry(
        &self,
        id: &str,
        retry_count: i64,
        status: TaskStatus,
        next_retry_at: Option<&str>,
        attempt: &TaskAttempt,
    ) -> AppResult<()> {
        self.store
            .schedule_task_retry(id, retry_count, status, next_retry_at, attempt)
            .await
            .map_err(map_store_error)
    }

    async fn set_task_started(&self, id: &str, started_at: &str) -> AppResult<()> {
        self.store
            .set_task_started(id, started_at)
            .await
            .map_err(map_store_error)
    }

    async fn set_task_finished(
        &self,
        id: &str,
        status: TaskStatus,
        finished_at: &str,
    ) -> AppResult<()> {
        self.store
            .set_task_finished(id, status, finished_at)
            .await
            .map_err(map_store_error)
    }

    async fn set_task_progress(&self, id: &str, progress: i64) -> AppResult<()> {
        self.store
            .set_task_progress(id, progress)
            .await
            .map_err(map_store_error)
    }

    async fn delete_task(&self, id: &str) -> AppResult<bool> {
        self.store.delete_task(id).await.map_err(map_store_error)
    }
}

#[async_trait]
impl TunnelStorePort for SqliteStoreAdapter {
    async fn insert_tunnel(&self, tunnel: &NewTunnel) -> AppResult<i64> {
        self.store
            .insert_tunnel(tunnel)
            .await
            .map_err(map_store_error)
    }

    async fn get_tunnel(&self, id: i64) -> AppResult<Option<TunnelRecord>> {
        self.store.get_tunnel(id).await.map_err(map_store_error)
    }

    async fn get_live_tunnel_for_job(&self, job_id: i64) -> AppResult<Option<TunnelRecord>> {
        self.store
            .get_live_tunnel_for_job(job_id)
            .await
            .map_err(map_store_error)
    }

    async fn list_tunnels(&self) -> AppResult<Vec<TunnelRecord>> {
        self.store.list_tunnels().await.map_err(map_store_error)
    }

    async fn list_tunnels_in_status(
        &self,
        statuses: &[TunnelStatus],
    ) -> AppResult<Vec<TunnelRecord>> {
        self.store
            .list_tunnels_in_status(statuses)
            .await
            .map_err(map_store_error)
    }

    async fn update_tunnel_status(&self, id: i64, status: TunnelStatus) -> AppResult<()> {
        self.store
            .update_tunnel_status(id, status)
            .await
            .map_err(map_store_error)
    }

    async fn update_tunnel_health(
        &self,
        id: i64,
        health: TunnelHealth,
        checked_at: &str,
    ) -> AppResult<()> {
        self.store
            .update_tunnel_health(id, health, checked_at)
            .await
            .map_err(map_store_error)
    }

    async fn set_tunnel_pids(
        &self,
        id: i64,
        ssh_pid: Option<u32>,
        forwarder_pid: Option<u32>,
    ) -> AppResult<()> {
        self.store
            .set_tunnel_pids(id, ssh_pid, forwarder_pid)
            .await
            .map_err(map_store_error)
    }

    async fn delete_tunnel(&self, id: i64) -> AppResult<bool> {
        self.store.delete_tunnel(id).await.map_err(map_store_error)
    }
}
