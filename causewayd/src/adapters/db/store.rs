// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;

use crate::app::types::{
    JobRecord, JobStatus, NewJob, NewTask, NewTunnel, ResourceRequest, TaskAttempt, TaskRecord,
    TaskStatus, TunnelHealth, TunnelRecord, TunnelStatus, UserRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("empty name")]
    EmptyName,
    #[error("empty username")]
    EmptyUsername,
    #[error("empty task id")]
    EmptyTaskId,
    #[error("internal and external port are equal: {0}")]
    EqualTunnelPorts(u16),
    #[error("active job name conflict: {0}")]
    ActiveNameConflict(String),
    #[error("invalid stored status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const ACTIVE_JOB_STATUSES: &str = "('PENDING','CONFIGURING','RUNNING')";
const ACTIVE_TASK_STATUSES: &str = "('PENDING','CONFIGURING','RUNNING')";
const LIVE_TUNNEL_STATUSES: &str = "('PENDING','CONNECTING','ACTIVE')";

/// Async SQLite store for users, jobs, tasks and tunnels.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_users_table().await?;
        self.ensure_jobs_table().await?;
        self.ensure_tasks_table().await?;
        self.ensure_tunnels_table().await?;
        Ok(())
    }

    async fn ensure_users_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username ON users(username);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_jobs_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              scheduler_id TEXT,
              name TEXT NOT NULL,
              container_name TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'PENDING',
              node TEXT,
              port INTEGER,
              partition TEXT NOT NULL,
              cpus INTEGER NOT NULL,
              memory_gb INTEGER NOT NULL,
              gpus INTEGER NOT NULL,
              node_count INTEGER NOT NULL,
              time_limit TEXT NOT NULL,
              owner_id INTEGER NOT NULL REFERENCES users(id),
              domain_ready INTEGER NOT NULL DEFAULT 0,
              time_used TEXT,
              time_left TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_scheduler_id ON jobs(scheduler_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_name
              ON jobs(owner_id, container_name)
              WHERE status IN ('PENDING','CONFIGURING','RUNNING');
            "#,
        )
        .execute(&self.pool)
        .await?;
        // TODO: move migrations into a separate function.
        let columns: Vec<String> = sqlx::query("PRAGMA table_info(jobs)")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        if !columns.iter().any(|name| name == "time_used") {
            sqlx::query("ALTER TABLE jobs ADD COLUMN time_used TEXT")
                .execute(&self.pool)
                .await?;
        }
        if !columns.iter().any(|name| name == "time_left") {
            sqlx::query("ALTER TABLE jobs ADD COLUMN time_left TEXT")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn ensure_tasks_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              scheduler_id TEXT,
              name TEXT NOT NULL,
              input_path TEXT NOT NULL,
              host_input_path TEXT NOT NULL,
              script_path TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'PENDING',
              cpus INTEGER NOT NULL,
              memory_gb INTEGER NOT NULL,
              gpus INTEGER NOT NULL,
              node_count INTEGER NOT NULL,
              time_limit TEXT NOT NULL,
              retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count BETWEEN 0 AND 3),
              next_retry_at TEXT,
              attempts TEXT NOT NULL DEFAULT '[]',
              progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
              output_dir TEXT NOT NULL,
              results_path TEXT,
              node TEXT,
              owner_id INTEGER NOT NULL REFERENCES users(id),
              started_at TEXT,
              finished_at TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_scheduler_id ON tasks(scheduler_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_next_retry ON tasks(next_retry_at);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_tunnels_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tunnels (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
              internal_port INTEGER NOT NULL,
              external_port INTEGER NOT NULL,
              remote_port INTEGER NOT NULL,
              remote_host TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'PENDING',
              health TEXT NOT NULL DEFAULT 'PENDING',
              ssh_pid INTEGER,
              forwarder_pid INTEGER,
              last_health_check TEXT,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
              CHECK (internal_port <> external_port)
            );
            CREATE INDEX IF NOT EXISTS idx_tunnels_job ON tunnels(job_id);
            CREATE INDEX IF NOT EXISTS idx_tunnels_status ON tunnels(status);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- users ----------------------------------------------------------

    pub async fn get_or_create_user(&self, username: &str) -> Result<UserRecord> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::EmptyUsername);
        }
        sqlx::query("INSERT OR IGNORE INTO users (username) VALUES (?1)")
            .bind(username)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE username = ?1")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        user_from_row(&row)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    // ---- jobs -----------------------------------------------------------

    pub async fn insert_job(&self, job: &NewJob) -> Result<i64> {
        if job.name.trim().is_empty() || job.container_name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO jobs
              (scheduler_id, name, container_name, partition,
               cpus, memory_gb, gpus, node_count, time_limit, owner_id, port)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&job.scheduler_id)
        .bind(&job.name)
        .bind(&job.container_name)
        .bind(&job.partition)
        .bind(job.resources.cpus)
        .bind(job.resources.memory_gb)
        .bind(job.resources.gpus)
        .bind(job.resources.nodes)
        .bind(&job.resources.time_limit)
        .bind(job.owner_id)
        .bind(job.port.map(i64::from))
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::ActiveNameConflict(job.container_name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn get_job_by_scheduler_id(&self, scheduler_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE scheduler_id = ?1")
            .bind(scheduler_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM jobs WHERE status IN {ACTIVE_JOB_STATUSES} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn active_job_exists(&self, owner_id: i64, container_name: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM jobs
             WHERE owner_id = ?1 AND container_name = ?2 AND status IN {ACTIVE_JOB_STATUSES}
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(container_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_observation(
        &self,
        id: i64,
        status: JobStatus,
        node: Option<&str>,
        time_used: Option<&str>,
        time_left: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = ?2, node = ?3, time_used = ?4, time_left = ?5,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(node)
        .bind(time_used)
        .bind(time_left)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_job_port(&self, id: i64, port: Option<u16>) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET port = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(port.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_domain_ready(&self, id: i64, ready: bool) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET domain_ready = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(ready)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ---- tasks ----------------------------------------------------------

    pub async fn insert_task(&self, task: &NewTask) -> Result<()> {
        if task.id.trim().is_empty() {
            return Err(StoreError::EmptyTaskId);
        }
        if task.name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        sqlx::query(
            r#"
            INSERT INTO tasks
              (id, name, input_path, host_input_path, script_path,
               cpus, memory_gb, gpus, node_count, time_limit, output_dir, owner_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.input_path)
        .bind(&task.host_input_path)
        .bind(&task.script_path)
        .bind(task.resources.cpus)
        .bind(task.resources.memory_gb)
        .bind(task.resources.gpus)
        .bind(task.resources.nodes)
        .bind(&task.resources.time_limit)
        .bind(&task.output_dir)
        .bind(task.owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn get_task_by_scheduler_id(&self, scheduler_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE scheduler_id = ?1")
            .bind(scheduler_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM tasks WHERE status IN {ACTIVE_TASK_STATUSES} ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn list_submittable_tasks(&self, now: &str) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE (status = 'PENDING' AND scheduler_id IS NULL)
                OR (status IN ('ERROR_RETRY_1','ERROR_RETRY_2','ERROR_RETRY_3')
                    AND next_retry_at IS NOT NULL AND next_retry_at <= ?1)
             ORDER BY created_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn update_task_observation(
        &self,
        id: &str,
        status: TaskStatus,
        node: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?2, node = ?3,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(node)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_task_submission(&self, id: &str, scheduler_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET scheduler_id = ?2, status = 'CONFIGURING', next_retry_at = NULL,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(scheduler_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn schedule_task_retry(
        &self,
        id: &str,
        retry_count: i64,
        status: TaskStatus,
        next_retry_at: Option<&str>,
        attempt: &TaskAttempt,
    ) -> Result<()> {
        let attempt_json = serde_json::to_string(attempt)?;
        // The attempt history is an append-only JSON array column.
        sqlx::query(
            "UPDATE tasks SET
               retry_count = ?2,
               status = ?3,
               next_retry_at = ?4,
               scheduler_id = NULL,
               attempts = json_insert(attempts, '$[#]', json(?5)),
               updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(retry_count)
        .bind(status.as_str())
        .bind(next_retry_at)
        .bind(attempt_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_started(&self, id: &str, started_at: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET started_at = COALESCE(started_at, ?2),
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_finished(
        &self,
        id: &str,
        status: TaskStatus,
        finished_at: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?2, finished_at = COALESCE(finished_at, ?3),
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_progress(&self, id: &str, progress: i64) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET progress = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(progress.clamp(0, 100))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ---- tunnels --------------------------------------------------------

    pub async fn insert_tunnel(&self, tunnel: &NewTunnel) -> Result<i64> {
        if tunnel.internal_port == tunnel.external_port {
            return Err(StoreError::EqualTunnelPorts(tunnel.internal_port));
        }
        let done = sqlx::query(
            r#"
            INSERT INTO tunnels
              (job_id, internal_port, external_port, remote_port, remote_host)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(tunnel.job_id)
        .bind(i64::from(tunnel.internal_port))
        .bind(i64::from(tunnel.external_port))
        .bind(i64::from(tunnel.remote_port))
        .bind(&tunnel.remote_host)
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    pub async fn get_tunnel(&self, id: i64) -> Result<Option<TunnelRecord>> {
        let row = sqlx::query("SELECT * FROM tunnels WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tunnel_from_row).transpose()
    }

    pub async fn get_live_tunnel_for_job(&self, job_id: i64) -> Result<Option<TunnelRecord>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM tunnels
             WHERE job_id = ?1 AND status IN {LIVE_TUNNEL_STATUSES}
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tunnel_from_row).transpose()
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let rows = sqlx::query("SELECT * FROM tunnels ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tunnel_from_row).collect()
    }

    pub async fn list_tunnels_in_status(
        &self,
        statuses: &[TunnelStatus],
    ) -> Result<Vec<TunnelRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = statuses
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect();
        let rows = sqlx::query(&format!(
            "SELECT * FROM tunnels WHERE status IN ({}) ORDER BY id",
            placeholders.join(",")
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tunnel_from_row).collect()
    }

    pub async fn update_tunnel_status(&self, id: i64, status: TunnelStatus) -> Result<()> {
        sqlx::query(
            "UPDATE tunnels SET status = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_tunnel_health(
        &self,
        id: i64,
        health: TunnelHealth,
        checked_at: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tunnels SET health = ?2, last_health_check = ?3,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(health.as_str())
        .bind(checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_tunnel_pids(
        &self,
        id: i64,
        ssh_pid: Option<u32>,
        forwarder_pid: Option<u32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tunnels SET ssh_pid = ?2, forwarder_pid = ?3,
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?1",
        )
        .bind(id)
        .bind(ssh_pid.map(i64::from))
        .bind(forwarder_pid.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<bool> {
        let done = sqlx::query("DELETE FROM tunnels WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

// ---- row mapping --------------------------------------------------------

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        created_at: row.try_get("created_at")?,
    })
}

fn resources_from_row(row: &SqliteRow) -> Result<ResourceRequest> {
    Ok(ResourceRequest {
        cpus: row.try_get("cpus")?,
        memory_gb: row.try_get("memory_gb")?,
        gpus: row.try_get("gpus")?,
        nodes: row.try_get("node_count")?,
        time_limit: row.try_get("time_limit")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    let port: Option<i64> = row.try_get("port")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        scheduler_id: row.try_get("scheduler_id")?,
        name: row.try_get("name")?,
        container_name: row.try_get("container_name")?,
        status: JobStatus::parse(&status),
        node: row.try_get("node")?,
        port: port.map(|p| p as u16),
        partition: row.try_get("partition")?,
        resources: resources_from_row(row)?,
        owner_id: row.try_get("owner_id")?,
        domain_ready: row.try_get("domain_ready")?,
        time_used: row.try_get("time_used")?,
        time_left: row.try_get("time_left")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    let status: String = row.try_get("status")?;
    let attempts_json: String = row.try_get("attempts")?;
    let attempts: Vec<TaskAttempt> = serde_json::from_str(&attempts_json)?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        scheduler_id: row.try_get("scheduler_id")?,
        name: row.try_get("name")?,
        input_path: row.try_get("input_path")?,
        host_input_path: row.try_get("host_input_path")?,
        script_path: row.try_get("script_path")?,
        status: TaskStatus::parse(&status),
        resources: resources_from_row(row)?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        attempts,
        progress: row.try_get("progress")?,
        output_dir: row.try_get("output_dir")?,
        results_path: row.try_get("results_path")?,
        node: row.try_get("node")?,
        owner_id: row.try_get("owner_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tunnel_from_row(row: &SqliteRow) -> Result<TunnelRecord> {
    let status: String = row.try_get("status")?;
    let health: String = row.try_get("health")?;
    let internal_port: i64 = row.try_get("internal_port")?;
    let external_port: i64 = row.try_get("external_port")?;
    let remote_port: i64 = row.try_get("remote_port")?;
    let ssh_pid: Option<i64> = row.try_get("ssh_pid")?;
    let forwarder_pid: Option<i64> = row.try_get("forwarder_pid")?;
    Ok(TunnelRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        internal_port: internal_port as u16,
        external_port: external_port as u16,
        remote_port: remote_port as u16,
        remote_host: row.try_get("remote_host")?,
        status: TunnelStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?,
        health: TunnelHealth::parse(&health),
        ssh_pid: ssh_pid.map(|p| p as u32),
        forwarder_pid: forwarder_pid.map(|p| p as u32),
        last_health_check: row.try_get("last_health_check")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> (Store, UserRecord) {
        let store = Store::open_memory().await.expect("open memory store");
        let user = store
            .get_or_create_user("alice")
            .await
            .expect("create user");
        (store, user)
    }

    fn new_job(owner_id: i64, container_name: &str, scheduler_id: &str) -> NewJob {
        NewJob {
            scheduler_id: Some(scheduler_id.to_string()),
            name: format!("cw-job-alice-{container_name}"),
            container_name: container_name.to_string(),
            partition: "gpu_std_interactive".into(),
            resources: ResourceRequest {
                cpus: 8,
                memory_gb: 32,
                gpus: 1,
                nodes: 1,
                time_limit: "06:00:00".into(),
            },
            owner_id,
            port: Some(8642),
        }
    }

    fn new_task(owner_id: i64, id: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            name: format!("sim {id}"),
            input_path: "/data/in.sim".into(),
            host_input_path: "/srv/data/in.sim".into(),
            script_path: format!("/srv/scripts/{id}.sbatch"),
            resources: ResourceRequest {
                cpus: 4,
                memory_gb: 8,
                gpus: 0,
                nodes: 1,
                time_limit: "01:00:00".into(),
            },
            owner_id,
            output_dir: "/srv/out".into(),
        }
    }

    #[tokio::test]
    async fn users_are_deduplicated_by_name() {
        let (store, user) = store_with_user().await;
        let again = store.get_or_create_user("alice").await.expect("second call");
        assert_eq!(user.id, again.id);
        let fetched = store.get_user(user.id).await.expect("get").expect("present");
        assert_eq!(fetched.username, "alice");
    }

    #[tokio::test]
    async fn job_round_trips() {
        let (store, user) = store_with_user().await;
        let id = store
            .insert_job(&new_job(user.id, "jupyter", "4821093"))
            .await
            .expect("insert");
        let job = store.get_job(id).await.expect("get").expect("present");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.container_name, "jupyter");
        assert_eq!(job.port, Some(8642));
        assert_eq!(job.resources.memory_gb, 32);

        let by_sched = store
            .get_job_by_scheduler_id("4821093")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(by_sched.id, id);
    }

    #[tokio::test]
    async fn active_name_uniqueness_is_enforced() {
        let (store, user) = store_with_user().await;
        store
            .insert_job(&new_job(user.id, "jupyter", "1"))
            .await
            .expect("first insert");
        let err = store
            .insert_job(&new_job(user.id, "jupyter", "2"))
            .await
            .expect_err("duplicate active name must be rejected");
        assert!(matches!(err, StoreError::ActiveNameConflict(_)));

        // A completed job frees the name.
        let jobs = store.list_active_jobs().await.expect("list");
        store
            .update_job_status(jobs[0].id, JobStatus::Completed)
            .await
            .expect("complete");
        store
            .insert_job(&new_job(user.id, "jupyter", "3"))
            .await
            .expect("name reusable after completion");
    }

    #[tokio::test]
    async fn active_listing_excludes_terminal_jobs() {
        let (store, user) = store_with_user().await;
        let keep = store
            .insert_job(&new_job(user.id, "keep", "1"))
            .await
            .expect("insert");
        let done = store
            .insert_job(&new_job(user.id, "done", "2"))
            .await
            .expect("insert");
        store
            .update_job_status(done, JobStatus::Completed)
            .await
            .expect("complete");

        let active = store.list_active_jobs().await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep);
        assert!(
            store
                .active_job_exists(user.id, "keep")
                .await
                .expect("exists")
        );
        assert!(
            !store
                .active_job_exists(user.id, "done")
                .await
                .expect("exists")
        );
    }

    #[tokio::test]
    async fn job_observation_updates_fields() {
        let (store, user) = store_with_user().await;
        let id = store
            .insert_job(&new_job(user.id, "jupyter", "1"))
            .await
            .expect("insert");
        store
            .update_job_observation(id, JobStatus::Running, Some("node03"), Some("0:10"), Some("5:50"))
            .await
            .expect("observe");
        let job = store.get_job(id).await.expect("get").expect("present");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.node.as_deref(), Some("node03"));
        assert_eq!(job.time_used.as_deref(), Some("0:10"));
    }

    #[tokio::test]
    async fn task_retry_round_trips_attempt_history() {
        let (store, user) = store_with_user().await;
        store
            .insert_task(&new_task(user.id, "sim-1"))
            .await
            .expect("insert");
        let attempt = TaskAttempt {
            state: "FAILED".into(),
            node: Some("node07".into()),
            finished_at: "2026-02-11T10:00:00Z".into(),
        };
        store
            .schedule_task_retry(
                "sim-1",
                1,
                TaskStatus::ErrorRetry1,
                Some("2026-02-11T10:05:00Z"),
                &attempt,
            )
            .await
            .expect("schedule retry");

        let task = store.get_task("sim-1").await.expect("get").expect("present");
        assert_eq!(task.status, TaskStatus::ErrorRetry1);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.scheduler_id, None);
        assert_eq!(task.attempts.len(), 1);
        assert_eq!(task.attempts[0], attempt);
    }

    #[tokio::test]
    async fn submittable_listing_honors_retry_deadline() {
        let (store, user) = store_with_user().await;
        store
            .insert_task(&new_task(user.id, "sim-new"))
            .await
            .expect("insert");
        store
            .insert_task(&new_task(user.id, "sim-wait"))
            .await
            .expect("insert");
        let attempt = TaskAttempt {
            state: "FAILED".into(),
            node: None,
            finished_at: "2026-02-11T10:00:00Z".into(),
        };
        store
            .schedule_task_retry(
                "sim-wait",
                1,
                TaskStatus::ErrorRetry1,
                Some("2026-02-11T10:05:00Z"),
                &attempt,
            )
            .await
            .expect("schedule retry");

        let before = store
            .list_submittable_tasks("2026-02-11T10:00:00Z")
            .await
            .expect("list");
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, "sim-new");

        let after = store
            .list_submittable_tasks("2026-02-11T10:06:00Z")
            .await
            .expect("list");
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn task_submission_clears_retry_deadline() {
        let (store, user) = store_with_user().await;
        store
            .insert_task(&new_task(user.id, "sim-1"))
            .await
            .expect("insert");
        store
            .update_task_submission("sim-1", "4821100")
            .await
            .expect("submit");
        let task = store.get_task("sim-1").await.expect("get").expect("present");
        assert_eq!(task.status, TaskStatus::Configuring);
        assert_eq!(task.scheduler_id.as_deref(), Some("4821100"));
        assert_eq!(task.next_retry_at, None);

        let by_sched = store
            .get_task_by_scheduler_id("4821100")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(by_sched.id, "sim-1");
    }

    #[tokio::test]
    async fn started_and_finished_are_write_once() {
        let (store, user) = store_with_user().await;
        store
            .insert_task(&new_task(user.id, "sim-1"))
            .await
            .expect("insert");
        store
            .set_task_started("sim-1", "2026-02-11T10:00:00Z")
            .await
            .expect("start");
        store
            .set_task_started("sim-1", "2026-02-11T11:00:00Z")
            .await
            .expect("second start");
        store
            .set_task_finished("sim-1", TaskStatus::Completed, "2026-02-11T12:00:00Z")
            .await
            .expect("finish");
        store
            .set_task_finished("sim-1", TaskStatus::Completed, "2026-02-11T13:00:00Z")
            .await
            .expect("second finish");

        let task = store.get_task("sim-1").await.expect("get").expect("present");
        assert_eq!(task.started_at.as_deref(), Some("2026-02-11T10:00:00Z"));
        assert_eq!(task.finished_at.as_deref(), Some("2026-02-11T12:00:00Z"));
    }

    #[tokio::test]
    async fn tunnel_round_trips_and_filters_by_status() {
        let (store, user) = store_with_user().await;
        let job_id = store
            .insert_job(&new_job(user.id, "jupyter", "1"))
            .await
            .expect("insert job");
        let tunnel_id = store
            .insert_tunnel(&NewTunnel {
                job_id,
                internal_port: 9101,
                external_port: 9201,
                remote_port: 8642,
                remote_host: "node03".into(),
            })
            .await
            .expect("insert tunnel");

        let tunnel = store
            .get_tunnel(tunnel_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(tunnel.status, TunnelStatus::Pending);
        assert_eq!(tunnel.health, TunnelHealth::Pending);
        assert_eq!(tunnel.internal_port, 9101);

        store
            .update_tunnel_status(tunnel_id, TunnelStatus::Active)
            .await
            .expect("status");
        store
            .set_tunnel_pids(tunnel_id, Some(4242), Some(4243))
            .await
            .expect("pids");
        store
            .update_tunnel_health(tunnel_id, TunnelHealth::Healthy, "2026-02-11T10:00:00Z")
            .await
            .expect("health");

        let live = store
            .get_live_tunnel_for_job(job_id)
            .await
            .expect("live")
            .expect("present");
        assert_eq!(live.ssh_pid, Some(4242));
        assert_eq!(live.health, TunnelHealth::Healthy);

        let active = store
            .list_tunnels_in_status(&[TunnelStatus::Active])
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        let closed = store
            .list_tunnels_in_status(&[TunnelStatus::Closed])
            .await
            .expect("list");
        assert!(closed.is_empty());
    }

    #[tokio::test]
    async fn equal_tunnel_ports_are_rejected() {
        let (store, user) = store_with_user().await;
        let job_id = store
            .insert_job(&new_job(user.id, "jupyter", "1"))
            .await
            .expect("insert job");
        let err = store
            .insert_tunnel(&NewTunnel {
                job_id,
                internal_port: 9101,
                external_port: 9101,
                remote_port: 8642,
                remote_host: "node03".into(),
            })
            .await
            .expect_err("equal ports must be rejected");
        assert!(matches!(err, StoreError::EqualTunnelPorts(9101)));
    }

    #[tokio::test]
    async fn deleting_a_job_cascades_to_its_tunnels() {
        let (store, user) = store_with_user().await;
        let job_id = store
            .insert_job(&new_job(user.id, "jupyter", "1"))
            .await
            .expect("insert job");
        store
            .insert_tunnel(&NewTunnel {
                job_id,
                internal_port: 9101,
                external_port: 9201,
                remote_port: 8642,
                remote_host: "node03".into(),
            })
            .await
            .expect("insert tunnel");

        assert!(store.delete_job(job_id).await.expect("delete"));
        assert!(store.list_tunnels().await.expect("list").is_empty());
    }
}
