// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{Mutex, watch};

use crate::app::errors::AppResult;
use crate::app::ports::{
    ClockPort, EventSinkPort, JobStorePort, ProxyRoutePort, TaskStorePort, UserStorePort,
};
use crate::app::scheduler::SchedulerClient;
use crate::app::services::names::{self, SnapshotClass};
use crate::app::services::slurm;
use crate::app::tunnels::TunnelOrchestrator;
use crate::app::types::{
    JobRecord, JobSnapshot, JobStatus, NewJob, ResourceRequest, TaskAttempt, TaskRecord,
    TaskStatus,
};

pub const JOB_EVENT_CHANNEL: &str = "jobs";
pub const TASK_EVENT_CHANNEL: &str = "tasks";

/// Escalating delays before a failed task is resubmitted.
const RETRY_DELAYS_SECS: [i64; 3] = [5 * 60, 30 * 60, 2 * 3600];
const MAX_TASK_RETRIES: i64 = 3;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Consecutive listings a job must be absent from before it is
    /// finalized as completed. One hiccup of the scheduler query looks
    /// identical to a real completion; the threshold trades detection
    /// latency against false positives.
    pub completion_miss_threshold: u32,
    /// Materialize scheduler jobs that follow the naming convention but
    /// have no local row.
    pub adopt_orphans: bool,
    /// Owner for adopted rows when the name yields no username.
    pub default_account: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            completion_miss_threshold: 3,
            adopt_orphans: false,
            default_account: "causeway".to_string(),
        }
    }
}

/// Periodic synchronization of local job and task records against the
/// scheduler's live queue.
///
/// One snapshot fetch per cycle is the sole source of truth; every record
/// is then processed behind its own error boundary, so a single bad row
/// never aborts a cycle. Cycles are idempotent: an unchanged snapshot
/// produces no writes.
pub struct ReconciliationLoop {
    config: ReconcilerConfig,
    scheduler: Arc<SchedulerClient>,
    jobs: Arc<dyn JobStorePort>,
    tasks: Arc<dyn TaskStorePort>,
    users: Arc<dyn UserStorePort>,
    tunnels: Arc<TunnelOrchestrator>,
    proxy: Arc<dyn ProxyRoutePort>,
    events: Arc<dyn EventSinkPort>,
    clock: Arc<dyn ClockPort>,
    job_misses: Mutex<HashMap<i64, u32>>,
    task_misses: Mutex<HashMap<String, u32>>,
}

impl ReconciliationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReconcilerConfig,
        scheduler: Arc<SchedulerClient>,
        jobs: Arc<dyn JobStorePort>,
        tasks: Arc<dyn TaskStorePort>,
        users: Arc<dyn UserStorePort>,
        tunnels: Arc<TunnelOrchestrator>,
        proxy: Arc<dyn ProxyRoutePort>,
        events: Arc<dyn EventSinkPort>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            config,
            scheduler,
            jobs,
            tasks,
            users,
            tunnels,
            proxy,
            events,
            clock,
            job_misses: Mutex::new(HashMap::new()),
            task_misses: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        tracing::warn!("reconciliation cycle failed: {err}");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    tracing::info!("reconciliation loop stopping");
                    return;
                }
            }
        }
    }

    /// One full cycle: fetch, classify, update, finalize vanished records,
    /// then push due task submissions. Only a failed snapshot fetch skips
    /// the cycle.
    pub async fn run_cycle(self: &Arc<Self>) -> AppResult<()> {
        let snapshots = match self.scheduler.get_all_active_jobs().await {
            Ok(snapshots) => snapshots,
            Err(err) if err.is_circuit_open() => {
                tracing::debug!("scheduler circuit open, skipping reconciliation cycle");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!("active-job snapshot fetch failed, skipping cycle: {err}");
                return Ok(());
            }
        };

        let mut container_snaps = Vec::new();
        let mut task_snaps = Vec::new();
        let mut foreign = 0usize;
        for snapshot in snapshots {
            match names::classify(&snapshot.name) {
                SnapshotClass::ContainerJob => container_snaps.push(snapshot),
                SnapshotClass::BatchTask => task_snaps.push(snapshot),
                SnapshotClass::Foreign => foreign += 1,
            }
        }
        tracing::debug!(
            "reconciling {} container jobs, {} tasks ({foreign} foreign entries ignored)",
            container_snaps.len(),
            task_snaps.len()
        );

        self.sync_container_jobs(&container_snaps).await?;
        self.sync_batch_tasks(&task_snaps).await?;
        self.submit_due_tasks().await;
        Ok(())
    }

    // ---- container jobs -------------------------------------------------

    async fn sync_container_jobs(self: &Arc<Self>, snapshots: &[JobSnapshot]) -> AppResult<()> {
        let local = self.jobs.list_active_jobs().await?;
        let by_scheduler_id: HashMap<&str, &JobRecord> = local
            .iter()
            .filter_map(|job| job.scheduler_id.as_deref().map(|sid| (sid, job)))
            .collect();

        let mut seen: HashSet<i64> = HashSet::new();
        for snapshot in snapshots {
            let Some(job) = by_scheduler_id.get(snapshot.scheduler_id.as_str()) else {
                if self.config.adopt_orphans {
                    if let Err(err) = self.adopt_orphan_job(snapshot).await {
                        tracing::warn!("adoption of job {} failed: {err}", snapshot.scheduler_id);
                    }
                }
                continue;
            };
            seen.insert(job.id);
            if let Err(err) = self.observe_container_job(job, snapshot).await {
                tracing::warn!("reconciling job {} failed: {err}", job.id);
            }
        }

        // Vanished jobs: only finalized after enough consecutive misses,
        // and only because the fetch above succeeded.
        let to_finalize = self
            .note_job_misses(&local, &seen, self.config.completion_miss_threshold)
            .await;
        for job in to_finalize {
            tracing::info!(
                "job {} ({}) left the scheduler queue, completing",
                job.id,
                job.name
            );
            if let Err(err) = self.complete_job(&job, JobStatus::Completed).await {
                tracing::warn!("completing vanished job {} failed: {err}", job.id);
            }
        }
        Ok(())
    }

    async fn note_job_misses(
        &self,
        local: &[JobRecord],
        seen: &HashSet<i64>,
        threshold: u32,
    ) -> Vec<JobRecord> {
        let mut misses = self.job_misses.lock().await;
        let active_ids: HashSet<i64> = local.iter().map(|job| job.id).collect();
        misses.retain(|id, _| active_ids.contains(id));

        let mut to_finalize = Vec::new();
        for job in local {
            if job.scheduler_id.is_none() {
                continue; // not submitted yet, nothing to miss
            }
            if seen.contains(&job.id) {
                misses.remove(&job.id);
                continue;
            }
            let count = misses.entry(job.id).or_insert(0);
            *count += 1;
            tracing::debug!("job {} missing from listing ({}/{threshold})", job.id, count);
            if *count >= threshold {
                misses.remove(&job.id);
                to_finalize.push(job.clone());
            }
        }
        to_finalize
    }

    async fn observe_container_job(
        self: &Arc<Self>,
        job: &JobRecord,
        snapshot: &JobSnapshot,
    ) -> AppResult<()> {
        let observed = slurm::job_status_from_state(&snapshot.state);
        let status = if observed == JobStatus::Unknown {
            tracing::debug!(
                "job {} reported unknown scheduler state {:?}, keeping {}",
                job.id,
                snapshot.state,
                job.status
            );
            job.status
        } else {
            observed
        };

        if status.is_terminal() {
            return self.complete_job(job, status).await;
        }

        let node = slurm::first_node(&snapshot.nodes);
        let time_used = non_empty(&snapshot.time_used);
        let time_left = non_empty(&snapshot.time_left);
        let changed = status != job.status
            || node.as_deref() != job.node.as_deref()
            || time_used != job.time_used.as_deref()
            || time_left != job.time_left.as_deref();
        if !changed {
            return Ok(());
        }

        let was_waiting = matches!(job.status, JobStatus::Pending | JobStatus::Configuring);
        self.jobs
            .update_job_observation(job.id, status, node.as_deref(), time_used, time_left)
            .await?;
        if status != job.status {
            self.events.publish(
                JOB_EVENT_CHANNEL,
                json!({
                    "event": "job.status_changed",
                    "job_id": job.id,
                    "from": job.status.as_str(),
                    "to": status.as_str(),
                }),
            );
        }

        if was_waiting && status == JobStatus::Running {
            let Some(updated) = self.jobs.get_job(job.id).await? else {
                return Ok(());
            };
            match self.tunnels.get_or_create(&updated).await {
                Ok(Some(tunnel)) => {
                    tracing::info!(
                        "job {} started on {:?}, tunnel {} {}",
                        job.id,
                        updated.node,
                        tunnel.id,
                        tunnel.status
                    );
                }
                Ok(None) => {
                    tracing::warn!(
                        "job {} is RUNNING but no tunnel could be prepared; retrying next cycle",
                        job.id
                    );
                }
                Err(err) => {
                    tracing::warn!("tunnel creation for job {} failed: {err}", job.id);
                }
            }
        }
        Ok(())
    }

    /// Terminal transition plus the cascade: tunnels down, proxy route
    /// gone, listeners notified. Route and event failures are non-fatal.
    async fn complete_job(&self, job: &JobRecord, status: JobStatus) -> AppResult<()> {
        self.jobs.update_job_status(job.id, status).await?;
        if job.domain_ready {
            self.jobs.set_domain_ready(job.id, false).await?;
        }
        if let Err(err) = self.tunnels.close_for_job(job.id).await {
            tracing::warn!("closing tunnels of job {} failed: {err}", job.id);
        }
        let route = names::route_name(job);
        if let Err(err) = self.proxy.remove_route(&route).await {
            tracing::warn!("removing proxy route {route} failed: {err}");
        }
        self.events.publish(
            JOB_EVENT_CHANNEL,
            json!({
                "event": "job.finished",
                "job_id": job.id,
                "status": status.as_str(),
            }),
        );
        self.job_misses.lock().await.remove(&job.id);
        Ok(())
    }

    async fn adopt_orphan_job(&self, snapshot: &JobSnapshot) -> AppResult<()> {
        let username = names::owner_from_job_name(&snapshot.name)
            .unwrap_or(self.config.default_account.as_str());
        let user = self.users.get_or_create_user(username).await?;
        let container_name = names::container_from_job_name(&snapshot.name)
            .map(names::sanitize_container_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| names::sanitize_container_name(&snapshot.name));

        if self
            .jobs
            .active_job_exists(user.id, &container_name)
            .await?
        {
            tracing::debug!(
                "not adopting {}: {username} already has an active '{container_name}'",
                snapshot.scheduler_id
            );
            return Ok(());
        }

        // The listing does not carry the original request, so adopted rows
        // get observed values and placeholders.
        let resources = ResourceRequest {
            cpus: 1,
            memory_gb: slurm::parse_memory_gb(&snapshot.memory).unwrap_or(1),
            gpus: 0,
            nodes: 1,
            time_limit: non_empty(&snapshot.time_left)
                .unwrap_or("00:00:00")
                .to_string(),
        };
        let new_job = NewJob {
            scheduler_id: Some(snapshot.scheduler_id.clone()),
            name: snapshot.name.clone(),
            container_name,
            partition: snapshot.partition.clone(),
            resources,
            owner_id: user.id,
            port: None,
        };
        let job_id = self.jobs.insert_job(&new_job).await?;
        let status = slurm::job_status_from_state(&snapshot.state);
        if status != JobStatus::Unknown && status != JobStatus::Pending {
            self.jobs
                .update_job_observation(
                    job_id,
                    status,
                    slurm::first_node(&snapshot.nodes).as_deref(),
                    non_empty(&snapshot.time_used),
                    non_empty(&snapshot.time_left),
                )
                .await?;
        }
        tracing::info!(
            "adopted scheduler job {} as job {job_id} (owner {username})",
            snapshot.scheduler_id
        );
        self.events.publish(
            JOB_EVENT_CHANNEL,
            json!({
                "event": "job.adopted",
                "job_id": job_id,
                "scheduler_id": snapshot.scheduler_id,
                "owner": username,
            }),
        );
        Ok(())
    }

    // ---- batch tasks ----------------------------------------------------

    async fn sync_batch_tasks(&self, snapshots: &[JobSnapshot]) -> AppResult<()> {
        let local = self.tasks.list_active_tasks().await?;
        let by_scheduler_id: HashMap<&str, &TaskRecord> = local
            .iter()
            .filter_map(|task| task.scheduler_id.as_deref().map(|sid| (sid, task)))
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        for snapshot in snapshots {
            let Some(task) = by_scheduler_id.get(snapshot.scheduler_id.as_str()) else {
                // A task without its input and script paths would be an
                // unusable row, so unlike jobs these are never adopted.
                tracing::debug!(
                    "scheduler task {} has no local record, ignoring",
                    snapshot.scheduler_id
                );
                continue;
            };
            seen.insert(task.id.clone());
            if let Err(err) = self.observe_task(task, snapshot).await {
                tracing::warn!("reconciling task {} failed: {err}", task.id);
            }
        }

        let to_finalize = self
            .note_task_misses(&local, &seen, self.config.completion_miss_threshold)
            .await;
        for task in to_finalize {
            tracing::info!("task {} left the scheduler queue, completing", task.id);
            if let Err(err) = self.finish_task(&task, TaskStatus::Completed).await {
                tracing::warn!("completing vanished task {} failed: {err}", task.id);
            }
        }
        Ok(())
    }

    async fn note_task_misses(
        &self,
        local: &[TaskRecord],
        seen: &HashSet<String>,
        threshold: u32,
    ) -> Vec<TaskRecord> {
        let mut misses = self.task_misses.lock().await;
        let active_ids: HashSet<&str> = local.iter().map(|task| task.id.as_str()).collect();
        misses.retain(|id, _| active_ids.contains(id.as_str()));

        let mut to_finalize = Vec::new();
        for task in local {
            if task.scheduler_id.is_none() {
                continue;
            }
            if seen.contains(&task.id) {
                misses.remove(&task.id);
                continue;
            }
            let count = misses.entry(task.id.clone()).or_insert(0);
            *count += 1;
            if *count >= threshold {
                misses.remove(&task.id);
                to_finalize.push(task.clone());
            }
        }
        to_finalize
    }

    async fn observe_task(&self, task: &TaskRecord, snapshot: &JobSnapshot) -> AppResult<()> {
        let observed = slurm::task_status_from_state(&snapshot.state);
        let node = slurm::first_node(&snapshot.nodes);

        match observed {
            TaskStatus::Unknown => {
                tracing::debug!(
                    "task {} reported unknown scheduler state {:?}",
                    task.id,
                    snapshot.state
                );
                Ok(())
            }
            TaskStatus::Pending | TaskStatus::Configuring | TaskStatus::Running => {
                if observed != task.status || node.as_deref() != task.node.as_deref() {
                    self.tasks
                        .update_task_observation(&task.id, observed, node.as_deref())
                        .await?;
                }
                if observed == TaskStatus::Running && task.started_at.is_none() {
                    self.tasks
                        .set_task_started(&task.id, &self.now_string())
                        .await?;
                    self.events.publish(
                        TASK_EVENT_CHANNEL,
                        json!({"event": "task.started", "task_id": task.id}),
                    );
                }
                Ok(())
            }
            TaskStatus::Completed => self.finish_task(task, TaskStatus::Completed).await,
            TaskStatus::Cancelled => self.finish_task(task, TaskStatus::Cancelled).await,
            TaskStatus::Failed | TaskStatus::Timeout => self.schedule_retry(task, observed).await,
            // Retry states are local bookkeeping, never observed remotely.
            TaskStatus::ErrorRetry1 | TaskStatus::ErrorRetry2 | TaskStatus::ErrorRetry3 => Ok(()),
        }
    }

    async fn finish_task(&self, task: &TaskRecord, status: TaskStatus) -> AppResult<()> {
        if task.finished_at.is_some() && task.status == status {
            return Ok(());
        }
        self.tasks
            .set_task_finished(&task.id, status, &self.now_string())
            .await?;
        self.events.publish(
            TASK_EVENT_CHANNEL,
            json!({
                "event": "task.finished",
                "task_id": task.id,
                "status": status.as_str(),
            }),
        );
        self.task_misses.lock().await.remove(&task.id);
        Ok(())
    }

    /// The retry ladder. Each failure burns one retry slot with an
    /// escalating delay; the fourth failure is final.
    async fn schedule_retry(&self, task: &TaskRecord, observed: TaskStatus) -> AppResult<()> {
        let now = self.clock.now_utc();
        let attempt = TaskAttempt {
            state: observed.as_str().to_string(),
            node: task.node.clone(),
            finished_at: rfc3339(now),
        };

        if task.retry_count < MAX_TASK_RETRIES {
            let retry_count = task.retry_count + 1;
            let delay = RETRY_DELAYS_SECS[(retry_count - 1) as usize];
            let next_retry_at = rfc3339(now + TimeDuration::seconds(delay));
            let status = TaskStatus::retry_ordinal(retry_count);
            self.tasks
                .schedule_task_retry(&task.id, retry_count, status, Some(&next_retry_at), &attempt)
                .await?;
            tracing::info!(
                "task {} failed ({}), retry {retry_count}/{MAX_TASK_RETRIES} at {next_retry_at}",
                task.id,
                observed
            );
            self.events.publish(
                TASK_EVENT_CHANNEL,
                json!({
                    "event": "task.retry_scheduled",
                    "task_id": task.id,
                    "retry_count": retry_count,
                    "next_retry_at": next_retry_at,
                }),
            );
        } else {
            self.tasks
                .schedule_task_retry(&task.id, MAX_TASK_RETRIES, TaskStatus::ErrorRetry3, None, &attempt)
                .await?;
            self.tasks
                .set_task_finished(&task.id, TaskStatus::ErrorRetry3, &rfc3339(now))
                .await?;
            tracing::warn!("task {} exhausted its retries, finalizing", task.id);
            self.events.publish(
                TASK_EVENT_CHANNEL,
                json!({
                    "event": "task.finished",
                    "task_id": task.id,
                    "status": TaskStatus::ErrorRetry3.as_str(),
                }),
            );
        }
        Ok(())
    }

    /// Push never-submitted and retry-due tasks to the scheduler. A
    /// circuit-open response abandons the rest of the batch for this cycle.
    async fn submit_due_tasks(&self) {
        let now = self.now_string();
        let due = match self.tasks.list_submittable_tasks(&now).await {
            Ok(due) => due,
            Err(err) => {
                tracing::warn!("listing submittable tasks failed: {err}");
                return;
            }
        };
        for task in due {
            match self.scheduler.submit(&task.script_path).await {
                Ok(scheduler_id) => {
                    if let Err(err) = self
                        .tasks
                        .update_task_submission(&task.id, &scheduler_id)
                        .await
                    {
                        tracing::warn!("recording submission of task {} failed: {err}", task.id);
                        continue;
                    }
                    tracing::info!("task {} submitted as scheduler job {scheduler_id}", task.id);
                    self.events.publish(
                        TASK_EVENT_CHANNEL,
                        json!({
                            "event": "task.submitted",
                            "task_id": task.id,
                            "scheduler_id": scheduler_id,
                        }),
                    );
                }
                Err(err) if err.is_circuit_open() => {
                    tracing::debug!("scheduler circuit open, deferring remaining submissions");
                    return;
                }
                Err(err) => {
                    tracing::warn!("submission of task {} failed: {err}", task.id);
                }
            }
        }
    }

    fn now_string(&self) -> String {
        rfc3339(self.clock.now_utc())
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| String::new())
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use crate::app::allocator::{AllocatorConfig, PortAllocator, PortSpan};
    use crate::app::errors::{AppError, AppErrorKind, codes};
    use crate::app::ports::{
        ExecCapture, NetworkProbePort, ProcessControlPort, ProcessInfo, RemoteExecPort, SpawnSpec,
        TunnelStorePort, events::NoopEventSink,
    };
    use crate::app::procman::{ProcessManager, ProcessManagerConfig};
    use crate::app::services::breaker::BreakerConfig;
    use crate::app::tunnels::TunnelOrchestratorConfig;
    use crate::app::types::{
        NewTask, NewTunnel, TunnelHealth, TunnelRecord, TunnelStatus, UserRecord,
    };

    // ---- stores ---------------------------------------------------------

    #[derive(Default)]
    struct MemJobStore {
        next_id: StdMutex<i64>,
        jobs: StdMutex<Vec<JobRecord>>,
        writes: AtomicUsize,
    }

    impl MemJobStore {
        fn push(&self, job: JobRecord) {
            self.jobs.lock().expect("jobs lock").push(job);
        }

        fn get(&self, id: i64) -> Option<JobRecord> {
            self.jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .find(|j| j.id == id)
                .cloned()
        }

        fn count(&self) -> usize {
            self.jobs.lock().expect("jobs lock").len()
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobStorePort for MemJobStore {
        async fn insert_job(&self, job: &NewJob) -> AppResult<i64> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut next = self.next_id.lock().expect("next_id lock");
            *next += 1;
            let id = *next + 100;
            self.push(JobRecord {
                id,
                scheduler_id: job.scheduler_id.clone(),
                name: job.name.clone(),
                container_name: job.container_name.clone(),
                status: JobStatus::Pending,
                node: None,
                port: job.port,
                partition: job.partition.clone(),
                resources: job.resources.clone(),
                owner_id: job.owner_id,
                domain_ready: false,
                time_used: None,
                time_left: None,
                created_at: "2026-02-11T08:00:00Z".into(),
                updated_at: "2026-02-11T08:00:00Z".into(),
            });
            Ok(id)
        }
        async fn get_job(&self, id: i64) -> AppResult<Option<JobRecord>> {
            Ok(self.get(id))
        }
        async fn get_job_by_scheduler_id(&self, sid: &str) -> AppResult<Option<JobRecord>> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .find(|j| j.scheduler_id.as_deref() == Some(sid))
                .cloned())
        }
        async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .filter(|j| j.status.is_active())
                .cloned()
                .collect())
        }
        async fn active_job_exists(&self, owner: i64, name: &str) -> AppResult<bool> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .iter()
                .any(|j| j.owner_id == owner && j.container_name == name && j.status.is_active()))
        }
        async fn update_job_status(&self, id: i64, status: JobStatus) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().expect("jobs lock");
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.status = status;
            }
            Ok(())
        }
        async fn update_job_observation(
            &self,
            id: i64,
            status: JobStatus,
            node: Option<&str>,
            time_used: Option<&str>,
            time_left: Option<&str>,
        ) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().expect("jobs lock");
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.status = status;
                job.node = node.map(str::to_string);
                job.time_used = time_used.map(str::to_string);
                job.time_left = time_left.map(str::to_string);
            }
            Ok(())
        }
        async fn set_job_port(&self, id: i64, port: Option<u16>) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().expect("jobs lock");
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.port = port;
            }
            Ok(())
        }
        async fn set_domain_ready(&self, id: i64, ready: bool) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().expect("jobs lock");
            if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                job.domain_ready = ready;
            }
            Ok(())
        }
        async fn delete_job(&self, id: i64) -> AppResult<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().expect("jobs lock");
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            Ok(jobs.len() < before)
        }
    }

    #[derive(Default)]
    struct MemTaskStore {
        tasks: StdMutex<Vec<TaskRecord>>,
        writes: AtomicUsize,
    }

    impl MemTaskStore {
        fn push(&self, task: TaskRecord) {
            self.tasks.lock().expect("tasks lock").push(task);
        }

        fn get(&self, id: &str) -> Option<TaskRecord> {
            self.tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .find(|t| t.id == id)
                .cloned()
        }

        /// Test-only shortcut standing in for the next resubmission.
        fn force_resubmitted(&self, id: &str, scheduler_id: &str) {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Configuring;
                task.scheduler_id = Some(scheduler_id.to_string());
                task.next_retry_at = None;
            }
        }
    }

    #[async_trait]
    impl TaskStorePort for MemTaskStore {
        async fn insert_task(&self, task: &NewTask) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.push(TaskRecord {
                id: task.id.clone(),
                scheduler_id: None,
                name: task.name.clone(),
                input_path: task.input_path.clone(),
                host_input_path: task.host_input_path.clone(),
                script_path: task.script_path.clone(),
                status: TaskStatus::Pending,
                resources: task.resources.clone(),
                retry_count: 0,
                next_retry_at: None,
                attempts: Vec::new(),
                progress: 0,
                output_dir: task.output_dir.clone(),
                results_path: None,
                node: None,
                owner_id: task.owner_id,
                started_at: None,
                finished_at: None,
                created_at: "2026-02-11T08:00:00Z".into(),
                updated_at: "2026-02-11T08:00:00Z".into(),
            });
            Ok(())
        }
        async fn get_task(&self, id: &str) -> AppResult<Option<TaskRecord>> {
            Ok(self.get(id))
        }
        async fn get_task_by_scheduler_id(&self, sid: &str) -> AppResult<Option<TaskRecord>> {
            Ok(self
                .tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .find(|t| t.scheduler_id.as_deref() == Some(sid))
                .cloned())
        }
        async fn list_active_tasks(&self) -> AppResult<Vec<TaskRecord>> {
            Ok(self
                .tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .filter(|t| t.status.is_active())
                .cloned()
                .collect())
        }
        async fn list_submittable_tasks(&self, now: &str) -> AppResult<Vec<TaskRecord>> {
            Ok(self
                .tasks
                .lock()
                .expect("tasks lock")
                .iter()
                .filter(|t| {
                    (t.status == TaskStatus::Pending && t.scheduler_id.is_none())
                        || (t.status.is_retry_wait()
                            && t.next_retry_at.as_deref().is_some_and(|at| at <= now))
                })
                .cloned()
                .collect())
        }
        async fn update_task_observation(
            &self,
            id: &str,
            status: TaskStatus,
            node: Option<&str>,
        ) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.status = status;
                task.node = node.map(str::to_string);
            }
            Ok(())
        }
        async fn update_task_submission(&self, id: &str, scheduler_id: &str) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.scheduler_id = Some(scheduler_id.to_string());
                task.status = TaskStatus::Configuring;
                task.next_retry_at = None;
            }
            Ok(())
        }
        async fn schedule_task_retry(
            &self,
            id: &str,
            retry_count: i64,
            status: TaskStatus,
            next_retry_at: Option<&str>,
            attempt: &TaskAttempt,
        ) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.retry_count = retry_count;
                task.status = status;
                task.next_retry_at = next_retry_at.map(str::to_string);
                task.attempts.push(attempt.clone());
            }
            Ok(())
        }
        async fn set_task_started(&self, id: &str, started_at: &str) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.started_at = Some(started_at.to_string());
            }
            Ok(())
        }
        async fn set_task_finished(
            &self,
            id: &str,
            status: TaskStatus,
            finished_at: &str,
        ) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.status = status;
                task.finished_at = Some(finished_at.to_string());
            }
            Ok(())
        }
        async fn set_task_progress(&self, id: &str, progress: i64) -> AppResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                task.progress = progress;
            }
            Ok(())
        }
        async fn delete_task(&self, id: &str) -> AppResult<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut tasks = self.tasks.lock().expect("tasks lock");
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            Ok(tasks.len() < before)
        }
    }

    #[derive(Default)]
    struct MemUserStore {
        users: StdMutex<Vec<UserRecord>>,
    }

    #[async_trait]
    impl UserStorePort for MemUserStore {
        async fn get_or_create_user(&self, username: &str) -> AppResult<UserRecord> {
            let mut users = self.users.lock().expect("users lock");
            if let Some(user) = users.iter().find(|u| u.username == username) {
                return Ok(user.clone());
            }
            let user = UserRecord {
                id: users.len() as i64 + 1,
                username: username.to_string(),
                created_at: "2026-02-11T08:00:00Z".into(),
            };
            users.push(user.clone());
            Ok(user)
        }
        async fn get_user(&self, id: i64) -> AppResult<Option<UserRecord>> {
            Ok(self
                .users
                .lock()
                .expect("users lock")
                .iter()
                .find(|u| u.id == id)
                .cloned())
        }
    }

    #[derive(Default)]
    struct MemTunnelStore {
        next_id: StdMutex<i64>,
        tunnels: StdMutex<Vec<TunnelRecord>>,
    }

    impl MemTunnelStore {
        fn all(&self) -> Vec<TunnelRecord> {
            self.tunnels.lock().expect("tunnels lock").clone()
        }
    }

    #[async_trait]
    impl TunnelStorePort for MemTunnelStore {
        async fn insert_tunnel(&self, tunnel: &NewTunnel) -> AppResult<i64> {
            let mut next = self.next_id.lock().expect("next_id lock");
            *next += 1;
            let id = *next;
            self.tunnels
                .lock()
                .expect("tunnels lock")
                .push(TunnelRecord {
                    id,
                    job_id: tunnel.job_id,
                    internal_port: tunnel.internal_port,
                    external_port: tunnel.external_port,
                    remote_port: tunnel.remote_port,
                    remote_host: tunnel.remote_host.clone(),
                    status: TunnelStatus::Pending,
                    health: TunnelHealth::Pending,
                    ssh_pid: None,
                    forwarder_pid: None,
                    last_health_check: None,
                    created_at: "2026-02-11T09:00:00Z".into(),
                    updated_at: "2026-02-11T09:00:00Z".into(),
                });
            Ok(id)
        }
        async fn get_tunnel(&self, id: i64) -> AppResult<Option<TunnelRecord>> {
            Ok(self
                .tunnels
                .lock()
                .expect("tunnels lock")
                .iter()
                .find(|t| t.id == id)
                .cloned())
        }
        async fn get_live_tunnel_for_job(&self, job_id: i64) -> AppResult<Option<TunnelRecord>> {
            Ok(self
                .tunnels
                .lock()
                .expect("tunnels lock")
                .iter()
                .find(|t| t.job_id == job_id && t.status.holds_ports())
                .cloned())
        }
        async fn list_tunnels(&self) -> AppResult<Vec<TunnelRecord>> {
            Ok(self.all())
        }
        async fn list_tunnels_in_status(
            &self,
            statuses: &[TunnelStatus],
        ) -> AppResult<Vec<TunnelRecord>> {
            Ok(self
                .all()
                .into_iter()
                .filter(|t| statuses.contains(&t.status))
                .collect())
        }
        async fn update_tunnel_status(&self, id: i64, status: TunnelStatus) -> AppResult<()> {
            let mut tunnels = self.tunnels.lock().expect("tunnels lock");
            if let Some(t) = tunnels.iter_mut().find(|t| t.id == id) {
                t.status = status;
            }
            Ok(())
        }
        async fn update_tunnel_health(
            &self,
            id: i64,
            health: TunnelHealth,
            checked_at: &str,
        ) -> AppResult<()> {
            let mut tunnels = self.tunnels.lock().expect("tunnels lock");
            if let Some(t) = tunnels.iter_mut().find(|t| t.id == id) {
                t.health = health;
                t.last_health_check = Some(checked_at.to_string());
            }
            Ok(())
        }
        async fn set_tunnel_pids(
            &self,
            id: i64,
            ssh_pid: Option<u32>,
            forwarder_pid: Option<u32>,
        ) -> AppResult<()> {
            let mut tunnels = self.tunnels.lock().expect("tunnels lock");
            if let Some(t) = tunnels.iter_mut().find(|t| t.id == id) {
                t.ssh_pid = ssh_pid;
                t.forwarder_pid = forwarder_pid;
            }
            Ok(())
        }
        async fn delete_tunnel(&self, id: i64) -> AppResult<bool> {
            let mut tunnels = self.tunnels.lock().expect("tunnels lock");
            let before = tunnels.len();
            tunnels.retain(|t| t.id != id);
            Ok(tunnels.len() < before)
        }
    }

    // ---- os / remote / proxy / clock fakes ------------------------------

    #[derive(Default)]
    struct FakeOs {
        next_pid: AtomicU32,
        alive: StdMutex<std::collections::HashMap<u32, String>>,
    }

    #[async_trait]
    impl ProcessControlPort for FakeOs {
        async fn spawn_detached(&self, spec: &SpawnSpec) -> AppResult<u32> {
            let pid = 60000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.alive
                .lock()
                .expect("alive lock")
                .insert(pid, spec.command_line());
            Ok(pid)
        }
        async fn find_pid(&self, patterns: &[String]) -> AppResult<Option<u32>> {
            Ok(self
                .alive
                .lock()
                .expect("alive lock")
                .iter()
                .find(|(_, cmd)| patterns.iter().all(|p| cmd.contains(p)))
                .map(|(pid, _)| *pid))
        }
        async fn process_info(&self, pid: u32) -> AppResult<Option<ProcessInfo>> {
            Ok(self
                .alive
                .lock()
                .expect("alive lock")
                .get(&pid)
                .map(|cmd| ProcessInfo {
                    pid,
                    command: cmd.clone(),
                    rss_kb: 1024,
                    cpu_ticks: 1,
                }))
        }
        async fn signal_terminate(&self, pid: u32) -> AppResult<bool> {
            Ok(self.alive.lock().expect("alive lock").remove(&pid).is_some())
        }
        async fn signal_kill(&self, pid: u32) -> AppResult<bool> {
            Ok(self.alive.lock().expect("alive lock").remove(&pid).is_some())
        }
    }

    #[async_trait]
    impl NetworkProbePort for FakeOs {
        async fn port_is_free(&self, _port: u16) -> AppResult<bool> {
            Ok(true)
        }
        async fn port_is_listening(&self, _port: u16, _timeout: Duration) -> AppResult<bool> {
            Ok(true)
        }
        async fn test_connectivity(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> AppResult<bool> {
            Ok(true)
        }
    }

    struct ScriptedRemoteExec {
        responses: StdMutex<std::collections::VecDeque<AppResult<ExecCapture>>>,
    }

    impl ScriptedRemoteExec {
        fn new(responses: Vec<AppResult<ExecCapture>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl RemoteExecPort for ScriptedRemoteExec {
        async fn exec_capture(&self, _command: &str) -> AppResult<ExecCapture> {
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .expect("a scripted response for every call")
        }
    }

    #[derive(Default)]
    struct RecordingProxy {
        removed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ProxyRoutePort for RecordingProxy {
        async fn add_route(
            &self,
            _domain: &str,
            _target_host: &str,
            _target_port: u16,
        ) -> AppResult<bool> {
            Ok(true)
        }
        async fn remove_route(&self, domain: &str) -> AppResult<bool> {
            self.removed
                .lock()
                .expect("removed lock")
                .push(domain.to_string());
            Ok(true)
        }
    }

    struct MutClock {
        now: StdMutex<OffsetDateTime>,
    }

    impl MutClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: StdMutex::new(
                    OffsetDateTime::from_unix_timestamp(1_770_000_000).expect("valid timestamp"),
                ),
            })
        }

        fn advance(&self, duration: Duration) {
            let mut now = self.now.lock().expect("now lock");
            *now += duration;
        }
    }

    impl ClockPort for MutClock {
        fn now_utc(&self) -> OffsetDateTime {
            *self.now.lock().expect("now lock")
        }
    }

    // ---- harness --------------------------------------------------------

    struct Harness {
        reconciler: Arc<ReconciliationLoop>,
        jobs: Arc<MemJobStore>,
        tasks: Arc<MemTaskStore>,
        users: Arc<MemUserStore>,
        tunnels: Arc<MemTunnelStore>,
        proxy: Arc<RecordingProxy>,
        clock: Arc<MutClock>,
        #[allow(dead_code)]
        shutdown_tx: watch::Sender<bool>,
    }

    fn harness(config: ReconcilerConfig, responses: Vec<AppResult<ExecCapture>>) -> Harness {
        let jobs = Arc::new(MemJobStore::default());
        let tasks = Arc::new(MemTaskStore::default());
        let users = Arc::new(MemUserStore::default());
        let tunnel_store = Arc::new(MemTunnelStore::default());
        let os = Arc::new(FakeOs::default());
        let clock = MutClock::new();
        let proxy = Arc::new(RecordingProxy::default());

        let allocator = Arc::new(PortAllocator::new(
            AllocatorConfig {
                tunnel_ports: PortSpan::new(9000, 9020),
                ..AllocatorConfig::default()
            },
            jobs.clone() as Arc<dyn JobStorePort>,
            tunnel_store.clone() as Arc<dyn TunnelStorePort>,
            os.clone() as Arc<dyn NetworkProbePort>,
            clock.clone() as Arc<dyn ClockPort>,
        ));
        let mut pm_config = ProcessManagerConfig::new("svc_causeway", "hpc-login01");
        pm_config.settle_delay = Duration::from_millis(1);
        pm_config.terminate_grace = Duration::from_millis(10);
        let procman = Arc::new(ProcessManager::new(
            pm_config,
            os.clone() as Arc<dyn ProcessControlPort>,
            os.clone() as Arc<dyn NetworkProbePort>,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::new(TunnelOrchestrator::new(
            TunnelOrchestratorConfig::default(),
            tunnel_store.clone() as Arc<dyn TunnelStorePort>,
            jobs.clone() as Arc<dyn JobStorePort>,
            allocator,
            procman,
            clock.clone() as Arc<dyn ClockPort>,
            Arc::new(NoopEventSink),
            shutdown_rx,
        ));

        let scheduler = Arc::new(SchedulerClient::new(
            ScriptedRemoteExec::new(responses),
            BreakerConfig::default(),
        ));
        let reconciler = Arc::new(ReconciliationLoop::new(
            config,
            scheduler,
            jobs.clone() as Arc<dyn JobStorePort>,
            tasks.clone() as Arc<dyn TaskStorePort>,
            users.clone() as Arc<dyn UserStorePort>,
            orchestrator,
            proxy.clone() as Arc<dyn ProxyRoutePort>,
            Arc::new(NoopEventSink),
            clock.clone() as Arc<dyn ClockPort>,
        ));
        Harness {
            reconciler,
            jobs,
            tasks,
            users,
            tunnels: tunnel_store,
            proxy,
            clock,
            shutdown_tx,
        }
    }

    fn listing_line(id: &str, name: &str, state: &str, nodes: &str) -> String {
        format!(
            "{id}|cpu_bycore_q2|{name}|svc_causeway|{state}|16G|0:10|5:00:00|{nodes}|2026-02-11T09:00:00|2026-02-11T09:01:00|None"
        )
    }

    fn listing(lines: &[String]) -> AppResult<ExecCapture> {
        Ok(ExecCapture {
            stdout: lines.join("\n").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }

    fn empty_listing() -> AppResult<ExecCapture> {
        listing(&[])
    }

    fn sbatch_ok(id: &str) -> AppResult<ExecCapture> {
        Ok(ExecCapture {
            stdout: format!("Submitted batch job {id}\n").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }

    fn fetch_failure() -> AppResult<ExecCapture> {
        Err(AppError::new(
            AppErrorKind::Aborted,
            codes::CONNECTION_FAILURE,
        ))
    }

    fn seed_job(id: i64, scheduler_id: &str, status: JobStatus) -> JobRecord {
        JobRecord {
            id,
            scheduler_id: Some(scheduler_id.to_string()),
            name: format!("cw-job-alice-nb{id}"),
            container_name: format!("nb{id}"),
            status,
            node: None,
            port: Some(8642),
            partition: "cpu_bycore_q2".into(),
            resources: ResourceRequest {
                cpus: 8,
                memory_gb: 16,
                gpus: 0,
                nodes: 1,
                time_limit: "06:00:00".into(),
            },
            owner_id: 1,
            domain_ready: false,
            time_used: None,
            time_left: None,
            created_at: "2026-02-11T08:00:00Z".into(),
            updated_at: "2026-02-11T08:00:00Z".into(),
        }
    }

    fn seed_task(id: &str, scheduler_id: Option<&str>, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            scheduler_id: scheduler_id.map(str::to_string),
            name: format!("sim {id}"),
            input_path: "/data/in.sim".into(),
            host_input_path: "/srv/data/in.sim".into(),
            script_path: format!("/srv/scripts/{id}.sbatch"),
            status,
            resources: ResourceRequest {
                cpus: 4,
                memory_gb: 8,
                gpus: 0,
                nodes: 1,
                time_limit: "01:00:00".into(),
            },
            retry_count: 0,
            next_retry_at: None,
            attempts: Vec::new(),
            progress: 0,
            output_dir: "/srv/out".into(),
            results_path: None,
            node: None,
            owner_id: 1,
            started_at: None,
            finished_at: None,
            created_at: "2026-02-11T08:00:00Z".into(),
            updated_at: "2026-02-11T08:00:00Z".into(),
        }
    }

    async fn wait_for_tunnel_status(
        store: &MemTunnelStore,
        status: TunnelStatus,
    ) -> Option<TunnelRecord> {
        for _ in 0..100 {
            if let Some(t) = store.all().into_iter().find(|t| t.status == status) {
                return Some(t);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    // ---- tests ----------------------------------------------------------

    #[tokio::test]
    async fn pending_to_running_creates_tunnel() {
        let rows = vec![listing_line("4821001", "cw-job-alice-nb1", "RUNNING", "node03")];
        let h = harness(ReconcilerConfig::default(), vec![listing(&rows)]);
        h.jobs.push(seed_job(1, "4821001", JobStatus::Pending));

        h.reconciler.run_cycle().await.expect("cycle");

        let job = h.jobs.get(1).expect("job");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.node.as_deref(), Some("node03"));
        assert_eq!(h.tunnels.all().len(), 1, "tunnel row must exist");

        let tunnel = wait_for_tunnel_status(&h.tunnels, TunnelStatus::Active)
            .await
            .expect("tunnel becomes active in the background");
        assert!(tunnel.ssh_pid.is_some() && tunnel.forwarder_pid.is_some());
    }

    #[tokio::test]
    async fn vanished_job_completes_after_consecutive_misses() {
        let h = harness(
            ReconcilerConfig::default(),
            vec![empty_listing(), empty_listing(), empty_listing()],
        );
        let job = seed_job(1, "4821001", JobStatus::Running);
        h.jobs.push(job.clone());
        h.tunnels
            .insert_tunnel(&NewTunnel {
                job_id: 1,
                internal_port: 9000,
                external_port: 9001,
                remote_port: 8642,
                remote_host: "node03".into(),
            })
            .await
            .expect("seed tunnel");
        h.tunnels
            .update_tunnel_status(1, TunnelStatus::Active)
            .await
            .expect("seed status");

        // Two misses: still RUNNING.
        h.reconciler.run_cycle().await.expect("cycle 1");
        h.reconciler.run_cycle().await.expect("cycle 2");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Running);

        // Third consecutive miss crosses the threshold.
        h.reconciler.run_cycle().await.expect("cycle 3");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Completed);
        assert_eq!(h.tunnels.all()[0].status, TunnelStatus::Closed);
        assert_eq!(
            h.proxy.removed.lock().expect("lock").as_slice(),
            ["nb1-1".to_string()]
        );
    }

    #[tokio::test]
    async fn fetch_failure_skips_cycle_and_resets_nothing() {
        let h = harness(
            ReconcilerConfig::default(),
            vec![
                empty_listing(),
                fetch_failure(),
                empty_listing(),
                empty_listing(),
            ],
        );
        h.jobs.push(seed_job(1, "4821001", JobStatus::Running));

        h.reconciler.run_cycle().await.expect("miss 1");
        // The failed fetch must not count as a miss.
        h.reconciler.run_cycle().await.expect("failed fetch");
        h.reconciler.run_cycle().await.expect("miss 2");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Running);
        h.reconciler.run_cycle().await.expect("miss 3");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unchanged_snapshot_writes_nothing() {
        let rows = vec![listing_line("4821001", "cw-job-alice-nb1", "RUNNING", "node03")];
        let h = harness(
            ReconcilerConfig::default(),
            vec![listing(&rows), listing(&rows)],
        );
        let mut job = seed_job(1, "4821001", JobStatus::Running);
        job.node = Some("node03".into());
        job.time_used = Some("0:10".into());
        job.time_left = Some("5:00:00".into());
        h.jobs.push(job);
        // Matching ACTIVE tunnel so no establishment is triggered.
        h.tunnels
            .insert_tunnel(&NewTunnel {
                job_id: 1,
                internal_port: 9000,
                external_port: 9001,
                remote_port: 8642,
                remote_host: "node03".into(),
            })
            .await
            .expect("seed tunnel");
        h.tunnels
            .update_tunnel_status(1, TunnelStatus::Active)
            .await
            .expect("seed status");

        h.reconciler.run_cycle().await.expect("cycle 1");
        h.reconciler.run_cycle().await.expect("cycle 2");
        assert_eq!(h.jobs.writes(), 0, "no-op cycles must not write");
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_resurrected() {
        let rows = vec![listing_line("4821001", "cw-job-alice-nb1", "RUNNING", "node03")];
        let h = harness(ReconcilerConfig::default(), vec![listing(&rows)]);
        h.jobs.push(seed_job(1, "4821001", JobStatus::Completed));

        h.reconciler.run_cycle().await.expect("cycle");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Completed);
        assert_eq!(h.jobs.count(), 1, "no duplicate row for a finished job");
        assert_eq!(h.jobs.writes(), 0);
    }

    #[tokio::test]
    async fn terminal_snapshot_state_completes_job() {
        let rows = vec![listing_line("4821001", "cw-job-alice-nb1", "FAILED", "node03")];
        let h = harness(ReconcilerConfig::default(), vec![listing(&rows)]);
        h.jobs.push(seed_job(1, "4821001", JobStatus::Running));

        h.reconciler.run_cycle().await.expect("cycle");
        assert_eq!(h.jobs.get(1).expect("job").status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn task_retry_ladder_caps_at_three() {
        let failed = |sid: &str| vec![listing_line(sid, "cw-sim-t1", "FAILED", "node03")];
        let h = harness(
            ReconcilerConfig::default(),
            vec![
                listing(&failed("201")),
                listing(&failed("202")),
                listing(&failed("203")),
                listing(&failed("204")),
            ],
        );
        h.tasks
            .push(seed_task("t1", Some("201"), TaskStatus::Configuring));

        h.reconciler.run_cycle().await.expect("failure 1");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::ErrorRetry1);
        assert_eq!(task.retry_count, 1);
        let first_delay = task.next_retry_at.clone().expect("retry scheduled");

        h.tasks.force_resubmitted("t1", "202");
        h.clock.advance(Duration::from_secs(60));
        h.reconciler.run_cycle().await.expect("failure 2");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::ErrorRetry2);
        assert_eq!(task.retry_count, 2);
        assert!(task.next_retry_at.clone().expect("scheduled") > first_delay);

        h.tasks.force_resubmitted("t1", "203");
        h.reconciler.run_cycle().await.expect("failure 3");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::ErrorRetry3);
        assert_eq!(task.retry_count, 3);
        assert!(task.next_retry_at.is_some(), "third retry still pending");

        h.tasks.force_resubmitted("t1", "204");
        h.reconciler.run_cycle().await.expect("failure 4");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::ErrorRetry3);
        assert_eq!(task.retry_count, 3, "retry counter never exceeds 3");
        assert!(task.next_retry_at.is_none());
        assert!(task.finished_at.is_some());
        assert!(task.is_terminal());
        assert_eq!(task.attempts.len(), 4);
    }

    #[tokio::test]
    async fn running_task_gets_started_timestamp_once() {
        let rows = vec![listing_line("201", "cw-sim-t1", "RUNNING", "node05")];
        let h = harness(
            ReconcilerConfig::default(),
            vec![listing(&rows), listing(&rows)],
        );
        h.tasks
            .push(seed_task("t1", Some("201"), TaskStatus::Configuring));

        h.reconciler.run_cycle().await.expect("cycle 1");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.node.as_deref(), Some("node05"));
        let started = task.started_at.clone().expect("started_at set");

        h.clock.advance(Duration::from_secs(90));
        h.reconciler.run_cycle().await.expect("cycle 2");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.started_at.as_deref(), Some(started.as_str()));
    }

    #[tokio::test]
    async fn due_tasks_are_submitted() {
        let h = harness(
            ReconcilerConfig::default(),
            vec![empty_listing(), sbatch_ok("301")],
        );
        h.tasks.push(seed_task("t1", None, TaskStatus::Pending));

        h.reconciler.run_cycle().await.expect("cycle");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::Configuring);
        assert_eq!(task.scheduler_id.as_deref(), Some("301"));
        assert!(task.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn retry_wait_task_is_resubmitted_once_due() {
        let h = harness(
            ReconcilerConfig::default(),
            vec![empty_listing(), empty_listing(), sbatch_ok("302")],
        );
        let mut task = seed_task("t1", Some("201"), TaskStatus::ErrorRetry1);
        task.retry_count = 1;
        task.next_retry_at = Some("2026-02-11T09:05:00Z".into());
        h.tasks.push(task);

        // Clock starts before the retry deadline: nothing submitted.
        h.reconciler.run_cycle().await.expect("cycle 1");
        assert_eq!(
            h.tasks.get("t1").expect("task").status,
            TaskStatus::ErrorRetry1
        );

        h.clock.advance(Duration::from_secs(14 * 24 * 3600));
        h.reconciler.run_cycle().await.expect("cycle 2");
        let task = h.tasks.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::Configuring);
        assert_eq!(task.scheduler_id.as_deref(), Some("302"));
        assert_eq!(task.retry_count, 1, "submission does not touch the counter");
    }

    #[tokio::test]
    async fn orphans_are_adopted_when_enabled() {
        let rows = vec![
            listing_line("4821009", "cw-job-bob-shell", "RUNNING", "node05"),
            listing_line("4821010", "nightly-backup", "RUNNING", "admin01"),
        ];
        let config = ReconcilerConfig {
            adopt_orphans: true,
            ..ReconcilerConfig::default()
        };
        let h = harness(config, vec![listing(&rows)]);

        h.reconciler.run_cycle().await.expect("cycle");

        assert_eq!(h.jobs.count(), 1, "only the convention-named job is adopted");
        let adopted = h
            .jobs
            .get_job_by_scheduler_id("4821009")
            .await
            .expect("lookup")
            .expect("adopted row");
        assert_eq!(adopted.container_name, "shell");
        assert_eq!(adopted.status, JobStatus::Running);
        assert_eq!(adopted.node.as_deref(), Some("node05"));
        let bob = h
            .users
            .get_or_create_user("bob")
            .await
            .expect("user lookup");
        assert_eq!(adopted.owner_id, bob.id);
    }

    #[tokio::test]
    async fn orphans_are_ignored_when_disabled() {
        let rows = vec![listing_line("4821009", "cw-job-bob-shell", "RUNNING", "node05")];
        let h = harness(ReconcilerConfig::default(), vec![listing(&rows)]);
        h.reconciler.run_cycle().await.expect("cycle");
        assert_eq!(h.jobs.count(), 0);
    }
}
