// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{Mutex, Semaphore, watch};

use crate::app::allocator::{PortAllocator, PortPurpose};
use crate::app::errors::AppResult;
use crate::app::ports::{ClockPort, EventSinkPort, JobStorePort, TunnelStorePort};
use crate::app::procman::ProcessManager;
use crate::app::types::{
    JobRecord, NewTunnel, TunnelHealth, TunnelRecord, TunnelStatus,
};

pub const TUNNEL_EVENT_CHANNEL: &str = "tunnels";

#[derive(Debug, Clone)]
pub struct TunnelOrchestratorConfig {
    /// Simultaneous tunnel establishments; keeps a burst of newly-RUNNING
    /// jobs from flooding the SSH host.
    pub establish_concurrency: usize,
    /// Tunnels older than this are swept regardless of state.
    pub max_tunnel_age: Duration,
    /// Host the external-port connectivity test dials.
    pub connect_host: String,
}

impl Default for TunnelOrchestratorConfig {
    fn default() -> Self {
        Self {
            establish_concurrency: 3,
            max_tunnel_age: Duration::from_secs(12 * 3600),
            connect_host: "127.0.0.1".to_string(),
        }
    }
}

/// Owns the tunnel lifecycle: PENDING → CONNECTING → ACTIVE, with FAILED on
/// setup errors and DEAD/CLOSED on the way out. Health runs on a parallel
/// axis updated by the periodic check.
///
/// All port handling goes through the allocator and all process handling
/// through the process manager; this component holds the state machine and
/// the persistence of each transition.
pub struct TunnelOrchestrator {
    config: TunnelOrchestratorConfig,
    tunnels: Arc<dyn TunnelStorePort>,
    jobs: Arc<dyn JobStorePort>,
    allocator: Arc<PortAllocator>,
    procman: Arc<ProcessManager>,
    clock: Arc<dyn ClockPort>,
    events: Arc<dyn EventSinkPort>,
    establish_sem: Semaphore,
    /// Jobs with an establishment in flight; makes `get_or_create`
    /// idempotent under concurrent callers.
    in_flight: Mutex<HashSet<i64>>,
    shutdown: watch::Receiver<bool>,
}

/// What `prepare` decided: an existing tunnel to hand back, or a fresh
/// PENDING row that still needs to be driven to ACTIVE.
enum Prepared {
    Existing(TunnelRecord),
    NeedsEstablish(TunnelRecord),
    Unavailable,
}

impl TunnelOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TunnelOrchestratorConfig,
        tunnels: Arc<dyn TunnelStorePort>,
        jobs: Arc<dyn JobStorePort>,
        allocator: Arc<PortAllocator>,
        procman: Arc<ProcessManager>,
        clock: Arc<dyn ClockPort>,
        events: Arc<dyn EventSinkPort>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let establish_sem = Semaphore::new(config.establish_concurrency.max(1));
        Self {
            config,
            tunnels,
            jobs,
            allocator,
            procman,
            clock,
            events,
            establish_sem,
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Hand back the job's tunnel, creating one when needed. The returned
    /// record may still be PENDING: establishment continues in the
    /// background and callers that need a ready tunnel poll or use
    /// [`TunnelOrchestrator::ensure_ready`]. `None` means the job is not
    /// tunnelable right now (no node, no port, or port range exhausted);
    /// the next reconciliation cycle retries.
    pub async fn get_or_create(self: &Arc<Self>, job: &JobRecord) -> AppResult<Option<TunnelRecord>> {
        match self.prepare(job).await? {
            Prepared::Existing(record) => Ok(Some(record)),
            Prepared::NeedsEstablish(record) => {
                self.spawn_establish(record.id, job.id);
                Ok(Some(record))
            }
            Prepared::Unavailable => Ok(None),
        }
    }

    /// Synchronous variant: awaits the establishment before returning, so
    /// the result is ACTIVE or FAILED rather than PENDING.
    pub async fn ensure_ready(self: &Arc<Self>, job: &JobRecord) -> AppResult<Option<TunnelRecord>> {
        match self.prepare(job).await? {
            Prepared::Existing(record) => Ok(Some(record)),
            Prepared::NeedsEstablish(record) => {
                self.establish(record.id, job.id).await;
                self.tunnels.get_tunnel(record.id).await
            }
            Prepared::Unavailable => Ok(None),
        }
    }

    async fn prepare(&self, job: &JobRecord) -> AppResult<Prepared> {
        let Some(node) = job.node.clone() else {
            tracing::warn!("job {} has no assigned node yet, cannot tunnel", job.id);
            return Ok(Prepared::Unavailable);
        };
        let Some(remote_port) = job.port else {
            tracing::warn!("job {} has no container port, cannot tunnel", job.id);
            return Ok(Prepared::Unavailable);
        };

        // Held across the whole decision so two concurrent callers cannot
        // both conclude "no tunnel yet" and build duplicates.
        let mut in_flight = self.in_flight.lock().await;

        if in_flight.contains(&job.id) {
            return Ok(match self.tunnels.get_live_tunnel_for_job(job.id).await? {
                Some(record) => Prepared::Existing(record),
                None => Prepared::Unavailable,
            });
        }

        if let Some(existing) = self.tunnels.get_live_tunnel_for_job(job.id).await? {
            match existing.status {
                TunnelStatus::Pending | TunnelStatus::Connecting => {
                    return Ok(Prepared::Existing(existing));
                }
                TunnelStatus::Active => {
                    let health = self.health_check(&existing).await?;
                    if matches!(health, TunnelHealth::Healthy | TunnelHealth::Degraded) {
                        return Ok(Prepared::Existing(existing));
                    }
                    tracing::info!(
                        "tunnel {} for job {} is {health}, recreating",
                        existing.id,
                        job.id
                    );
                    self.close_tunnel(&existing).await?;
                }
                _ => {}
            }
        }

        let resource = format!("job-{}", job.id);
        let Some(internal_port) = self
            .allocator
            .allocate(PortPurpose::TunnelInternal, &resource)
            .await?
        else {
            tracing::warn!("no internal port available for job {}", job.id);
            return Ok(Prepared::Unavailable);
        };
        let Some(external_port) = self
            .allocator
            .allocate(PortPurpose::TunnelExternal, &resource)
            .await?
        else {
            self.allocator.release(internal_port).await;
            tracing::warn!("no external port available for job {}", job.id);
            return Ok(Prepared::Unavailable);
        };

        let new_tunnel = NewTunnel {
            job_id: job.id,
            internal_port,
            external_port,
            remote_port,
            remote_host: node,
        };
        let tunnel_id = match self.tunnels.insert_tunnel(&new_tunnel).await {
            Ok(id) => id,
            Err(err) => {
                self.allocator.release(internal_port).await;
                self.allocator.release(external_port).await;
                return Err(err);
            }
        };
        in_flight.insert(job.id);

        self.publish(json!({
            "event": "tunnel.pending",
            "tunnel_id": tunnel_id,
            "job_id": job.id,
            "internal_port": internal_port,
            "external_port": external_port,
        }));

        match self.tunnels.get_tunnel(tunnel_id).await? {
            Some(record) => Ok(Prepared::NeedsEstablish(record)),
            None => Ok(Prepared::Unavailable),
        }
    }

    fn spawn_establish(self: &Arc<Self>, tunnel_id: i64, job_id: i64) {
        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = orch.establish(tunnel_id, job_id) => {}
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    tracing::info!("shutdown cancelled establishment of tunnel {tunnel_id}");
                    orch.abort_establishment(tunnel_id).await;
                    orch.clear_in_flight(job_id).await;
                }
            }
        });
    }

    /// Drives one PENDING tunnel to ACTIVE or FAILED, then releases the
    /// job's in-flight slot. Errors are logged, never propagated: the row
    /// ends in a state the next cycle can act on either way.
    async fn establish(self: &Arc<Self>, tunnel_id: i64, job_id: i64) {
        let Ok(_permit) = self.establish_sem.acquire().await else {
            self.clear_in_flight(job_id).await;
            return;
        };
        if let Err(err) = self.drive_establish(tunnel_id).await {
            tracing::warn!("tunnel {tunnel_id} establishment failed: {err}");
        }
        self.clear_in_flight(job_id).await;
    }

    async fn drive_establish(&self, tunnel_id: i64) -> AppResult<()> {
        let Some(tunnel) = self.tunnels.get_tunnel(tunnel_id).await? else {
            return Ok(());
        };
        if tunnel.status != TunnelStatus::Pending {
            return Ok(());
        }

        self.tunnels
            .update_tunnel_status(tunnel_id, TunnelStatus::Connecting)
            .await?;

        let ssh_pid = self
            .procman
            .create_ssh_tunnel(tunnel.internal_port, tunnel.remote_port, &tunnel.remote_host)
            .await?;
        let Some(ssh_pid) = ssh_pid else {
            return self
                .fail_establishment(&tunnel, "ssh port-forward did not come up")
                .await;
        };
        self.tunnels
            .set_tunnel_pids(tunnel_id, Some(ssh_pid), None)
            .await?;

        let forwarder_pid = self
            .procman
            .create_forwarder(tunnel.external_port, tunnel.internal_port)
            .await?;
        let Some(forwarder_pid) = forwarder_pid else {
            self.procman.terminate_process(ssh_pid).await;
            self.tunnels.set_tunnel_pids(tunnel_id, None, None).await?;
            return self
                .fail_establishment(&tunnel, "forwarder did not come up")
                .await;
        };
        self.tunnels
            .set_tunnel_pids(tunnel_id, Some(ssh_pid), Some(forwarder_pid))
            .await?;
        self.tunnels
            .update_tunnel_status(tunnel_id, TunnelStatus::Active)
            .await?;

        let connected = self
            .procman
            .test_port_connectivity(&self.config.connect_host, tunnel.external_port)
            .await;
        // Both processes verified up; a failed first probe through a fresh
        // tunnel downgrades rather than fails.
        let health = if connected {
            TunnelHealth::Healthy
        } else {
            TunnelHealth::Degraded
        };
        self.tunnels
            .update_tunnel_health(tunnel_id, health, &self.now_string())
            .await?;

        tracing::info!(
            "tunnel {tunnel_id} active: {}:{} -> {}:{} (ssh={ssh_pid}, forwarder={forwarder_pid}, {health})",
            tunnel.external_port,
            tunnel.internal_port,
            tunnel.remote_host,
            tunnel.remote_port,
        );
        self.publish(json!({
            "event": "tunnel.active",
            "tunnel_id": tunnel_id,
            "job_id": tunnel.job_id,
            "external_port": tunnel.external_port,
            "health": health.as_str(),
        }));
        Ok(())
    }

    async fn fail_establishment(&self, tunnel: &TunnelRecord, reason: &str) -> AppResult<()> {
        tracing::warn!("tunnel {} failed: {reason}", tunnel.id);
        self.tunnels
            .update_tunnel_status(tunnel.id, TunnelStatus::Failed)
            .await?;
        self.allocator.release(tunnel.internal_port).await;
        self.allocator.release(tunnel.external_port).await;
        self.publish(json!({
            "event": "tunnel.failed",
            "tunnel_id": tunnel.id,
            "job_id": tunnel.job_id,
            "reason": reason,
        }));
        Ok(())
    }

    /// Cancellation path for a half-built tunnel: terminate whatever
    /// already started, then the normal close bookkeeping.
    async fn abort_establishment(&self, tunnel_id: i64) {
        let tunnel = match self.tunnels.get_tunnel(tunnel_id).await {
            Ok(Some(tunnel)) => tunnel,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("could not load tunnel {tunnel_id} for abort: {err}");
                return;
            }
        };
        if let Err(err) = self.close_tunnel(&tunnel).await {
            tracing::warn!("abort of tunnel {tunnel_id} left residue: {err}");
        }
    }

    /// Combined process + connectivity verdict, persisted on the row.
    ///
    /// HEALTHY needs both tracked processes alive and a passing probe.
    /// A confirmed-dead tracked process is UNHEALTHY. Tunnels from before
    /// PID tracking are DEGRADED as long as the port still answers.
    pub async fn health_check(&self, tunnel: &TunnelRecord) -> AppResult<TunnelHealth> {
        let ssh_alive = match tunnel.ssh_pid {
            Some(pid) => self.procman.check_process_health(pid).await.is_some(),
            None => false,
        };
        let forwarder_alive = match tunnel.forwarder_pid {
            Some(pid) => self.procman.check_process_health(pid).await.is_some(),
            None => false,
        };
        let connected = self
            .procman
            .test_port_connectivity(&self.config.connect_host, tunnel.external_port)
            .await;

        let health = if tunnel.ssh_pid.is_none() && tunnel.forwarder_pid.is_none() {
            if connected {
                TunnelHealth::Degraded
            } else {
                TunnelHealth::Unhealthy
            }
        } else if (tunnel.ssh_pid.is_some() && !ssh_alive)
            || (tunnel.forwarder_pid.is_some() && !forwarder_alive)
        {
            TunnelHealth::Unhealthy
        } else if connected {
            TunnelHealth::Healthy
        } else {
            TunnelHealth::Degraded
        };

        self.tunnels
            .update_tunnel_health(tunnel.id, health, &self.now_string())
            .await?;
        Ok(health)
    }

    /// Close-and-recreate. Best effort: every failure is logged and
    /// swallowed so the periodic health loop can never be crashed by one
    /// broken tunnel.
    pub async fn repair(self: &Arc<Self>, tunnel: &TunnelRecord) {
        tracing::info!("repairing tunnel {} for job {}", tunnel.id, tunnel.job_id);
        if let Err(err) = self.close_tunnel(tunnel).await {
            tracing::warn!("repair: closing tunnel {} failed: {err}", tunnel.id);
            return;
        }
        let job = match self.jobs.get_job(tunnel.job_id).await {
            Ok(Some(job)) if job.status.is_active() => job,
            Ok(_) => {
                tracing::debug!(
                    "job {} gone or inactive, not recreating its tunnel",
                    tunnel.job_id
                );
                return;
            }
            Err(err) => {
                tracing::warn!("repair: loading job {} failed: {err}", tunnel.job_id);
                return;
            }
        };
        match self.ensure_ready(&job).await {
            Ok(Some(fresh)) => {
                tracing::info!(
                    "tunnel {} repaired as tunnel {} ({})",
                    tunnel.id,
                    fresh.id,
                    fresh.status
                );
            }
            Ok(None) => tracing::warn!("repair could not recreate tunnel for job {}", job.id),
            Err(err) => tracing::warn!("repair of tunnel {} failed: {err}", tunnel.id),
        }
    }

    /// Terminate both processes, release both ports, mark the row CLOSED.
    /// The row itself is left for the cleanup sweep so a crash mid-close
    /// still converges.
    pub async fn close_tunnel(&self, tunnel: &TunnelRecord) -> AppResult<()> {
        if let Some(pid) = tunnel.ssh_pid {
            self.procman.terminate_process(pid).await;
        }
        if let Some(pid) = tunnel.forwarder_pid {
            self.procman.terminate_process(pid).await;
        }
        self.allocator.release(tunnel.internal_port).await;
        self.allocator.release(tunnel.external_port).await;
        self.tunnels.set_tunnel_pids(tunnel.id, None, None).await?;
        self.tunnels
            .update_tunnel_status(tunnel.id, TunnelStatus::Closed)
            .await?;
        self.publish(json!({
            "event": "tunnel.closed",
            "tunnel_id": tunnel.id,
            "job_id": tunnel.job_id,
        }));
        Ok(())
    }

    /// Cascade entry point for job completion and deletion.
    pub async fn close_for_job(&self, job_id: i64) -> AppResult<()> {
        if let Some(tunnel) = self.tunnels.get_live_tunnel_for_job(job_id).await? {
            self.close_tunnel(&tunnel).await?;
        }
        Ok(())
    }

    /// Re-verify every ACTIVE tunnel; repair the unhealthy ones. One
    /// broken tunnel never aborts the pass.
    pub async fn health_pass(self: &Arc<Self>) -> AppResult<()> {
        let active = self
            .tunnels
            .list_tunnels_in_status(&[TunnelStatus::Active])
            .await?;
        for tunnel in active {
            match self.health_check(&tunnel).await {
                Ok(TunnelHealth::Unhealthy) => self.repair(&tunnel).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("health check of tunnel {} failed: {err}", tunnel.id);
                }
            }
        }
        Ok(())
    }

    /// Periodic health verification until shutdown.
    pub async fn run_health_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.health_pass().await {
                        tracing::warn!("tunnel health pass failed: {err}");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    tracing::info!("tunnel health loop stopping");
                    return;
                }
            }
        }
    }

    /// Periodic garbage collection until shutdown.
    pub async fn run_cleanup_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.cleanup_sweep().await {
                        tracing::warn!("tunnel cleanup sweep failed: {err}");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    tracing::info!("tunnel cleanup loop stopping");
                    return;
                }
            }
        }
    }

    /// Delete rows nothing serves anymore: DEAD/CLOSED/FAILED leftovers,
    /// over-age tunnels, and ACTIVE rows whose external port is silent
    /// (state drift from a prior crash).
    pub async fn cleanup_sweep(&self) -> AppResult<()> {
        let now = self.clock.now_utc();
        for tunnel in self.tunnels.list_tunnels().await? {
            if let Err(err) = self.sweep_one(&tunnel, now).await {
                tracing::warn!("sweep of tunnel {} failed: {err}", tunnel.id);
            }
        }
        Ok(())
    }

    async fn sweep_one(&self, tunnel: &TunnelRecord, now: OffsetDateTime) -> AppResult<()> {
        match tunnel.status {
            TunnelStatus::Dead | TunnelStatus::Closed | TunnelStatus::Failed => {
                self.reap_row(tunnel).await
            }
            _ => {
                if self.is_over_age(tunnel, now) {
                    tracing::info!("tunnel {} exceeded max age, closing", tunnel.id);
                    self.close_tunnel(tunnel).await?;
                    return self.reap_row(tunnel).await;
                }
                if tunnel.status == TunnelStatus::Active
                    && !self.procman.port_is_served(tunnel.external_port).await
                {
                    tracing::warn!(
                        "tunnel {} is ACTIVE in the database but port {} is silent, reaping",
                        tunnel.id,
                        tunnel.external_port
                    );
                    self.close_tunnel(tunnel).await?;
                    return self.reap_row(tunnel).await;
                }
                Ok(())
            }
        }
    }

    async fn reap_row(&self, tunnel: &TunnelRecord) -> AppResult<()> {
        // Confirm nothing is still running before the row disappears.
        if let Some(pid) = tunnel.ssh_pid {
            self.procman.terminate_process(pid).await;
        }
        if let Some(pid) = tunnel.forwarder_pid {
            self.procman.terminate_process(pid).await;
        }
        self.allocator.release(tunnel.internal_port).await;
        self.allocator.release(tunnel.external_port).await;
        self.tunnels.delete_tunnel(tunnel.id).await?;
        tracing::debug!("deleted tunnel row {}", tunnel.id);
        Ok(())
    }

    fn is_over_age(&self, tunnel: &TunnelRecord, now: OffsetDateTime) -> bool {
        let Ok(created) = OffsetDateTime::parse(&tunnel.created_at, &Rfc3339) else {
            return false;
        };
        let Ok(max_age) = TimeDuration::try_from(self.config.max_tunnel_age) else {
            return false;
        };
        now - created > max_age
    }

    /// Startup pass: rebuild port bookkeeping, re-link ACTIVE rows to the
    /// processes that outlived the previous daemon, and fail whatever was
    /// mid-establishment when it died.
    pub async fn recover(self: &Arc<Self>) -> AppResult<()> {
        self.allocator.initialize_from_storage().await?;

        let live = self
            .tunnels
            .list_tunnels_in_status(&[
                TunnelStatus::Pending,
                TunnelStatus::Connecting,
                TunnelStatus::Active,
            ])
            .await?;
        for tunnel in live {
            match tunnel.status {
                TunnelStatus::Pending | TunnelStatus::Connecting => {
                    tracing::info!(
                        "tunnel {} was mid-establishment at shutdown, tearing down",
                        tunnel.id
                    );
                    if let Err(err) = self.close_tunnel(&tunnel).await {
                        tracing::warn!("teardown of tunnel {} failed: {err}", tunnel.id);
                    }
                }
                TunnelStatus::Active => {
                    if let Err(err) = self.relink_active(&tunnel).await {
                        tracing::warn!("recovery of tunnel {} failed: {err}", tunnel.id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn relink_active(&self, tunnel: &TunnelRecord) -> AppResult<()> {
        let ssh_pid = match tunnel.ssh_pid {
            Some(pid) if self.procman.check_process_health(pid).await.is_some() => Some(pid),
            _ => {
                self.procman
                    .find_ssh_tunnel(tunnel.internal_port, tunnel.remote_port, &tunnel.remote_host)
                    .await
            }
        };
        let forwarder_pid = match tunnel.forwarder_pid {
            Some(pid) if self.procman.check_process_health(pid).await.is_some() => Some(pid),
            _ => self.procman.find_forwarder(tunnel.external_port).await,
        };

        if ssh_pid.is_none() && forwarder_pid.is_none() {
            tracing::warn!(
                "tunnel {} has no surviving processes, marking DEAD",
                tunnel.id
            );
            self.tunnels
                .update_tunnel_status(tunnel.id, TunnelStatus::Dead)
                .await?;
            self.tunnels
                .update_tunnel_health(tunnel.id, TunnelHealth::Unhealthy, &self.now_string())
                .await?;
            return Ok(());
        }

        self.tunnels
            .set_tunnel_pids(tunnel.id, ssh_pid, forwarder_pid)
            .await?;
        let health = if ssh_pid.is_some() && forwarder_pid.is_some() {
            TunnelHealth::Unknown // next health pass decides
        } else {
            TunnelHealth::Degraded
        };
        self.tunnels
            .update_tunnel_health(tunnel.id, health, &self.now_string())
            .await?;
        tracing::info!(
            "re-linked tunnel {} to pids ssh={ssh_pid:?} forwarder={forwarder_pid:?}",
            tunnel.id
        );
        Ok(())
    }

    async fn clear_in_flight(&self, job_id: i64) {
        self.in_flight.lock().await.remove(&job_id);
    }

    fn now_string(&self) -> String {
        self.clock
            .now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::new())
    }

    fn publish(&self, event: serde_json::Value) {
        self.events.publish(TUNNEL_EVENT_CHANNEL, event);
    }
}
