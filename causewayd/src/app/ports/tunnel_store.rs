// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{NewTunnel, TunnelHealth, TunnelRecord, TunnelStatus};

#[async_trait]
pub trait TunnelStorePort: Send + Sync {
    async fn insert_tunnel(&self, tunnel: &NewTunnel) -> AppResult<i64>;
    async fn get_tunnel(&self, id: i64) -> AppResult<Option<TunnelRecord>>;
    /// The live (not CLOSED/FAILED/DEAD) tunnel for a job, if any.
    /// At most one such tunnel exists per job.
    async fn get_live_tunnel_for_job(&self, job_id: i64) -> AppResult<Option<TunnelRecord>>;
    async fn list_tunnels(&self) -> AppResult<Vec<TunnelRecord>>;
    async fn list_tunnels_in_status(
        &self,
        statuses: &[TunnelStatus],
    ) -> AppResult<Vec<TunnelRecord>>;
    async fn update_tunnel_status(&self, id: i64, status: TunnelStatus) -> AppResult<()>;
    async fn update_tunnel_health(
        &self,
        id: i64,
        health: TunnelHealth,
        checked_at: &str,
    ) -> AppResult<()>;
    async fn set_tunnel_pids(
        &self,
        id: i64,
        ssh_pid: Option<u32>,
        forwarder_pid: Option<u32>,
    ) -> AppResult<()>;
    async fn delete_tunnel(&self, id: i64) -> AppResult<bool>;
}
