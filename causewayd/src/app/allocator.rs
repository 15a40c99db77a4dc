// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::app::errors::AppResult;
use crate::app::ports::{ClockPort, JobStorePort, NetworkProbePort, TunnelStorePort};
use crate::app::types::TunnelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortPurpose {
    JobPort,
    TunnelInternal,
    TunnelExternal,
}

impl PortPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            PortPurpose::JobPort => "job",
            PortPurpose::TunnelInternal => "tunnel-internal",
            PortPurpose::TunnelExternal => "tunnel-external",
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpan {
    pub start: u16,
    pub end: u16,
}

impl PortSpan {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + use<> {
        self.start..=self.end
    }
}

/// In-memory bookkeeping for one handed-out port. Never persisted;
/// reconstructed from job and tunnel rows on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub purpose: PortPurpose,
    pub resource_id: String,
    pub allocated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub job_ports: PortSpan,
    pub tunnel_ports: PortSpan,
    /// Candidates probed before giving up.
    pub max_attempts: usize,
    /// Wall-clock bound on one allocation attempt.
    pub probe_deadline: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            job_ports: PortSpan::new(8600, 8700),
            tunnel_ports: PortSpan::new(9000, 9500),
            max_attempts: 100,
            probe_deadline: Duration::from_secs(30),
        }
    }
}

/// Collision-free TCP port numbers out of the configured ranges.
///
/// The whole probe-and-reserve sequence runs under one lock: two callers
/// racing for the same free port is the failure mode this component
/// exists to prevent. The used-set is rebuilt from persisted rows on every
/// allocation so a write that went through another daemon replica or a
/// previous incarnation is still respected, and every candidate is probed
/// against the live OS to catch squatters outside our bookkeeping.
pub struct PortAllocator {
    config: AllocatorConfig,
    jobs: Arc<dyn JobStorePort>,
    tunnels: Arc<dyn TunnelStorePort>,
    network: Arc<dyn NetworkProbePort>,
    clock: Arc<dyn ClockPort>,
    inner: Mutex<HashMap<u16, PortAllocation>>,
}

impl PortAllocator {
    pub fn new(
        config: AllocatorConfig,
        jobs: Arc<dyn JobStorePort>,
        tunnels: Arc<dyn TunnelStorePort>,
        network: Arc<dyn NetworkProbePort>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            config,
            jobs,
            tunnels,
            network,
            clock,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn span_for(&self, purpose: PortPurpose) -> PortSpan {
        match purpose {
            PortPurpose::JobPort => self.config.job_ports,
            PortPurpose::TunnelInternal | PortPurpose::TunnelExternal => self.config.tunnel_ports,
        }
    }

    /// Reserve one confirmed-free port, or `None` when the range is
    /// exhausted. Exhaustion is a retryable condition for the caller, not
    /// an error of the allocator.
    pub async fn allocate(
        &self,
        purpose: PortPurpose,
        resource_id: &str,
    ) -> AppResult<Option<u16>> {
        let deadline = Instant::now() + self.config.probe_deadline;
        let span = self.span_for(purpose);

        // Serializes probe + reserve; holding the lock across the awaits is
        // the point.
        let mut inner = self.inner.lock().await;
        let used = self.used_ports(&inner).await?;

        let mut candidates: Vec<u16> = span.iter().filter(|p| !used.contains(p)).collect();
        candidates.shuffle(&mut rand::rng());

        let mut attempts = 0usize;
        for port in candidates {
            if attempts >= self.config.max_attempts || Instant::now() >= deadline {
                break;
            }
            attempts += 1;
            match self.network.port_is_free(port).await {
                Ok(true) => {
                    inner.insert(
                        port,
                        PortAllocation {
                            port,
                            purpose,
                            resource_id: resource_id.to_string(),
                            allocated_at: self.clock.now_utc(),
                        },
                    );
                    tracing::debug!(
                        "allocated port {port} purpose={} resource={resource_id}",
                        purpose.as_str()
                    );
                    return Ok(Some(port));
                }
                Ok(false) => continue,
                Err(err) => {
                    tracing::debug!("probe failed for port {port}: {err}");
                    continue;
                }
            }
        }

        tracing::warn!(
            "no free port in {}-{} for purpose={} resource={resource_id} after {attempts} probes",
            span.start,
            span.end,
            purpose.as_str()
        );
        Ok(None)
    }

    /// Idempotent; releasing a port that was never allocated is a no-op.
    pub async fn release(&self, port: u16) {
        let mut inner = self.inner.lock().await;
        if inner.remove(&port).is_some() {
            tracing::debug!("released port {port}");
        }
    }

    /// Drop every port held by one resource, e.g. when a half-built tunnel
    /// is torn down.
    pub async fn release_for_resource(&self, purpose: PortPurpose, resource_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.retain(|_, alloc| !(alloc.purpose == purpose && alloc.resource_id == resource_id));
    }

    /// Rebuild the in-memory table from persisted rows. Run once at
    /// startup, before any allocation; without it a restart would forget
    /// every port the previous incarnation handed out.
    pub async fn initialize_from_storage(&self) -> AppResult<usize> {
        let now = self.clock.now_utc();
        let mut table = HashMap::new();

        for job in self.jobs.list_active_jobs().await? {
            if let Some(port) = job.port {
                table.insert(
                    port,
                    PortAllocation {
                        port,
                        purpose: PortPurpose::JobPort,
                        resource_id: job.id.to_string(),
                        allocated_at: now,
                    },
                );
            }
        }

        let live = self
            .tunnels
            .list_tunnels_in_status(&[
                TunnelStatus::Pending,
                TunnelStatus::Connecting,
                TunnelStatus::Active,
            ])
            .await?;
        for tunnel in live {
            let resource_id = tunnel.id.to_string();
            table.insert(
                tunnel.internal_port,
                PortAllocation {
                    port: tunnel.internal_port,
                    purpose: PortPurpose::TunnelInternal,
                    resource_id: resource_id.clone(),
                    allocated_at: now,
                },
            );
            table.insert(
                tunnel.external_port,
                PortAllocation {
                    port: tunnel.external_port,
                    purpose: PortPurpose::TunnelExternal,
                    resource_id,
                    allocated_at: now,
                },
            );
        }

        let count = table.len();
        *self.inner.lock().await = table;
        tracing::info!("port allocator initialized with {count} reserved ports");
        Ok(count)
    }

    pub async fn snapshot(&self) -> Vec<PortAllocation> {
        let inner = self.inner.lock().await;
        let mut out: Vec<PortAllocation> = inner.values().cloned().collect();
        out.sort_by_key(|alloc| alloc.port);
        out
    }

    async fn used_ports(
        &self,
        inner: &HashMap<u16, PortAllocation>,
    ) -> AppResult<HashSet<u16>> {
        let mut used: HashSet<u16> = inner.keys().copied().collect();

        for job in self.jobs.list_active_jobs().await? {
            if let Some(port) = job.port {
                used.insert(port);
            }
        }
        let live = self
            .tunnels
            .list_tunnels_in_status(&[
                TunnelStatus::Pending,
                TunnelStatus::Connecting,
                TunnelStatus::Active,
            ])
            .await?;
        for tunnel in live {
            used.insert(tunnel.internal_port);
            used.insert(tunnel.external_port);
        }
        Ok(used)
    }
}
