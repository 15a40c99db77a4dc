// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::app::errors::AppResult;
use crate::app::ports::{NetworkProbePort, ProcessControlPort, ProcessInfo, SpawnSpec};

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Account used on the scheduler head node for port forwards.
    pub ssh_user: String,
    /// Scheduler head node; all forwards hop through it.
    pub ssh_host: String,
    pub ssh_identity_path: Option<String>,
    /// Wait after spawn before trusting the process; both ssh and socat can
    /// exit asynchronously shortly after a clean-looking start.
    pub settle_delay: Duration,
    /// Wait between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,
    /// Deadline for listen/connect verification probes.
    pub probe_timeout: Duration,
}

impl ProcessManagerConfig {
    pub fn new(ssh_user: impl Into<String>, ssh_host: impl Into<String>) -> Self {
        Self {
            ssh_user: ssh_user.into(),
            ssh_host: ssh_host.into(),
            ssh_identity_path: None,
            settle_delay: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Spawns, verifies and terminates the two cooperating OS processes behind
/// every tunnel: an SSH client in port-forward mode and a TCP forwarder
/// republishing the forwarded port externally.
///
/// A successful spawn call is never trusted on its own; every spawn is
/// followed by a liveness-plus-listening check after the settle delay.
pub struct ProcessManager {
    config: ProcessManagerConfig,
    proc: Arc<dyn ProcessControlPort>,
    network: Arc<dyn NetworkProbePort>,
}

impl ProcessManager {
    pub fn new(
        config: ProcessManagerConfig,
        proc: Arc<dyn ProcessControlPort>,
        network: Arc<dyn NetworkProbePort>,
    ) -> Self {
        Self {
            config,
            proc,
            network,
        }
    }

    fn ssh_forward_spec(&self, internal_port: u16, remote_port: u16, node: &str) -> SpawnSpec {
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("{internal_port}:{node}:{remote_port}"),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.config.ssh_identity_path {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(format!("{}@{}", self.config.ssh_user, self.config.ssh_host));
        SpawnSpec::new("ssh", args)
    }

    fn forwarder_spec(&self, external_port: u16, internal_port: u16) -> SpawnSpec {
        SpawnSpec::new(
            "socat",
            vec![
                format!("TCP-LISTEN:{external_port},fork,reuseaddr"),
                format!("TCP:127.0.0.1:{internal_port}"),
            ],
        )
    }

    /// Launch the SSH port-forward and verify it: alive after the settle
    /// delay and actually listening on the local port. Returns the PID on
    /// success, `None` on any verified failure (nothing keeps running in
    /// that case).
    pub async fn create_ssh_tunnel(
        &self,
        internal_port: u16,
        remote_port: u16,
        node: &str,
    ) -> AppResult<Option<u32>> {
        let spec = self.ssh_forward_spec(internal_port, remote_port, node);
        self.spawn_and_verify(&spec, internal_port).await
    }

    /// Launch the TCP forwarder republishing `internal_port` on
    /// `external_port`; same settle-and-verify pattern.
    pub async fn create_forwarder(
        &self,
        external_port: u16,
        internal_port: u16,
    ) -> AppResult<Option<u32>> {
        let spec = self.forwarder_spec(external_port, internal_port);
        self.spawn_and_verify(&spec, external_port).await
    }

    async fn spawn_and_verify(&self, spec: &SpawnSpec, listen_port: u16) -> AppResult<Option<u32>> {
        let pid = match self.proc.spawn_detached(spec).await {
            Ok(pid) => pid,
            Err(err) => {
                tracing::warn!("spawn failed for `{}`: {err}", spec.command_line());
                return Ok(None);
            }
        };

        sleep(self.config.settle_delay).await;

        match self.proc.process_info(pid).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    "process {pid} exited within settle window: `{}`",
                    spec.command_line()
                );
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!("liveness check failed for {pid}: {err}");
                self.terminate_process(pid).await;
                return Ok(None);
            }
        }

        let listening = self
            .network
            .port_is_listening(listen_port, self.config.probe_timeout)
            .await
            .unwrap_or(false);
        if !listening {
            tracing::warn!(
                "process {pid} is alive but port {listen_port} is not listening, killing it"
            );
            self.terminate_process(pid).await;
            return Ok(None);
        }

        tracing::debug!("spawned pid {pid} listening on {listen_port}");
        Ok(Some(pid))
    }

    /// Liveness and usage for a tracked PID. Vanished, zombie and
    /// permission-denied all come back as `None`.
    pub async fn check_process_health(&self, pid: u32) -> Option<ProcessInfo> {
        match self.proc.process_info(pid).await {
            Ok(info) => info,
            Err(err) => {
                tracing::debug!("process info failed for {pid}: {err}");
                None
            }
        }
    }

    /// Open-and-close connectivity check. Any successful connect counts.
    pub async fn test_port_connectivity(&self, host: &str, port: u16) -> bool {
        self.network
            .test_connectivity(host, port, self.config.probe_timeout)
            .await
            .unwrap_or(false)
    }

    /// Whether anything serves the local port right now. Used by the
    /// cleanup sweep to spot ACTIVE rows whose processes are long gone.
    pub async fn port_is_served(&self, port: u16) -> bool {
        self.network
            .port_is_listening(port, self.config.probe_timeout)
            .await
            .unwrap_or(false)
    }

    /// Graceful terminate, escalating to SIGKILL after the grace period.
    /// An already-gone process counts as success.
    pub async fn terminate_process(&self, pid: u32) -> bool {
        match self.proc.process_info(pid).await {
            Ok(None) => return true,
            Ok(Some(_)) => {}
            Err(_) => return true,
        }

        if let Err(err) = self.proc.signal_terminate(pid).await {
            tracing::debug!("SIGTERM delivery failed for {pid}: {err}");
        }

        let poll = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        while waited < self.config.terminate_grace {
            sleep(poll).await;
            waited += poll;
            match self.proc.process_info(pid).await {
                Ok(None) | Err(_) => return true,
                Ok(Some(_)) => {}
            }
        }

        tracing::warn!("process {pid} survived SIGTERM, escalating to SIGKILL");
        if let Err(err) = self.proc.signal_kill(pid).await {
            tracing::debug!("SIGKILL delivery failed for {pid}: {err}");
        }
        sleep(poll).await;
        matches!(self.proc.process_info(pid).await, Ok(None) | Err(_))
    }

    /// Locate an SSH forward that outlived a daemon restart by matching the
    /// process table against the forward expression.
    pub async fn find_ssh_tunnel(
        &self,
        internal_port: u16,
        remote_port: u16,
        node: &str,
    ) -> Option<u32> {
        let patterns = vec![
            "ssh".to_string(),
            format!("{internal_port}:{node}:{remote_port}"),
        ];
        match self.proc.find_pid(&patterns).await {
            Ok(pid) => pid,
            Err(err) => {
                tracing::debug!("ssh tunnel lookup failed: {err}");
                None
            }
        }
    }

    /// Same for the forwarder half.
    pub async fn find_forwarder(&self, external_port: u16) -> Option<u32> {
        let patterns = vec![
            "socat".to_string(),
            format!("TCP-LISTEN:{external_port},"),
        ];
        match self.proc.find_pid(&patterns).await {
            Ok(pid) => pid,
            Err(err) => {
                tracing::debug!("forwarder lookup failed: {err}");
                None
            }
        }
    }
}
