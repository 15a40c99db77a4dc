// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::time::timeout;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::NetworkProbePort;

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("DNS name not found for {0}")]
    DnsNotFound(String),

    #[error("couldn't resolve host: {0:?}")]
    Resolve(io::Error),

    #[error("no addresses resolved from {0}")]
    NoAddrs(String),
}

pub async fn lookup_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, NetError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NetError::DnsNotFound(host.to_owned()),
            _ => NetError::Resolve(e),
        })?;

    let out: Vec<SocketAddr> = addrs.collect();
    if out.is_empty() {
        return Err(NetError::NoAddrs(host.to_owned()));
    }
    Ok(out)
}

async fn is_socket_reachable(addr: SocketAddr, timeout_duration: Duration) -> bool {
    matches!(
        timeout(timeout_duration, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Live-socket probing for port allocation and tunnel verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProbe;

impl NetworkProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProbePort for NetworkProbe {
    async fn port_is_free(&self, port: u16) -> AppResult<bool> {
        // A successful wildcard bind is the strongest local free-signal we
        // can get without races; the listener is dropped immediately.
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                drop(listener);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(false),
            Err(err) => Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("bind probe on port {port} failed: {err}"),
            )),
        }
    }

    async fn port_is_listening(&self, port: u16, probe_timeout: Duration) -> AppResult<bool> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Ok(is_socket_reachable(addr, probe_timeout).await)
    }

    async fn test_connectivity(
        &self,
        host: &str,
        port: u16,
        probe_timeout: Duration,
    ) -> AppResult<bool> {
        let addrs = lookup_addrs(host, port).await.map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::CONNECTION_FAILURE,
                err.to_string(),
            )
        })?;
        for addr in addrs {
            if is_socket_reachable(addr, probe_timeout).await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
