// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::ports::ProxyRoutePort;

/// Stand-in for the platform's reverse-proxy provisioning client. Logs
/// every route change and reports success, so the daemon runs unchanged on
/// installations without the proxy component.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProxyRoutes;

impl LoggingProxyRoutes {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProxyRoutePort for LoggingProxyRoutes {
    async fn add_route(
        &self,
        domain: &str,
        target_host: &str,
        target_port: u16,
    ) -> AppResult<bool> {
        tracing::info!("proxy route added: {domain} -> {target_host}:{target_port}");
        Ok(true)
    }

    async fn remove_route(&self, domain: &str) -> AppResult<bool> {
        tracing::info!("proxy route removed: {domain}");
        Ok(true)
    }
}
