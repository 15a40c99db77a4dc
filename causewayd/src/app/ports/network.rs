// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use std::time::Duration;

use crate::app::errors::AppResult;

#[async_trait]
pub trait NetworkProbePort: Send + Sync {
    /// Whether a local TCP bind on the port would succeed right now.
    /// Catches ports held by processes outside this daemon's bookkeeping.
    async fn port_is_free(&self, port: u16) -> AppResult<bool>;
    /// Whether something accepts connections on the local port.
    async fn port_is_listening(&self, port: u16, timeout: Duration) -> AppResult<bool>;
    /// Open-and-close connectivity test against an arbitrary host. A
    /// successful connect counts even if the peer rejects the protocol.
    async fn test_connectivity(&self, host: &str, port: u16, timeout: Duration)
    -> AppResult<bool>;
}
