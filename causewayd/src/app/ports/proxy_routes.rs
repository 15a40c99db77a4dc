// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

/// Reverse-proxy route management, owned by the surrounding platform.
/// This daemon only hands over the external port when a tunnel comes up
/// and revokes the route when the owning job goes away.
#[async_trait]
pub trait ProxyRoutePort: Send + Sync {
    async fn add_route(&self, domain: &str, target_host: &str, target_port: u16)
    -> AppResult<bool>;
    async fn remove_route(&self, domain: &str) -> AppResult<bool>;
}
