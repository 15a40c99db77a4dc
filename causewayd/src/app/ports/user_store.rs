// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::UserRecord;

#[async_trait]
pub trait UserStorePort: Send + Sync {
    async fn get_or_create_user(&self, username: &str) -> AppResult<UserRecord>;
    async fn get_user(&self, id: i64) -> AppResult<Option<UserRecord>>;
}
