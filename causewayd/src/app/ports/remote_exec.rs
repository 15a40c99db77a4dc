// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[derive(Debug, Clone)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Remote command execution against the scheduler head node.
///
/// Implementations must return distinguishable error codes for
/// authentication failures, connection timeouts and generic transport
/// errors; a nonzero exit from the remote command itself is not an error
/// and comes back inside the capture.
#[async_trait]
pub trait RemoteExecPort: Send + Sync {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture>;
}
