// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use thiserror::Error as ThisError;
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteExecPort};

/// OpenSSH exits with 255 for its own failures; anything else is the
/// remote command's exit code.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshExecConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity_path: Option<String>,
    pub connect_timeout_secs: u64,
}

impl SshExecConfig {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            identity_path: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum SshExecError {
    #[error("authentication to {0} failed")]
    AuthenticationFailure(String),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("connection to {0} failed: {1}")]
    Connection(String, String),

    #[error("could not run ssh client: {0}")]
    Client(io::Error),
}

fn map_ssh_error(err: SshExecError) -> AppError {
    let code = match &err {
        SshExecError::AuthenticationFailure(_) => codes::AUTHENTICATION_FAILURE,
        SshExecError::Timeout(_) => codes::TIMEOUT,
        SshExecError::Connection(..) | SshExecError::Client(_) => codes::CONNECTION_FAILURE,
    };
    AppError::with_message(AppErrorKind::Aborted, code, err.to_string())
}

/// Classify an ssh(1) transport failure from its stderr. Auth, timeout and
/// generic connection failures must stay distinguishable for callers.
fn classify_transport_failure(host: &str, stderr: &str) -> SshExecError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("too many authentication failures")
    {
        SshExecError::AuthenticationFailure(host.to_string())
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        SshExecError::Timeout(host.to_string())
    } else {
        let line = stderr.lines().last().unwrap_or("").trim().to_string();
        SshExecError::Connection(host.to_string(), line)
    }
}

/// Remote command execution through the system OpenSSH client in
/// non-interactive BatchMode. Connection multiplexing is left to the
/// user's ssh config.
pub struct OpenSshExec {
    config: SshExecConfig,
}

impl OpenSshExec {
    pub fn new(config: SshExecConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(identity) = &self.config.identity_path {
            command.arg("-i").arg(identity);
        }
        command
            .arg(format!("{}@{}", self.config.user, self.config.host))
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[async_trait]
impl RemoteExecPort for OpenSshExec {
    async fn exec_capture(&self, remote_command: &str) -> AppResult<ExecCapture> {
        let output = self
            .build_command(remote_command)
            .output()
            .await
            .map_err(|err| map_ssh_error(SshExecError::Client(err)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_TRANSPORT_EXIT {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(map_ssh_error(classify_transport_failure(
                &self.config.host,
                &stderr,
            )));
        }
        Ok(ExecCapture {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }
}
