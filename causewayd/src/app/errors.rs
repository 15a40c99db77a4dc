// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const TIMEOUT: &str = "timeout";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const CANCELED: &str = "canceled";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const PORT_EXHAUSTED: &str = "port_exhausted";
    pub const PROCESS_SPAWN_FAILURE: &str = "process_spawn_failure";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    AlreadyExists,
    Internal,
    Aborted,
    Cancelled,
    Unavailable,
    ResourceExhausted,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// True when the scheduler circuit is open, so callers can present a
    /// degraded-mode state instead of a generic failure.
    pub fn is_circuit_open(&self) -> bool {
        self.code == codes::CIRCUIT_OPEN
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
