// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::EventSinkPort;

/// Event sink that writes every published event to the log. Swapped for a
/// real notification fan-out where one is deployed; delivery is
/// fire-and-forget either way.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSinkPort for LogEventSink {
    fn publish(&self, channel: &str, event: serde_json::Value) {
        tracing::debug!("event on {channel}: {event}");
    }
}
