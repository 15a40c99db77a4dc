// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod events;
pub mod job_store;
pub mod network;
pub mod process_control;
pub mod proxy_routes;
pub mod remote_exec;
pub mod task_store;
pub mod tunnel_store;
pub mod user_store;

pub use clock::ClockPort;
pub use events::EventSinkPort;
pub use job_store::JobStorePort;
pub use network::NetworkProbePort;
pub use process_control::{ProcessControlPort, ProcessInfo, SpawnSpec};
pub use proxy_routes::ProxyRoutePort;
pub use remote_exec::{ExecCapture, RemoteExecPort};
pub use task_store::TaskStorePort;
pub use tunnel_store::TunnelStorePort;
pub use user_store::UserStorePort;
