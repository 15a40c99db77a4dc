// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::JobRecord;

/// Scheduler-visible name prefixes. Classification of the active-job
/// listing is a pure prefix match on these; nothing else about a foreign
/// job is inspected.
pub const CONTAINER_JOB_PREFIX: &str = "cw-job-";
pub const BATCH_TASK_PREFIX: &str = "cw-sim-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotClass {
    ContainerJob,
    BatchTask,
    Foreign,
}

pub fn classify(job_name: &str) -> SnapshotClass {
    if job_name.starts_with(CONTAINER_JOB_PREFIX) {
        SnapshotClass::ContainerJob
    } else if job_name.starts_with(BATCH_TASK_PREFIX) {
        SnapshotClass::BatchTask
    } else {
        SnapshotClass::Foreign
    }
}

/// Lowercase, alnum and dashes only, runs of anything else collapsed into a
/// single dash. The result is what the active-uniqueness constraint and the
/// route name are keyed on.
pub fn sanitize_container_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true; // swallow leading separators
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn container_job_name(username: &str, container_name: &str) -> String {
    format!("{CONTAINER_JOB_PREFIX}{username}-{container_name}")
}

pub fn batch_task_name(task_id: &str) -> String {
    format!("{BATCH_TASK_PREFIX}{task_id}")
}

/// Best-effort owner extraction from a container job name.
///
/// The convention is `cw-job-<user>-<container>`, so the first segment
/// after the prefix is taken as the username. The convention cannot
/// represent usernames containing dashes, so those are misattributed;
/// callers fall back to a default account when this returns None.
pub fn owner_from_job_name(job_name: &str) -> Option<&str> {
    let rest = job_name.strip_prefix(CONTAINER_JOB_PREFIX)?;
    let user = rest.split('-').next()?;
    if user.is_empty() { None } else { Some(user) }
}

/// Container name segment of a container job name: everything after the
/// username.
pub fn container_from_job_name(job_name: &str) -> Option<&str> {
    let rest = job_name.strip_prefix(CONTAINER_JOB_PREFIX)?;
    let (_, container) = rest.split_once('-')?;
    if container.is_empty() {
        None
    } else {
        Some(container)
    }
}

/// Task id embedded in a batch task's scheduler name.
pub fn task_id_from_job_name(job_name: &str) -> Option<&str> {
    let id = job_name.strip_prefix(BATCH_TASK_PREFIX)?;
    if id.is_empty() { None } else { Some(id) }
}

/// Stable reverse-proxy route label for a job's domain.
pub fn route_name(job: &JobRecord) -> String {
    format!("{}-{}", job.container_name, job.id)
}
