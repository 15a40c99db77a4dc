// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use crate::app::types::{JobSnapshot, JobStatus, TaskStatus};

/// One listing per reconciliation cycle; the sole source of truth for that
/// cycle. Field order must match [`SNAPSHOT_FIELD_COUNT`] and
/// [`parse_active_jobs`].
pub const LIST_ACTIVE_JOBS_CMD: &str =
    r#"squeue --me -h -o '%i|%P|%j|%u|%T|%m|%M|%L|%N|%V|%S|%r'"#;

const SNAPSHOT_FIELD_COUNT: usize = 12;

/// Placeholders squeue prints for not-yet-assigned columns.
fn none_marker(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == "(null)" || value == "N/A" || value == "(None)" {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Debug, Default)]
pub struct SnapshotParse {
    pub jobs: Vec<JobSnapshot>,
    /// Lines with an unexpected field count. Rejected outright: a short or
    /// long line would otherwise shift every following column.
    pub rejected: Vec<String>,
}

/// Parse the `|`-separated active-job listing into validated records.
pub fn parse_active_jobs(output: &str) -> SnapshotParse {
    let mut parse = SnapshotParse::default();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != SNAPSHOT_FIELD_COUNT {
            parse.rejected.push(line.to_string());
            continue;
        }
        let scheduler_id = fields[0].trim();
        if scheduler_id.is_empty() {
            parse.rejected.push(line.to_string());
            continue;
        }
        parse.jobs.push(JobSnapshot {
            scheduler_id: scheduler_id.to_string(),
            partition: fields[1].trim().to_string(),
            name: fields[2].trim().to_string(),
            user: fields[3].trim().to_string(),
            state: fields[4].trim().to_string(),
            memory: fields[5].trim().to_string(),
            time_used: fields[6].trim().to_string(),
            time_left: fields[7].trim().to_string(),
            nodes: fields[8].trim().to_string(),
            submit_time: fields[9].trim().to_string(),
            start_time: none_marker(fields[10]),
            reason: none_marker(fields[11]),
        });
    }
    parse
}

/// Strip flag suffixes the scheduler appends to state names
/// (e.g. "CANCELLED+", "FAILED:127", "PENDING(Resources)").
pub fn normalize_state(state: &str) -> String {
    state
        .split(['+', ':', '('])
        .next()
        .unwrap_or(state)
        .trim()
        .to_ascii_uppercase()
}

/// Scheduler state code to container-job status. Every known code is listed
/// explicitly; anything else maps to `Unknown` and is left for the next
/// cycle rather than guessed at.
pub fn job_status_from_state(state: &str) -> JobStatus {
    match normalize_state(state).as_str() {
        "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => JobStatus::Pending,
        "CONFIGURING" => JobStatus::Configuring,
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "RESIZING" | "SIGNALING" | "STAGE_OUT"
        | "STAGE_IN" => JobStatus::Running,
        "COMPLETED" => JobStatus::Completed,
        "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "DEADLINE" | "TIMEOUT"
        | "PREEMPTED" | "SPECIAL_EXIT" => JobStatus::Failed,
        "CANCELLED" | "REVOKED" => JobStatus::Cancelled,
        _ => JobStatus::Unknown,
    }
}

/// Same table for batch tasks; TIMEOUT keeps its own status because the
/// retry ladder reports it separately.
pub fn task_status_from_state(state: &str) -> TaskStatus {
    match normalize_state(state).as_str() {
        "TIMEOUT" => TaskStatus::Timeout,
        other => match job_status_from_state(other) {
            JobStatus::Pending => TaskStatus::Pending,
            JobStatus::Configuring => TaskStatus::Configuring,
            JobStatus::Running => TaskStatus::Running,
            JobStatus::Completed => TaskStatus::Completed,
            JobStatus::Failed => TaskStatus::Failed,
            JobStatus::Cancelled => TaskStatus::Cancelled,
            JobStatus::Unknown => TaskStatus::Unknown,
        },
    }
}

pub fn parse_submitted_job_id(line: &str) -> Option<String> {
    // Expect message from sbatch like: "Submitted batch job 11"
    let marker = "job ";
    let idx = line.find(marker)?;
    let after_job = line[idx + marker.len()..].trim();
    if !after_job.is_empty() && after_job.chars().all(|c| c.is_ascii_digit()) {
        Some(after_job.to_string())
    } else {
        None
    }
}

/// Parse scheduler durations like "D-HH:MM:SS", "HH:MM:SS" or "MM:SS".
/// Returns None for markers like "UNLIMITED", "NONE", or "N/A".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("unlimited")
        || s.eq_ignore_ascii_case("none")
        || s.eq_ignore_ascii_case("n/a")
        || s.eq_ignore_ascii_case("invalid")
    {
        return None;
    }

    let (days, clock) = if let Some(dash) = s.find('-') {
        let (d, rest) = s.split_at(dash);
        let d: u64 = d.parse().ok()?;
        (d, &rest[1..])
    } else {
        (0, s)
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, sec): (u64, u64, u64) = match parts.as_slice() {
        [h, m, s] => (h.parse().ok()?, m.parse().ok()?, s.parse().ok()?),
        [m, s] => (0, m.parse().ok()?, s.parse().ok()?),
        _ => return None,
    };

    let total = days
        .saturating_mul(24 * 3600)
        .saturating_add(h * 3600)
        .saturating_add(m * 60)
        .saturating_add(sec);
    Some(Duration::from_secs(total))
}

/// Parse a scheduler memory expression ("16G", "32000M", "2T") into whole
/// gigabytes, rounding up. Bare numbers are megabytes, the scheduler's
/// default unit.
pub fn parse_memory_gb(memory: &str) -> Option<i64> {
    let memory = memory.trim();
    if memory.is_empty() {
        return None;
    }
    let (digits, unit) = match memory.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => memory.split_at(idx),
        None => (memory, "M"),
    };
    let value: f64 = digits.parse().ok()?;
    let gb = match unit.trim().to_ascii_uppercase().as_str() {
        "K" | "KB" => value / (1024.0 * 1024.0),
        "M" | "MB" => value / 1024.0,
        "G" | "GB" => value,
        "T" | "TB" => value * 1024.0,
        _ => return None,
    };
    Some(gb.ceil() as i64)
}

/// First hostname of a scheduler node-list expression.
///
/// "node03" stays as-is; "gpu[07-12]" becomes "gpu07"; comma lists take the
/// head element. Zero padding in the range is preserved. Empty or
/// placeholder expressions return None.
pub fn first_node(nodes: &str) -> Option<String> {
    let nodes = none_marker(nodes)?;
    let head = nodes.split(',').next().unwrap_or(&nodes).trim();
    let Some(open) = head.find('[') else {
        return Some(head.to_string());
    };
    let prefix = &head[..open];
    let inner = head[open + 1..].trim_end_matches(']');
    let first = inner.split([',', '-']).next().unwrap_or(inner).trim();
    if first.is_empty() {
        return None;
    }
    Some(format!("{prefix}{first}"))
}
