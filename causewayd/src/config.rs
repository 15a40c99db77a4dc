// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const APP_DIR_NAME: &str = "causeway";
const CONFIG_FILE_NAME: &str = "causeway.toml";
const CONFIG_ENV_VAR: &str = "CAUSEWAY_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "causeway.sqlite";
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 90;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 120;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
const DEFAULT_COMPLETION_MISS_THRESHOLD: u32 = 3;
const DEFAULT_ESTABLISH_CONCURRENCY: usize = 3;
const DEFAULT_MAX_TUNNEL_AGE_HOURS: u64 = 12;
const DEFAULT_SCHEDULER_PORT: u16 = 22;
const DEFAULT_JOB_PORTS: (u16, u16) = (8600, 8700);
const DEFAULT_TUNNEL_PORTS: (u16, u16) = (9000, 9500);
const DEFAULT_ACCOUNT: &str = "causeway";

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    reconcile_interval_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    completion_miss_threshold: Option<u32>,
    establish_concurrency: Option<usize>,
    max_tunnel_age_hours: Option<u64>,
    adopt_orphans: Option<bool>,
    default_account: Option<String>,
    verbose: Option<bool>,
    scheduler: Option<FileSchedulerConfig>,
    ports: Option<FilePortsConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSchedulerConfig {
    host: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    identity_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FilePortsConfig {
    job_start: Option<u16>,
    job_end: Option<u16>,
    tunnel_start: Option<u16>,
    tunnel_end: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub reconcile_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub completion_miss_threshold: u32,
    pub establish_concurrency: usize,
    pub max_tunnel_age_hours: u64,
    pub adopt_orphans: bool,
    pub default_account: String,
    pub scheduler: SchedulerConfig,
    pub job_ports: PortRangeConfig,
    pub tunnel_ports: PortRangeConfig,
    pub verbose: bool,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub reconcile_interval_secs: ConfigValue<u64>,
    pub scheduler_host: ConfigValue<String>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub reconcile_interval_secs: Option<u64>,
    pub verbose: Option<bool>,
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.database_path {
            Some(raw) => (
                resolve_path(
                    &raw,
                    config_path.as_deref().and_then(|path| path.parent()),
                ),
                ConfigSource::ConfigFile,
            ),
            None => (
                default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (reconcile_interval_secs, reconcile_interval_source) =
        match overrides.reconcile_interval_secs {
            Some(secs) => (secs, ConfigSource::Override),
            None => match file_config.reconcile_interval_secs {
                Some(secs) => (secs, ConfigSource::ConfigFile),
                None => (DEFAULT_RECONCILE_INTERVAL_SECS, ConfigSource::Default),
            },
        };
    if reconcile_interval_secs == 0 {
        anyhow::bail!("reconcile_interval_secs must be greater than zero");
    }

    let (verbose, verbose_source) = match overrides.verbose {
        Some(verbose) => (verbose, ConfigSource::Override),
        None => match file_config.verbose {
            Some(verbose) => (verbose, ConfigSource::ConfigFile),
            None => (false, ConfigSource::Default),
        },
    };

    let scheduler_file = file_config.scheduler.unwrap_or_default();
    let (scheduler_host, scheduler_host_source) = match scheduler_file.host {
        Some(host) if !host.trim().is_empty() => (host, ConfigSource::ConfigFile),
        _ => anyhow::bail!(
            "scheduler.host must be set in the config file; causewayd cannot reach the cluster without it"
        ),
    };
    let scheduler_user = match scheduler_file.user {
        Some(user) if !user.trim().is_empty() => user,
        _ => std::env::var("USER").unwrap_or_else(|_| DEFAULT_ACCOUNT.to_string()),
    };
    let scheduler = SchedulerConfig {
        host: scheduler_host.clone(),
        user: scheduler_user,
        port: scheduler_file.port.unwrap_or(DEFAULT_SCHEDULER_PORT),
        identity_path: scheduler_file
            .identity_path
            .map(|raw| expand_path(PathBuf::from(raw)).to_string_lossy().into_owned()),
    };

    let ports_file = file_config.ports.unwrap_or_default();
    let job_ports = PortRangeConfig {
        start: ports_file.job_start.unwrap_or(DEFAULT_JOB_PORTS.0),
        end: ports_file.job_end.unwrap_or(DEFAULT_JOB_PORTS.1),
    };
    let tunnel_ports = PortRangeConfig {
        start: ports_file.tunnel_start.unwrap_or(DEFAULT_TUNNEL_PORTS.0),
        end: ports_file.tunnel_end.unwrap_or(DEFAULT_TUNNEL_PORTS.1),
    };
    validate_port_ranges(job_ports, tunnel_ports)?;

    let completion_miss_threshold = file_config
        .completion_miss_threshold
        .unwrap_or(DEFAULT_COMPLETION_MISS_THRESHOLD);
    if completion_miss_threshold == 0 {
        anyhow::bail!("completion_miss_threshold must be at least 1");
    }

    let config = Config {
        database_path,
        reconcile_interval_secs,
        health_check_interval_secs: file_config
            .health_check_interval_secs
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
        cleanup_interval_secs: file_config
            .cleanup_interval_secs
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
        completion_miss_threshold,
        establish_concurrency: file_config
            .establish_concurrency
            .unwrap_or(DEFAULT_ESTABLISH_CONCURRENCY)
            .max(1),
        max_tunnel_age_hours: file_config
            .max_tunnel_age_hours
            .unwrap_or(DEFAULT_MAX_TUNNEL_AGE_HOURS),
        adopt_orphans: file_config.adopt_orphans.unwrap_or(false),
        default_account: file_config
            .default_account
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string()),
        scheduler,
        job_ports,
        tunnel_ports,
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        reconcile_interval_secs: ConfigValue {
            value: config.reconcile_interval_secs,
            source: reconcile_interval_source,
        },
        scheduler_host: ConfigValue {
            value: scheduler_host,
            source: scheduler_host_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn validate_port_ranges(job: PortRangeConfig, tunnel: PortRangeConfig) -> Result<()> {
    if job.start > job.end {
        anyhow::bail!("job port range is inverted: {}-{}", job.start, job.end);
    }
    if tunnel.start > tunnel.end {
        anyhow::bail!(
            "tunnel port range is inverted: {}-{}",
            tunnel.start,
            tunnel.end
        );
    }
    if job.start <= tunnel.end && tunnel.start <= job.end {
        anyhow::bail!(
            "job ports {}-{} overlap tunnel ports {}-{}",
            job.start,
            job.end,
            tunnel.start,
            tunnel.end
        );
    }
    Ok(())
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DATABASE_FILE_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}
