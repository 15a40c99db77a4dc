// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "causewayd",
    version,
    about,
    long_about = None,
    after_help = "causewayd daemon\n\
\n\
Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < CAUSEWAY_CONFIG_PATH < command-line flags.\n\
If --config is omitted, causewayd tries CAUSEWAY_CONFIG_PATH, then the default config file location; a missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, causewayd uses CAUSEWAY_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often to reconcile against the scheduler queue. Overrides `reconcile_interval_secs` from the config file."
    )]
    pub reconcile_interval_secs: Option<u64>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn parse_opts() -> ParsedOpts {
    let opts = Opts::parse();
    let verbose_override = if opts.verbose { Some(true) } else { None };
    ParsedOpts {
        opts,
        verbose_override,
    }
}
