use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};

use crate::{carrier::PlatformDefaults, domain::parse_timezone, service::ServiceOptions};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netpolicy",
    about = "Network data-usage policy and quota enforcement daemon",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the policy engine (default).
    Run,

    /// Print the billing cycle around an instant.
    Cycle(CycleArgs),

    /// Print the persisted policy snapshot under --data-dir.
    Dump,
}

#[derive(Args, Debug, Clone)]
pub struct CycleArgs {
    #[arg(
        long,
        value_name = "DAY",
        value_parser = clap::value_parser!(u8).range(1..=31)
    )]
    pub cycle_day: u8,

    /// IANA zone name; defaults to --default-timezone.
    #[arg(long, value_name = "TZ", value_parser = parse_timezone_arg)]
    pub timezone: Option<Tz>,

    /// RFC 3339 instant; defaults to now.
    #[arg(long, value_name = "INSTANT", value_parser = parse_instant_arg)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "NETPOLICY_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "default-warning-mb",
        global = true,
        env = "NETPOLICY_DEFAULT_WARNING_MB",
        value_name = "MB",
        default_value_t = 2048
    )]
    pub default_warning_mb: u64,

    /// Platform default data limit; disabled when unset.
    #[arg(
        long = "default-limit-mb",
        global = true,
        env = "NETPOLICY_DEFAULT_LIMIT_MB",
        value_name = "MB"
    )]
    pub default_limit_mb: Option<u64>,

    #[arg(
        long = "default-timezone",
        global = true,
        env = "NETPOLICY_DEFAULT_TIMEZONE",
        value_name = "TZ",
        default_value = "UTC",
        value_parser = parse_timezone_arg
    )]
    pub default_timezone: Tz,

    #[arg(
        long = "proc-state-history-size",
        global = true,
        env = "NETPOLICY_PROC_STATE_HISTORY_SIZE",
        value_name = "N",
        default_value_t = 200,
        value_parser = clap::value_parser!(u64).range(1..=4096)
    )]
    pub proc_state_history_size: u64,

    #[arg(
        long = "stats-poll-interval-secs",
        global = true,
        env = "NETPOLICY_STATS_POLL_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(5..=3600)
    )]
    pub stats_poll_interval_secs: u64,
}

impl Config {
    pub fn platform_defaults(&self) -> PlatformDefaults {
        PlatformDefaults::from_megabytes(
            Some(self.default_warning_mb),
            self.default_limit_mb,
            self.default_timezone,
        )
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            defaults: self.platform_defaults(),
            proc_state_history_size: self.proc_state_history_size as usize,
        }
    }

    pub fn stats_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stats_poll_interval_secs)
    }
}

fn parse_timezone_arg(value: &str) -> Result<Tz, String> {
    parse_timezone(value).map_err(|e| e.to_string())
}

fn parse_instant_arg(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 instant: {e}"))
}
