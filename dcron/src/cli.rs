use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use coord::config::{CoordConfig, DEFAULT_ELECTION_PREFIX, DEFAULT_LOCK_PREFIX};

#[derive(Debug, Parser)]
#[command(
    name = "dcron",
    version,
    about = "Distributed cron jobs coordinated through etcd",
    long_about = None
)]
pub struct Cli {
    /// etcd endpoints, comma separated
    #[arg(
        long,
        global = true,
        env = "DCRON_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://localhost:2379"
    )]
    pub endpoints: Vec<String>,

    /// Connect timeout per endpoint
    #[arg(long, global = true, default_value_t = 5_000)]
    pub dial_timeout_ms: u64,

    /// Session lease TTL in seconds
    #[arg(long, global = true, default_value_t = 10)]
    pub ttl: u64,

    #[arg(long, global = true, default_value = DEFAULT_ELECTION_PREFIX)]
    pub election_prefix: String,

    #[arg(long, global = true, default_value = DEFAULT_LOCK_PREFIX)]
    pub lock_prefix: String,

    #[arg(
        long,
        global = true,
        default_value_t = 1_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub campaign_interval_ms: u64,

    #[arg(
        long,
        global = true,
        default_value_t = 1_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub job_interval_ms: u64,

    /// Counter file mutated by job-with-resource
    #[arg(long, global = true, default_value = "./resource/test.counter")]
    pub counter_file: PathBuf,

    /// Verbose mode (-v, -vv)
    #[arg(short, global = true, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a distributed cron job using leader election
    RunWithElector,
    /// Run a distributed cron job using a distributed lock
    RunWithLock,
}

impl Cli {
    pub fn coord_config(&self) -> CoordConfig {
        CoordConfig::default()
            .with_endpoints(self.endpoints.iter().map(|e| e.trim().to_string()))
            .with_dial_timeout(Duration::from_millis(self.dial_timeout_ms))
            .with_session_ttl(self.ttl)
            .with_election_prefix(self.election_prefix.as_str())
            .with_lock_prefix(self.lock_prefix.as_str())
    }

    pub fn campaign_interval(&self) -> Duration {
        Duration::from_millis(self.campaign_interval_ms)
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.job_interval_ms)
    }

    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
