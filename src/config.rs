use std::net::Ipv4Addr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use service::pacing::PacingWay;

/// One physical port of the transport instance.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    ///
    /// interface name
    ///
    /// the name the device layer resolves to a port, for example an
    /// AF_PACKET interface name.
    ///
    pub name: String,
    ///
    /// local ip address
    ///
    /// the source address the port stamps into every transmitted frame
    /// and filters receive flows against.
    ///
    pub ip: Ipv4Addr,
    ///
    /// transmit pacing
    ///
    /// auto probes the NIC rate limiter and falls back to software
    /// pacing when training fails.
    ///
    #[serde(default)]
    pub pacing: PacingCfg,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacingCfg {
    #[default]
    Auto,
    Ratelimit,
    Tsc,
    User,
}

impl PacingCfg {
    pub fn as_way(&self) -> PacingWay {
        match self {
            Self::Auto => PacingWay::Auto,
            Self::Ratelimit => PacingWay::RateLimit,
            Self::Tsc => PacingWay::Tsc,
            Self::User => PacingWay::User,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// run schedulers in plain threads
    ///
    /// by default each scheduler pins one core; thread mode skips the
    /// pinning, for constrained hosts and tests.
    ///
    #[serde(default)]
    pub tasklet_thread: bool,
    ///
    /// allow scheduler sleep
    ///
    /// idle schedulers park on a timed wait instead of spinning.
    ///
    #[serde(default = "Runtime::sleep")]
    pub tasklet_sleep: bool,
    ///
    /// forced sleep time in microseconds
    ///
    /// overrides the per tasklet sleep advice when set.
    ///
    #[serde(default)]
    pub tasklet_sleep_us: Option<u64>,
    ///
    /// record per tasklet handler times
    ///
    #[serde(default)]
    pub tasklet_time_measure: bool,
    ///
    /// maximum cores the schedulers may pin
    ///
    #[serde(default = "Runtime::max_cores")]
    pub max_cores: usize,
    ///
    /// per scheduler data quota in Mbit/s
    ///
    #[serde(default = "Runtime::quota")]
    pub data_quota_mbs_limit: u32,
    ///
    /// statistics dump period in seconds
    ///
    #[serde(default = "Runtime::dump_period")]
    pub dump_period_s: u64,
}

impl Runtime {
    fn sleep() -> bool {
        true
    }

    fn max_cores() -> usize {
        num_cpus::get()
    }

    fn quota() -> u32 {
        100_000
    }

    fn dump_period() -> u64 {
        10
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            tasklet_thread: false,
            tasklet_sleep: Self::sleep(),
            tasklet_sleep_us: None,
            tasklet_time_measure: false,
            max_cores: Self::max_cores(),
            data_quota_mbs_limit: Self::quota(),
            dump_period_s: Self::dump_period(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    ///
    /// Load a configuration from a json5 document.
    ///
    /// # Test
    ///
    /// ```
    /// use st2110::config::Config;
    ///
    /// let config = Config::from_str(
    ///     r#"{
    ///         interfaces: [{ name: "ens1f0", ip: "192.168.85.80" }],
    ///         runtime: { "tasklet-thread": true },
    ///     }"#,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(config.interfaces.len(), 1);
    /// assert!(config.runtime.tasklet_thread);
    /// assert_eq!(config.runtime.dump_period_s, 10);
    /// ```
    pub fn from_str(source: &str) -> Result<Self> {
        Ok(serde_json5::from_str(source)?)
    }
}
