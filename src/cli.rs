//! Clap derive structures for the `tuyaswitch` CLI.

use crate::driver::{Action, tail_interval};
use crate::protocol::Version;
use crate::transport::{DEFAULT_PORT, DeviceConfig};
use clap::Parser;
use clap::builder::NonEmptyStringValueParser;
use std::ffi::OsString;
use std::time::Duration;

const POWER_FLAGS: &[&str] = &["--on", "--off"];

/// Control a Tuya smart switch on the local network
#[derive(Debug, Parser)]
#[command(
    name = "tuyaswitch",
    about = "CLI utility for Tuya smart switches (Tuya protocol 3.1 to 3.5)",
    long_about = long_about()
)]
pub struct Cli {
    /// Device ID
    #[arg(value_parser = NonEmptyStringValueParser::new())]
    pub dev_id: String,

    /// Local IP address
    #[arg(value_parser = NonEmptyStringValueParser::new())]
    pub ip: String,

    /// Local key
    #[arg(value_parser = NonEmptyStringValueParser::new())]
    pub local_key: String,

    /// Tuya protocol version
    #[arg(long, value_name = "FLOAT", default_value = "3.3", value_parser = parse_version)]
    pub version: Version,

    /// Turn on the switch (DPS 1)
    #[arg(long, conflicts_with = "off")]
    pub on: bool,

    /// Turn off the switch (DPS 1)
    #[arg(long)]
    pub off: bool,

    /// Print current device status
    #[arg(long)]
    pub status: bool,

    /// Continuously print status every SEC (default: 1)
    #[arg(
        long,
        value_name = "SEC",
        num_args = 0..=1,
        default_missing_value = "1",
        allow_negative_numbers = true
    )]
    pub tail: Option<f64>,

    /// Enable verbose protocol logs
    #[arg(long)]
    pub debug: bool,

    /// Device TCP port
    #[arg(long, env = "TUYA_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Network timeout in seconds
    #[arg(long, value_name = "SEC", env = "TUYA_TIMEOUT", default_value_t = 5)]
    pub timeout: u64,
}

fn long_about() -> String {
    format!(
        "CLI utility for Tuya smart switches (Tuya protocol 3.1 to 3.5).\n\
         Version: {}\n\n\
         The first three arguments are mandatory:\n  \
         tuyaswitch DEV_ID IP LOCAL_KEY [options]\n\n\
         Example: tuyaswitch bfcdd0dddd2698529gse2 192.168.1.2 'your_local_key' --on\n\n\
         Without --status or --tail the current power state is printed as ON or OFF.",
        crate::VERSION
    )
}

fn parse_version(s: &str) -> Result<Version, String> {
    s.parse::<Version>().map_err(|_| {
        let supported: Vec<&str> = Version::ALL.iter().map(Version::as_str).collect();
        format!("supported versions are {}", supported.join(", "))
    })
}

/// Lower-cases `--on`/`--off` tokens in any casing; every other argument passes through.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg = arg.into();
            match arg.to_str().map(str::to_ascii_lowercase) {
                Some(lower) if POWER_FLAGS.contains(&lower.as_str()) => OsString::from(lower),
                _ => arg,
            }
        })
        .collect()
}

impl Cli {
    /// Parses the process arguments after normalization, exiting on usage errors.
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_args(std::env::args_os()))
    }

    pub fn try_parse_normalized<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(normalize_args(args))
    }

    /// Picks the single action to run: tail, then status, then power, then confirmation.
    pub fn action(&self) -> Action {
        if let Some(secs) = self.tail {
            Action::Tail(tail_interval(secs))
        } else if self.status && !self.on && !self.off {
            Action::Status
        } else if self.on || self.off {
            Action::Power(self.on)
        } else {
            Action::Confirm
        }
    }

    /// True when `--tail` silently wins over a requested power change.
    pub fn tail_overrides_power(&self) -> bool {
        self.tail.is_some() && (self.on || self.off)
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig::new(&self.dev_id, &self.ip, &self.local_key)
            .version(self.version)
            .port(self.port)
            .timeout(Duration::from_secs(self.timeout))
    }
}
