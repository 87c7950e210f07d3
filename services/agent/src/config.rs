//! Command-line and environment configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use regex::Regex;
use tapra_networking::{ExclusionList, NetworkError};
use thiserror::Error;

use crate::protocol::AdvertConfig;

/// Raw command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tapra",
    version,
    about = "IPv6 router advertisement responder for VM tap interfaces"
)]
pub struct Args {
    /// Log level.
    #[arg(long, env = "TAPRA_LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format.
    #[arg(long, env = "TAPRA_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Pattern an interface name must match to be handled.
    #[arg(long, env = "TAPRA_REGEX", default_value = "tap.*_0")]
    pub regex: String,

    /// Router lifetime carried in advertisements (e.g. 30m, 1h, 90s).
    #[arg(long, env = "TAPRA_LIFETIME", default_value = "30m", value_parser = parse_duration)]
    pub lifetime: Duration,

    /// Delay between unsolicited advertisements.
    #[arg(long, env = "TAPRA_INTERVAL", default_value = "10m", value_parser = parse_duration)]
    pub interval: Duration,

    /// IPv6 blocks never advertised, as CIDRs. Repeatable or comma-separated.
    #[arg(long = "exclude", env = "TAPRA_EXCLUDE", value_name = "CIDR", value_delimiter = ',')]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Disable log output.
    None,
    Trace,
    Debug,
    Info,
    #[value(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive, or `None` when logging is off.
    pub fn directive(&self) -> Option<&'static str> {
        match self {
            LogLevel::None => None,
            LogLevel::Trace => Some("trace"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Info => Some("info"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Error => Some("error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to parse interface regex {pattern}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid exclusion block: {0}")]
    Exclusion(#[from] NetworkError),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("lifetime {0:?} does not fit the 16-bit router lifetime field")]
    LifetimeTooLong(Duration),
}

/// Validated configuration, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub pattern: Regex,
    pub advert: AdvertConfig,
    pub exclusions: ExclusionList,
}

impl Config {
    /// Parse process arguments and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&args.regex).map_err(|source| ConfigError::Regex {
            pattern: args.regex.clone(),
            source,
        })?;

        if args.lifetime.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "lifetime" });
        }
        if args.interval.is_zero() {
            return Err(ConfigError::ZeroDuration { name: "interval" });
        }
        if args.lifetime > Duration::from_secs(u64::from(u16::MAX)) {
            return Err(ConfigError::LifetimeTooLong(args.lifetime));
        }

        let exclude: Vec<&str> = args
            .exclude
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let exclusions = ExclusionList::parse(exclude.as_slice())?;

        Ok(Self {
            log_level: args.log_level,
            log_format: args.log_format,
            pattern,
            advert: AdvertConfig {
                router_lifetime: args.lifetime,
                interval: args.interval,
            },
            exclusions,
        })
    }

    /// Whether the lifetime is too short for an advertisement to always
    /// arrive before the previous one expires.
    pub fn lifetime_too_short(&self) -> bool {
        self.advert.router_lifetime < self.advert.interval.saturating_mul(3)
    }
}

/// Parse a duration such as `90s`, `30m`, `1h30m`, `250ms` or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    Ok(total)
}
