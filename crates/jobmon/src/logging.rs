//! Tracing subscriber setup.
//!
//! `JOBMON_LOG` takes an `EnvFilter` directive (default `info`, or `debug`
//! with `--verbose`); `JOBMON_LOG_FORMAT` selects `compact` (default),
//! `json` or `pretty` output.

use std::env;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

pub fn init(verbose: bool) {
    let filter = build_filter(env::var("JOBMON_LOG").ok(), verbose);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match parse_format(env::var("JOBMON_LOG_FORMAT").ok().as_deref()) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

fn build_filter(directive: Option<String>, verbose: bool) -> EnvFilter {
    match directive {
        Some(value) => EnvFilter::new(value),
        None if verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    }
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
    {
        Some(value) if value == "json" => LogFormat::Json,
        Some(value) if value == "pretty" => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}
