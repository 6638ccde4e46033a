//! CLI argument parsing for jobmon.

use camino::Utf8PathBuf;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "jobmon")]
#[command(about = "Collect and serve performance metrics of HPC jobs")]
pub struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "config.json")]
    pub config: Utf8PathBuf,

    /// Log at debug level unless JOBMON_LOG is set
    #[arg(long, short)]
    pub verbose: bool,

    /// Hours between janitor runs (reaper and overtime finisher)
    #[arg(long, default_value = "12")]
    pub janitor_interval_hours: u64,

    /// Do not reload the configuration when the file changes
    #[arg(long)]
    pub no_watch: bool,
}

impl Args {
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_hours.max(1) * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["jobmon"]);
        assert_eq!(args.config, "config.json");
        assert!(!args.verbose);
        assert!(!args.no_watch);
        assert_eq!(args.janitor_interval(), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "jobmon",
            "--config",
            "/etc/jobmon/config.json",
            "-v",
            "--janitor-interval-hours",
            "0",
            "--no-watch",
        ]);
        assert_eq!(args.config, "/etc/jobmon/config.json");
        assert!(args.verbose);
        assert!(args.no_watch);
        assert_eq!(args.janitor_interval(), Duration::from_secs(3600));
    }
}
