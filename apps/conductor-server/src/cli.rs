//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "conductor-server",
    about = "Conductor workflow orchestration server",
    version,
    long_about = "Runs declarative workflow templates as durable, resumable runs \
                  and exposes the engine over HTTP."
)]
pub struct Args {
    /// Path to configuration file (yaml, toml or json)
    #[arg(short, long, env = "CONDUCTOR_CONFIG", default_value = "config/conductor")]
    pub config: PathBuf,

    /// HTTP server port, overrides the configured one
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory of workflow templates, overrides the configured one
    #[arg(short, long, env = "CONDUCTOR_TEMPLATES")]
    pub templates: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Skip restarting unfinished runs on boot
    #[arg(long)]
    pub no_recover: bool,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(dir) = &self.templates {
            if !dir.is_dir() {
                anyhow::bail!("templates path {} is not a directory", dir.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["conductor-server"]);
        assert_eq!(args.log_level, "info");
        assert!(args.port.is_none());
        assert!(!args.no_recover);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_missing_templates_dir_is_rejected() {
        let args = Args::parse_from(["conductor-server", "--templates", "/definitely/not/here"]);
        assert!(args.validate().is_err());
    }
}
