use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::controller::PollerConfig;

/// Stream NVIDIA GPU telemetry to connected browsers
#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None, version)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "RGM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "RGM_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Polling period in milliseconds
    #[arg(
        long,
        env = "RGM_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval_ms: u64,

    /// Consecutive failed polls tolerated before polling stops
    #[arg(
        long,
        env = "RGM_MAX_FAILURES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_failures: u32,

    /// Also write logs to this file, rotated daily
    #[arg(long, env = "RGM_LOG_FILE", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.interval_ms),
            max_failures_in_a_row: self.max_failures,
        }
    }

    pub fn listen_addr(&self) -> String {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_service() {
        let cli = Cli::try_parse_from(["rgm-stream"]).unwrap();
        assert_eq!(cli.port, 5000);
        assert_eq!(cli.poller_config(), PollerConfig::default());
        assert_eq!(cli.listen_addr(), "0.0.0.0:5000");
        assert!(cli.log_file.is_none());
    }

    #[test]
    fn overrides_from_flags() {
        let cli = Cli::try_parse_from([
            "rgm-stream",
            "--host",
            "::1",
            "--port",
            "8080",
            "--interval-ms",
            "250",
            "--max-failures",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.listen_addr(), "[::1]:8080");
        let config = cli.poller_config();
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.max_failures_in_a_row, 3);
    }

    #[test]
    fn rejects_zero_budget_and_interval() {
        assert!(Cli::try_parse_from(["rgm-stream", "--max-failures", "0"]).is_err());
        assert!(Cli::try_parse_from(["rgm-stream", "--interval-ms", "0"]).is_err());
    }
}
