use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Server settings, as read from an optional YAML file. Every field has a
/// default, so an empty file is valid.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Address to listen on.
    pub listen: IpAddr,
    /// (TCP) port to listen on.
    pub port: u16,
    /// Largest job body accepted by `put`, in bytes.
    pub max_job_size: u32,
    /// How often delayed jobs and expired reservations are moved to ready.
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 11300,
            max_job_size: 65535,
            sweep_interval_ms: 500,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserialises as null rather than an empty map.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_str(yaml).context("parsing config")?;
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        Self::from_yaml(&yaml).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.sweep_interval_ms > 0, "sweep-interval-ms must be positive");

        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());

        let config = Config::from_yaml(
            "listen: 127.0.0.1\nport: 11301\nmax-job-size: 1024\n",
        )
        .unwrap();
        assert_eq!(
            config,
            Config {
                listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 11301,
                max_job_size: 1024,
                sweep_interval_ms: 500,
            }
        );
        assert_eq!(config.addr().to_string(), "127.0.0.1:11301");
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));

        assert!(Config::from_yaml("port: seventy").is_err());
        assert!(Config::from_yaml("backlog: 5").is_err());
        assert!(Config::from_yaml("sweep-interval-ms: 0").is_err());
    }
}
