use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use beanbridge::config::Config;
use clap::Parser;

/// Flags left unset fall back to the config file, then to built-in defaults.
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// YAML file to read settings from.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Address to listen on [default: 0.0.0.0].
    #[arg(short, long)]
    pub(crate) listen: Option<IpAddr>,
    /// (TCP) port to listen on [default: 11300].
    #[arg(short, long)]
    pub(crate) port: Option<u16>,
    /// Sets the maximum allowed job size [default: 65535].
    #[arg(short = 'z', long)]
    pub(crate) max_job_size: Option<u32>,
    /// Milliseconds between promotions of delayed and timed-out jobs
    /// [default: 500].
    #[arg(long)]
    pub(crate) sweep_interval_ms: Option<u64>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    /// Layers the flags given on the command line over the config file, if
    /// any.
    pub(crate) fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_job_size) = self.max_job_size {
            config.max_job_size = max_job_size;
        }
        if let Some(sweep_interval_ms) = self.sweep_interval_ms {
            config.sweep_interval_ms = sweep_interval_ms;
        }

        config.validate()?;

        Ok(config)
    }
}
