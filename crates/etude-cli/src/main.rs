use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use etude_core::{Config, Server, init_logging_with_level};
use tracing::info;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "A small epoll-driven static file server")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve files from
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Worker threads: a number, or `auto` for one per CPU
    #[arg(short, long, value_parser = parse_workers)]
    workers: Option<usize>,

    /// Maximum number of queued requests
    #[arg(long)]
    max_requests: Option<usize>,

    /// Maximum number of open connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Default log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Pin worker threads to CPU cores
    #[arg(long)]
    pin: bool,
}

fn parse_workers(s: &str) -> Result<usize, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(num_cpus::get());
    }
    s.parse::<usize>()
        .map_err(|e| format!("expected a number or `auto`: {}", e))
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(Config, bool)> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        config.apply_env();

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max) = self.max_requests {
            config.max_requests = max;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok((config, self.pin))
    }
}

fn main() -> anyhow::Result<()> {
    let (config, pin) = Cli::parse().into_config()?;
    init_logging_with_level(&config.log_level);

    info!(?config, "starting etude");
    Server::from_config(&config)
        .context("invalid configuration")?
        .pin_workers(pin)
        .serve()
        .context("server failed")?;
    Ok(())
}
