use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use lanshare::announce::{resolve_interface, AnnounceSender};
use lanshare::cli::DaemonOpts;
use lanshare::config::ServerConfig;
use lanshare::net::Server;
use lanshare::repository::FileRepository;
use lanshare::shutdown::ShutdownSignal;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    lanshare::logger::init(opts.verbose, opts.log_file.as_deref())?;

    let base = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let config = opts.apply(base);
    config.validate()?;

    let repo = Arc::new(FileRepository::open(&config.storage)?);
    tracing::info!(
        files_dir = %repo.working_dir().display(),
        staging_dir = %repo.staging_dir().display(),
        files = repo.file_count(),
        "repository ready"
    );

    if config.bind.ip().is_unspecified() {
        tracing::warn!(bind = %config.bind, "file service is reachable from every interface without authentication");
    }
    let server = Server::bind(&config, Arc::clone(&repo))?.spawn()?;

    let announcer = if config.announce.enabled {
        let iface = config.announce.interface.as_deref().unwrap_or(&opts.interface);
        let ip = resolve_interface(iface).with_context(|| format!("resolve interface {}", iface))?;
        Some(AnnounceSender::spawn(
            config.announce.resolved_host_name(),
            ip,
            config.announce.target,
            config.announce.interval(),
            repo.clone(),
        )?)
    } else {
        tracing::info!("presence announcements disabled");
        None
    };

    let stop = ShutdownSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.trigger()).context("install Ctrl-C handler")?;
    }
    stop.wait();

    tracing::info!("shutting down");
    if let Some(a) = announcer {
        a.stop();
    }
    server.shutdown()?;
    tracing::info!("stopped");
    Ok(())
}
