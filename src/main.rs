//! lanshare: command-line client for LanShare hosts

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanshare::announce::{AnnounceReceiver, HostDirectory};
use lanshare::checksum::to_hex;
use lanshare::cli::{ClientCommand, ClientOpts};
use lanshare::client::Client;
use lanshare::protocol::timeouts;
use lanshare::url::parse_remote;

fn connect(remote: &str) -> Result<Client> {
    let host = parse_remote(remote)
        .with_context(|| format!("expected host[:port] or lanshare://host[:port], got {:?}", remote))?;
    Client::connect_to(&host.host, host.port)
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    lanshare::logger::init(opts.verbose, None)?;

    match opts.command {
        ClientCommand::List { remote } => {
            let entries = connect(&remote)?.list()?;
            for e in &entries {
                println!("{}  {}", to_hex(&e.hash), e.name);
            }
            if opts.verbose {
                eprintln!("{} file(s)", entries.len());
            }
        }
        ClientCommand::Get { remote, name, output } => {
            let client = connect(&remote)?;
            let dest = output.unwrap_or_else(|| PathBuf::from(&name));
            let start = Instant::now();
            let bytes = client.get_to_path(&name, &dest)?;
            println!(
                "{} -> {} ({} bytes in {:.2}s)",
                name,
                dest.display(),
                bytes,
                start.elapsed().as_secs_f64()
            );
        }
        ClientCommand::Put { remote, path, name } => {
            let name = match name {
                Some(n) => n,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("cannot derive a name from {}", path.display()))?,
            };
            let client = connect(&remote)?;
            let start = Instant::now();
            let bytes = client.put_file(&name, &path)?;
            println!(
                "{} -> {} ({} bytes in {:.2}s)",
                path.display(),
                name,
                bytes,
                start.elapsed().as_secs_f64()
            );
        }
        ClientCommand::Discover {
            bind,
            seconds,
            no_verify,
        } => {
            let directory = Arc::new(HostDirectory::new());
            let receiver = {
                let directory = Arc::clone(&directory);
                AnnounceReceiver::spawn(bind, !no_verify, move |status| directory.record(status))?
            };
            // Hosts silent for three announce intervals are considered gone
            let ttl = Duration::from_millis(3 * timeouts::ANNOUNCE_INTERVAL_MS);
            let deadline = Instant::now() + Duration::from_secs(seconds);
            while Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(500));
                directory.expire(ttl);
            }
            receiver.stop();
            for h in directory.hosts() {
                println!(
                    "{:<24} {:<15} {:>6} file(s)  {}",
                    h.name,
                    h.ip,
                    h.file_count,
                    h.timestamp.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}
