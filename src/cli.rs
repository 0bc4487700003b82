//! Command-line definitions for the daemon and the client

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::{PutAck, ServerConfig};

/// Daemon options for lanshared
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Share a directory on the LAN")]
pub struct DaemonOpts {
    /// Interface name or IPv4 address announcements are sent from
    pub interface: String,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address for the file service (host:port)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Directory holding the shared files
    #[arg(long)]
    pub files_dir: Option<PathBuf>,

    /// Staging directory for uploads; on another filesystem commits copy before renaming
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Host name to announce
    #[arg(long)]
    pub name: Option<String>,

    /// Acknowledge successful uploads with a single 0x00 byte
    #[arg(long)]
    pub explicit_put_ack: bool,

    /// Do not broadcast presence
    #[arg(long)]
    pub no_announce: bool,

    /// Also append log output to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    /// Fold the flags over `base`.
    pub fn apply(&self, mut base: ServerConfig) -> ServerConfig {
        base.announce.interface = Some(self.interface.clone());
        if let Some(bind) = self.bind {
            base.bind = bind;
        }
        if let Some(dir) = &self.files_dir {
            base.storage.working_dir = dir.clone();
            if self.tmp_dir.is_none() {
                base.storage.staging_dir = dir.join(".staging");
            }
        }
        if let Some(dir) = &self.tmp_dir {
            base.storage.staging_dir = dir.clone();
        }
        if let Some(name) = &self.name {
            base.announce.host_name = Some(name.clone());
        }
        if self.explicit_put_ack {
            base.put_ack = PutAck::Explicit;
        }
        if self.no_announce {
            base.announce.enabled = false;
        }
        base
    }
}

/// Client options for lanshare
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Browse, fetch and upload files shared on the LAN")]
pub struct ClientOpts {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List files on a host
    List {
        /// host[:port] or lanshare://host[:port]
        remote: String,
    },
    /// Download a file
    Get {
        remote: String,
        name: String,
        /// Destination path; defaults to NAME in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file
    Put {
        remote: String,
        path: PathBuf,
        /// Name on the host; defaults to the file name of PATH
        #[arg(long = "as")]
        name: Option<String>,
    },
    /// Listen for host announcements
    Discover {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:7777")]
        bind: SocketAddr,
        /// Seconds to listen before printing the hosts heard
        #[arg(long, default_value_t = 6)]
        seconds: u64,
        /// Accept announcements whose claimed address differs from the sender
        #[arg(long)]
        no_verify: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_flags_override_config() {
        let opts = DaemonOpts::parse_from([
            "lanshared",
            "eth0",
            "--files-dir",
            "/srv/share",
            "--name",
            "attic",
            "--explicit-put-ack",
            "--no-announce",
        ]);
        let cfg = opts.apply(ServerConfig::default());
        assert_eq!(cfg.announce.interface.as_deref(), Some("eth0"));
        assert_eq!(cfg.storage.working_dir, PathBuf::from("/srv/share"));
        assert_eq!(cfg.storage.staging_dir, PathBuf::from("/srv/share/.staging"));
        assert_eq!(cfg.announce.host_name.as_deref(), Some("attic"));
        assert_eq!(cfg.put_ack, PutAck::Explicit);
        assert!(!cfg.announce.enabled);
        assert_eq!(cfg.bind.port(), 7777);
    }

    #[test]
    fn client_subcommands_parse() {
        let opts = ClientOpts::parse_from(["lanshare", "put", "attic:9000", "./a.txt", "--as", "b.txt"]);
        match opts.command {
            ClientCommand::Put { remote, path, name } => {
                assert_eq!(remote, "attic:9000");
                assert_eq!(path, PathBuf::from("./a.txt"));
                assert_eq!(name.as_deref(), Some("b.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ClientOpts::try_parse_from(["lanshare"]).is_err());
    }
}
