//! LanShare library
//!
//! Serve a flat directory of files over a small binary TCP protocol and
//! announce the host on the LAN over UDP broadcast.

pub mod announce;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod locking;
pub mod logger;
pub mod net;
pub mod protocol;
pub mod protocol_core;
pub mod repository;
pub mod shutdown;
pub mod url;

pub use error::{ProtocolError, ProtocolResult};
