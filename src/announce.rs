//! UDP presence announcements.
//!
//! A sharing host broadcasts an [`AnnounceMessage`] every few seconds from
//! its chosen interface. Peers run an [`AnnounceReceiver`] on the well-known
//! port and fold what they hear into a [`HostDirectory`]. Neither side
//! touches the TCP file service.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{timeouts, MAX_ANNOUNCE_SIZE};
use crate::protocol_core::AnnounceMessage;
use crate::repository::FileRepository;
use crate::shutdown::ShutdownSignal;

/// What one announcement says about a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceStatus {
    pub name: String,
    pub ip: Ipv4Addr,
    pub timestamp: DateTime<Utc>,
    pub file_count: u32,
}

impl From<AnnounceMessage> for AnnounceStatus {
    fn from(msg: AnnounceMessage) -> Self {
        Self {
            name: msg.name,
            ip: msg.ip,
            timestamp: msg.timestamp,
            file_count: msg.file_count,
        }
    }
}

/// Live file count for the outgoing payload
pub trait FileCountSource: Send + Sync {
    fn file_count(&self) -> u32;
}

impl FileCountSource for FileRepository {
    fn file_count(&self) -> u32 {
        FileRepository::file_count(self)
    }
}

/// Background broadcaster. Stops on [`AnnounceSender::stop`] or drop.
pub struct AnnounceSender {
    signal: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl AnnounceSender {
    /// Bind to `ip` and broadcast to `target` every `interval`. The first
    /// announcement goes out immediately.
    pub fn spawn(
        host_name: String,
        ip: Ipv4Addr,
        target: SocketAddr,
        interval: Duration,
        source: Arc<dyn FileCountSource>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((ip, 0)).with_context(|| format!("bind announce socket on {}", ip))?;
        socket.set_broadcast(true).context("enable broadcast")?;

        let signal = ShutdownSignal::new();
        let stop = signal.clone();
        let thread = thread::Builder::new()
            .name("lanshare-announce".into())
            .spawn(move || {
                tracing::info!(host = %host_name, %ip, %target, "announcing presence");
                loop {
                    let msg = AnnounceMessage::new(&host_name, ip, source.file_count(), Utc::now());
                    match socket.send_to(&msg.encode(), target) {
                        Ok(_) => tracing::trace!(files = msg.file_count, "announce sent"),
                        Err(e) => tracing::warn!(error = %e, %target, "announce send failed"),
                    }
                    if stop.wait_timeout(interval) {
                        break;
                    }
                }
                tracing::debug!("announce sender stopped");
            })
            .context("spawn announce sender")?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.signal.trigger();
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::warn!("announce sender panicked");
            }
        }
    }
}

impl Drop for AnnounceSender {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Background listener for announce datagrams.
pub struct AnnounceReceiver {
    local_addr: SocketAddr,
    signal: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl AnnounceReceiver {
    /// Listen on `bind` and hand every decoded announcement to `handler`.
    ///
    /// With `verify_source` set, datagrams whose payload address differs
    /// from the address they arrived from are dropped.
    pub fn spawn<F>(bind: SocketAddr, verify_source: bool, mut handler: F) -> Result<Self>
    where
        F: FnMut(AnnounceStatus) + Send + 'static,
    {
        let socket = UdpSocket::bind(bind).with_context(|| format!("bind announce receiver on {}", bind))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(timeouts::RECEIVER_POLL_MS)))
            .context("set receiver timeout")?;
        let local_addr = socket.local_addr().context("receiver address")?;

        let signal = ShutdownSignal::new();
        let stop = signal.clone();
        let thread = thread::Builder::new()
            .name("lanshare-discover".into())
            .spawn(move || {
                tracing::debug!(addr = %local_addr, "announce receiver listening");
                // One spare byte so oversized datagrams are detectable
                let mut buf = [0u8; MAX_ANNOUNCE_SIZE + 1];
                while !stop.is_triggered() {
                    let (n, from) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock
                                    | io::ErrorKind::TimedOut
                                    | io::ErrorKind::Interrupted
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "announce receive failed");
                            if stop.wait_timeout(Duration::from_millis(timeouts::RECEIVER_POLL_MS)) {
                                break;
                            }
                            continue;
                        }
                    };
                    if stop.is_triggered() {
                        break;
                    }
                    match AnnounceMessage::decode(&buf[..n]) {
                        Ok(msg) => {
                            if verify_source && from.ip() != msg.ip {
                                tracing::debug!(%from, claimed = %msg.ip, "announce source mismatch");
                                continue;
                            }
                            handler(msg.into());
                        }
                        Err(e) => tracing::debug!(%from, error = %e, "discarding malformed announce"),
                    }
                }
                tracing::debug!("announce receiver stopped");
            })
            .context("spawn announce receiver")?;

        Ok(Self {
            local_addr,
            signal,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and wait for the worker to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.signal.trigger();
        // Wake a blocked recv rather than waiting out the poll interval
        let wake = wake_addr(self.local_addr);
        let from: SocketAddr = match wake {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        match UdpSocket::bind(from).and_then(|s| s.send_to(&[], wake)) {
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, %wake, "receiver wake-up failed"),
        }
        if thread.join().is_err() {
            tracing::warn!("announce receiver panicked");
        }
    }
}

impl Drop for AnnounceReceiver {
    fn drop(&mut self) {
        self.halt();
    }
}

// Where a datagram reaches a socket bound to `local`
fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, local.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, local.port()).into(),
        _ => local,
    }
}

/// Known hosts keyed by address, newest announcement wins.
#[derive(Debug, Default)]
pub struct HostDirectory {
    hosts: Mutex<HashMap<Ipv4Addr, (AnnounceStatus, Instant)>>,
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: AnnounceStatus) {
        let mut hosts = self.hosts.lock();
        if !hosts.contains_key(&status.ip) {
            tracing::info!(host = %status.name, ip = %status.ip, files = status.file_count, "host discovered");
        }
        hosts.insert(status.ip, (status, Instant::now()));
    }

    /// Current hosts sorted by name
    pub fn hosts(&self) -> Vec<AnnounceStatus> {
        let mut v: Vec<AnnounceStatus> = self.hosts.lock().values().map(|(s, _)| s.clone()).collect();
        v.sort_by(|a, b| a.name.cmp(&b.name).then(a.ip.cmp(&b.ip)));
        v
    }

    /// Forget hosts not heard from within `max_age`. Returns how many were dropped.
    pub fn expire(&self, max_age: Duration) -> usize {
        let mut hosts = self.hosts.lock();
        let before = hosts.len();
        hosts.retain(|_, (status, seen)| {
            let keep = seen.elapsed() <= max_age;
            if !keep {
                tracing::info!(host = %status.name, ip = %status.ip, "host expired");
            }
            keep
        });
        before - hosts.len()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve an interface argument to the IPv4 address announcements are sent
/// from: either an IPv4 literal or an interface name such as `eth0`.
pub fn resolve_interface(spec: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = spec.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    match interface_ipv4(spec)? {
        Some(ip) => Ok(ip),
        None => anyhow::bail!("interface {} has no IPv4 address", spec),
    }
}

#[cfg(unix)]
fn interface_ipv4(name: &str) -> Result<Option<Ipv4Addr>> {
    use std::ffi::CStr;

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error()).context("getifaddrs");
    }
    let mut found = None;
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: getifaddrs returned a valid list that lives until freeifaddrs
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        let ifname = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if ifname.to_bytes() != name.as_bytes() {
            continue;
        }
        if i32::from(unsafe { (*ifa.ifa_addr).sa_family }) != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }
    unsafe { libc::freeifaddrs(ifap) };
    Ok(found)
}

#[cfg(not(unix))]
fn interface_ipv4(name: &str) -> Result<Option<Ipv4Addr>> {
    anyhow::bail!("interface names are not supported here; pass an IPv4 address instead of {}", name)
}
