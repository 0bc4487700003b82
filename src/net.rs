//! TCP file service: accept loop, per-connection dispatcher and the
//! List/Get/Put request handlers.
//!
//! One request per connection. The dispatcher reads the opcode, lets the
//! matching request parse its own header, then runs
//! `lock -> execute -> respond -> unlock` and closes the connection.

use anyhow::{Context, Result};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::checksum::to_hex;
use crate::config::{PutAck, ServerConfig};
use crate::error::{ProtocolError, ProtocolResult};
use crate::locking::{LockMode, ResourceLocks};
use crate::protocol::{ErrorCode, Opcode, IO_CHUNK};
use crate::protocol_core::{
    encode_error, encode_get_header, encode_list_response, read_byte_or_eof, read_name,
    read_size, ListEntry,
};
use crate::repository::FileRepository;
use crate::shutdown::ShutdownSignal;

/// A decoded request header. Put content is still on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    List,
    Get { name: String },
    Put { name: String, size: u64 },
}

impl Request {
    /// Parse the opcode-specific header that follows `opcode`.
    fn read<R: Read + ?Sized>(
        opcode: Opcode,
        r: &mut R,
        repo: &FileRepository,
    ) -> ProtocolResult<Request> {
        match opcode {
            Opcode::ReqList => Ok(Request::List),
            Opcode::ReqGet => {
                let name = read_name(r)?;
                if !repo.is_valid_name(&name) {
                    return Err(ProtocolError::Malformed(format!("invalid file name {:?}", name)));
                }
                if !repo.exists(&name) {
                    return Err(ProtocolError::FileNotFound(name));
                }
                Ok(Request::Get { name })
            }
            Opcode::ReqPut => {
                let name = read_name(r)?;
                if !repo.is_valid_name(&name) {
                    return Err(ProtocolError::Malformed(format!("invalid file name {:?}", name)));
                }
                let size = read_size(r)?;
                Ok(Request::Put { name, size })
            }
            other => Err(ProtocolError::Malformed(format!(
                "{:?} is not a request opcode",
                other
            ))),
        }
    }

    /// Resource key and lock mode this request holds while it runs
    fn resource(&self) -> Option<(&str, LockMode)> {
        match self {
            Request::List => None,
            Request::Get { name } => Some((name, LockMode::Read)),
            Request::Put { name, .. } => Some((name, LockMode::Write)),
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    peer: String,
    // Set once any response byte has been written
    responded: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            reader: BufReader::with_capacity(IO_CHUNK, stream),
            peer,
            responded: false,
        }
    }

    fn stream(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    fn send(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.responded = true;
        let mut stream = self.stream();
        stream.write_all(bytes).map_err(ProtocolError::Transport)?;
        stream.flush().map_err(ProtocolError::Transport)
    }
}

/// Turns accepted connections into executed requests.
pub struct Dispatcher {
    repo: Arc<FileRepository>,
    locks: Arc<ResourceLocks>,
    idle_timeout: Duration,
    put_ack: PutAck,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, repo: Arc<FileRepository>, locks: Arc<ResourceLocks>) -> Self {
        Self {
            repo,
            locks,
            idle_timeout: config.idle_timeout(),
            put_ack: config.put_ack,
        }
    }

    pub fn locks(&self) -> &Arc<ResourceLocks> {
        &self.locks
    }

    /// Serve the single request carried by `stream`, then close it.
    pub fn dispatch(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tune_socket(&stream, self.idle_timeout);
        let mut conn = Connection::new(stream, peer);
        match self.handle(&mut conn) {
            Ok(()) => tracing::debug!(peer = %conn.peer, "request complete"),
            Err(err) => self.report(&mut conn, err),
        }
    }

    fn handle(&self, conn: &mut Connection) -> ProtocolResult<()> {
        let opcode = match read_byte_or_eof(&mut conn.reader)? {
            Some(b) => Opcode::from_byte(b)?,
            None => {
                return Err(ProtocolError::Malformed(
                    "connection closed before opcode".into(),
                ))
            }
        };
        tracing::debug!(peer = %conn.peer, ?opcode, "request");
        let request = Request::read(opcode, &mut conn.reader, &self.repo)?;

        let guard = match request.resource() {
            Some((key, mode)) => Some(self.locks.acquire(key, mode)?),
            None if self.locks.is_closed() => return Err(ProtocolError::Closed),
            None => None,
        };
        let result = self.execute(&request, conn);
        if let Some(guard) = guard {
            guard.release();
        }
        result
    }

    fn execute(&self, request: &Request, conn: &mut Connection) -> ProtocolResult<()> {
        match request {
            Request::List => self.process_list(conn),
            Request::Get { name } => self.process_get(name, conn),
            Request::Put { name, size } => self.process_put(name, *size, conn),
        }
    }

    fn process_list(&self, conn: &mut Connection) -> ProtocolResult<()> {
        let entries: Vec<ListEntry> = self
            .repo
            .list()
            .into_iter()
            .map(|r| ListEntry {
                hash: r.hash,
                name: r.name,
            })
            .collect();
        let frame = encode_list_response(&entries)?;
        conn.send(&frame)?;
        tracing::debug!(peer = %conn.peer, files = entries.len(), "list sent");
        Ok(())
    }

    fn process_get(&self, name: &str, conn: &mut Connection) -> ProtocolResult<()> {
        let stored = self
            .repo
            .get(name)
            .map_err(ProtocolError::Internal)?
            .ok_or_else(|| ProtocolError::FileNotFound(name.to_string()))?;
        let record = stored.record;
        let header = encode_get_header(record.size, &record.hash)?;
        conn.send(&header)?;

        let mut file = stored.file;
        let mut out = BufWriter::with_capacity(IO_CHUNK, conn.stream());
        let mut buf = vec![0u8; IO_CHUNK];
        let mut remaining = record.size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match file.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(ProtocolError::Internal(anyhow::anyhow!(
                        "{} shorter than its catalog size {}",
                        name,
                        record.size
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProtocolError::Internal(
                        anyhow::Error::new(e).context(format!("read {}", name)),
                    ))
                }
            };
            out.write_all(&buf[..n]).map_err(ProtocolError::Transport)?;
            remaining -= n as u64;
        }
        out.flush().map_err(ProtocolError::Transport)?;
        tracing::info!(
            peer = %conn.peer,
            file = name,
            bytes = record.size,
            hash = %to_hex(&record.hash),
            "get served"
        );
        Ok(())
    }

    fn process_put(&self, name: &str, size: u64, conn: &mut Connection) -> ProtocolResult<()> {
        let mut pending = self.repo.begin_write(name).map_err(ProtocolError::Internal)?;
        let mut buf = vec![0u8; IO_CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match conn.reader.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(ProtocolError::truncated(
                        "put content",
                        size as usize,
                        (size - remaining) as usize,
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Transport(e)),
            };
            pending.write_all(&buf[..n]).map_err(|e| {
                ProtocolError::Internal(anyhow::Error::new(e).context("write staging file"))
            })?;
            remaining -= n as u64;
        }
        let record = pending.commit().map_err(ProtocolError::Internal)?;
        tracing::info!(
            peer = %conn.peer,
            file = name,
            bytes = record.size,
            hash = %to_hex(&record.hash),
            "put committed"
        );
        match self.put_ack {
            PutAck::Implicit => Ok(()),
            PutAck::Explicit => conn.send(&[Opcode::None.as_byte()]),
        }
    }

    fn report(&self, conn: &mut Connection, err: ProtocolError) {
        let Some(code) = err.error_code() else {
            match err {
                ProtocolError::Closed => {
                    tracing::debug!(peer = %conn.peer, "request abandoned: shutting down")
                }
                other => tracing::debug!(peer = %conn.peer, error = %other, "connection dropped"),
            }
            return;
        };
        if code == ErrorCode::InternalServerError {
            tracing::error!(peer = %conn.peer, error = %err, "request failed");
        } else {
            tracing::info!(peer = %conn.peer, error = %err, "request rejected");
        }
        if conn.responded {
            // Part of a response is already on the wire; an error frame would corrupt it
            return;
        }
        if let Err(e) = conn.send(&encode_error(code)) {
            tracing::debug!(peer = %conn.peer, error = %e, "could not send error frame");
        }
    }
}

fn tune_socket(stream: &TcpStream, idle: Duration) {
    let _ = stream.set_nodelay(true);
    if let Err(e) = stream
        .set_read_timeout(Some(idle))
        .and_then(|_| stream.set_write_timeout(Some(idle)))
    {
        tracing::warn!(error = %e, "could not set socket timeouts");
    }
}

#[cfg(unix)]
fn apply_backlog(listener: &TcpListener, backlog: i32) {
    use std::os::fd::AsRawFd;
    // listen() on an already listening socket only updates the backlog
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog as libc::c_int) };
    if rc != 0 {
        tracing::warn!(error = %io::Error::last_os_error(), backlog, "could not apply listen backlog");
    }
}

#[cfg(not(unix))]
fn apply_backlog(_listener: &TcpListener, _backlog: i32) {}

/// Bound TCP listener plus everything needed to serve it.
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownSignal,
}

impl Server {
    pub fn bind(config: &ServerConfig, repo: Arc<FileRepository>) -> Result<Self> {
        let listener =
            TcpListener::bind(config.bind).with_context(|| format!("bind {}", config.bind))?;
        apply_backlog(&listener, config.backlog);
        let locks = Arc::new(ResourceLocks::new());
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(config, repo, locks)),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let shutdown = self.shutdown.clone();
        let locks = Arc::clone(self.dispatcher.locks());
        let thread = thread::Builder::new()
            .name("lanshare-accept".into())
            .spawn(move || self.run())
            .context("spawn accept thread")?;
        Ok(ServerHandle {
            addr,
            shutdown,
            locks,
            thread: Some(thread),
        })
    }

    /// Accept connections until shut down, one worker thread per connection.
    pub fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "lanshare file service listening");
        for conn in self.listener.incoming() {
            if self.shutdown.is_triggered() {
                break;
            }
            match conn {
                Ok(stream) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    if let Err(e) = thread::Builder::new()
                        .name("lanshare-conn".into())
                        .spawn(move || dispatcher.dispatch(stream))
                    {
                        tracing::error!(error = %e, "could not spawn connection worker");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    // Avoid spinning on persistent failures such as fd exhaustion
                    if self.shutdown.wait_timeout(Duration::from_millis(50)) {
                        break;
                    }
                }
            }
        }
        tracing::info!(%addr, "lanshare file service stopped accepting");
        Ok(())
    }
}

/// Running server; shuts the service down when told to or when dropped.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: ShutdownSignal,
    locks: Arc<ResourceLocks>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close the lock registry and wait for the accept
    /// loop to exit. In-flight requests holding a lock finish on their own.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shutdown.trigger();
        self.locks.shutdown();
        // Unblock accept() with a throwaway connection
        let wake = wake_addr(self.addr);
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            tracing::debug!(error = %e, "wake-up connection failed");
        }
        match thread.join() {
            Ok(res) => res,
            Err(_) => anyhow::bail!("accept thread panicked"),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "server shutdown failed");
        }
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}
