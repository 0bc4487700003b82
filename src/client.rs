//! Blocking client for the file protocol: one TCP connection per request.

use anyhow::Context;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::checksum::{to_hex, HashingWriter};
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{timeouts, Opcode, IO_CHUNK};
use crate::protocol_core::{
    encode_get_request, encode_list_request, encode_put_header, read_byte_or_eof,
    read_error_body, read_get_header, read_list_body, ListEntry,
};

pub struct Client {
    addr: SocketAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
    // None: wait as long as the server keeps the request queued
    response_timeout: Option<Duration>,
}

impl Client {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_millis(timeouts::CONNECT_MS),
            io_timeout: Duration::from_millis(timeouts::CLIENT_IO_MS),
            response_timeout: None,
        }
    }

    /// Resolve `host` and `port`, taking the first address.
    pub fn connect_to(host: &str, port: u16) -> anyhow::Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", host))?
            .next()
            .with_context(|| format!("{} resolved to no addresses", host))?;
        Ok(Self::new(addr))
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Bound the wait for the first response byte, which includes the time
    /// the server spends queued behind other holders of the same file.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn open(&self) -> ProtocolResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)
            .map_err(ProtocolError::Transport)?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
            .map_err(ProtocolError::Transport)?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// First response byte. The server answers only once it holds the
    /// file's lock, so this wait is not bounded by the transfer timeout.
    fn await_response<R: Read>(&self, stream: &TcpStream, r: &mut R) -> ProtocolResult<Option<u8>> {
        stream
            .set_read_timeout(self.response_timeout)
            .map_err(ProtocolError::Transport)?;
        let first = read_byte_or_eof(r);
        stream
            .set_read_timeout(Some(self.io_timeout))
            .map_err(ProtocolError::Transport)?;
        first
    }

    /// Check the response opcode, turning an `Error` frame into `Remote`.
    fn expect<R: Read>(first: Option<u8>, r: &mut R, want: Opcode) -> ProtocolResult<()> {
        let op = match first {
            Some(b) => Opcode::from_byte(b)?,
            None => return Err(ProtocolError::Malformed("server closed without a response".into())),
        };
        if op == want {
            return Ok(());
        }
        if op == Opcode::Error {
            return Err(ProtocolError::Remote(read_error_body(r)?));
        }
        Err(ProtocolError::Malformed(format!("expected {:?}, got {:?}", want, op)))
    }

    pub fn list(&self) -> ProtocolResult<Vec<ListEntry>> {
        let stream = self.open()?;
        (&stream)
            .write_all(&encode_list_request())
            .map_err(ProtocolError::Transport)?;
        let mut r = BufReader::new(&stream);
        let first = self.await_response(&stream, &mut r)?;
        Self::expect(first, &mut r, Opcode::RespList)?;
        read_list_body(&mut r)
    }

    /// Download `name` into `out`, verifying size and MD5. Returns the byte count.
    pub fn get<W: Write>(&self, name: &str, out: W) -> ProtocolResult<u64> {
        let stream = self.open()?;
        (&stream)
            .write_all(&encode_get_request(name)?)
            .map_err(ProtocolError::Transport)?;
        let mut r = BufReader::with_capacity(IO_CHUNK, &stream);
        let first = self.await_response(&stream, &mut r)?;
        Self::expect(first, &mut r, Opcode::RespGet)?;
        let header = read_get_header(&mut r)?;

        let mut sink = HashingWriter::new(out);
        let copied = io::copy(&mut (&mut r).take(header.size), &mut sink).map_err(ProtocolError::Transport)?;
        if copied != header.size {
            return Err(ProtocolError::truncated("get content", header.size as usize, copied as usize));
        }
        let (mut out, hash, _) = sink.finish();
        out.flush().map_err(ProtocolError::Transport)?;
        if hash != header.hash {
            tracing::warn!(
                file = name,
                expected = %to_hex(&header.hash),
                actual = %to_hex(&hash),
                "downloaded content does not match advertised hash"
            );
            return Err(ProtocolError::HashMismatch(name.to_string()));
        }
        Ok(copied)
    }

    /// Download into `dest`; a failed download leaves no file behind.
    pub fn get_to_path(&self, name: &str, dest: &Path) -> ProtocolResult<u64> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ProtocolError::Internal(anyhow::Error::new(e).context("create download file")))?;
        let n = self.get(name, BufWriter::new(tmp.as_file()))?;
        tmp.persist(dest).map_err(|e| {
            ProtocolError::Internal(anyhow::Error::new(e.error).context(format!("save {}", dest.display())))
        })?;
        Ok(n)
    }

    /// Upload exactly `size` bytes from `content` as `name`.
    pub fn put<R: Read>(&self, name: &str, size: u64, content: R) -> ProtocolResult<()> {
        let stream = self.open()?;
        {
            let mut w = BufWriter::with_capacity(IO_CHUNK, &stream);
            w.write_all(&encode_put_header(name, size)?)
                .map_err(ProtocolError::Transport)?;
            let sent = io::copy(&mut content.take(size), &mut w).map_err(ProtocolError::Transport)?;
            if sent != size {
                return Err(ProtocolError::Malformed(format!(
                    "content ended after {} of {} bytes",
                    sent, size
                )));
            }
            w.flush().map_err(ProtocolError::Transport)?;
        }
        // Success is the server closing without a frame, or a bare `None` ack
        let mut r = BufReader::new(&stream);
        match self.await_response(&stream, &mut r)? {
            None => Ok(()),
            Some(b) => match Opcode::from_byte(b)? {
                Opcode::None => Ok(()),
                Opcode::Error => Err(ProtocolError::Remote(read_error_body(&mut r)?)),
                other => Err(ProtocolError::Malformed(format!("unexpected {:?} after put", other))),
            },
        }
    }

    pub fn put_file(&self, name: &str, path: &Path) -> ProtocolResult<u64> {
        let file = File::open(path)
            .map_err(|e| ProtocolError::Internal(anyhow::Error::new(e).context(format!("open {}", path.display()))))?;
        let size = file
            .metadata()
            .map_err(|e| ProtocolError::Internal(anyhow::Error::new(e).context(format!("stat {}", path.display()))))?
            .len();
        self.put(name, size, BufReader::new(file))?;
        Ok(size)
    }
}
