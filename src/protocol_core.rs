//! Wire codec shared by the server, the client and the announcer
//!
//! Frames are not length-prefixed as a whole, so every field is assembled
//! from as many `read` calls as it takes. A peer that closes before a
//! declared length is satisfied produces `ProtocolError::Malformed`; any other
//! I/O failure is a transport error.

use chrono::{DateTime, TimeZone, Utc};
use std::io::{self, Read};
use std::net::Ipv4Addr;

use crate::checksum::ContentHash;
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{
    ErrorCode, Opcode, ANNOUNCE_HEADER_LEN, HASH_LEN, MAX_ANNOUNCE_SIZE, MAX_NAME_LEN,
};

/// Read exactly `buf.len()` bytes, tolerating short reads.
pub fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8], what: &str) -> ProtocolResult<()> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => return Err(ProtocolError::truncated(what, buf.len(), got)),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Transport(e)),
        }
    }
    Ok(())
}

/// Read a single byte, `None` if the peer closed cleanly first.
pub fn read_byte_or_eof<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Transport(e)),
        }
    }
}

pub fn read_u8<R: Read + ?Sized>(r: &mut R, what: &str) -> ProtocolResult<u8> {
    let mut b = [0u8; 1];
    read_full(r, &mut b, what)?;
    Ok(b[0])
}

pub fn read_u32<R: Read + ?Sized>(r: &mut R, what: &str) -> ProtocolResult<u32> {
    let mut b = [0u8; 4];
    read_full(r, &mut b, what)?;
    Ok(u32::from_be_bytes(b))
}

/// Sizes travel as signed 64-bit values; negative sizes are rejected.
pub fn read_size<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<u64> {
    let mut b = [0u8; 8];
    read_full(r, &mut b, "file size")?;
    let size = i64::from_be_bytes(b);
    u64::try_from(size).map_err(|_| ProtocolError::Malformed(format!("negative file size {}", size)))
}

pub fn read_hash<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<ContentHash> {
    let mut h = [0u8; HASH_LEN];
    read_full(r, &mut h, "content hash")?;
    Ok(h)
}

/// Read a NUL-terminated UTF-8 name, one byte at a time so nothing past
/// the terminator is consumed.
pub fn read_name<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<String> {
    let mut bytes = Vec::with_capacity(64);
    loop {
        let b = read_u8(r, "file name")?;
        if b == 0 {
            break;
        }
        if bytes.len() == MAX_NAME_LEN {
            return Err(ProtocolError::Malformed(format!(
                "file name longer than {} bytes",
                MAX_NAME_LEN
            )));
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| ProtocolError::Malformed("file name is not UTF-8".into()))
}

fn push_name(buf: &mut Vec<u8>, name: &str) -> ProtocolResult<()> {
    if name.as_bytes().contains(&0) {
        return Err(ProtocolError::Malformed("file name contains NUL".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::Malformed(format!(
            "file name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    Ok(())
}

fn push_size(buf: &mut Vec<u8>, size: u64) -> ProtocolResult<()> {
    let size = i64::try_from(size)
        .map_err(|_| ProtocolError::Malformed(format!("file size {} does not fit i64", size)))?;
    buf.extend_from_slice(&size.to_be_bytes());
    Ok(())
}

// ---- frame encoders -------------------------------------------------------

pub fn encode_list_request() -> Vec<u8> {
    vec![Opcode::ReqList.as_byte()]
}

pub fn encode_get_request(name: &str) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(2 + name.len());
    buf.push(Opcode::ReqGet.as_byte());
    push_name(&mut buf, name)?;
    Ok(buf)
}

/// Put header: the content bytes follow separately.
pub fn encode_put_header(name: &str, size: u64) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(10 + name.len());
    buf.push(Opcode::ReqPut.as_byte());
    push_name(&mut buf, name)?;
    push_size(&mut buf, size)?;
    Ok(buf)
}

pub fn encode_list_response(entries: &[ListEntry]) -> ProtocolResult<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| ProtocolError::Malformed("too many list entries".into()))?;
    let mut buf = Vec::with_capacity(5 + entries.len() * (HASH_LEN + 16));
    buf.push(Opcode::RespList.as_byte());
    buf.extend_from_slice(&count.to_be_bytes());
    for entry in entries {
        buf.extend_from_slice(&entry.hash);
        push_name(&mut buf, &entry.name)?;
    }
    Ok(buf)
}

/// Get response header: the content bytes follow separately.
pub fn encode_get_header(size: u64, hash: &ContentHash) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(1 + 8 + HASH_LEN);
    buf.push(Opcode::RespGet.as_byte());
    push_size(&mut buf, size)?;
    buf.extend_from_slice(hash);
    Ok(buf)
}

pub fn encode_error(code: ErrorCode) -> [u8; 2] {
    [Opcode::Error.as_byte(), code.as_byte()]
}

// ---- list scanning --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub hash: ContentHash,
    pub name: String,
}

/// Incremental decoder for the entries of a `RespList` body.
///
/// Entries carry no length prefix: each is a 16-byte hash followed by a
/// NUL-terminated name. A zero byte only terminates the name once the
/// current entry's hash has been consumed in full, so hashes containing
/// zero bytes are handled. Scanning stops as soon as the declared number of
/// entries has been terminated.
#[derive(Debug)]
pub struct ListScanner {
    remaining: u32,
    hash: ContentHash,
    hash_filled: usize,
    name: Vec<u8>,
    entries: Vec<ListEntry>,
}

impl ListScanner {
    pub fn new(count: u32) -> Self {
        Self {
            remaining: count,
            hash: [0u8; HASH_LEN],
            hash_filled: 0,
            name: Vec::new(),
            entries: Vec::with_capacity(count.min(1024) as usize),
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Feed the next chunk; returns how many bytes belonged to the list.
    pub fn feed(&mut self, chunk: &[u8]) -> ProtocolResult<usize> {
        let mut used = 0;
        for &b in chunk {
            if self.remaining == 0 {
                break;
            }
            used += 1;
            if self.hash_filled < HASH_LEN {
                self.hash[self.hash_filled] = b;
                self.hash_filled += 1;
            } else if b == 0 {
                let name = String::from_utf8(std::mem::take(&mut self.name)).map_err(|_| {
                    ProtocolError::Malformed("list entry name is not UTF-8".into())
                })?;
                self.entries.push(ListEntry {
                    hash: self.hash,
                    name,
                });
                self.hash_filled = 0;
                self.remaining -= 1;
            } else {
                if self.name.len() == MAX_NAME_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "list entry name longer than {} bytes",
                        MAX_NAME_LEN
                    )));
                }
                self.name.push(b);
            }
        }
        Ok(used)
    }

    pub fn finish(self) -> ProtocolResult<Vec<ListEntry>> {
        if self.remaining != 0 {
            return Err(ProtocolError::Malformed(format!(
                "list ended with {} entries missing",
                self.remaining
            )));
        }
        Ok(self.entries)
    }
}

/// Decode a `RespList` body (after the opcode).
///
/// Reads in chunks; the connection carries a single response, so bytes after
/// the last terminator are not expected and are dropped.
pub fn read_list_body<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<Vec<ListEntry>> {
    let count = read_u32(r, "entry count")?;
    let mut scanner = ListScanner::new(count);
    let mut buf = [0u8; 4096];
    while !scanner.is_done() {
        let n = match r.read(&mut buf) {
            Ok(0) => {
                return Err(ProtocolError::Malformed(format!(
                    "peer closed with {} list entries outstanding",
                    scanner.remaining
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Transport(e)),
        };
        scanner.feed(&buf[..n])?;
    }
    scanner.finish()
}

/// `RespGet` header fields, content excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetHeader {
    pub size: u64,
    pub hash: ContentHash,
}

pub fn read_get_header<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<GetHeader> {
    let size = read_size(r)?;
    let hash = read_hash(r)?;
    Ok(GetHeader { size, hash })
}

pub fn read_error_body<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<ErrorCode> {
    ErrorCode::from_byte(read_u8(r, "error code")?)
}

// ---- whole-frame model ----------------------------------------------------

/// Every frame the file protocol knows, with bodies held in memory.
///
/// The server and client stream file bodies instead; this form exists for
/// small frames and for exercising the codec end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    None,
    ReqList,
    ReqGet { name: String },
    ReqPut { name: String, content: Vec<u8> },
    RespList { entries: Vec<ListEntry> },
    RespGet { hash: ContentHash, content: Vec<u8> },
    Error(ErrorCode),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::None => Opcode::None,
            Message::ReqList => Opcode::ReqList,
            Message::ReqGet { .. } => Opcode::ReqGet,
            Message::ReqPut { .. } => Opcode::ReqPut,
            Message::RespList { .. } => Opcode::RespList,
            Message::RespGet { .. } => Opcode::RespGet,
            Message::Error(_) => Opcode::Error,
        }
    }

    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(match self {
            Message::None => vec![Opcode::None.as_byte()],
            Message::ReqList => encode_list_request(),
            Message::ReqGet { name } => encode_get_request(name)?,
            Message::ReqPut { name, content } => {
                let mut buf = encode_put_header(name, content.len() as u64)?;
                buf.extend_from_slice(content);
                buf
            }
            Message::RespList { entries } => encode_list_response(entries)?,
            Message::RespGet { hash, content } => {
                let mut buf = encode_get_header(content.len() as u64, hash)?;
                buf.extend_from_slice(content);
                buf
            }
            Message::Error(code) => encode_error(*code).to_vec(),
        })
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> ProtocolResult<Message> {
        let opcode = Opcode::from_byte(read_u8(r, "opcode")?)?;
        Ok(match opcode {
            Opcode::None => Message::None,
            Opcode::ReqList => Message::ReqList,
            Opcode::ReqGet => Message::ReqGet { name: read_name(r)? },
            Opcode::ReqPut => {
                let name = read_name(r)?;
                let size = read_size(r)?;
                let content = read_body(r, size)?;
                Message::ReqPut { name, content }
            }
            Opcode::RespList => Message::RespList {
                entries: read_list_body(r)?,
            },
            Opcode::RespGet => {
                let header = read_get_header(r)?;
                let content = read_body(r, header.size)?;
                Message::RespGet {
                    hash: header.hash,
                    content,
                }
            }
            Opcode::Error => Message::Error(read_error_body(r)?),
        })
    }
}

// Grows with the data actually received rather than trusting the declared size
fn read_body<R: Read + ?Sized>(r: &mut R, size: u64) -> ProtocolResult<Vec<u8>> {
    let mut content = Vec::new();
    let got = r
        .take(size)
        .read_to_end(&mut content)
        .map_err(ProtocolError::Transport)?;
    if (got as u64) != size {
        return Err(ProtocolError::Malformed(format!(
            "peer closed while reading content: got {} of {} bytes",
            got, size
        )));
    }
    Ok(content)
}

// ---- announce datagram ----------------------------------------------------

/// Presence datagram broadcast by a sharing host.
///
/// Layout: IPv4 (4) | file count u32 BE | epoch milliseconds u64 BE |
/// UTF-8 name | NUL. The whole datagram fits in [`MAX_ANNOUNCE_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub ip: Ipv4Addr,
    pub file_count: u32,
    pub timestamp: DateTime<Utc>,
    pub name: String,
}

impl AnnounceMessage {
    /// Longest name that still fits one datagram
    pub const MAX_NAME_BYTES: usize = MAX_ANNOUNCE_SIZE - ANNOUNCE_HEADER_LEN - 1;

    pub fn new(name: &str, ip: Ipv4Addr, file_count: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            ip,
            file_count,
            timestamp,
            name: bounded_name(name).to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = bounded_name(&self.name);
        let millis = self.timestamp.timestamp_millis().max(0) as u64;
        let mut buf = Vec::with_capacity(ANNOUNCE_HEADER_LEN + name.len() + 1);
        buf.extend_from_slice(&self.ip.octets());
        buf.extend_from_slice(&self.file_count.to_be_bytes());
        buf.extend_from_slice(&millis.to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<AnnounceMessage> {
        if data.len() < ANNOUNCE_HEADER_LEN + 1 {
            return Err(ProtocolError::Malformed(format!(
                "announce too short: {} bytes",
                data.len()
            )));
        }
        if data.len() > MAX_ANNOUNCE_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "announce too long: {} bytes",
                data.len()
            )));
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let file_count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut ms = [0u8; 8];
        ms.copy_from_slice(&data[8..16]);
        let millis = i64::try_from(u64::from_be_bytes(ms))
            .map_err(|_| ProtocolError::Malformed("announce timestamp out of range".into()))?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| ProtocolError::Malformed("announce timestamp out of range".into()))?;

        let tail = &data[ANNOUNCE_HEADER_LEN..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProtocolError::Malformed("announce name not terminated".into()))?;
        if end == 0 {
            return Err(ProtocolError::Malformed("announce name is empty".into()));
        }
        let name = std::str::from_utf8(&tail[..end])
            .map_err(|_| ProtocolError::Malformed("announce name is not UTF-8".into()))?
            .to_string();

        Ok(AnnounceMessage {
            ip,
            file_count,
            timestamp,
            name,
        })
    }
}

// Cut at the first NUL and at a char boundary within the datagram budget
fn bounded_name(name: &str) -> &str {
    let name = match name.find('\0') {
        Some(i) => &name[..i],
        None => name,
    };
    if name.len() <= AnnounceMessage::MAX_NAME_BYTES {
        return name;
    }
    let mut end = AnnounceMessage::MAX_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
