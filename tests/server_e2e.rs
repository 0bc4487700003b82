use anyhow::Result;
use lanshare::checksum::hash_bytes;
use lanshare::client::Client;
use lanshare::config::{PutAck, ServerConfig, StorageConfig};
use lanshare::net::{Server, ServerHandle};
use lanshare::protocol::{timeouts, ErrorCode};
use lanshare::repository::FileRepository;
use lanshare::ProtocolError;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn pattern(size: usize, seed: u8) -> Vec<u8> {
    let mut val = seed;
    (0..size)
        .map(|_| {
            val = val.wrapping_add(1);
            val
        })
        .collect()
}

fn start(root: &Path, put_ack: PutAck) -> Result<(ServerHandle, Client, Arc<FileRepository>)> {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse()?,
        put_ack,
        storage: StorageConfig {
            working_dir: root.join("files"),
            staging_dir: root.join("files").join(".staging"),
        },
        ..ServerConfig::default()
    };
    let repo = Arc::new(FileRepository::open(&config.storage)?);
    let server = Server::bind(&config, Arc::clone(&repo))?.spawn()?;
    let client = Client::new(server.local_addr()).with_io_timeout(Duration::from_secs(10));
    Ok((server, client, repo))
}

// Send raw bytes, half-close, return everything the server answered
fn raw_exchange(client: &Client, request: &[u8]) -> Result<Vec<u8>> {
    let mut s = TcpStream::connect(client.addr())?;
    s.set_read_timeout(Some(Duration::from_secs(10)))?;
    s.write_all(request)?;
    s.shutdown(Shutdown::Write)?;
    let mut reply = Vec::new();
    s.read_to_end(&mut reply)?;
    Ok(reply)
}

#[test]
fn list_put_get_roundtrip() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, _repo) = start(tmp.path(), PutAck::Implicit)?;

    assert!(client.list()?.is_empty());

    let body = pattern(1_100_000, 0);
    client.put("big.bin", body.len() as u64, body.as_slice())?;
    client.put("empty", 0, &b""[..])?;

    let listed = client.list()?;
    let names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["big.bin", "empty"]);
    assert_eq!(listed[0].hash, hash_bytes(&body));
    assert_eq!(listed[1].hash, hash_bytes(b""));

    let mut fetched = Vec::new();
    assert_eq!(client.get("big.bin", &mut fetched)?, body.len() as u64);
    assert_eq!(fetched, body);

    // Overwrite replaces content and hash
    client.put("big.bin", 5, &b"small"[..])?;
    let mut fetched = Vec::new();
    client.get("big.bin", &mut fetched)?;
    assert_eq!(fetched, b"small");
    assert_eq!(client.list()?[0].hash, hash_bytes(b"small"));

    let dest = tmp.path().join("out.bin");
    client.get_to_path("big.bin", &dest)?;
    assert_eq!(std::fs::read(&dest)?, b"small");
    assert!(std::fs::read(tmp.path().join("files").join("big.bin"))? == b"small");

    server.shutdown()?;
    Ok(())
}

#[test]
fn existing_files_are_served_after_restart() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let files = tmp.path().join("files");
    std::fs::create_dir_all(&files)?;
    std::fs::write(files.join("notes.txt"), b"hello")?;

    let (server, client, _repo) = start(tmp.path(), PutAck::Implicit)?;
    let listed = client.list()?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "notes.txt");
    assert_eq!(listed[0].hash, hash_bytes(b"hello"));
    server.shutdown()?;
    Ok(())
}

#[test]
fn classified_failures_produce_error_frames() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, _repo) = start(tmp.path(), PutAck::Implicit)?;

    match client.get("missing.txt", Vec::new()) {
        Err(ProtocolError::Remote(ErrorCode::FileNotFound)) => {}
        other => panic!("expected FileNotFound, got {:?}", other),
    }

    assert_eq!(raw_exchange(&client, &[0x7E])?, vec![0xFF, 0x03]);
    assert_eq!(raw_exchange(&client, &[0x04])?, vec![0xFF, 0x03]);
    assert_eq!(raw_exchange(&client, b"\x02bad/name\0")?, vec![0xFF, 0x03]);
    assert_eq!(raw_exchange(&client, b"\x02unterminated")?, vec![0xFF, 0x03]);

    // Put that stops short of its declared size
    let mut short = b"\x03part.bin\0".to_vec();
    short.extend_from_slice(&100i64.to_be_bytes());
    short.extend_from_slice(&[7u8; 10]);
    assert_eq!(raw_exchange(&client, &short)?, vec![0xFF, 0x03]);

    let mut negative = b"\x03neg.bin\0".to_vec();
    negative.extend_from_slice(&(-1i64).to_be_bytes());
    assert_eq!(raw_exchange(&client, &negative)?, vec![0xFF, 0x03]);

    assert!(client.list()?.is_empty());
    let staging = tmp.path().join("files").join(".staging");
    assert_eq!(std::fs::read_dir(staging)?.count(), 0);

    server.shutdown()?;
    Ok(())
}

#[test]
fn explicit_put_ack_sends_none_byte() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, _repo) = start(tmp.path(), PutAck::Explicit)?;

    let mut req = b"\x03ack.txt\0".to_vec();
    req.extend_from_slice(&3i64.to_be_bytes());
    req.extend_from_slice(b"abc");
    assert_eq!(raw_exchange(&client, &req)?, vec![0x00]);

    // The library client accepts either acknowledgement style
    client.put("ack2.txt", 2, &b"hi"[..])?;
    assert_eq!(client.list()?.len(), 2);

    server.shutdown()?;
    Ok(())
}

#[test]
fn readers_never_observe_partial_overwrites() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, _repo) = start(tmp.path(), PutAck::Implicit)?;
    let client = Arc::new(client);

    let a = Arc::new(pattern(300_000, 1));
    let b = Arc::new(pattern(450_000, 99));
    client.put("shared.bin", a.len() as u64, a.as_slice())?;

    let writer = {
        let (client, a, b) = (Arc::clone(&client), Arc::clone(&a), Arc::clone(&b));
        thread::spawn(move || -> Result<()> {
            for i in 0..10 {
                let body = if i % 2 == 0 { &b } else { &a };
                client.put("shared.bin", body.len() as u64, body.as_slice())?;
            }
            Ok(())
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let (client, a, b) = (Arc::clone(&client), Arc::clone(&a), Arc::clone(&b));
            thread::spawn(move || -> Result<()> {
                for _ in 0..10 {
                    let mut got = Vec::new();
                    client.get("shared.bin", &mut got)?;
                    assert!(got == *a || got == *b, "reader saw a torn file of {} bytes", got.len());
                }
                Ok(())
            })
        })
        .collect();

    writer.join().expect("writer thread")?;
    for r in readers {
        r.join().expect("reader thread")?;
    }
    let mut last = Vec::new();
    client.get("shared.bin", &mut last)?;
    assert_eq!(last, *a);

    drop(client);
    server.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_stops_accepting() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, _repo) = start(tmp.path(), PutAck::Implicit)?;
    client.put("x", 1, &b"x"[..])?;
    server.shutdown()?;

    let quick = Client::new(client.addr()).with_io_timeout(Duration::from_secs(2));
    assert!(quick.list().is_err());
    Ok(())
}

// Larger than the loopback socket buffers, so the server blocks mid-response
const HELD_SIZE: usize = 32 * 1024 * 1024;

// Start a Get and stop reading after its header; the server keeps the read lock
fn stalled_get(client: &Client, name: &str) -> Result<TcpStream> {
    let mut s = TcpStream::connect(client.addr())?;
    s.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut req = vec![0x02];
    req.extend_from_slice(name.as_bytes());
    req.push(0);
    s.write_all(&req)?;
    let mut header = [0u8; 1 + 8 + 16];
    s.read_exact(&mut header)?;
    assert_eq!(header[0], 0x05);
    Ok(s)
}

#[test]
fn held_get_delays_put_on_same_file() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, repo) = start(tmp.path(), PutAck::Implicit)?;

    let big = pattern(HELD_SIZE, 3);
    client.put("k.bin", big.len() as u64, big.as_slice())?;
    let before = repo.record("k.bin").expect("catalogued");

    let get = stalled_get(&client, "k.bin")?;
    let (tx, rx) = mpsc::channel();
    let addr = client.addr();
    // Default client: the queued wait outlasts its transfer timeout
    let put = thread::spawn(move || {
        let res = Client::new(addr).put("k.bin", 5, &b"hello"[..]);
        let _ = tx.send(());
        res
    });

    assert!(rx
        .recv_timeout(Duration::from_millis(timeouts::CLIENT_IO_MS + 500))
        .is_err());
    assert_eq!(repo.record("k.bin").as_ref(), Some(&before));
    let listed = client.list()?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].hash, before.hash);

    drop(get);
    put.join().expect("put thread")?;
    let after = repo.record("k.bin").expect("catalogued");
    assert_eq!(after.size, 5);
    assert_eq!(after.hash, hash_bytes(b"hello"));
    assert_eq!(client.list()?[0].hash, hash_bytes(b"hello"));

    server.shutdown()?;
    Ok(())
}

#[test]
fn stalled_put_delays_get_on_same_file() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (server, client, repo) = start(tmp.path(), PutAck::Implicit)?;
    client.put("k.txt", 3, &b"old"[..])?;

    let mut put = TcpStream::connect(client.addr())?;
    put.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut req = b"\x03k.txt\0".to_vec();
    req.extend_from_slice(&10i64.to_be_bytes());
    req.extend_from_slice(b"new-");
    put.write_all(&req)?;
    // Let the server take the write lock
    thread::sleep(Duration::from_millis(300));

    let (tx, rx) = mpsc::channel();
    let addr = client.addr();
    let get = thread::spawn(move || {
        let mut out = Vec::new();
        let res = Client::new(addr).get("k.txt", &mut out).map(|_| out);
        let _ = tx.send(());
        res
    });

    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(repo.record("k.txt").map(|r| r.size), Some(3));

    put.write_all(b"value!")?;
    put.shutdown(Shutdown::Write)?;
    let mut ack = Vec::new();
    put.read_to_end(&mut ack)?;
    assert!(ack.is_empty());

    let got = get.join().expect("get thread")?;
    assert_eq!(got, b"new-value!");
    assert_eq!(repo.record("k.txt").map(|r| r.hash), Some(hash_bytes(b"new-value!")));

    server.shutdown()?;
    Ok(())
}
