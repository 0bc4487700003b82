//! Remote host parsing for lanshare:// addresses

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
}

/// Parse `lanshare://host[:port]` or a bare `host[:port]`.
///
/// IPv6 literals need brackets (`[::1]:7777`). A trailing `/` is tolerated.
pub fn parse_remote(s: &str) -> Option<RemoteHost> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let rest = if lower.starts_with("lanshare://") {
        &s_trim["lanshare://".len()..]
    } else if lower.contains("://") {
        return None;
    } else {
        s_trim
    };
    let hp = rest.trim_end_matches('/');
    if hp.is_empty() || hp.contains('/') {
        return None;
    }

    let (host, port) = if let Some(v6) = hp.strip_prefix('[') {
        let (h, after) = v6.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        (h.to_string(), port)
    } else {
        match hp.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()?),
            None => (hp.to_string(), DEFAULT_PORT),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteHost { host, port })
}
