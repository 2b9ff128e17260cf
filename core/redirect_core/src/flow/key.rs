//! Flow keys.
//!
//! A key renders as `src_ip:src_port:dst_ip:dst_port` and parses back to the
//! same value, so logs and lookups agree on one textual form.

use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;

use crate::packet::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        FlowKey { protocol, src, dst }
    }

    pub fn reversed(&self) -> Self {
        FlowKey {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(pub String);

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid flow key: {}", self.0)
    }
}

impl std::error::Error for ParseKeyError {}

/// Split `a.b.c.d:p:e.f.g.h:q` into its two socket halves.
fn split_sockets(s: &str) -> Result<(SocketAddrV4, SocketAddrV4), ParseKeyError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 4 {
        return Err(ParseKeyError(s.to_string()));
    }
    let left = format!("{}:{}", parts[0], parts[1]);
    let right = format!("{}:{}", parts[2], parts[3]);
    let src = left.parse().map_err(|_| ParseKeyError(s.to_string()))?;
    let dst = right.parse().map_err(|_| ParseKeyError(s.to_string()))?;
    Ok((src, dst))
}

impl FlowKey {
    /// Parse the textual form back; the protocol is not part of the text.
    pub fn parse(protocol: Protocol, s: &str) -> Result<Self, ParseKeyError> {
        let (src, dst) = split_sockets(s)?;
        Ok(FlowKey { protocol, src, dst })
    }
}

/// Key of the pending-redirection index: the backend socket a committed flow
/// was sent to, plus the external peer it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedirectKey {
    pub protocol: Protocol,
    pub backend: SocketAddrV4,
    pub ext: SocketAddrV4,
}

impl fmt::Display for RedirectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.ext)
    }
}

impl FromStr for RedirectKey {
    type Err = ParseKeyError;

    /// Parses `backend:ext`, assuming TCP (use the fields directly for UDP).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backend, ext) = split_sockets(s)?;
        Ok(RedirectKey {
            protocol: Protocol::Tcp,
            backend,
            ext,
        })
    }
}

/// Value of the pending-redirection index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectTarget {
    /// LIH socket the external peer believes it is talking to
    pub lih: SocketAddrV4,
    /// Uplink mark of the redirected flow
    pub mark: u32,
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lih, self.mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sock(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = FlowKey::new(Protocol::Tcp, sock(5, 4444), sock(9, 80));
        let text = key.to_string();
        assert_eq!(text, "10.0.0.5:4444:10.0.0.9:80");
        assert_eq!(FlowKey::parse(Protocol::Tcp, &text).unwrap(), key);
    }

    #[test]
    fn test_key_reversed_is_involution() {
        let key = FlowKey::new(Protocol::Udp, sock(5, 53000), sock(9, 53));
        assert_ne!(key.reversed(), key);
        assert_eq!(key.reversed().reversed(), key);
        assert_eq!(key.reversed().to_string(), "10.0.0.9:53:10.0.0.5:53000");
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(FlowKey::parse(Protocol::Tcp, "10.0.0.5:4444").is_err());
        assert!(FlowKey::parse(Protocol::Tcp, "10.0.0.5:x:10.0.0.9:80").is_err());
        assert!(FlowKey::parse(Protocol::Tcp, "10.0.0.500:1:10.0.0.9:80").is_err());
    }

    #[test]
    fn test_redirect_key_roundtrip() {
        let key = RedirectKey {
            protocol: Protocol::Tcp,
            backend: sock(30, 80),
            ext: sock(5, 4444),
        };
        assert_eq!(key.to_string(), "10.0.0.30:80:10.0.0.5:4444");
        assert_eq!(key.to_string().parse::<RedirectKey>().unwrap(), key);
    }
}
