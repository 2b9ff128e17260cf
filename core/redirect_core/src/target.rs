//! Redirection targets: a capture filter, the LIH that answers first, and the
//! HIH backends a flow can be escalated to.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;
use crate::packet::{Packet, Protocol};

/// IPv4 network in `a.b.c.d/len` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, p),
            None => (s, "32"),
        };
        let addr: Ipv4Addr = addr.parse().map_err(|_| format!("invalid network address: {}", s))?;
        let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix: {}", s))?;
        if prefix > 32 {
            return Err(format!("prefix longer than 32: {}", s));
        }
        Ok(Ipv4Cidr { addr, prefix })
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(c: Ipv4Cidr) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Selects the external traffic a target captures. Every criterion that is
/// present must match; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFilter {
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub dst_host: Option<Ipv4Addr>,
    #[serde(default)]
    pub dst_net: Option<Ipv4Cidr>,
    #[serde(default)]
    pub dst_ports: Vec<u16>,
}

impl CaptureFilter {
    pub fn matches(&self, pkt: &Packet) -> bool {
        if let Some(proto) = self.protocol {
            if pkt.protocol() != proto {
                return false;
            }
        }
        if let Some(host) = self.dst_host {
            if pkt.ip.dst != host {
                return false;
            }
        }
        if let Some(net) = self.dst_net {
            if !net.contains(pkt.ip.dst) {
                return false;
            }
        }
        self.dst_ports.is_empty() || self.dst_ports.contains(&pkt.dst_port())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Non-zero identifier used by decisions; 0 means "no backend"
    pub id: u64,
    pub addr: Ipv4Addr,
    /// Port override; by default the backend listens on the LIH's port
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub filter: CaptureFilter,
    pub lih: Ipv4Addr,
    pub backends: Vec<Backend>,
    /// Addresses backend-initiated traffic is source-NATed to
    #[serde(default)]
    pub uplinks: Vec<Ipv4Addr>,
    /// Decision tree deciding whether to escalate a flow
    #[serde(default)]
    pub rule: Option<RuleConfig>,
    /// Backend committed on ACCEPT (defaults to the lowest id)
    #[serde(default)]
    pub backend: Option<u64>,
}

impl Target {
    pub fn matches(&self, pkt: &Packet) -> bool {
        self.filter.matches(pkt)
    }

    pub fn backend(&self, id: u64) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn backend_by_addr(&self, addr: Ipv4Addr) -> Option<&Backend> {
        self.backends.iter().find(|b| b.addr == addr)
    }

    pub fn is_uplink(&self, addr: Ipv4Addr) -> bool {
        self.uplinks.contains(&addr)
    }

    pub fn default_backend(&self) -> Option<u64> {
        self.backend
            .or_else(|| self.backends.iter().map(|b| b.id).min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tcp_frame, build_udp_frame, TcpSegment};
    use crate::packet::{classify, TcpFlags};
    use std::net::SocketAddrV4;

    fn syn_to(dst: Ipv4Addr, port: u16) -> Packet {
        let frame = build_tcp_frame(&TcpSegment {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4444),
            dst: SocketAddrV4::new(dst, port),
            seq: 1,
            ack: 0,
            flags: TcpFlags { syn: true, ..TcpFlags::default() },
            window: 512,
            payload: &[],
        });
        classify(&frame, 0, 0).unwrap()
    }

    #[test]
    fn test_cidr_parse_and_contains() {
        let net: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!net.contains(Ipv4Addr::new(10, 0, 1, 1)));

        let all: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));

        let host: Ipv4Cidr = "10.0.0.9".parse().unwrap();
        assert_eq!(host.prefix, 32);
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("nope/8".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let filter = CaptureFilter {
            protocol: Some(Protocol::Tcp),
            dst_host: None,
            dst_net: Some("10.0.0.0/24".parse().unwrap()),
            dst_ports: vec![80, 443],
        };
        assert!(filter.matches(&syn_to(Ipv4Addr::new(10, 0, 0, 9), 80)));
        assert!(!filter.matches(&syn_to(Ipv4Addr::new(10, 0, 0, 9), 22)));
        assert!(!filter.matches(&syn_to(Ipv4Addr::new(10, 0, 5, 9), 80)));

        let udp = build_udp_frame(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80),
            &[0u8; 12],
        );
        assert!(!filter.matches(&classify(&udp, 0, 0).unwrap()));

        assert!(CaptureFilter::default().matches(&syn_to(Ipv4Addr::new(1, 2, 3, 4), 9)));
    }

    #[test]
    fn test_default_backend() {
        let mut target = Target {
            filter: CaptureFilter::default(),
            lih: Ipv4Addr::new(10, 0, 0, 9),
            backends: vec![
                Backend { id: 7, addr: Ipv4Addr::new(10, 0, 1, 7), port: None },
                Backend { id: 3, addr: Ipv4Addr::new(10, 0, 1, 3), port: Some(8080) },
            ],
            uplinks: vec![],
            rule: None,
            backend: None,
        };
        assert_eq!(target.default_backend(), Some(3));
        target.backend = Some(7);
        assert_eq!(target.default_backend(), Some(7));
        assert_eq!(target.backend_by_addr(Ipv4Addr::new(10, 0, 1, 3)).unwrap().id, 3);
        assert!(target.backend(9).is_none());
    }
}
