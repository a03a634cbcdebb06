//! Target addresses and the shared `ATYP | ADDR | PORT` wire codec.
//!
//! SOCKS5, VLESS and Trojan all carry destination addresses in the same
//! shape: one address-type byte (1=IPv4, 3=domain, 4=IPv6), the address
//! itself (domains get a leading length byte), then a big-endian port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Either a fully-qualified domain name or an IP address, exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Name(String),
    Ip(IpAddr),
}

/// An address a client wants to reach through the proxy.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    host: Host,
    port: u16,
}

impl TargetAddr {
    /// Build from a host string (IP literal or domain) and port.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(TargetAddr {
                host: Host::Ip(ip),
                port,
            });
        }
        if host.len() > 255 {
            return Err(Error::protocol(format!(
                "domain name too long: {} bytes",
                host.len()
            )));
        }
        if host.is_empty() || host.contains('\0') {
            return Err(Error::protocol("invalid domain name"));
        }
        Ok(TargetAddr {
            host: Host::Name(host.to_string()),
            port,
        })
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        TargetAddr {
            host: Host::Ip(ip),
            port,
        }
    }

    /// Parse a `host:port` string; IPv6 hosts are bracketed.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        TargetAddr::new(host, port)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The host rendered without the port.
    pub fn host_str(&self) -> String {
        match &self.host {
            Host::Name(name) => name.clone(),
            Host::Ip(ip) => ip.to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address-type byte for the wire formats.
    pub fn atyp(&self) -> u8 {
        match &self.host {
            Host::Name(_) => ATYP_DOMAIN,
            Host::Ip(IpAddr::V4(_)) => ATYP_IPV4,
            Host::Ip(IpAddr::V6(_)) => ATYP_IPV6,
        }
    }

    /// Append the host part of the wire form: `[len] domain` or the
    /// raw IP octets, without ATYP or port.
    pub fn write_host(&self, buf: &mut Vec<u8>) {
        match &self.host {
            Host::Name(name) => {
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            Host::Ip(IpAddr::V4(ip)) => buf.extend_from_slice(&ip.octets()),
            Host::Ip(IpAddr::V6(ip)) => buf.extend_from_slice(&ip.octets()),
        }
    }

    /// Append the address body (everything after the ATYP byte):
    /// host, then the big-endian port.
    pub fn write_body(&self, buf: &mut Vec<u8>) {
        self.write_host(buf);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Name(name) => write!(f, "{}:{}", name, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

fn split_host_port(s: &str) -> Result<(&str, u16)> {
    let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
        // [v6]:port
        let end = rest
            .find(']')
            .ok_or_else(|| Error::protocol(format!("invalid address {}", s)))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| Error::protocol(format!("missing port in {}", s)))?;
        (&rest[..end], port)
    } else {
        let idx = s
            .rfind(':')
            .ok_or_else(|| Error::protocol(format!("missing port in {}", s)))?;
        (&s[..idx], &s[idx + 1..])
    };
    let port = port_str
        .parse::<u16>()
        .map_err(|_| Error::protocol(format!("invalid port in {}", s)))?;
    Ok((host, port))
}

/// Encode `ATYP | ADDR | PORT` into `buf`.
pub fn encode_addr(addr: &TargetAddr, buf: &mut Vec<u8>) {
    buf.push(addr.atyp());
    addr.write_body(buf);
}

/// Read an `ATYP | ADDR | PORT` tuple. Returns the address and the
/// number of bytes consumed.
pub async fn read_addr<R>(r: &mut R) -> Result<(TargetAddr, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    r.read_exact(&mut atyp).await?;
    let mut read = 1;

    let addr = match atyp[0] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            r.read_exact(&mut buf).await?;
            read += buf.len();
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::from_ip(IpAddr::V4(ip), port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            r.read_exact(&mut buf).await?;
            read += buf.len();
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::from_ip(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            r.read_exact(&mut len).await?;
            read += 1;
            let mut buf = vec![0u8; len[0] as usize + 2];
            r.read_exact(&mut buf).await?;
            read += buf.len();
            let name = std::str::from_utf8(&buf[..len[0] as usize])
                .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
            let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
            TargetAddr::new(name, port)?
        }
        other => {
            return Err(Error::unsupported(format!("unknown address type {}", other)));
        }
    };

    Ok((addr, read))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(host: &str, port: u16) -> TargetAddr {
        let addr = TargetAddr::new(host, port).unwrap();
        let mut buf = Vec::new();
        encode_addr(&addr, &mut buf);
        let mut cursor = buf.as_slice();
        let (decoded, n) = read_addr(&mut cursor).await.unwrap();
        assert_eq!(n, buf.len());
        decoded
    }

    #[tokio::test]
    async fn test_roundtrip_ipv4() {
        let addr = roundtrip("127.0.0.1", 80).await;
        assert_eq!(addr.to_string(), "127.0.0.1:80");
        assert_eq!(addr.atyp(), ATYP_IPV4);
    }

    #[tokio::test]
    async fn test_roundtrip_ipv6() {
        let addr = roundtrip("2001:db8::1", 443).await;
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");
        assert_eq!(addr.atyp(), ATYP_IPV6);
    }

    #[tokio::test]
    async fn test_roundtrip_domain() {
        let addr = roundtrip("example.com", 8080).await;
        assert_eq!(addr.to_string(), "example.com:8080");
        assert_eq!(addr.atyp(), ATYP_DOMAIN);
    }

    #[tokio::test]
    async fn test_roundtrip_port_zero() {
        // Port 0 is valid bytes-wise for the codec.
        let addr = roundtrip("example.com", 0).await;
        assert_eq!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let buf = [0x07u8, 0, 0, 0, 0, 0, 0];
        let mut cursor = buf.as_slice();
        let err = read_addr(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("unknown address type 7"));
    }

    #[test]
    fn test_domain_too_long_rejected() {
        let long = "a".repeat(256);
        assert!(TargetAddr::new(&long, 80).is_err());
        let ok = "a".repeat(255);
        assert!(TargetAddr::new(&ok, 80).is_ok());
    }

    #[test]
    fn test_parse_host_port() {
        let addr = TargetAddr::parse("example.com:443").unwrap();
        assert_eq!(addr.host_str(), "example.com");
        assert_eq!(addr.port(), 443);

        let addr = TargetAddr::parse("[::1]:1080").unwrap();
        assert_eq!(addr.to_string(), "[::1]:1080");

        assert!(TargetAddr::parse("no-port").is_err());
    }

    #[test]
    fn test_encode_domain_layout() {
        let addr = TargetAddr::new("example.com", 443).unwrap();
        let mut buf = Vec::new();
        encode_addr(&addr, &mut buf);
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(&buf[13..], &[0x01, 0xBB]);
    }
}
