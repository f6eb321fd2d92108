use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::IpAddr;

/// A validated `target` scan parameter: a single host or a CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    Host(IpAddr),
    Network(IpNet),
}

impl ScanTarget {
    /// Number of hosts the backend will probe.
    ///
    /// For IPv4 networks, excludes the network and broadcast addresses.
    /// IPv6 networks are reported as `None`; the count is not meaningful there.
    pub fn host_count(&self) -> Option<u64> {
        match self {
            ScanTarget::Host(_) => Some(1),
            ScanTarget::Network(IpNet::V4(n4)) => Some(ipv4_host_count(*n4)),
            ScanTarget::Network(IpNet::V6(_)) => None,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::Host(ip) => write!(f, "{ip}"),
            ScanTarget::Network(net) => write!(f, "{net}"),
        }
    }
}

/// Parse a target string (plain IP or CIDR).
pub fn parse_target(s: &str) -> Result<ScanTarget> {
    let t = s.trim();
    if t.contains('/') {
        let net = t
            .parse::<IpNet>()
            .with_context(|| format!("invalid CIDR: {t}"))?;
        Ok(ScanTarget::Network(net.trunc()))
    } else {
        let ip = t
            .parse::<IpAddr>()
            .with_context(|| format!("invalid IP: {t}"))?;
        Ok(ScanTarget::Host(ip))
    }
}

fn ipv4_host_count(net: Ipv4Net) -> u64 {
    let start = u64::from(u32::from(net.network()));
    let end = u64::from(u32::from(net.broadcast()));
    if end <= start + 1 {
        // /31 and /32 have no separate network/broadcast addresses
        return end - start + 1;
    }
    end - start - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_plain_host() {
        let t = parse_target(" 10.1.2.3 ").unwrap();
        assert_eq!(t, ScanTarget::Host(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert_eq!(t.host_count(), Some(1));
    }

    #[test]
    fn network_is_truncated_and_counts_hosts() {
        let t = parse_target("192.168.1.42/24").unwrap();
        assert_eq!(t.to_string(), "192.168.1.0/24");
        assert_eq!(t.host_count(), Some(254));
    }

    #[test]
    fn small_networks_count_every_address() {
        assert_eq!(parse_target("10.0.0.0/30").unwrap().host_count(), Some(2));
        assert_eq!(parse_target("10.0.0.0/31").unwrap().host_count(), Some(2));
        assert_eq!(parse_target("10.0.0.7/32").unwrap().host_count(), Some(1));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_target("10.0.0.0/33").is_err());
        assert!(parse_target("router.local").is_err());
        assert!(parse_target("").is_err());
    }
}
