use std::collections::HashMap;
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{DazeError, Result};
use crate::resolver::Resolve;
use crate::router::{Road, Router};

/// IPv4 and IPv6 ranges that never leave the local network.
const RESERVED: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "100::/64",
    "2001::/32",
    "2001:20::/28",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Address-range router. Resolves the host to its first IP and tests
/// containment against the locale, remote and fucked buckets in that
/// order. Misses and resolution failures are Puzzle.
pub struct RouterIpNet {
    locale: Vec<IpNet>,
    remote: Vec<IpNet>,
    fucked: Vec<IpNet>,
    resolver: Arc<dyn Resolve>,
}

impl RouterIpNet {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            locale: Vec::new(),
            remote: Vec::new(),
            fucked: Vec::new(),
            resolver,
        }
    }

    /// A router whose locale bucket is the built-in reserved ranges.
    pub fn reserved(resolver: Arc<dyn Resolve>) -> Self {
        let mut router = Self::new(resolver);
        router.locale = RESERVED.iter().filter_map(|s| s.parse().ok()).collect();
        router
    }

    pub fn push(&mut self, road: Road, net: IpNet) {
        match road {
            Road::Locale => self.locale.push(net),
            Road::Remote => self.remote.push(net),
            Road::Fucked => self.fucked.push(net),
            Road::Puzzle => {}
        }
    }

    pub fn extend(&mut self, road: Road, nets: impl IntoIterator<Item = IpNet>) {
        for net in nets {
            self.push(road, net);
        }
    }

    /// Load a CIDR file: same line grammar as the rule file, with CIDR
    /// strings in place of glob patterns.
    pub fn from_reader<R: BufRead>(reader: R, resolver: Arc<dyn Resolve>) -> Result<Self> {
        let mut router = Self::new(resolver);
        for line in reader.lines() {
            let line = line.map_err(DazeError::Io)?;
            let mut fields = line.split_whitespace();
            let road = match fields.next() {
                Some("L") => Road::Locale,
                Some("R") => Road::Remote,
                Some("B") => Road::Fucked,
                _ => continue,
            };
            for cidr in fields {
                let net: IpNet = cidr
                    .parse()
                    .map_err(|e| DazeError::Config(format!("bad CIDR {cidr:?}: {e}")))?;
                router.push(road, net);
            }
        }
        Ok(router)
    }

    fn classify(&self, ip: IpAddr) -> Road {
        if self.locale.iter().any(|net| net.contains(&ip)) {
            return Road::Locale;
        }
        if self.remote.iter().any(|net| net.contains(&ip)) {
            return Road::Remote;
        }
        if self.fucked.iter().any(|net| net.contains(&ip)) {
            return Road::Fucked;
        }
        Road::Puzzle
    }
}

#[async_trait]
impl Router for RouterIpNet {
    async fn road(&self, host: &str) -> Road {
        let ip = match self.resolver.lookup(host).await {
            Ok(addrs) => match addrs.first() {
                Some(ip) => *ip,
                None => return Road::Puzzle,
            },
            Err(_) => return Road::Puzzle,
        };
        self.classify(ip)
    }
}

/// Ingest the APNIC delegation dataset into per-region CIDR sets.
///
/// Only `apnic|<region>|ipv4|...` and `apnic|<region>|ipv6|...` lines are
/// consumed. For ipv4 the fifth field is an address count that must be a
/// power of two (the prefix length is `32 - log2(count)`); for ipv6 it is
/// already a prefix length. Malformed lines are skipped.
pub fn parse_apnic<R: BufRead>(reader: R) -> Result<HashMap<String, Vec<IpNet>>> {
    let mut regions: HashMap<String, Vec<IpNet>> = HashMap::new();
    for line in reader.lines() {
        let line = line.map_err(DazeError::Io)?;
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 5 || fields[0] != "apnic" {
            continue;
        }
        let (region, kind, addr, size) = (fields[1], fields[2], fields[3], fields[4]);
        let net = match kind {
            "ipv4" => {
                let start = match addr.parse::<std::net::Ipv4Addr>() {
                    Ok(a) => a,
                    Err(_) => continue,
                };
                let count = match size.parse::<u32>() {
                    Ok(n) if n.is_power_of_two() => n,
                    _ => continue,
                };
                let prefix = 32 - count.trailing_zeros() as u8;
                match Ipv4Net::new(start, prefix) {
                    Ok(net) => IpNet::V4(net),
                    Err(_) => continue,
                }
            }
            "ipv6" => {
                let start = match addr.parse::<std::net::Ipv6Addr>() {
                    Ok(a) => a,
                    Err(_) => continue,
                };
                let prefix = match size.parse::<u8>() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                match Ipv6Net::new(start, prefix) {
                    Ok(net) => IpNet::V6(net),
                    Err(_) => continue,
                }
            }
            _ => continue,
        };
        regions.entry(region.to_string()).or_default().push(net);
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct NoResolver;

    #[async_trait]
    impl Resolve for NoResolver {
        async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
            host.parse::<IpAddr>()
                .map(|ip| vec![ip])
                .map_err(|_| DazeError::Resolve("unresolvable".into()))
        }
    }

    fn resolver() -> Arc<dyn Resolve> {
        Arc::new(NoResolver)
    }

    #[tokio::test]
    async fn reserved_ranges_are_locale() {
        let router = RouterIpNet::reserved(resolver());
        assert_eq!(router.road("127.0.0.1").await, Road::Locale);
        assert_eq!(router.road("192.168.1.20").await, Road::Locale);
        assert_eq!(router.road("10.8.0.1").await, Road::Locale);
        assert_eq!(router.road("::1").await, Road::Locale);
        assert_eq!(router.road("fe80::1").await, Road::Locale);
        assert_eq!(router.road("8.8.8.8").await, Road::Puzzle);
    }

    #[tokio::test]
    async fn buckets_are_tested_in_order() {
        let mut router = RouterIpNet::new(resolver());
        router.push(Road::Locale, "10.0.0.0/8".parse().unwrap());
        router.push(Road::Remote, "10.1.0.0/16".parse().unwrap());
        router.push(Road::Fucked, "203.0.113.0/24".parse().unwrap());
        assert_eq!(router.road("10.1.2.3").await, Road::Locale);
        assert_eq!(router.road("203.0.113.9").await, Road::Fucked);
    }

    #[tokio::test]
    async fn resolution_failure_is_puzzle() {
        let router = RouterIpNet::reserved(resolver());
        assert_eq!(router.road("not-an-address.invalid").await, Road::Puzzle);
    }

    #[tokio::test]
    async fn cidr_file_grammar() {
        let file = "# comment\nL 10.0.0.0/8\nR 1.0.0.0/8 2.0.0.0/8\nB 203.0.113.0/24\n";
        let router = RouterIpNet::from_reader(Cursor::new(file), resolver()).unwrap();
        assert_eq!(router.road("10.0.0.1").await, Road::Locale);
        assert_eq!(router.road("1.2.3.4").await, Road::Remote);
        assert_eq!(router.road("2.3.4.5").await, Road::Remote);
        assert_eq!(router.road("203.0.113.1").await, Road::Fucked);
        assert_eq!(router.road("9.9.9.9").await, Road::Puzzle);
    }

    #[test]
    fn bad_cidr_is_an_error() {
        let file = "L not-a-cidr\n";
        assert!(RouterIpNet::from_reader(Cursor::new(file), resolver()).is_err());
    }

    #[test]
    fn apnic_ingestion() {
        let data = "\
apnic|JP|ipv4|1.0.16.0|4096|20110412|allocated\n\
apnic|CN|ipv4|1.0.1.0|256|20110414|allocated\n\
apnic|CN|ipv6|2001:250::|35|20000426|allocated\n\
apnic|CN|ipv4|1.0.2.0|300|20110414|allocated\n\
apnic|*|asn|*|9999|summary\n\
ripencc|NL|ipv4|2.56.0.0|1024|20180910|allocated\n";
        let regions = parse_apnic(Cursor::new(data)).unwrap();
        assert_eq!(regions["JP"], vec!["1.0.16.0/20".parse::<IpNet>().unwrap()]);
        assert_eq!(
            regions["CN"],
            vec![
                "1.0.1.0/24".parse::<IpNet>().unwrap(),
                "2001:250::/35".parse::<IpNet>().unwrap(),
            ]
        );
        // 300 is not a power of two, the ripencc line is another registry
        assert!(!regions.contains_key("NL"));
    }
}
