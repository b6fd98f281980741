use color_eyre::eyre::eyre;
use color_eyre::Report;
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

/// One element of a network set: an exact address or a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    Addr(IpAddr),
    Net(IpNet),
}

impl Network {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match self {
            Network::Addr(addr) => *addr == ip,
            Network::Net(net) => net.contains(&ip),
        }
    }
}

impl FromStr for Network {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Network::Addr(addr));
        }
        s.parse::<IpNet>()
            .map(Network::Net)
            .map_err(|e| eyre!("invalid network {:?}: {}", s, e))
    }
}

/// Role membership as the manager sees it: an empty set admits everyone.
pub fn in_any(ip: IpAddr, set: &[Network]) -> bool {
    set.is_empty() || set.iter().any(|net| net.contains(ip))
}

/// One endpoint of the analyzer's flow filter. With its own set empty, an
/// address passes when the opposite set is empty too, or when it does not
/// fall in the opposite set.
pub fn side_matches(ip: IpAddr, own: &[Network], opposite: &[Network]) -> bool {
    if own.is_empty() {
        opposite.is_empty() || !opposite.iter().any(|net| net.contains(ip))
    } else {
        own.iter().any(|net| net.contains(ip))
    }
}

/// A flow is kept when both of its endpoints match their own side.
pub fn flow_matches(
    src_ip: IpAddr,
    dest_ip: IpAddr,
    src: &[Network],
    dest: &[Network],
) -> bool {
    side_matches(src_ip, src, dest) && side_matches(dest_ip, dest, src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("test ip should parse")
    }

    fn nets(patterns: &[&str]) -> Vec<Network> {
        patterns
            .iter()
            .map(|s| s.parse().expect("test network should parse"))
            .collect()
    }

    #[test]
    fn parse_exact_and_cidr() {
        assert_eq!(
            "10.0.0.1".parse::<Network>().unwrap(),
            Network::Addr(ip("10.0.0.1"))
        );
        assert!(matches!(
            "10.0.0.0/8".parse::<Network>().unwrap(),
            Network::Net(_)
        ));
        assert!("not-a-network".parse::<Network>().is_err());
        // missing prefix length is not a network either
        assert!("10.0.0.0/".parse::<Network>().is_err());
    }

    #[test]
    fn contains() {
        let exact: Network = "10.0.0.1".parse().unwrap();
        assert!(exact.contains(ip("10.0.0.1")));
        assert!(!exact.contains(ip("10.0.0.2")));

        let cidr: Network = "192.168.0.0/24".parse().unwrap();
        assert!(cidr.contains(ip("192.168.0.200")));
        assert!(!cidr.contains(ip("192.168.1.1")));
    }

    #[test]
    fn empty_set_admits_everyone() {
        assert!(in_any(ip("10.0.0.1"), &[]));
        assert!(in_any(ip("10.0.0.1"), &nets(&["10.0.0.0/8"])));
        assert!(!in_any(ip("172.16.0.1"), &nets(&["10.0.0.0/8"])));
    }

    #[test]
    fn side_matches_formula() {
        let own = nets(&["10.0.0.0/8"]);
        let opposite = nets(&["192.168.0.0/16"]);

        // own set present: membership decides
        assert!(side_matches(ip("10.1.2.3"), &own, &opposite));
        assert!(!side_matches(ip("172.16.0.1"), &own, &opposite));

        // both sets empty: everything passes
        assert!(side_matches(ip("10.1.2.3"), &[], &[]));

        // own empty: pass only outside the opposite set
        assert!(side_matches(ip("10.1.2.3"), &[], &opposite));
        assert!(!side_matches(ip("192.168.4.5"), &[], &opposite));
    }

    #[test]
    fn flow_matches_both_endpoints() {
        let src = nets(&["10.0.0.0/8"]);
        let dest = nets(&["192.168.0.0/16"]);

        assert!(flow_matches(ip("10.0.0.1"), ip("192.168.0.1"), &src, &dest));
        assert!(!flow_matches(ip("10.0.0.1"), ip("172.16.0.1"), &src, &dest));
        assert!(!flow_matches(ip("172.16.0.1"), ip("192.168.0.1"), &src, &dest));

        // with a src filter only, a dest that happens to sit in the src set
        // still passes (its own set is empty and the opposite is the dest set)
        assert!(flow_matches(ip("10.0.0.1"), ip("10.0.0.2"), &src, &[]));
    }

    #[quickcheck]
    fn address_matches_its_own_host_net(a: u8, b: u8, c: u8, d: u8) -> bool {
        let addr = IpAddr::from([a, b, c, d]);
        let net: Network = format!("{}/32", addr).parse().unwrap();
        net.contains(addr)
    }
}
