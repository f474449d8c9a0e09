//! IPv4 subnet matching for the trusted-network auth bypass.

use std::net::Ipv4Addr;
use std::str::FromStr;

/// A parsed IPv4 CIDR block, e.g. `192.168.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    mask: u32,
}

impl Subnet {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & self.mask) == (self.network & self.mask)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid CIDR (missing '/'): '{}'", s))?;
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| format!("Invalid network address: '{}'", addr_part))?;
        let prefix: u32 = prefix_part
            .parse()
            .map_err(|_| format!("Invalid prefix length: '{}'", prefix_part))?;
        if prefix > 32 {
            return Err(format!("Prefix length out of range: {}", prefix));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Ok(Subnet {
            network: u32::from(addr),
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_inside_and_outside() {
        let subnet: Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 15)));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 2, 1)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_edge_prefixes() {
        let all: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));

        let single: Subnet = "10.1.2.3/32".parse().unwrap();
        assert!(single.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!single.contains(Ipv4Addr::new(10, 1, 2, 4)));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("192.168.1.0".parse::<Subnet>().is_err());
        assert!("192.168.1.0/33".parse::<Subnet>().is_err());
        assert!("not-an-ip/24".parse::<Subnet>().is_err());
    }
}
