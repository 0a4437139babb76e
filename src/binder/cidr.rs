//! Bitwise CIDR membership over `std::net`, no extra crate needed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy)]
pub enum Cidr {
    V4 { network: Ipv4Addr, prefix_len: u8 },
    V6 { network: Ipv6Addr, prefix_len: u8 },
}

impl Cidr {
    pub fn parse(text: &str) -> Option<Self> {
        let (addr_part, prefix_part) = text.split_once('/')?;
        let prefix_len: u8 = prefix_part.parse().ok()?;
        match addr_part.parse::<IpAddr>().ok()? {
            IpAddr::V4(addr) if prefix_len <= 32 => Some(Cidr::V4 {
                network: mask_v4(addr, prefix_len),
                prefix_len,
            }),
            IpAddr::V6(addr) if prefix_len <= 128 => Some(Cidr::V6 {
                network: mask_v6(addr, prefix_len),
                prefix_len,
            }),
            _ => None,
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Cidr::V4 { network, prefix_len }, IpAddr::V4(addr)) => mask_v4(addr, *prefix_len) == *network,
            (Cidr::V6 { network, prefix_len }, IpAddr::V6(addr)) => mask_v6(addr, *prefix_len) == *network,
            _ => false,
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask: u32 = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
    Ipv4Addr::from(bits & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let octets = addr.octets();
    let mut masked = [0u8; 16];
    let full_bytes = (prefix_len / 8) as usize;
    let remaining_bits = prefix_len % 8;

    masked[..full_bytes].copy_from_slice(&octets[..full_bytes]);
    if remaining_bits > 0 && full_bytes < 16 {
        let partial_mask = 0xFFu8 << (8 - remaining_bits);
        masked[full_bytes] = octets[full_bytes] & partial_mask;
    }
    Ipv6Addr::from(masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cgnat_range_contains_resolver() {
        let cidr = Cidr::parse("100.64.0.0/10").unwrap();
        assert!(cidr.contains("100.64.1.1".parse().unwrap()));
        assert!(cidr.contains("100.127.255.255".parse().unwrap()));
        assert!(!cidr.contains("100.128.0.0".parse().unwrap()));
        assert!(!cidr.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn v4_slash_32_matches_exact_address_only() {
        let cidr = Cidr::parse("10.0.0.5/32").unwrap();
        assert!(cidr.contains("10.0.0.5".parse().unwrap()));
        assert!(!cidr.contains("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn v6_prefix_matches_partial_byte_boundary() {
        let cidr = Cidr::parse("fd00::/9").unwrap();
        assert!(cidr.contains("fd00::1".parse().unwrap()));
        assert!(cidr.contains("fd7f:ffff::1".parse().unwrap()));
        assert!(!cidr.contains("fe00::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_cidr_text() {
        assert!(Cidr::parse("not-a-cidr").is_none());
        assert!(Cidr::parse("10.0.0.0/33").is_none());
    }
}
