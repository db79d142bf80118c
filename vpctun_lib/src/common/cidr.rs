use std::fmt;
use std::io;
use std::io::ErrorKind;
use std::net::Ipv4Addr;

/// An IPv4 destination prefix in `a.b.c.d/len` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> io::Result<Cidr> {
        let Some((address, prefix)) = s.split_once('/') else {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid cidr '{}': expected a.b.c.d/len", s),
            ));
        };
        let network = address.parse::<Ipv4Addr>().map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid cidr '{}': bad network address", s),
            )
        })?;
        let prefix = prefix.parse::<u8>().ok().filter(|p| (1..=32).contains(p));
        let Some(prefix) = prefix else {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid cidr '{}': prefix length must be 1-32", s),
            ));
        };
        Ok(Cidr { network, prefix })
    }

    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_netmask(self.prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Maps a prefix length in 1..=32 to its dotted-decimal netmask.
pub fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    debug_assert!((1..=32).contains(&prefix));
    let bits = u32::MAX << (32 - prefix as u32);
    Ipv4Addr::from(bits)
}

/// Inverse of [`prefix_to_netmask`]. Returns `None` for non-contiguous masks.
pub fn netmask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if prefix == 0 || bits != u32::MAX << (32 - prefix) {
        return None;
    }
    Some(prefix as u8)
}
