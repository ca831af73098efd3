use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("invalid acl entry {0:?}")]
    InvalidEntry(String),
}

enum AclEntry {
    Single(IpAddr),
    Cidr { net: IpAddr, prefix: u8 },
}

/// Allow-list of single addresses and CIDR blocks. An empty list
/// allows everything.
pub struct IpAllowList {
    entries: Vec<AclEntry>,
}

impl IpAllowList {
    pub fn parse(entries: &[String]) -> Result<IpAllowList, AclError> {
        let entries = entries
            .iter()
            .map(|entry| parse_entry(entry))
            .collect::<Result<_, _>>()?;
        Ok(IpAllowList { entries })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.iter().any(|entry| match entry {
            AclEntry::Single(allowed) => *allowed == ip,
            AclEntry::Cidr { net, prefix } => cidr_contains(*net, *prefix, ip),
        })
    }
}

fn parse_entry(entry: &str) -> Result<AclEntry, AclError> {
    let invalid = || AclError::InvalidEntry(entry.to_string());
    match entry.split_once('/') {
        Some((addr, prefix)) => {
            let net: IpAddr = addr.parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            let max = if net.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(invalid());
            }
            Ok(AclEntry::Cidr { net, prefix })
        }
        None => Ok(AclEntry::Single(entry.parse().map_err(|_| invalid())?)),
    }
}

fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    if prefix == 0 {
        return matches!(
            (net, ip),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
        );
    }
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let shift = 32 - u32::from(prefix);
            u32::from(net) >> shift == u32::from(ip) >> shift
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let shift = 128 - u32::from(prefix);
            u128::from(net) >> shift == u128::from(ip) >> shift
        }
        _ => false,
    }
}
