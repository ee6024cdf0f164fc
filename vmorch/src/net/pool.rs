//! Point-to-point address allocation for tap devices.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use vmorch_shared::errors::{VmorchError, VmorchResult};

/// Prefix length of every lease subnet.
pub const LEASE_PREFIX_LEN: u8 = 30;

/// Host and guest side of one /30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapAddress {
    pub subnet: Ipv4Addr,
    pub host: Ipv4Addr,
    pub guest: Ipv4Addr,
}

impl TapAddress {
    fn from_subnet(subnet: u32) -> Self {
        Self {
            subnet: Ipv4Addr::from(subnet),
            host: Ipv4Addr::from(subnet + 1),
            guest: Ipv4Addr::from(subnet + 2),
        }
    }

    /// Host address in `a.b.c.d/30` form, as passed to `ip addr add`.
    pub fn host_cidr(&self) -> String {
        format!("{}/{}", self.host, LEASE_PREFIX_LEN)
    }
}

impl fmt::Display for TapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (guest {})", self.host, LEASE_PREFIX_LEN, self.guest)
    }
}

/// Hands out /30 subnets from a larger block.
#[derive(Debug)]
pub struct AddressPool {
    base: u32,
    slots: u32,
    allocated: BTreeSet<u32>,
}

impl AddressPool {
    /// `cidr` must be in `a.b.c.d/n` notation with `n` at most 30.
    pub fn new(cidr: &str) -> VmorchResult<Self> {
        let (addr, prefix_len) = parse_cidr(cidr)?;
        if !(1..=LEASE_PREFIX_LEN).contains(&prefix_len) {
            return Err(VmorchError::Config(format!(
                "address pool prefix length {} out of range 1..={}",
                prefix_len, LEASE_PREFIX_LEN
            )));
        }

        let host_bits = 32 - u32::from(prefix_len);
        let mask = !((1u64 << host_bits) - 1) as u32;

        Ok(Self {
            base: u32::from(addr) & mask,
            slots: 1u32 << (u32::from(LEASE_PREFIX_LEN) - u32::from(prefix_len)),
            allocated: BTreeSet::new(),
        })
    }

    /// Lowest free /30.
    pub fn allocate(&mut self) -> VmorchResult<TapAddress> {
        let slot = (0..self.slots)
            .find(|slot| !self.allocated.contains(slot))
            .ok_or_else(|| VmorchError::NetworkResource("tap address pool exhausted".into()))?;
        self.allocated.insert(slot);
        Ok(TapAddress::from_subnet(self.base + slot * 4))
    }

    pub fn release(&mut self, address: &TapAddress) {
        let subnet = u32::from(address.subnet);
        if subnet >= self.base {
            self.allocated.remove(&((subnet - self.base) / 4));
        }
    }

    pub fn in_use(&self) -> usize {
        self.allocated.len()
    }
}

pub fn parse_cidr(cidr: &str) -> VmorchResult<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| VmorchError::Config(format!("invalid CIDR: {}", cidr)))?;
    let addr = addr
        .parse::<Ipv4Addr>()
        .map_err(|e| VmorchError::Config(format!("invalid CIDR address: {}", e)))?;
    let prefix = prefix
        .parse::<u8>()
        .map_err(|e| VmorchError::Config(format!("invalid prefix length: {}", e)))?;
    Ok((addr, prefix))
}
