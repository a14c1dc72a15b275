//! IP/MAC address pools.
//!
//! A deployment draws the network identity of every VM from one ordered
//! pool of `(ip, mac)` pairs, either handed over by the testbed's subnet
//! reservation or synthesized locally from a subnet. Pairs are consumed
//! strictly in order and every batch gets a disjoint slice, so no two live
//! VMs ever share an address within a deployment's lifetime.

use std::net::Ipv4Addr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// One (ip, mac) pair from the pool.
pub type IpMac = (Ipv4Addr, String);

/// Host bytes never handed out when expanding a subnet: network, broadcast
/// and the gateway convention of the testbed.
const RESERVED_HOST_BYTES: [u8; 3] = [0, 254, 255];

/// An ordered pool of (ip, mac) pairs, consumed front to back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpMacPool {
    pairs: Vec<IpMac>,
    cursor: usize,
}

impl IpMacPool {
    /// Wrap a provider-assigned list of pairs.
    pub fn new(pairs: Vec<IpMac>) -> Self {
        IpMacPool { pairs, cursor: 0 }
    }

    /// Synthesize a pool from a subnet.
    ///
    /// Expands `network/mask_size`, skipping addresses whose host byte is
    /// reserved, and pairs each address with a unique locally-administered
    /// MAC (`00:20:4e:xx:xx:xx`). The RNG is injectable so reproducible
    /// runs can seed it.
    pub fn from_subnet<R: Rng>(network: Ipv4Addr, mask_size: u32, rng: &mut R) -> Self {
        let net = u32::from(network);
        let mask = !(2u64.pow(32 - mask_size) - 1) as u32;
        let start = net & mask;
        let end = net | !mask;

        let mut pairs = Vec::new();
        let mut macs = std::collections::HashSet::new();
        for raw in start..=end {
            let ip = Ipv4Addr::from(raw);
            if RESERVED_HOST_BYTES.contains(&ip.octets()[3]) {
                continue;
            }
            let mut mac = random_mac(rng);
            while !macs.insert(mac.clone()) {
                mac = random_mac(rng);
            }
            pairs.push((ip, mac));
        }

        IpMacPool::new(pairs)
    }

    /// Take the next `n` pairs, in order.
    ///
    /// The returned slice is disjoint from every earlier `take`; pairs are
    /// not reused until the pool itself is rebuilt.
    pub fn take(&mut self, n: usize) -> Result<Vec<IpMac>, failure::Error> {
        if self.remaining() < n {
            return Err(FleetError::PoolExhausted {
                requested: n,
                available: self.remaining(),
            }
            .into());
        }

        let slice = self.pairs[self.cursor..self.cursor + n].to_vec();
        self.cursor += n;
        Ok(slice)
    }

    /// Number of pairs not yet handed out.
    pub fn remaining(&self) -> usize {
        self.pairs.len() - self.cursor
    }
}

fn random_mac<R: Rng>(rng: &mut R) -> String {
    format!(
        "00:20:4e:{:02x}:{:02x}:{:02x}",
        rng.gen_range(0x00..=0xffu16),
        rng.gen_range(0x00..=0xffu16),
        rng.gen_range(0x00..=0xffu16)
    )
}
