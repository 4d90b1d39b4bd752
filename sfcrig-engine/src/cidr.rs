//! Non-overlapping CIDR generation.
//!
//! Each address family has one process-wide counter. Block `n` of a start
//! prefix is the prefix shifted by `n` times its own size, so two callers
//! drawing from the same family never receive the same block, even across
//! concurrent scenario runs. Counters start at 1: the start prefix itself is
//! never handed out.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::model::Ethertype;

/// Default IPv4 start prefix
pub const DEFAULT_V4_START: &str = "10.2.0.0/24";
/// Default IPv6 start prefix
pub const DEFAULT_V6_START: &str = "fd00:2::/64";

static V4_BLOCKS: AtomicU64 = AtomicU64::new(1);
static V6_BLOCKS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
enum Counter {
    Global(&'static AtomicU64),
    Isolated(Arc<AtomicU64>),
}

impl Counter {
    fn next(&self) -> u64 {
        match self {
            Counter::Global(counter) => counter.fetch_add(1, Ordering::SeqCst),
            Counter::Isolated(counter) => counter.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Source of fresh address blocks for one family
#[derive(Debug, Clone)]
pub struct CidrGenerator {
    start: IpNet,
    counter: Counter,
}

impl CidrGenerator {
    /// Generator backed by the process-wide counter of `start`'s family
    pub fn global(start: IpNet) -> Self {
        let counter = match start {
            IpNet::V4(_) => &V4_BLOCKS,
            IpNet::V6(_) => &V6_BLOCKS,
        };
        Self {
            start: start.trunc(),
            counter: Counter::Global(counter),
        }
    }

    /// Generator with a private counter, for tests and dry runs
    pub fn isolated(start: IpNet) -> Self {
        Self {
            start: start.trunc(),
            counter: Counter::Isolated(Arc::new(AtomicU64::new(1))),
        }
    }

    pub fn start(&self) -> IpNet {
        self.start
    }

    pub fn ethertype(&self) -> Ethertype {
        Ethertype::of(&self.start)
    }

    /// Hand out the next unused block
    pub fn next_cidr(&self) -> ProvisionResult<IpNet> {
        let index = self.counter.next();
        let cidr = nth_block(self.start, index)?;
        debug!("CIDR generated: {}", cidr);
        Ok(cidr)
    }
}

/// Pair of generators, one per address family
#[derive(Debug, Clone)]
pub struct CidrPool {
    pub v4: CidrGenerator,
    pub v6: CidrGenerator,
}

impl CidrPool {
    /// Pool drawing from the process-wide counters
    pub fn global() -> Self {
        Self {
            v4: CidrGenerator::global(
                DEFAULT_V4_START
                    .parse()
                    .expect("Default IPv4 start prefix is a valid literal"),
            ),
            v6: CidrGenerator::global(
                DEFAULT_V6_START
                    .parse()
                    .expect("Default IPv6 start prefix is a valid literal"),
            ),
        }
    }

    /// Pool with private counters
    pub fn isolated(v4_start: IpNet, v6_start: IpNet) -> Self {
        Self {
            v4: CidrGenerator::isolated(v4_start),
            v6: CidrGenerator::isolated(v6_start),
        }
    }

    pub fn for_family(&self, ethertype: Ethertype) -> &CidrGenerator {
        match ethertype {
            Ethertype::IPv4 => &self.v4,
            Ethertype::IPv6 => &self.v6,
        }
    }
}

/// Block `index` counted from `start`, each block the size of `start`
pub fn nth_block(start: IpNet, index: u64) -> ProvisionResult<IpNet> {
    let exhausted = || ProvisionError::AddressExhausted {
        block: start.to_string(),
        requested: usize::try_from(index).unwrap_or(usize::MAX).saturating_add(1),
        capacity: 0,
    };

    match start {
        IpNet::V4(net) => {
            let size = 1u64 << (32 - u32::from(net.prefix_len()));
            let addr = index
                .checked_mul(size)
                .and_then(|offset| u64::from(u32::from(net.network())).checked_add(offset))
                .and_then(|addr| u32::try_from(addr).ok())
                .ok_or_else(exhausted)?;
            Ipv4Net::new(Ipv4Addr::from(addr), net.prefix_len())
                .map(IpNet::V4)
                .map_err(|_| exhausted())
        }
        IpNet::V6(net) => {
            let offset = match 1u128.checked_shl(128 - u32::from(net.prefix_len())) {
                Some(size) => u128::from(index).checked_mul(size),
                None if index == 0 => Some(0),
                None => None,
            };
            let addr = offset
                .and_then(|offset| u128::from(net.network()).checked_add(offset))
                .ok_or_else(exhausted)?;
            Ipv6Net::new(Ipv6Addr::from(addr), net.prefix_len())
                .map(IpNet::V6)
                .map_err(|_| exhausted())
        }
    }
}

/// Number of addresses in a prefix, saturating at `u128::MAX`
pub fn block_size(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

/// Address at `offset` from the network address, if it stays inside the prefix
pub fn host_at(net: &IpNet, offset: u128) -> Option<IpAddr> {
    if offset >= block_size(net) {
        return None;
    }
    match net {
        IpNet::V4(v4) => {
            let offset = u32::try_from(offset).ok()?;
            u32::from(v4.network())
                .checked_add(offset)
                .map(|addr| IpAddr::V4(Ipv4Addr::from(addr)))
        }
        IpNet::V6(v6) => u128::from(v6.network())
            .checked_add(offset)
            .map(|addr| IpAddr::V6(Ipv6Addr::from(addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_nth_block_v4() {
        let start = net("1.1.0.0/24");
        assert_eq!(nth_block(start, 0).unwrap(), net("1.1.0.0/24"));
        assert_eq!(nth_block(start, 1).unwrap(), net("1.1.1.0/24"));
        assert_eq!(nth_block(start, 256).unwrap(), net("1.2.0.0/24"));
    }

    #[test]
    fn test_nth_block_v6() {
        let start = net("fd00:2::/64");
        assert_eq!(nth_block(start, 1).unwrap(), net("fd00:2:0:1::/64"));
        assert_eq!(nth_block(start, 0x10000).unwrap(), net("fd00:2:1::/64"));
    }

    #[test]
    fn test_overflow_is_exhaustion() {
        let start = net("255.255.255.0/24");
        assert!(matches!(
            nth_block(start, 1),
            Err(ProvisionError::AddressExhausted { .. })
        ));
        assert!(nth_block(net("10.0.0.0/8"), 1 << 30).is_err());
    }

    #[test]
    fn test_isolated_generator_starts_after_start_block() {
        let generator = CidrGenerator::isolated(net("1.1.0.0/24"));
        assert_eq!(generator.next_cidr().unwrap(), net("1.1.1.0/24"));
        assert_eq!(generator.next_cidr().unwrap(), net("1.1.2.0/24"));
        assert_eq!(generator.next_cidr().unwrap(), net("1.1.3.0/24"));
    }

    #[test]
    fn test_global_generators_never_repeat() {
        let a = CidrGenerator::global(net(DEFAULT_V4_START));
        let b = CidrGenerator::global(net(DEFAULT_V4_START));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            assert!(seen.insert(a.next_cidr().unwrap()));
            assert!(seen.insert(b.next_cidr().unwrap()));
        }
    }

    #[test]
    fn test_host_at_stays_inside_prefix() {
        let prefix = net("192.168.10.0/24");
        assert_eq!(host_at(&prefix, 199), Some("192.168.10.199".parse().unwrap()));
        assert_eq!(host_at(&prefix, 255), Some("192.168.10.255".parse().unwrap()));
        assert_eq!(host_at(&prefix, 256), None);
        assert_eq!(block_size(&net("2001:db8::/64")), 1u128 << 64);
    }
}
