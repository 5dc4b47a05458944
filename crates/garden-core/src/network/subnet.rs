//! Container subnet and address allocation.
//!
//! A request is either dynamic (empty network string) or static (CIDR,
//! optionally with host bits set). Dynamic requests take the lowest free
//! `/30` from the pool. Static subnets may be shared by several containers
//! as long as every container gets a distinct address, but a static subnet
//! must never partially overlap another allocated subnet or the pool.
//!
//! ```text
//! 10.2.0.0/24   gateway 10.2.0.1, first container 10.2.0.2
//! 10.2.0.3/24   gateway 10.2.0.1, container 10.2.0.3
//! ""            pool /30: gateway .1, container .2
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use garden_common::constants::DYNAMIC_SUBNET_PREFIX;
use garden_common::error::{GardenError, Result};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Address assignment of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAllocation {
    /// Subnet the container lives in.
    pub subnet: Ipv4Net,
    /// Gateway (host side) address.
    pub gateway: Ipv4Addr,
    /// Container address.
    pub container_ip: Ipv4Addr,
    /// Whether the subnet came from the dynamic pool.
    pub dynamic: bool,
}

#[derive(Debug)]
struct SubnetEntry {
    ips: BTreeSet<Ipv4Addr>,
    dynamic: bool,
}

/// Allocator for container subnets and addresses.
#[derive(Debug)]
pub struct SubnetPool {
    pool: Ipv4Net,
    subnets: Mutex<BTreeMap<Ipv4Net, SubnetEntry>>,
}

/// Parsed form of a network request.
enum Request {
    Dynamic,
    Static { subnet: Ipv4Net, ip: Ipv4Addr },
}

impl SubnetPool {
    /// Creates an allocator that carves dynamic subnets out of `pool`.
    #[must_use]
    pub fn new(pool: Ipv4Net) -> Self {
        Self {
            pool: pool.trunc(),
            subnets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of dynamic subnets the pool can hold.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        let host_bits = u32::from(DYNAMIC_SUBNET_PREFIX.saturating_sub(self.pool.prefix_len()));
        1u64 << host_bits
    }

    /// Allocates an address for `network`.
    ///
    /// # Errors
    ///
    /// - [`GardenError::InvalidRequest`] if `network` does not parse or names
    ///   the gateway or broadcast address.
    /// - [`GardenError::SubnetOverlap`] if a static subnet partially overlaps
    ///   an allocated subnet or the dynamic pool.
    /// - [`GardenError::IpAlreadyAllocated`] if the requested address is taken.
    /// - [`GardenError::PoolExhausted`] if no subnet or address is free.
    pub fn acquire(&self, network: &str) -> Result<NetworkAllocation> {
        let allocation = match parse_request(network)? {
            Request::Dynamic => self.acquire_dynamic()?,
            Request::Static { subnet, ip } => self.acquire_static(subnet, ip)?,
        };
        tracing::debug!(
            subnet = %allocation.subnet,
            ip = %allocation.container_ip,
            "network allocated"
        );
        Ok(allocation)
    }

    fn acquire_dynamic(&self) -> Result<NetworkAllocation> {
        let mut subnets = self.subnets.lock();
        let candidates = self
            .pool
            .subnets(DYNAMIC_SUBNET_PREFIX)
            .map_err(|e| GardenError::Config {
                message: format!("network pool {}: {e}", self.pool),
            })?;
        for subnet in candidates {
            if subnets.contains_key(&subnet) {
                continue;
            }
            let gateway = nth_host(subnet, 1);
            let container_ip = nth_host(subnet, 2);
            let _ = subnets.insert(
                subnet,
                SubnetEntry {
                    ips: BTreeSet::from([container_ip]),
                    dynamic: true,
                },
            );
            return Ok(NetworkAllocation {
                subnet,
                gateway,
                container_ip,
                dynamic: true,
            });
        }
        Err(GardenError::PoolExhausted {
            resource: "subnet".into(),
        })
    }

    fn acquire_static(&self, subnet: Ipv4Net, ip: Ipv4Addr) -> Result<NetworkAllocation> {
        if overlaps(subnet, self.pool) {
            return Err(GardenError::SubnetOverlap {
                requested: subnet.to_string(),
                existing: self.pool.to_string(),
            });
        }

        let mut subnets = self.subnets.lock();
        if let Some(existing) = subnets
            .iter()
            .find(|(other, entry)| overlaps(subnet, **other) && (**other != subnet || entry.dynamic))
            .map(|(other, _)| *other)
        {
            return Err(GardenError::SubnetOverlap {
                requested: subnet.to_string(),
                existing: existing.to_string(),
            });
        }

        let gateway = nth_host(subnet, 1);
        let taken = subnets.get(&subnet).map(|e| &e.ips);
        let container_ip = if ip == subnet.network() {
            first_free_host(subnet, gateway, taken).ok_or_else(|| GardenError::PoolExhausted {
                resource: format!("address ({subnet})"),
            })?
        } else {
            if ip == gateway || ip == subnet.broadcast() {
                return Err(GardenError::InvalidRequest {
                    message: format!("{ip} is reserved in subnet {subnet}"),
                });
            }
            if taken.is_some_and(|ips| ips.contains(&ip)) {
                return Err(GardenError::IpAlreadyAllocated { ip: ip.to_string() });
            }
            ip
        };

        let _ = subnets
            .entry(subnet)
            .or_insert_with(|| SubnetEntry {
                ips: BTreeSet::new(),
                dynamic: false,
            })
            .ips
            .insert(container_ip);
        Ok(NetworkAllocation {
            subnet,
            gateway,
            container_ip,
            dynamic: false,
        })
    }

    /// Re-reserves an allocation restored from disk.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::IpAlreadyAllocated`] if the address is already
    /// held by another container.
    pub fn recover(&self, allocation: &NetworkAllocation) -> Result<()> {
        let mut subnets = self.subnets.lock();
        let entry = subnets.entry(allocation.subnet).or_insert_with(|| SubnetEntry {
            ips: BTreeSet::new(),
            dynamic: allocation.dynamic,
        });
        if !entry.ips.insert(allocation.container_ip) {
            return Err(GardenError::IpAlreadyAllocated {
                ip: allocation.container_ip.to_string(),
            });
        }
        Ok(())
    }

    /// Returns an allocation to the pool. The subnet is freed with its last address.
    pub fn release(&self, allocation: &NetworkAllocation) {
        let mut subnets = self.subnets.lock();
        let now_empty = subnets.get_mut(&allocation.subnet).is_some_and(|entry| {
            let _ = entry.ips.remove(&allocation.container_ip);
            entry.ips.is_empty()
        });
        if now_empty {
            let _ = subnets.remove(&allocation.subnet);
        }
        tracing::debug!(ip = %allocation.container_ip, "network released");
    }
}

fn parse_request(network: &str) -> Result<Request> {
    let network = network.trim();
    if network.is_empty() {
        return Ok(Request::Dynamic);
    }
    let invalid = |reason: &str| GardenError::InvalidRequest {
        message: format!("invalid network {network}: {reason}"),
    };
    let net: Ipv4Net = if network.contains('/') {
        network.parse().map_err(|_| invalid("not a CIDR"))?
    } else {
        let ip: Ipv4Addr = network.parse().map_err(|_| invalid("not an address"))?;
        Ipv4Net::new(ip, DYNAMIC_SUBNET_PREFIX).map_err(|_| invalid("bad prefix"))?
    };
    if net.prefix_len() > DYNAMIC_SUBNET_PREFIX {
        return Err(invalid("subnet too small"));
    }
    Ok(Request::Static {
        subnet: net.trunc(),
        ip: net.addr(),
    })
}

fn overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn nth_host(subnet: Ipv4Net, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).saturating_add(n))
}

fn first_free_host(
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    taken: Option<&BTreeSet<Ipv4Addr>>,
) -> Option<Ipv4Addr> {
    subnet
        .hosts()
        .find(|ip| *ip != gateway && !taken.is_some_and(|t| t.contains(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SubnetPool {
        SubnetPool::new("10.254.0.0/22".parse().unwrap())
    }

    #[test]
    fn dynamic_allocations_use_lowest_free_slash_30() {
        let pool = pool();
        let a = pool.acquire("").unwrap();
        let b = pool.acquire("").unwrap();
        assert_eq!(a.subnet.to_string(), "10.254.0.0/30");
        assert_eq!(a.gateway, Ipv4Addr::new(10, 254, 0, 1));
        assert_eq!(a.container_ip, Ipv4Addr::new(10, 254, 0, 2));
        assert_eq!(b.container_ip, Ipv4Addr::new(10, 254, 0, 6));

        pool.release(&a);
        let c = pool.acquire("").unwrap();
        assert_eq!(c.container_ip, a.container_ip);
    }

    #[test]
    fn static_address_is_honoured() {
        let pool = pool();
        let alloc = pool.acquire("10.2.0.3/24").unwrap();
        assert_eq!(alloc.subnet.to_string(), "10.2.0.0/24");
        assert_eq!(alloc.container_ip, Ipv4Addr::new(10, 2, 0, 3));
        assert_eq!(alloc.gateway, Ipv4Addr::new(10, 2, 0, 1));
    }

    #[test]
    fn network_address_picks_next_free_host() {
        let pool = pool();
        let first = pool.acquire("10.2.0.0/30").unwrap();
        assert_eq!(first.container_ip, Ipv4Addr::new(10, 2, 0, 2));
        assert!(matches!(
            pool.acquire("10.2.0.0/30"),
            Err(GardenError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn identical_subnets_are_shared() {
        let pool = pool();
        let a = pool.acquire("10.1.1.1/16").unwrap();
        let b = pool.acquire("10.1.1.2/16").unwrap();
        assert_eq!(a.subnet, b.subnet);
        assert_eq!(a.container_ip, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(b.container_ip, Ipv4Addr::new(10, 1, 1, 2));
        assert!(matches!(
            pool.acquire("10.1.1.2/16"),
            Err(GardenError::IpAlreadyAllocated { .. })
        ));
    }

    #[test]
    fn overlapping_subnets_are_rejected() {
        let pool = pool();
        let _ = pool.acquire("10.2.0.0/24").unwrap();
        let err = pool.acquire("10.2.0.3/16").unwrap_err();
        assert_eq!(
            err.to_string(),
            "the requested subnet (10.2.0.0/16) overlaps an existing subnet (10.2.0.0/24)"
        );
    }

    #[test]
    fn static_request_inside_dynamic_pool_is_rejected() {
        let pool = pool();
        assert!(matches!(
            pool.acquire("10.254.0.8/30"),
            Err(GardenError::SubnetOverlap { .. })
        ));
    }

    #[test]
    fn gateway_cannot_be_requested() {
        let pool = pool();
        assert!(matches!(
            pool.acquire("10.2.0.1/24"),
            Err(GardenError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn releasing_last_address_frees_the_subnet() {
        let pool = pool();
        let a = pool.acquire("10.2.0.2/24").unwrap();
        pool.release(&a);
        let _ = pool.acquire("10.2.0.0/16").unwrap();
    }

    #[test]
    fn recover_marks_addresses_taken() {
        let pool = pool();
        let alloc = NetworkAllocation {
            subnet: "10.254.0.0/30".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 254, 0, 1),
            container_ip: Ipv4Addr::new(10, 254, 0, 2),
            dynamic: true,
        };
        pool.recover(&alloc).unwrap();
        assert!(pool.recover(&alloc).is_err());
        assert_eq!(pool.acquire("").unwrap().subnet.to_string(), "10.254.0.4/30");
    }

    #[test]
    fn capacity_counts_slash_30s() {
        assert_eq!(pool().capacity(), 256);
    }

    #[test]
    fn garbage_is_an_invalid_request() {
        assert!(matches!(
            pool().acquire("not-a-network"),
            Err(GardenError::InvalidRequest { .. })
        ));
    }
}
