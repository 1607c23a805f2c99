//! Address pool allocation: non-overlapping subnets and free host addresses.
//!
//! A pool owns one or more base CIDR ranges and hands out fixed-prefix
//! subnets in ascending numeric order, never overlapping anything it has
//! already handed out (or anything pre-excluded). Individual host addresses
//! within a network are picked the same way: ascending scan over the usable
//! range, skipping reservations.
//!
//! All selection is deterministic; the only mutable state is the pool's
//! excluded-subnet set, owned by a single controlling process.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

use crate::error::{Result, VirtLabError};

/// A reservoir of non-overlapping subnets derived from base CIDR ranges.
#[derive(Debug, Clone)]
pub struct AddressPool {
    name: String,
    base_ranges: Vec<Ipv4Net>,
    prefix_len: u8,
    excluded: BTreeSet<Ipv4Net>,
}

impl AddressPool {
    /// Create a pool that carves `/prefix_len` subnets out of `base_ranges`.
    pub fn new(
        name: impl Into<String>,
        base_ranges: Vec<Ipv4Net>,
        prefix_len: u8,
    ) -> Result<Self> {
        if prefix_len > 30 {
            return Err(VirtLabError::InvalidConfig(format!(
                "pool prefix /{} leaves no usable host addresses",
                prefix_len
            )));
        }
        if base_ranges.iter().any(|r| r.prefix_len() > prefix_len) {
            return Err(VirtLabError::InvalidConfig(format!(
                "pool prefix /{} is wider than a base range",
                prefix_len
            )));
        }
        Ok(Self {
            name: name.into(),
            base_ranges,
            prefix_len,
            excluded: BTreeSet::new(),
        })
    }

    /// Default management pool: the 10.0.0.0/8 private block at /24.
    pub fn default_pool(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_ranges: vec!["10.0.0.0/8".parse().expect("valid literal")],
            prefix_len: 24,
            excluded: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark a subnet as taken without handing it out (e.g. a host network
    /// that already exists outside this process).
    pub fn exclude(&mut self, subnet: Ipv4Net) {
        self.excluded.insert(subnet);
    }

    /// All `/prefix_len` sub-ranges of the base ranges, ascending, skipping
    /// any that overlap an excluded subnet.
    ///
    /// Re-iterating after the excluded set changed yields a fresh, consistent
    /// ordering.
    pub fn subnets(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        free_subnets(&self.base_ranges, self.prefix_len, &self.excluded)
    }

    /// Hand out the next free subnet and record it as excluded.
    pub fn next_subnet(&mut self) -> Result<Ipv4Net> {
        let subnet = self
            .subnets()
            .next()
            .ok_or_else(|| VirtLabError::PoolExhausted {
                pool: self.name.clone(),
                prefix_len: self.prefix_len,
            })?;
        self.excluded.insert(subnet);
        debug!(pool = %self.name, subnet = %subnet, "Allocated subnet");
        Ok(subnet)
    }
}

/// Lazy ascending sequence of every `/prefix_len` sub-range of `base_ranges`
/// that overlaps nothing in `excluded`.
pub fn free_subnets<'a>(
    base_ranges: &'a [Ipv4Net],
    prefix_len: u8,
    excluded: &'a BTreeSet<Ipv4Net>,
) -> impl Iterator<Item = Ipv4Net> + 'a {
    // Base ranges are finite private blocks; sort so the produced order is
    // ascending across ranges, not just within one.
    let mut ranges: Vec<Ipv4Net> = base_ranges.to_vec();
    ranges.sort();
    ranges.into_iter().flat_map(move |range| {
        range
            .subnets(prefix_len)
            .into_iter()
            .flatten()
            .filter(move |candidate| !excluded.iter().any(|taken| overlaps(candidate, taken)))
    })
}

/// Whether two CIDRs share any address (partial or full overlap).
fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// First usable host address of `network` not present in `allocated`.
///
/// The first `reserved_lo` and last `reserved_hi` host addresses are never
/// returned.
pub fn first_free_address(
    network: Ipv4Net,
    reserved_lo: u32,
    reserved_hi: u32,
    allocated: &BTreeSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let host_count = network.hosts().count() as u32;
    let usable = host_count.saturating_sub(reserved_lo + reserved_hi);
    network
        .hosts()
        .skip(reserved_lo as usize)
        .take(usable as usize)
        .find(|ip| !allocated.contains(ip))
        .ok_or_else(|| VirtLabError::AddressPoolExhausted {
            network: network.to_string(),
        })
}
