// src/core/multicast.rs

//! SPEAD multicast endpoint parsing and apportioning of stream addresses
//! among allocated DAQ instances.

use crate::core::CoordinatorError;

type Result<T> = std::result::Result<T, CoordinatorError>;

/// A parsed SPEAD endpoint of the form `spead://<ip>+<count>:<port>`.
/// `count` is the number of addresses after the first, so the total number
/// of multicast groups is `count + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeadEndpoint {
    /// The leading octets of the first address, e.g. `239.9.0`.
    pub prefix: String,
    /// The final octet of the first address.
    pub first_octet: u32,
    /// Total number of addresses.
    pub n_addrs: usize,
    pub port: u16,
}

impl SpeadEndpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let bad = || CoordinatorError::BadEndpoint(uri.to_string());
        // Strip any scheme, keeping <ip>+<count>:<port>.
        let addrs = uri.rsplit('/').next().ok_or_else(bad)?;
        let (addrs, port) = addrs.split_once(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;
        // A lone address arrives without the +<count> suffix.
        let (addr0, count) = match addrs.split_once('+') {
            Some((addr0, count)) => (addr0, count.parse::<usize>().map_err(|_| bad())?),
            None => (addrs, 0),
        };
        let (prefix, last_octet) = addr0.rsplit_once('.').ok_or_else(bad)?;
        let first_octet: u32 = last_octet.parse().map_err(|_| bad())?;
        Ok(Self {
            prefix: prefix.to_string(),
            first_octet,
            n_addrs: count + 1,
            port,
        })
    }

    /// The number of DAQ instances sufficient to process the full bandwidth.
    pub fn instances_required(&self, streams_per_instance: usize) -> usize {
        self.n_addrs.div_ceil(streams_per_instance)
    }
}

/// The result of apportioning multicast groups across instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAllocation {
    /// One `<prefix>.<octet>+<n>` DESTIP string per instance, in order.
    pub addr_list: Vec<String>,
    pub port: u16,
    /// Total number of stream addresses in the subarray.
    pub n_addrs: usize,
    /// Extra streams carried by the final instance beyond a full block,
    /// i.e. its stream count is `n_last + 1`.
    pub n_last: usize,
}

/// Apportions multicast groups sequentially: each instance takes a full block
/// of `streams_per_instance` addresses except possibly the last. Streams
/// beyond the capacity of `n_instances` are dropped with a warning by the
/// caller.
pub fn allocate_groups(
    endpoint: &SpeadEndpoint,
    n_instances: usize,
    streams_per_instance: usize,
) -> GroupAllocation {
    let mut addr_list = Vec::new();
    let mut octet = endpoint.first_octet;
    let n_addrs = endpoint.n_addrs;
    let n_last;

    if n_addrs > streams_per_instance * n_instances {
        // Oversubscribed: fill every instance completely.
        for _ in 0..n_instances {
            addr_list.push(format!(
                "{}.{}+{}",
                endpoint.prefix,
                octet,
                streams_per_instance - 1
            ));
            octet += streams_per_instance as u32;
        }
        n_last = streams_per_instance - 1;
    } else {
        let n_required = n_addrs.div_ceil(streams_per_instance);
        for _ in 1..n_required {
            addr_list.push(format!(
                "{}.{}+{}",
                endpoint.prefix,
                octet,
                streams_per_instance - 1
            ));
            octet += streams_per_instance as u32;
        }
        // The final instance may not be completely filled.
        n_last = n_addrs - 1 - (n_required - 1) * streams_per_instance;
        addr_list.push(format!("{}.{}+{}", endpoint.prefix, octet, n_last));
    }

    GroupAllocation {
        addr_list,
        port: endpoint.port,
        n_addrs,
        n_last,
    }
}
