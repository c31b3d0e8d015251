//! Subnet allocation for run data networks.
//!
//! Every container-based run gets its own /16 data subnet out of the
//! 16.0.0.0/4 space, 4096 slots in total. The allocator starts at a
//! random slot to avoid collisions between concurrently operating
//! controllers, and wraps around.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of /16 slots carved out of 16.0.0.0/4.
pub const SUBNET_SLOTS: u64 = 4096;

/// Subnet of the control network instances use to reach platform
/// services.
pub fn control_subnet() -> &'static str {
    "192.18.0.0/16"
}

/// Gateway address on the control network (the host side).
pub fn control_gateway() -> &'static str {
    "192.18.0.1"
}

/// Allocator handing out data-plane /16 subnets.
pub struct DataSubnets {
    next: AtomicU64,
}

impl Default for DataSubnets {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSubnets {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(rand::random::<u64>() % SUBNET_SLOTS),
        }
    }

    /// Allocator starting at a fixed slot; for tests.
    pub fn starting_at(slot: u64) -> Self {
        Self {
            next: AtomicU64::new(slot % SUBNET_SLOTS),
        }
    }

    /// Returns the next `(subnet_cidr, gateway)` pair.
    pub fn next(&self) -> (String, String) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % SUBNET_SLOTS;
        subnet_for_slot(slot)
    }
}

/// Maps a slot in `[0, SUBNET_SLOTS)` to its /16 subnet and gateway.
pub fn subnet_for_slot(slot: u64) -> (String, String) {
    let slot = slot % SUBNET_SLOTS;
    let a = 16 + slot / 256;
    let b = slot % 256;
    (format!("{}.{}.0.0/16", a, b), format!("{}.{}.0.1", a, b))
}

/// True when `ip` belongs to the /16 identified by `subnet_cidr`.
/// Only /16 data subnets are ever compared, so the check is a two-octet
/// prefix match.
pub fn ip_in_data_subnet(ip: &str, subnet_cidr: &str) -> bool {
    let Some(net) = subnet_cidr.split('/').next() else {
        return false;
    };
    let net_octets: Vec<&str> = net.split('.').collect();
    let ip_octets: Vec<&str> = ip.split('/').next().unwrap_or(ip).split('.').collect();
    if net_octets.len() != 4 || ip_octets.len() != 4 {
        return false;
    }
    net_octets[0] == ip_octets[0] && net_octets[1] == ip_octets[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_mapping() {
        assert_eq!(
            subnet_for_slot(0),
            ("16.0.0.0/16".to_string(), "16.0.0.1".to_string())
        );
        assert_eq!(
            subnet_for_slot(255),
            ("16.255.0.0/16".to_string(), "16.255.0.1".to_string())
        );
        assert_eq!(
            subnet_for_slot(256),
            ("17.0.0.0/16".to_string(), "17.0.0.1".to_string())
        );
        assert_eq!(
            subnet_for_slot(4095),
            ("31.255.0.0/16".to_string(), "31.255.0.1".to_string())
        );
    }

    #[test]
    fn test_allocator_advances_and_wraps() {
        let alloc = DataSubnets::starting_at(4095);
        assert_eq!(alloc.next().0, "31.255.0.0/16");
        assert_eq!(alloc.next().0, "16.0.0.0/16");
    }

    #[test]
    fn test_consecutive_allocations_differ() {
        let alloc = DataSubnets::new();
        let (a, _) = alloc.next();
        let (b, _) = alloc.next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ip_in_data_subnet() {
        assert!(ip_in_data_subnet("16.3.0.17", "16.3.0.0/16"));
        assert!(ip_in_data_subnet("16.3.0.17/16", "16.3.0.0/16"));
        assert!(!ip_in_data_subnet("16.4.0.17", "16.3.0.0/16"));
        assert!(!ip_in_data_subnet("192.18.0.4", "16.3.0.0/16"));
        assert!(!ip_in_data_subnet("garbage", "16.3.0.0/16"));
    }
}
