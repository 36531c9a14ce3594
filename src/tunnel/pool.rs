//! Tunnel address pool.
//!
//! The network address, the server address (`.1`) and the broadcast address
//! are never handed out. Allocation always returns the smallest free host.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Widest network accepted; keeps the free set small.
pub const MIN_PREFIX: u8 = 16;
/// Narrowest network that still leaves one client address.
pub const MAX_PREFIX: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Expected an IPv4 CIDR such as 10.8.0.0/24, got {0:?}")]
    Malformed(String),

    #[error("Prefix /{0} leaves no client addresses (at most /{MAX_PREFIX})")]
    TooSmall(u8),

    #[error("Prefix /{0} is too large a pool (at least /{MIN_PREFIX})")]
    TooLarge(u8),
}

/// An IPv4 network in CIDR form, normalised to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelNetwork {
    base: u32,
    prefix: u8,
}

impl TunnelNetwork {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, NetworkError> {
        if prefix > MAX_PREFIX {
            return Err(NetworkError::TooSmall(prefix));
        }
        if prefix < MIN_PREFIX {
            return Err(NetworkError::TooLarge(prefix));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            base: u32::from(address) & mask,
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn size(&self) -> u32 {
        1u32 << (32 - self.prefix)
    }

    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    /// Host offsets clients may use: everything except network, server and
    /// broadcast.
    fn client_offsets(&self) -> std::ops::RangeInclusive<u32> {
        2..=self.size() - 2
    }

    pub fn client_capacity(&self) -> usize {
        (self.size() - 3) as usize
    }

    fn offset_of(&self, address: Ipv4Addr) -> Option<u32> {
        let raw = u32::from(address);
        let offset = raw.checked_sub(self.base)?;
        self.client_offsets().contains(&offset).then_some(offset)
    }

    /// `address/prefix`, the form handed to clients.
    pub fn with_prefix(&self, address: Ipv4Addr) -> String {
        format!("{}/{}", address, self.prefix)
    }
}

impl FromStr for TunnelNetwork {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || NetworkError::Malformed(s.to_string());
        let (address, prefix) = s.trim().split_once('/').ok_or_else(malformed)?;
        let address: Ipv4Addr = address.parse().map_err(|_| malformed())?;
        let prefix: u8 = prefix.parse().map_err(|_| malformed())?;
        if prefix > 32 {
            return Err(malformed());
        }
        Self::new(address, prefix)
    }
}

impl fmt::Display for TunnelNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

/// Free client addresses of a [`TunnelNetwork`].
pub struct AddressPool {
    network: TunnelNetwork,
    free: Mutex<BTreeSet<u32>>,
}

impl AddressPool {
    pub fn new(network: TunnelNetwork) -> Self {
        Self {
            network,
            free: Mutex::new(network.client_offsets().collect()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn network(&self) -> &TunnelNetwork {
        &self.network
    }

    /// Take the smallest free address.
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let offset = self.lock().pop_first()?;
        Some(Ipv4Addr::from(self.network.base + offset))
    }

    /// Return `address` to the pool. Returns `false` when the address was
    /// already free or is not a client address of this network.
    pub fn release(&self, address: Ipv4Addr) -> bool {
        match self.network.offset_of(address) {
            Some(offset) => self.lock().insert(offset),
            None => false,
        }
    }

    pub fn is_free(&self, address: Ipv4Addr) -> bool {
        self.network
            .offset_of(address)
            .map(|offset| self.lock().contains(&offset))
            .unwrap_or(false)
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.network.client_capacity()
    }
}

impl fmt::Debug for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPool")
            .field("network", &self.network)
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        let network: TunnelNetwork = "10.8.0.7/24".parse().unwrap();
        assert_eq!(network.to_string(), "10.8.0.0/24");
        assert_eq!(network.server_address(), Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(network.client_capacity(), 253);

        assert!(matches!(
            "10.8.0.0".parse::<TunnelNetwork>(),
            Err(NetworkError::Malformed(_))
        ));
        assert_eq!(
            "10.8.0.0/31".parse::<TunnelNetwork>(),
            Err(NetworkError::TooSmall(31))
        );
        assert_eq!(
            "10.0.0.0/8".parse::<TunnelNetwork>(),
            Err(NetworkError::TooLarge(8))
        );
    }

    #[test]
    fn test_first_allocation_skips_server() {
        let pool = AddressPool::new("10.8.0.0/24".parse().unwrap());
        let first = pool.allocate().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(pool.network().with_prefix(first), "10.8.0.2/24");
    }

    #[test]
    fn test_smallest_free_wins() {
        let pool = AddressPool::new("10.8.0.0/24".parse().unwrap());
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();
        assert!(pool.release(b));
        assert!(pool.release(a));
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = AddressPool::new("10.8.0.0/30".parse().unwrap());
        assert_eq!(pool.capacity(), 1);
        let only = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert!(pool.release(only));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_release_rejects_foreign_and_double() {
        let pool = AddressPool::new("10.8.0.0/24".parse().unwrap());
        let a = pool.allocate().unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert!(!pool.release(Ipv4Addr::new(10, 8, 0, 1)));
        assert!(!pool.release(Ipv4Addr::new(10, 8, 0, 255)));
        assert!(!pool.release(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(pool.free_count(), 253);
    }
}
