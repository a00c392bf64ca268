//! Address allocation and lease tracking.
//!
//! [`LeasePool`] owns every lease the server knows about. It implements the
//! server-side lease state machine:
//!
//! - allocation from the dynamic range (sequential or random)
//! - static mac-to-ip bindings, which always win
//! - offered reservations that lapse after `offerTimeout`
//! - binding, renewal, release and expiry
//! - quarantine of declined addresses until an operator clears them
//!
//! The pool has a single mutator. It takes `&mut self` and every time-based
//! decision is made against a caller-supplied `now`, so the server loop
//! serializes packets and timer ticks and tests stay deterministic.
//!
//! Persistence lives outside the pool: [`LeasePool::snapshot`] and
//! [`LeasePool::seed`] are the hooks an external store uses.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::packet::MacAddr;

/// Encodes a client ID as a colon-separated hex string for storage.
fn encode_client_id(client_id: &[u8]) -> String {
    client_id
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Free,
    /// Reserved by an OFFER, waiting for the client's REQUEST.
    Offered,
    Bound,
    Released,
    Expired,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "FREE",
            Self::Offered => "OFFERED",
            Self::Bound => "BOUND",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// One address assignment.
///
/// Only `Offered` and `Bound` leases live inside the pool. The other states
/// appear on leases handed back by [`LeasePool::release`],
/// [`LeasePool::sweep_expired`] and [`LeasePool::reclaim`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub state: LeaseState,
    pub offered_at: DateTime<Utc>,
    /// End of the offer reservation while `Offered`, end of the lease once `Bound`.
    pub expires_at: DateTime<Utc>,
    /// Hex-encoded Option 61, or htype + chaddr when the client sent none.
    pub client_id: Option<String>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, LeaseState::Offered | LeaseState::Bound) && !self.is_expired(now)
    }
}

/// The server's address pool.
#[derive(Debug, Clone)]
pub struct LeasePool {
    range: (Ipv4Addr, Ipv4Addr),
    random: bool,
    offer_timeout: TimeDelta,
    static_bindings: HashMap<MacAddr, Ipv4Addr>,
    static_owners: HashMap<Ipv4Addr, MacAddr>,
    /// Offered and bound leases by address.
    leases: HashMap<Ipv4Addr, Lease>,
    /// Inverse of `leases`.
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    /// Dynamic addresses nobody holds (sorted for sequential allocation).
    free: BTreeSet<Ipv4Addr>,
    /// Declined addresses, withheld until cleared.
    quarantined: BTreeSet<Ipv4Addr>,
    /// Last address each mac held, preferred again in sequential mode.
    previous: HashMap<MacAddr, Ipv4Addr>,
}

impl LeasePool {
    pub fn new(config: &ServerConfig) -> Self {
        let static_bindings: HashMap<MacAddr, Ipv4Addr> = config
            .static_bindings
            .iter()
            .map(|(mac, ip)| (*mac, *ip))
            .collect();
        let static_owners = static_bindings.iter().map(|(mac, ip)| (*ip, *mac)).collect();

        let mut pool = Self {
            range: config.range,
            random: config.random_ip,
            offer_timeout: TimeDelta::seconds(i64::from(config.offer_timeout)),
            static_bindings,
            static_owners,
            leases: HashMap::new(),
            by_mac: HashMap::new(),
            free: BTreeSet::new(),
            quarantined: BTreeSet::new(),
            previous: HashMap::new(),
        };

        let start = u32::from(pool.range.0);
        let end = u32::from(pool.range.1);
        for ip_num in start..=end {
            let ip = Ipv4Addr::from(ip_num);
            if !pool.static_owners.contains_key(&ip) {
                pool.free.insert(ip);
            }
        }

        pool
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range.0) && addr <= u32::from(self.range.1)
    }

    pub fn is_static(&self, ip: Ipv4Addr) -> bool {
        self.static_owners.contains_key(&ip)
    }

    pub fn static_binding(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.static_bindings.get(&mac).copied()
    }

    pub fn lease_for_ip(&self, ip: Ipv4Addr) -> Option<&Lease> {
        self.leases.get(&ip)
    }

    pub fn lease_for_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.by_mac.get(&mac).and_then(|ip| self.leases.get(ip))
    }

    /// State of an address as the pool sees it; anything not held is `Free`.
    pub fn state_of(&self, ip: Ipv4Addr) -> LeaseState {
        self.leases
            .get(&ip)
            .map_or(LeaseState::Free, |lease| lease.state)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_quarantined(&self, ip: Ipv4Addr) -> bool {
        self.quarantined.contains(&ip)
    }

    /// Picks an address for `mac` and reserves it as `Offered` (DISCOVER handling).
    ///
    /// # Allocation Priority
    ///
    /// 1. Static binding for this mac
    /// 2. This mac's live offered or bound lease
    /// 3. `requested`, if in range and free
    /// 4. The mac's previous address, if free (sequential mode only)
    /// 5. Lowest free address, or a random one in random mode
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no address is free.
    pub fn allocate(
        &mut self,
        mac: MacAddr,
        requested: Option<Ipv4Addr>,
        now: DateTime<Utc>,
    ) -> Result<Ipv4Addr> {
        if let Some(ip) = self.static_binding(mac) {
            if let Some(held) = self.by_mac.get(&mac).copied()
                && held != ip
            {
                self.remove_lease(held);
            }
            if !self.leases.get(&ip).is_some_and(|lease| lease.is_live(now)) {
                self.reserve(mac, ip, now)?;
            }
            return Ok(ip);
        }

        if let Some(lease) = self.lease_for_mac(mac) {
            if lease.is_live(now) {
                return Ok(lease.ip);
            }
            let stale = lease.ip;
            self.remove_lease(stale);
        }

        let ip = requested
            .filter(|ip| self.free.contains(ip))
            .or_else(|| {
                if self.random {
                    None
                } else {
                    self.previous
                        .get(&mac)
                        .copied()
                        .filter(|ip| self.free.contains(ip))
                }
            })
            .or_else(|| {
                if self.random {
                    self.free.iter().copied().choose(&mut rand::rng())
                } else {
                    self.free.first().copied()
                }
            })
            .ok_or(Error::PoolExhausted)?;

        self.reserve(mac, ip, now)?;
        Ok(ip)
    }

    fn reserve(&mut self, mac: MacAddr, ip: Ipv4Addr, now: DateTime<Utc>) -> Result<()> {
        self.insert(Lease {
            mac,
            ip,
            state: LeaseState::Offered,
            offered_at: now,
            expires_at: now + self.offer_timeout,
            client_id: None,
        })?;
        debug!("Reserved {} for {}", ip, mac);
        Ok(())
    }

    /// Inserts or replaces a lease, refusing any change that would give one
    /// address two owners or one mac two addresses.
    fn insert(&mut self, lease: Lease) -> Result<()> {
        if let Some(existing) = self.leases.get(&lease.ip)
            && existing.mac != lease.mac
        {
            return Err(Error::InternalFault(format!(
                "{} is held by {} but was about to be given to {}",
                lease.ip, existing.mac, lease.mac
            )));
        }

        if let Some(&held) = self.by_mac.get(&lease.mac)
            && held != lease.ip
        {
            return Err(Error::InternalFault(format!(
                "{} already holds {} but was about to be given {}",
                lease.mac, held, lease.ip
            )));
        }

        self.free.remove(&lease.ip);
        self.by_mac.insert(lease.mac, lease.ip);
        self.leases.insert(lease.ip, lease);
        Ok(())
    }

    /// Drops a lease from the tables and returns its address to the free set
    /// when it belongs there.
    fn remove_lease(&mut self, ip: Ipv4Addr) -> Option<Lease> {
        let lease = self.leases.remove(&ip)?;
        if self.by_mac.get(&lease.mac) == Some(&ip) {
            self.by_mac.remove(&lease.mac);
        }
        self.previous.insert(lease.mac, ip);
        self.return_to_free(ip);
        Some(lease)
    }

    fn return_to_free(&mut self, ip: Ipv4Addr) {
        if self.in_range(ip) && !self.is_static(ip) && !self.quarantined.contains(&ip) {
            self.free.insert(ip);
        }
    }

    /// Binds an offered address (REQUEST/ACK handling).
    ///
    /// Accepts an unexpired offer for (`mac`, `ip`), or a lease already bound
    /// to the pair, and sets `expires_at = now + lease_time`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] when there is no such offer, it has
    /// lapsed, or `ip` is not what this mac was offered.
    pub fn confirm(
        &mut self,
        mac: MacAddr,
        ip: Ipv4Addr,
        client_id: Option<&[u8]>,
        lease_time: u32,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let lease = self
            .leases
            .get_mut(&ip)
            .filter(|lease| lease.mac == mac)
            .ok_or_else(|| Error::Rejected(format!("{} was not offered to {}", ip, mac)))?;

        if lease.state == LeaseState::Offered && lease.is_expired(now) {
            return Err(Error::Rejected(format!("offer of {} to {} expired", ip, mac)));
        }

        lease.state = LeaseState::Bound;
        lease.expires_at = now + TimeDelta::seconds(i64::from(lease_time));
        if let Some(id) = client_id {
            lease.client_id = Some(encode_client_id(id));
        }

        info!("Bound {} to {} for {}s", ip, mac, lease_time);
        Ok(lease.clone())
    }

    /// Extends a bound lease (renewing/rebinding).
    ///
    /// A bound lease past its expiry but not yet swept can still be renewed;
    /// nobody else can hold the address until the sweep frees it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] if `ip` is not bound to `mac`.
    pub fn renew(
        &mut self,
        mac: MacAddr,
        ip: Ipv4Addr,
        lease_time: u32,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let lease = self
            .leases
            .get_mut(&ip)
            .filter(|lease| lease.mac == mac && lease.state == LeaseState::Bound)
            .ok_or_else(|| Error::Rejected(format!("{} is not bound to {}", ip, mac)))?;

        lease.expires_at = now + TimeDelta::seconds(i64::from(lease_time));
        debug!("Renewed {} for {} until {}", ip, mac, lease.expires_at);
        Ok(lease.clone())
    }

    /// Frees a bound lease immediately (RELEASE handling).
    ///
    /// Returns the released lease, or `None` if `ip` was not bound to `mac`.
    pub fn release(&mut self, mac: MacAddr, ip: Ipv4Addr) -> Option<Lease> {
        let bound = self
            .leases
            .get(&ip)
            .is_some_and(|lease| lease.mac == mac && lease.state == LeaseState::Bound);
        if !bound {
            return None;
        }

        let mut lease = self.remove_lease(ip)?;
        lease.state = LeaseState::Released;
        info!("Released {} from {}", ip, mac);
        Some(lease)
    }

    /// Quarantines an address the client found in use (DECLINE handling).
    ///
    /// Only the mac the address is offered or bound to may decline it.
    /// Returns `true` if the address was quarantined.
    pub fn decline(&mut self, mac: MacAddr, ip: Ipv4Addr) -> bool {
        let held = self.leases.get(&ip).is_some_and(|lease| lease.mac == mac);
        if !held {
            return false;
        }

        self.quarantined.insert(ip);
        self.remove_lease(ip);
        self.previous.remove(&mac);
        warn!("{} declined {}, quarantined", mac, ip);
        true
    }

    /// Makes a quarantined address allocatable again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOutOfRange`] if the pool doesn't manage `ip`.
    pub fn clear_quarantine(&mut self, ip: Ipv4Addr) -> Result<bool> {
        if !self.in_range(ip) && !self.is_static(ip) {
            return Err(Error::AddressOutOfRange(ip));
        }

        if !self.quarantined.remove(&ip) {
            return Ok(false);
        }
        self.return_to_free(ip);
        info!("Cleared quarantine on {}", ip);
        Ok(true)
    }

    /// Forcibly frees whatever lease holds `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOutOfRange`] if the pool doesn't manage `ip`.
    pub fn reclaim(&mut self, ip: Ipv4Addr) -> Result<Option<Lease>> {
        if !self.in_range(ip) && !self.is_static(ip) {
            return Err(Error::AddressOutOfRange(ip));
        }

        Ok(self.remove_lease(ip).map(|mut lease| {
            info!("Reclaimed {} from {}", ip, lease.mac);
            lease.state = LeaseState::Free;
            lease
        }))
    }

    /// Frees every lease whose `expires_at` is before `now`, including lapsed
    /// offers, and returns them marked `Expired`.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired: Vec<Ipv4Addr> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.ip)
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for ip in expired {
            if let Some(mut lease) = self.remove_lease(ip) {
                lease.state = LeaseState::Expired;
                swept.push(lease);
            }
        }

        if !swept.is_empty() {
            debug!("Swept {} expired leases", swept.len());
        }
        swept.sort_by_key(|lease| lease.ip);
        swept
    }

    /// All offered and bound leases, ordered by address.
    pub fn snapshot(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.leases.values().cloned().collect();
        leases.sort_by_key(|lease| lease.ip);
        leases
    }

    /// Loads leases from an external store.
    ///
    /// Leases in states other than `Offered`/`Bound` are ignored. The pool is
    /// left unchanged if any lease is rejected.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if a lease is neither in range nor the
    ///   mac's static address
    /// - [`Error::InternalFault`] if two leases share an address or a mac, or
    ///   a lease holds another mac's static address
    pub fn seed(&mut self, leases: impl IntoIterator<Item = Lease>) -> Result<()> {
        let mut next = self.clone();

        for lease in leases {
            if !matches!(lease.state, LeaseState::Offered | LeaseState::Bound) {
                continue;
            }

            match next.static_owners.get(&lease.ip) {
                Some(owner) if *owner != lease.mac => {
                    return Err(Error::InternalFault(format!(
                        "{} is statically bound to {}, not {}",
                        lease.ip, owner, lease.mac
                    )));
                }
                Some(_) => {}
                None if !next.in_range(lease.ip) => {
                    return Err(Error::AddressOutOfRange(lease.ip));
                }
                None => {}
            }

            if next.leases.contains_key(&lease.ip) || next.by_mac.contains_key(&lease.mac) {
                return Err(Error::InternalFault(format!(
                    "duplicate lease for {} / {}",
                    lease.ip, lease.mac
                )));
            }

            next.quarantined.remove(&lease.ip);
            next.insert(lease)?;
        }

        *self = next;
        Ok(())
    }

    /// Checks that `leases` and `by_mac` are mutual inverses and that no
    /// held address is also free.
    pub fn check_consistency(&self) -> Result<()> {
        if self.leases.len() != self.by_mac.len() {
            return Err(Error::InternalFault(format!(
                "{} leases but {} mac entries",
                self.leases.len(),
                self.by_mac.len()
            )));
        }

        for (ip, lease) in &self.leases {
            if self.by_mac.get(&lease.mac) != Some(ip) || lease.ip != *ip {
                return Err(Error::InternalFault(format!(
                    "{} / {} index mismatch",
                    ip, lease.mac
                )));
            }
            if self.free.contains(ip) {
                return Err(Error::InternalFault(format!("{} is leased and free", ip)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            range: (
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 110),
            ),
            ..Default::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn test_lease_struct() {
        let lease = Lease {
            mac: mac(1),
            ip: Ipv4Addr::new(192, 168, 1, 100),
            state: LeaseState::Bound,
            offered_at: t0(),
            expires_at: t0() + secs(3600),
            client_id: None,
        };
        assert!(!lease.is_expired(t0()));
        assert_eq!(lease.remaining_seconds(t0() + secs(100)), 3500);
        assert!(lease.is_expired(t0() + secs(3601)));
        assert_eq!(lease.remaining_seconds(t0() + secs(4000)), 0);
    }

    #[test]
    fn test_lease_lifecycle() {
        let mut pool = LeasePool::new(&test_config());

        let ip = pool.allocate(mac(1), None, t0()).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(pool.state_of(ip), LeaseState::Offered);

        let lease = pool
            .confirm(mac(1), ip, Some(&[1, 0xaa]), 3600, t0() + secs(5))
            .unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.expires_at, t0() + secs(3605));
        assert_eq!(lease.client_id.as_deref(), Some("01:aa"));

        let renewed = pool.renew(mac(1), ip, 3600, t0() + secs(1800)).unwrap();
        assert_eq!(renewed.expires_at, t0() + secs(5400));

        let released = pool.release(mac(1), ip).unwrap();
        assert_eq!(released.state, LeaseState::Released);
        assert_eq!(pool.state_of(ip), LeaseState::Free);
        assert!(pool.lease_for_mac(mac(1)).is_none());
        pool.check_consistency().unwrap();
    }

    #[test]
    fn test_sequential_allocation() {
        let mut pool = LeasePool::new(&test_config());
        let first = pool.allocate(mac(1), None, t0()).unwrap();
        let second = pool.allocate(mac(2), None, t0()).unwrap();
        assert_eq!(first, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(second, Ipv4Addr::new(192, 168, 1, 101));

        assert_eq!(pool.allocate(mac(1), None, t0()).unwrap(), first);
    }

    #[test]
    fn test_requested_ip_honored_when_free() {
        let mut pool = LeasePool::new(&test_config());
        let wanted = Ipv4Addr::new(192, 168, 1, 105);
        assert_eq!(pool.allocate(mac(1), Some(wanted), t0()).unwrap(), wanted);

        // Taken, so mac 2 falls back to the lowest free address.
        assert_eq!(
            pool.allocate(mac(2), Some(wanted), t0()).unwrap(),
            Ipv4Addr::new(192, 168, 1, 100)
        );

        let outside = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(
            pool.allocate(mac(3), Some(outside), t0()).unwrap(),
            Ipv4Addr::new(192, 168, 1, 101)
        );
    }

    #[test]
    fn test_static_binding() {
        let mut config = test_config();
        let fixed = Ipv4Addr::new(192, 168, 1, 50);
        config.static_bindings.insert(mac(9), fixed);
        config
            .static_bindings
            .insert(mac(8), Ipv4Addr::new(192, 168, 1, 100));
        let mut pool = LeasePool::new(&config);

        assert_eq!(pool.allocate(mac(9), None, t0()).unwrap(), fixed);
        assert_eq!(
            pool.allocate(mac(9), Some(Ipv4Addr::new(192, 168, 1, 104)), t0())
                .unwrap(),
            fixed
        );

        // A static address inside the range is never handed to anyone else.
        assert_eq!(
            pool.allocate(mac(1), Some(Ipv4Addr::new(192, 168, 1, 100)), t0())
                .unwrap(),
            Ipv4Addr::new(192, 168, 1, 101)
        );

        pool.confirm(mac(9), fixed, None, 60, t0()).unwrap();
        assert_eq!(pool.lease_for_mac(mac(9)).unwrap().state, LeaseState::Bound);
    }

    #[test]
    fn test_static_binding_wins_over_random() {
        let mut config = test_config();
        config.random_ip = true;
        config
            .static_bindings
            .insert(mac(9), Ipv4Addr::new(192, 168, 1, 107));
        let mut pool = LeasePool::new(&config);

        for _ in 0..5 {
            assert_eq!(
                pool.allocate(mac(9), None, t0()).unwrap(),
                Ipv4Addr::new(192, 168, 1, 107)
            );
        }
    }

    #[test]
    fn test_random_allocation_stays_in_range() {
        let mut config = test_config();
        config.random_ip = true;
        let mut pool = LeasePool::new(&config);

        let mut seen = BTreeSet::new();
        for last in 0..11 {
            let ip = pool.allocate(mac(last), None, t0()).unwrap();
            assert!(pool.in_range(ip));
            assert!(seen.insert(ip));
        }
        assert!(matches!(
            pool.allocate(mac(99), None, t0()),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    fn test_random_mode_keeps_live_lease() {
        let mut config = test_config();
        config.random_ip = true;
        let mut pool = LeasePool::new(&config);

        let ip = pool.allocate(mac(1), None, t0()).unwrap();
        assert_eq!(pool.allocate(mac(1), None, t0() + secs(10)).unwrap(), ip);

        pool.confirm(mac(1), ip, None, 3600, t0() + secs(10)).unwrap();
        for last in 2..8 {
            pool.allocate(mac(last), None, t0()).unwrap();
        }
        assert_eq!(pool.allocate(mac(1), None, t0() + secs(20)).unwrap(), ip);
        assert_eq!(pool.state_of(ip), LeaseState::Bound);

        // A requested address still wins over the random draw.
        let wanted = pool.free.last().copied().unwrap();
        assert_eq!(pool.allocate(mac(9), Some(wanted), t0()).unwrap(), wanted);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn test_pool_exhaustion() {
        let config = ServerConfig {
            range: (
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 101),
            ),
            ..Default::default()
        };
        let mut pool = LeasePool::new(&config);

        pool.allocate(mac(1), None, t0()).unwrap();
        pool.allocate(mac(2), None, t0()).unwrap();
        assert!(matches!(
            pool.allocate(mac(3), None, t0()),
            Err(Error::PoolExhausted)
        ));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_confirm_rejections() {
        let mut pool = LeasePool::new(&test_config());
        let ip = pool.allocate(mac(1), None, t0()).unwrap();

        assert!(matches!(
            pool.confirm(mac(2), ip, None, 3600, t0()),
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            pool.confirm(mac(1), Ipv4Addr::new(192, 168, 1, 105), None, 3600, t0()),
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            pool.confirm(mac(1), ip, None, 3600, t0() + secs(61)),
            Err(Error::Rejected(_))
        ));
        assert!(pool.confirm(mac(1), ip, None, 3600, t0() + secs(60)).is_ok());
    }

    #[test]
    fn test_offer_timeout_reclaimed_by_sweep() {
        let mut pool = LeasePool::new(&test_config());
        let ip = pool.allocate(mac(1), None, t0()).unwrap();

        assert!(pool.sweep_expired(t0() + secs(30)).is_empty());
        let swept = pool.sweep_expired(t0() + secs(61));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].state, LeaseState::Expired);
        assert_eq!(pool.state_of(ip), LeaseState::Free);
    }

    #[test]
    fn test_expired_lease_reallocated_after_sweep() {
        let config = ServerConfig {
            range: (
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 100),
            ),
            ..Default::default()
        };
        let mut pool = LeasePool::new(&config);

        let ip = pool.allocate(mac(1), None, t0()).unwrap();
        pool.confirm(mac(1), ip, None, 100, t0()).unwrap();

        let later = t0() + secs(200);
        assert!(matches!(
            pool.allocate(mac(2), None, later),
            Err(Error::PoolExhausted)
        ));

        pool.sweep_expired(later);
        assert_eq!(pool.allocate(mac(2), None, later).unwrap(), ip);
        pool.check_consistency().unwrap();
    }

    #[test]
    fn test_previous_address_preferred() {
        let mut pool = LeasePool::new(&test_config());
        let first = pool.allocate(mac(1), None, t0()).unwrap();
        let ip = pool.allocate(mac(2), None, t0()).unwrap();
        pool.confirm(mac(2), ip, None, 3600, t0()).unwrap();
        pool.release(mac(2), ip).unwrap();
        pool.reclaim(first).unwrap();

        // Lower address is free too, but mac 2 gets its old one back.
        assert_eq!(pool.allocate(mac(2), None, t0()).unwrap(), ip);
    }

    #[test]
    fn test_release_wrong_mac_or_unbound() {
        let mut pool = LeasePool::new(&test_config());
        let ip = pool.allocate(mac(1), None, t0()).unwrap();

        assert!(pool.release(mac(1), ip).is_none());
        pool.confirm(mac(1), ip, None, 3600, t0()).unwrap();
        assert!(pool.release(mac(2), ip).is_none());
        assert_eq!(pool.state_of(ip), LeaseState::Bound);
    }

    #[test]
    fn test_decline_quarantines_until_cleared() {
        let config = ServerConfig {
            range: (
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 101),
            ),
            ..Default::default()
        };
        let mut pool = LeasePool::new(&config);
        let ip = pool.allocate(mac(1), None, t0()).unwrap();

        assert!(!pool.decline(mac(2), ip));
        assert!(pool.decline(mac(1), ip));
        assert!(pool.is_quarantined(ip));

        assert_eq!(
            pool.allocate(mac(1), None, t0()).unwrap(),
            Ipv4Addr::new(192, 168, 1, 101)
        );
        assert!(matches!(
            pool.allocate(mac(3), None, t0()),
            Err(Error::PoolExhausted)
        ));

        assert!(pool.clear_quarantine(ip).unwrap());
        assert!(!pool.clear_quarantine(ip).unwrap());
        assert_eq!(pool.allocate(mac(3), None, t0()).unwrap(), ip);
    }

    #[test]
    fn test_admin_operations_reject_foreign_addresses() {
        let mut pool = LeasePool::new(&test_config());
        let foreign = Ipv4Addr::new(10, 1, 1, 1);
        assert!(matches!(
            pool.clear_quarantine(foreign),
            Err(Error::AddressOutOfRange(_))
        ));
        assert!(matches!(
            pool.reclaim(foreign),
            Err(Error::AddressOutOfRange(_))
        ));
    }

    #[test]
    fn test_reclaim() {
        let mut pool = LeasePool::new(&test_config());
        let ip = pool.allocate(mac(1), None, t0()).unwrap();
        pool.confirm(mac(1), ip, None, 3600, t0()).unwrap();

        let lease = pool.reclaim(ip).unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Free);
        assert!(pool.reclaim(ip).unwrap().is_none());
        assert_eq!(pool.allocate(mac(2), None, t0()).unwrap(), ip);
    }

    #[test]
    fn test_snapshot_and_seed() {
        let mut pool = LeasePool::new(&test_config());
        let ip = pool.allocate(mac(1), None, t0()).unwrap();
        pool.confirm(mac(1), ip, None, 3600, t0()).unwrap();
        pool.allocate(mac(2), None, t0()).unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);

        let mut restored = LeasePool::new(&test_config());
        restored.seed(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.free_count(), pool.free_count());
        restored.check_consistency().unwrap();
    }

    #[test]
    fn test_seed_rejects_conflicts() {
        let lease = |last: u8, ip: Ipv4Addr| Lease {
            mac: mac(last),
            ip,
            state: LeaseState::Bound,
            offered_at: t0(),
            expires_at: t0() + secs(60),
            client_id: None,
        };
        let ip = Ipv4Addr::new(192, 168, 1, 103);
        let mut pool = LeasePool::new(&test_config());

        assert!(matches!(
            pool.seed(vec![lease(1, ip), lease(2, ip)]),
            Err(Error::InternalFault(_))
        ));
        assert!(pool.snapshot().is_empty());

        assert!(matches!(
            pool.seed(vec![lease(1, Ipv4Addr::new(10, 0, 0, 1))]),
            Err(Error::AddressOutOfRange(_))
        ));
    }
}
