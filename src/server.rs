//! Server-side protocol state machine.
//!
//! [`DhcpServer`] answers client messages without touching a socket: each
//! datagram goes in through [`DhcpServer::handle_datagram`] and at most one
//! [`Response`] comes out, already encoded and addressed. The
//! [`transport`](crate::transport) layer owns the socket and the sweep timer
//! and feeds both into the same `&mut self`, so the [`LeasePool`] only ever
//! has one mutator.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::codec::OptionCodec;
use crate::config::{ConfigValues, ServerConfig};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeasePool, LeaseState};
use crate::options::{ConfigLookup, MessageType, OptionCode, OptionValue};
use crate::packet::{
    BOOTREQUEST, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, DhcpPacket, MacAddr, Transmit,
};

/// Options every lease-granting reply carries, requested or not.
const LEASE_OPTIONS: [u8; 4] = [
    OptionCode::ServerIdentifier as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::RenewalTime as u8,
    OptionCode::RebindingTime as u8,
];

/// Options never dropped when fitting a reply into the client's size limit.
const PROTECTED_OPTIONS: [u8; 6] = [
    OptionCode::MessageType as u8,
    OptionCode::ServerIdentifier as u8,
    OptionCode::LeaseTime as u8,
    OptionCode::RenewalTime as u8,
    OptionCode::RebindingTime as u8,
    OptionCode::RelayAgentInfo as u8,
];

/// Shortest lease granted when a client asks for one (Option 51).
const MIN_LEASE_SECONDS: u32 = 60;

/// RFC 2132 §9.10 minimum for the maximum message size.
const MIN_MESSAGE_SIZE: u16 = 576;

/// IPv4 + UDP headers, counted against the maximum message size.
const IP_UDP_HEADER_SIZE: usize = 28;

/// Computes the boot file name from the decoded request and the reply being
/// built. Its return value is written into the `file` field verbatim.
pub type BootFileFn = Arc<dyn Fn(&DhcpPacket, &DhcpPacket) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// OFFER sent, waiting for the REQUEST.
    AwaitingRequest,
    Bound,
}

/// What the server remembers about one `xid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub state: TransactionState,
    pub updated_at: DateTime<Utc>,
}

/// A reply ready to hand to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub packet: DhcpPacket,
    pub transmit: Transmit,
}

impl Response {
    pub fn message_type(&self) -> Option<MessageType> {
        self.packet.message_type()
    }
}

/// Lease, T1 and T2 for one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeaseTimes {
    lease: u32,
    renewal: u32,
    rebinding: u32,
}

/// Configuration view with the negotiated lease times laid over it.
struct ReplyValues<'a> {
    base: &'a ConfigValues,
    times: Option<LeaseTimes>,
}

impl ConfigLookup for ReplyValues<'_> {
    fn lookup(&self, key: &str) -> Option<OptionValue> {
        match (key, self.times) {
            ("leaseTime", Some(times)) => Some(OptionValue::UInt32(times.lease)),
            ("renewalTime", Some(times)) => Some(OptionValue::UInt32(times.renewal)),
            ("rebindingTime", Some(times)) => Some(OptionValue::UInt32(times.rebinding)),
            _ => self.base.lookup(key),
        }
    }
}

pub struct DhcpServer {
    config: ServerConfig,
    values: ConfigValues,
    codec: OptionCodec,
    pool: LeasePool,
    transactions: HashMap<u32, Transaction>,
    boot_file: Option<BootFileFn>,
}

impl DhcpServer {
    /// Validates the configuration against the codec's option table and
    /// builds an empty pool.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for any configuration problem, including
    /// option values of the wrong shape.
    pub fn new(config: ServerConfig, codec: OptionCodec) -> Result<Self> {
        config.validate()?;
        let values = config.option_values(codec.registry())?;
        let pool = LeasePool::new(&config);

        info!(
            "IP pool: {} - {} ({} addresses)",
            config.range.0,
            config.range.1,
            config.pool_size()
        );

        Ok(Self {
            config,
            values,
            codec,
            pool,
            transactions: HashMap::new(),
            boot_file: None,
        })
    }

    /// Installs the boot file callback (PXE).
    pub fn with_boot_file<F>(mut self, boot_file: F) -> Self
    where
        F: Fn(&DhcpPacket, &DhcpPacket) -> String + Send + Sync + 'static,
    {
        self.boot_file = Some(Arc::new(boot_file));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn codec(&self) -> &OptionCodec {
        &self.codec
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    /// Mutable pool access for administrative operations and seeding.
    pub fn pool_mut(&mut self) -> &mut LeasePool {
        &mut self.pool
    }

    pub fn transaction(&self, xid: u32) -> Option<&Transaction> {
        self.transactions.get(&xid)
    }

    fn server_ip(&self) -> Ipv4Addr {
        self.config.server
    }

    /// Decodes and answers one datagram.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] for a malformed datagram (the caller drops it), or
    /// [`Error::InternalFault`] if the pool detects an inconsistency.
    pub fn handle_datagram(&mut self, data: &[u8], now: DateTime<Utc>) -> Result<Option<Response>> {
        let packet = self.codec.decode(data)?;
        self.handle_packet(&packet, now)
    }

    pub fn handle_packet(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        if packet.op != BOOTREQUEST {
            debug!("Ignoring BOOTREPLY from {}", packet.mac());
            return Ok(None);
        }

        let Some(message_type) = packet.message_type() else {
            debug!("Ignoring BOOTP request from {}", packet.mac());
            return Ok(None);
        };

        info!("{} from {} (xid {:#010x})", message_type, packet.mac(), packet.xid);

        match message_type {
            MessageType::Discover => self.handle_discover(packet, now),
            MessageType::Request => self.handle_request(packet, now),
            MessageType::Decline => {
                self.handle_decline(packet);
                Ok(None)
            }
            MessageType::Release => {
                self.handle_release(packet);
                Ok(None)
            }
            MessageType::Inform => Ok(Some(self.handle_inform(packet))),
            other => {
                warn!("Ignoring {} message", other);
                Ok(None)
            }
        }
    }

    fn handle_discover(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();

        let offered_ip = match self.pool.allocate(mac, packet.requested_ip(), now) {
            Ok(ip) => ip,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted, cannot offer IP to {}", mac);
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        self.transactions.insert(
            packet.xid,
            Transaction {
                mac,
                ip: offered_ip,
                state: TransactionState::AwaitingRequest,
                updated_at: now,
            },
        );

        let times = self.negotiate_lease_times(packet);
        let response = self.reply(packet, MessageType::Offer, offered_ip, Some(times));

        info!("OFFER {} to {}", offered_ip, mac);

        Ok(Some(response))
    }

    fn handle_request(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();

        match packet.server_identifier() {
            Some(server_id) if server_id != self.server_ip() => {
                info!("REQUEST from {} is for different server {}", mac, server_id);
                self.transactions.remove(&packet.xid);
                Ok(None)
            }
            Some(_) => self.handle_selecting(packet, now),
            None if packet.ciaddr != Ipv4Addr::UNSPECIFIED => self.handle_renewing(packet, now),
            None => self.handle_init_reboot(packet, now),
        }
    }

    /// REQUEST answering one of our OFFERs.
    fn handle_selecting(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();

        let requested_ip = packet.requested_ip().or_else(|| {
            self.transactions
                .get(&packet.xid)
                .filter(|txn| txn.mac == mac)
                .map(|txn| txn.ip)
        });

        let Some(requested_ip) = requested_ip else {
            return Ok(Some(self.nak(packet, "No IP address in REQUEST")));
        };

        self.bind(packet, requested_ip, now)
    }

    /// REQUEST from a client extending its lease (RENEWING or REBINDING).
    fn handle_renewing(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();
        let ip = packet.ciaddr;
        let times = self.negotiate_lease_times(packet);

        match self.pool.renew(mac, ip, times.lease, now) {
            Ok(_) => {
                self.record_bound(packet.xid, mac, ip, now);
                info!("ACK {} to {} (renewed {}s)", ip, mac, times.lease);
                Ok(Some(self.reply(packet, MessageType::Ack, ip, Some(times))))
            }
            Err(Error::Rejected(reason)) => {
                if self.is_wrong_for(mac, ip) {
                    Ok(Some(self.nak(packet, &reason)))
                } else {
                    debug!("No lease for {} at {}, staying silent", mac, ip);
                    Ok(None)
                }
            }
            Err(error) => Err(error),
        }
    }

    /// REQUEST with a remembered address and no ciaddr (INIT-REBOOT).
    fn handle_init_reboot(
        &mut self,
        packet: &DhcpPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();

        let Some(requested_ip) = packet.requested_ip() else {
            warn!("REQUEST from {} carries neither server id, ciaddr nor requested ip", mac);
            return Ok(None);
        };

        if self
            .pool
            .lease_for_ip(requested_ip)
            .is_some_and(|lease| lease.mac == mac)
        {
            return self.bind(packet, requested_ip, now);
        }

        if self.is_wrong_for(mac, requested_ip) {
            return Ok(Some(self.nak(packet, "Requested IP not valid for this client")));
        }

        debug!("No record of {} for {}, staying silent", requested_ip, mac);
        Ok(None)
    }

    /// Confirms or renews `ip` for the requesting mac and builds ACK or NAK.
    fn bind(
        &mut self,
        packet: &DhcpPacket,
        ip: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Response>> {
        let mac = packet.mac();
        let times = self.negotiate_lease_times(packet);

        let result = match self.pool.lease_for_ip(ip).map(|lease| lease.state) {
            Some(LeaseState::Bound) => self.pool.renew(mac, ip, times.lease, now),
            _ => self
                .pool
                .confirm(mac, ip, Some(&packet.client_id()), times.lease, now),
        };

        match result {
            Ok(lease) => {
                self.record_bound(packet.xid, mac, ip, now);
                info!(
                    "ACK {} to {} (lease: {} seconds)",
                    ip,
                    mac,
                    lease.remaining_seconds(now)
                );
                Ok(Some(self.reply(packet, MessageType::Ack, ip, Some(times))))
            }
            Err(Error::Rejected(reason)) => {
                self.transactions.remove(&packet.xid);
                Ok(Some(self.nak(packet, &reason)))
            }
            Err(error) => Err(error),
        }
    }

    fn record_bound(&mut self, xid: u32, mac: MacAddr, ip: Ipv4Addr, now: DateTime<Utc>) {
        self.transactions.insert(
            xid,
            Transaction {
                mac,
                ip,
                state: TransactionState::Bound,
                updated_at: now,
            },
        );
    }

    /// True when `ip` can never be this mac's: outside what we manage, held
    /// by someone else, or another mac's static address.
    fn is_wrong_for(&self, mac: MacAddr, ip: Ipv4Addr) -> bool {
        if let Some(fixed) = self.pool.static_binding(mac) {
            return fixed != ip;
        }
        if !self.pool.in_range(ip) || self.pool.is_static(ip) {
            return true;
        }
        self.pool
            .lease_for_ip(ip)
            .is_some_and(|lease| lease.mac != mac)
    }

    fn handle_decline(&mut self, packet: &DhcpPacket) {
        let mac = packet.mac();

        let Some(declined_ip) = packet.requested_ip() else {
            warn!("DECLINE from {} without requested ip", mac);
            return;
        };

        if self.pool.decline(mac, declined_ip) {
            warn!(
                "DECLINE from {} for {} - marked IP as unavailable",
                mac, declined_ip
            );
        } else {
            warn!(
                "DECLINE from {} for {} rejected - IP not associated with this client",
                mac, declined_ip
            );
        }
        self.transactions.remove(&packet.xid);
    }

    fn handle_release(&mut self, packet: &DhcpPacket) {
        let mac = packet.mac();

        if packet.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", mac);
            return;
        }

        match self.pool.release(mac, packet.ciaddr) {
            Some(_) => info!("RELEASE from {} for {}", mac, packet.ciaddr),
            None => warn!(
                "RELEASE from {} for {} ignored - not bound to this client",
                mac, packet.ciaddr
            ),
        }
        self.transactions.remove(&packet.xid);
    }

    fn handle_inform(&self, packet: &DhcpPacket) -> Response {
        let response = self.reply(packet, MessageType::Inform, Ipv4Addr::UNSPECIFIED, None);
        info!("INFORM response to {}", packet.mac());
        response
    }

    /// Lease length for this request: the client's Option 51 clamped to
    /// `[60, leaseTime]`, else `leaseTime`. T1/T2 are the configured values
    /// for a full lease and 1/2 and 7/8 of a shortened one.
    fn negotiate_lease_times(&self, packet: &DhcpPacket) -> LeaseTimes {
        let max_lease = self.config.lease_time;
        let lease = match packet.lease_time() {
            Some(requested) => requested.clamp(MIN_LEASE_SECONDS.min(max_lease), max_lease),
            None => max_lease,
        };

        if lease == max_lease {
            LeaseTimes {
                lease,
                renewal: self.config.renewal_time,
                rebinding: self.config.rebinding_time,
            }
        } else {
            LeaseTimes {
                lease,
                renewal: lease / 2,
                rebinding: (u64::from(lease) * 7 / 8) as u32,
            }
        }
    }

    /// Builds an OFFER, ACK, or (for [`MessageType::Inform`]) an ACK with no
    /// address and no lease timers.
    fn reply(
        &self,
        request: &DhcpPacket,
        kind: MessageType,
        your_ip: Ipv4Addr,
        times: Option<LeaseTimes>,
    ) -> Response {
        let message_type = match kind {
            MessageType::Inform => MessageType::Ack,
            other => other,
        };

        let mut reply = DhcpPacket::create_reply(request, message_type, your_ip, self.server_ip());
        if message_type == MessageType::Ack {
            reply.ciaddr = request.ciaddr;
        }

        let values = ReplyValues {
            base: &self.values,
            times,
        };
        let always: &[u8] = if times.is_some() {
            &LEASE_OPTIONS
        } else {
            &LEASE_OPTIONS[..1]
        };

        let mut options = self.codec.select_options(
            request.parameter_request_list(),
            self.values.forced(),
            always,
            &values,
        );
        if times.is_none() {
            options.retain(|(code, _)| !LEASE_OPTIONS[1..].contains(code));
        }

        for (code, value) in options {
            reply.set_option(code, value);
        }

        self.finish(request, reply)
    }

    fn nak(&self, request: &DhcpPacket, reason: &str) -> Response {
        let mut nak = DhcpPacket::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        );
        nak.set_option(
            OptionCode::ServerIdentifier as u8,
            OptionValue::Ip(self.server_ip()),
        );

        warn!("NAK to {}: {}", request.mac(), reason);

        self.finish(request, nak)
    }

    /// Echoes relay data, runs the boot file callback, fits the reply to the
    /// client's size limit, encodes and addresses it.
    fn finish(&self, request: &DhcpPacket, mut reply: DhcpPacket) -> Response {
        if let Some(relay_info) = request.relay_agent_info() {
            reply.set_raw_option(OptionCode::RelayAgentInfo as u8, relay_info.to_vec());
        }

        let is_nak = reply.message_type() == Some(MessageType::Nak);

        if let Some(boot_file) = &self.boot_file {
            let name = boot_file(request, &reply);
            reply.set_file_name(&name);
        }

        self.fit_to_size(request, &mut reply);

        let transmit = Transmit {
            payload: self.codec.encode(&reply),
            destination: reply_destination(request, is_nak),
        };

        Response {
            packet: reply,
            transmit,
        }
    }

    /// Drops optional options from the tail until the reply fits in
    /// `min(maxMessageSize, client Option 57)`.
    fn fit_to_size(&self, request: &DhcpPacket, reply: &mut DhcpPacket) {
        let limit = request
            .max_message_size()
            .map_or(self.config.max_message_size, |client| {
                client.min(self.config.max_message_size)
            })
            .max(MIN_MESSAGE_SIZE);
        let limit = usize::from(limit) - IP_UDP_HEADER_SIZE;

        while reply.encoded_len() > limit {
            let Some(victim) = reply
                .options
                .iter()
                .rev()
                .map(|option| option.code)
                .find(|code| !PROTECTED_OPTIONS.contains(code))
            else {
                warn!(
                    "Reply to {} is {} bytes, over the {} byte limit",
                    request.mac(),
                    reply.encoded_len(),
                    limit
                );
                break;
            };

            debug!("Dropping option {} to fit {} bytes", victim, limit);
            reply.remove_option(victim);
        }
    }

    /// Periodic tick: frees lapsed offers and expired leases, and forgets
    /// stale transactions.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired = self.pool.sweep_expired(now);
        for lease in &expired {
            info!("Lease {} for {} expired", lease.ip, lease.mac);
        }

        let horizon = TimeDelta::seconds(i64::from(self.config.offer_timeout));
        self.transactions
            .retain(|_, txn| txn.updated_at + horizon >= now);

        expired
    }

    /// Drops in-flight transactions. Leases are kept so a later server can
    /// snapshot or continue from them.
    pub fn close(&mut self) {
        let dropped = self.transactions.len();
        self.transactions.clear();
        info!("DHCP server closed ({} open transactions dropped)", dropped);
    }
}

/// Where a reply goes.
///
/// Relayed requests go back to the relay on port 67. Clients that already
/// have an address (`ciaddr`) get unicast, except for NAKs. Everything else
/// is broadcast, since a client without an address can't answer ARP.
fn reply_destination(request: &DhcpPacket, is_nak: bool) -> SocketAddrV4 {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
    }
}
