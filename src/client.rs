//! Client-side protocol state machine.
//!
//! [`DhcpClient`] drives one interface through
//! `INIT → SELECTING → REQUESTING → BOUND → RENEWING → REBINDING`. It is
//! sans-IO: datagrams and timer expiries go in, [`ClientAction`]s come out,
//! and the driver (see [`transport::ClientService`](crate::transport::ClientService))
//! performs them. All timing is expressed against a caller-supplied
//! [`Instant`], and [`DhcpClient::next_deadline`] tells the driver when to
//! call [`DhcpClient::on_timeout`] next.

use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::codec::OptionCodec;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::options::{MessageType, OptionCode, OptionValue};
use crate::packet::{BOOTREPLY, DHCP_SERVER_PORT, DhcpPacket, Transmit};

/// RFC 2131 §4.4.5: never wait less than this between RENEWING/REBINDING
/// retransmissions.
const MIN_RENEW_RETRANSMIT: Duration = Duration::from_secs(60);

/// Retransmission jitter, ±1 second (RFC 2131 §4.1).
const JITTER_MILLIS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

/// A lease as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLease {
    pub ip: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub lease_time: u32,
    /// T1.
    pub renewal_time: u32,
    /// T2.
    pub rebinding_time: u32,
    pub subnet_mask: Option<Ipv4Addr>,
    pub routers: Vec<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    /// When the ACK that granted or last extended the lease arrived.
    pub acquired_at: Instant,
}

impl ClientLease {
    /// Reads the lease from an ACK typed by [`OptionCodec::decode`].
    fn from_ack(
        ack: &DhcpPacket,
        fallback_server: Option<Ipv4Addr>,
        now: Instant,
    ) -> Option<Self> {
        let u32_value = |code: OptionCode| ack.value(code as u8).and_then(OptionValue::as_u32);
        let ip_value = |code: OptionCode| ack.value(code as u8).and_then(OptionValue::as_ip);
        let ips_value = |code: OptionCode| {
            ack.value(code as u8)
                .and_then(OptionValue::as_ips)
                .map(<[Ipv4Addr]>::to_vec)
                .unwrap_or_default()
        };

        let lease_time = u32_value(OptionCode::LeaseTime)?;
        let server_id = ip_value(OptionCode::ServerIdentifier).or(fallback_server)?;

        let rebinding_time = u32_value(OptionCode::RebindingTime)
            .unwrap_or((u64::from(lease_time) * 7 / 8) as u32)
            .min(lease_time);
        let renewal_time = u32_value(OptionCode::RenewalTime)
            .unwrap_or(lease_time / 2)
            .min(rebinding_time);

        Some(Self {
            ip: ack.yiaddr,
            server_id,
            lease_time,
            renewal_time,
            rebinding_time,
            subnet_mask: ip_value(OptionCode::SubnetMask),
            routers: ips_value(OptionCode::Router),
            dns_servers: ips_value(OptionCode::DnsServer),
            domain_name: ack
                .value(OptionCode::DomainName as u8)
                .and_then(OptionValue::as_text)
                .map(Cow::into_owned),
            acquired_at: now,
        })
    }

    pub fn renew_at(&self) -> Instant {
        self.acquired_at + Duration::from_secs(u64::from(self.renewal_time))
    }

    pub fn rebind_at(&self) -> Instant {
        self.acquired_at + Duration::from_secs(u64::from(self.rebinding_time))
    }

    pub fn expires_at(&self) -> Instant {
        self.acquired_at + Duration::from_secs(u64::from(self.lease_time))
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Send(Transmit),
    /// Apply (or refresh) this lease on the interface.
    Bound(ClientLease),
    /// Remove this address from the interface.
    Deconfigure(Ipv4Addr),
    /// The client is back in INIT; call [`DhcpClient::send_discover`].
    Restart,
}

/// Exponential retransmission backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The next wait: the current interval ±1s, after which the interval
    /// doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = i64::try_from(self.current.as_millis()).unwrap_or(i64::MAX);
        let jitter = rand::rng().random_range(-JITTER_MILLIS..=JITTER_MILLIS);
        let delay = Duration::from_millis(base.saturating_add(jitter).max(0) as u64);

        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

pub struct DhcpClient {
    config: ClientConfig,
    codec: OptionCodec,
    state: ClientState,
    xid: u32,
    /// Start of the current exchange, for the `secs` field.
    started: Option<Instant>,
    /// Address and server we are REQUESTING.
    requested: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
    lease: Option<ClientLease>,
    backoff: Backoff,
    attempts: u32,
    deadline: Option<Instant>,
}

impl DhcpClient {
    pub fn new(config: ClientConfig, codec: OptionCodec) -> Result<Self> {
        config.validate()?;
        let backoff = Backoff::new(
            Duration::from_secs(config.initial_retransmit_secs),
            Duration::from_secs(config.max_retransmit_secs),
        );

        Ok(Self {
            config,
            codec,
            state: ClientState::Init,
            xid: rand::random(),
            started: None,
            requested: None,
            lease: None,
            backoff,
            attempts: 0,
            deadline: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease(&self) -> Option<&ClientLease> {
        self.lease.as_ref()
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// When [`on_timeout`](Self::on_timeout) should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Broadcasts a DISCOVER with a fresh `xid` and moves to SELECTING.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the client is in INIT.
    pub fn send_discover(&mut self, now: Instant) -> Result<Transmit> {
        self.expect_state(&[ClientState::Init], "send DISCOVER")?;

        self.begin_exchange(now);
        self.state = ClientState::Selecting;
        self.deadline = Some(now + self.backoff.next_delay());

        info!("Sending DISCOVER (xid {:#010x})", self.xid);
        Ok(self.discover(now))
    }

    /// Asks to keep a previously known address, skipping SELECTING
    /// (INIT-REBOOT).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the client is in INIT.
    pub fn reboot(&mut self, ip: Ipv4Addr, now: Instant) -> Result<Transmit> {
        self.expect_state(&[ClientState::Init], "reboot")?;

        self.begin_exchange(now);
        self.requested = Some((ip, None));
        self.state = ClientState::Requesting;
        self.attempts = 1;
        self.deadline = Some(now + self.backoff.next_delay());

        info!("Requesting previous address {} (xid {:#010x})", ip, self.xid);
        Ok(self.selecting_request(now))
    }

    /// Emits a RELEASE for the current lease and returns to INIT. DHCP
    /// defines no reply, so nothing is awaited.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the client holds a lease.
    pub fn send_release(&mut self, now: Instant) -> Result<Transmit> {
        self.expect_state(
            &[ClientState::Bound, ClientState::Renewing, ClientState::Rebinding],
            "send RELEASE",
        )?;
        let lease = self
            .lease
            .take()
            .ok_or_else(|| Error::InvalidState("no lease to release".to_string()))?;

        self.xid = rand::random();
        let mut packet = self.base_packet(MessageType::Release, now);
        packet.ciaddr = lease.ip;
        packet.set_option(
            OptionCode::ServerIdentifier as u8,
            OptionValue::Ip(lease.server_id),
        );

        self.reset();
        info!("Released {} to {}", lease.ip, lease.server_id);

        Ok(Transmit {
            payload: self.codec.encode(&packet),
            destination: SocketAddrV4::new(lease.server_id, DHCP_SERVER_PORT),
        })
    }

    /// Cancels every timer. Returns a RELEASE to send when the client holds
    /// a lease and `releaseOnClose` is set.
    pub fn close(&mut self, now: Instant) -> Option<Transmit> {
        let release = if self.config.release_on_close && self.lease.is_some() {
            self.send_release(now).ok()
        } else {
            None
        };
        self.reset();
        release
    }

    /// Handles one datagram from a server.
    ///
    /// Replies for another transaction or another hardware address are
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] for a malformed datagram.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Result<Vec<ClientAction>> {
        let packet = self.codec.decode(data)?;

        if packet.op != BOOTREPLY || packet.xid != self.xid || packet.mac() != self.config.mac {
            debug!("Ignoring reply for xid {:#010x}", packet.xid);
            return Ok(Vec::new());
        }

        let Some(message_type) = packet.message_type() else {
            return Ok(Vec::new());
        };

        debug!("{} in {:?}", message_type, self.state);

        let actions = match (self.state, message_type) {
            (ClientState::Selecting, MessageType::Offer) => self.accept_offer(&packet, now),
            (
                ClientState::Requesting | ClientState::Renewing | ClientState::Rebinding,
                MessageType::Ack,
            ) => self.accept_ack(&packet, now),
            (
                ClientState::Requesting | ClientState::Renewing | ClientState::Rebinding,
                MessageType::Nak,
            ) => {
                warn!("Received NAK, restarting discovery");
                self.restart()
            }
            _ => Vec::new(),
        };

        Ok(actions)
    }

    /// Advances timers. Does nothing before [`next_deadline`](Self::next_deadline).
    pub fn on_timeout(&mut self, now: Instant) -> Vec<ClientAction> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Vec::new(),
        }

        match self.state {
            ClientState::Init => {
                self.deadline = None;
                Vec::new()
            }
            ClientState::Selecting => {
                debug!("No OFFER yet, retransmitting DISCOVER");
                self.deadline = Some(now + self.backoff.next_delay());
                vec![ClientAction::Send(self.discover(now))]
            }
            ClientState::Requesting => {
                if self.attempts >= self.config.max_request_attempts {
                    warn!("No reply to REQUEST after {} attempts", self.attempts);
                    return self.restart();
                }
                self.attempts += 1;
                self.deadline = Some(now + self.backoff.next_delay());
                vec![ClientAction::Send(self.selecting_request(now))]
            }
            ClientState::Bound => {
                let Some(lease) = self.lease.clone() else {
                    return self.restart();
                };
                info!("T1 reached, renewing {} with {}", lease.ip, lease.server_id);
                self.begin_exchange(now);
                self.state = ClientState::Renewing;
                self.deadline = Some(retransmit_deadline(now, lease.rebind_at()));
                vec![ClientAction::Send(self.extend_request(&lease, now))]
            }
            ClientState::Renewing => {
                let Some(lease) = self.lease.clone() else {
                    return self.restart();
                };
                if now >= lease.rebind_at() {
                    info!("T2 reached, rebinding {}", lease.ip);
                    self.state = ClientState::Rebinding;
                    self.deadline = Some(retransmit_deadline(now, lease.expires_at()));
                } else {
                    self.deadline = Some(retransmit_deadline(now, lease.rebind_at()));
                }
                vec![ClientAction::Send(self.extend_request(&lease, now))]
            }
            ClientState::Rebinding => {
                let Some(lease) = self.lease.clone() else {
                    return self.restart();
                };
                if now >= lease.expires_at() {
                    warn!("Lease on {} expired", lease.ip);
                    return self.restart();
                }
                self.deadline = Some(retransmit_deadline(now, lease.expires_at()));
                vec![ClientAction::Send(self.extend_request(&lease, now))]
            }
        }
    }

    fn accept_offer(&mut self, offer: &DhcpPacket, now: Instant) -> Vec<ClientAction> {
        let Some(server_id) = offer.server_identifier() else {
            warn!("OFFER of {} has no server identifier, ignoring", offer.yiaddr);
            return Vec::new();
        };

        info!("Received OFFER {} from {}", offer.yiaddr, server_id);

        self.requested = Some((offer.yiaddr, Some(server_id)));
        self.state = ClientState::Requesting;
        self.attempts = 1;
        self.backoff.reset();
        self.deadline = Some(now + self.backoff.next_delay());

        vec![ClientAction::Send(self.selecting_request(now))]
    }

    fn accept_ack(&mut self, ack: &DhcpPacket, now: Instant) -> Vec<ClientAction> {
        let expected = match self.state {
            ClientState::Requesting => self.requested.map(|(ip, _)| ip),
            _ => self.lease.as_ref().map(|lease| lease.ip),
        };
        if let Some(expected) = expected
            && ack.yiaddr != expected
        {
            warn!("ACK for {} but we asked for {}, ignoring", ack.yiaddr, expected);
            return Vec::new();
        }

        let fallback_server = self
            .lease
            .as_ref()
            .map(|lease| lease.server_id)
            .or_else(|| self.requested.and_then(|(_, server)| server));

        let Some(lease) = ClientLease::from_ack(ack, fallback_server, now) else {
            warn!("ACK for {} lacks lease time or server id, ignoring", ack.yiaddr);
            return Vec::new();
        };

        info!(
            "Bound to {} from {} for {}s (T1 {}s, T2 {}s)",
            lease.ip, lease.server_id, lease.lease_time, lease.renewal_time, lease.rebinding_time
        );

        self.state = ClientState::Bound;
        self.requested = None;
        self.started = None;
        self.deadline = Some(lease.renew_at());
        self.lease = Some(lease.clone());

        vec![ClientAction::Bound(lease)]
    }

    /// Drops all state and reports what the driver has to undo.
    fn restart(&mut self) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        if let Some(lease) = self.lease.take() {
            actions.push(ClientAction::Deconfigure(lease.ip));
        }
        self.reset();
        actions.push(ClientAction::Restart);
        actions
    }

    fn reset(&mut self) {
        self.state = ClientState::Init;
        self.lease = None;
        self.requested = None;
        self.started = None;
        self.deadline = None;
        self.attempts = 0;
        self.backoff.reset();
    }

    fn begin_exchange(&mut self, now: Instant) {
        self.xid = rand::random();
        self.started = Some(now);
        self.backoff.reset();
    }

    fn expect_state(&self, allowed: &[ClientState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "cannot {} in {:?}",
                operation, self.state
            )))
        }
    }

    fn base_packet(&self, message_type: MessageType, now: Instant) -> DhcpPacket {
        let mut packet = DhcpPacket::request(message_type, self.xid, self.config.mac);
        packet.secs = self
            .started
            .map(|started| now.saturating_duration_since(started).as_secs())
            .map_or(0, |secs| u16::try_from(secs).unwrap_or(u16::MAX));

        if let Some(client_id) = &self.config.client_id {
            packet.set_option(
                OptionCode::ClientIdentifier as u8,
                OptionValue::Bytes(client_id.as_bytes().to_vec()),
            );
        }
        packet
    }

    /// Adds the options every DISCOVER/REQUEST carries.
    fn with_parameters(&self, mut packet: DhcpPacket) -> DhcpPacket {
        if let Some(hostname) = &self.config.hostname {
            packet.set_option(
                OptionCode::Hostname as u8,
                OptionValue::ascii(hostname),
            );
        }
        packet.set_option(
            OptionCode::MaxMessageSize as u8,
            OptionValue::UInt16(self.config.max_message_size),
        );
        if !self.config.requested_options.is_empty() {
            packet.set_option(
                OptionCode::ParameterRequestList as u8,
                OptionValue::Bytes(self.config.requested_options.clone()),
            );
        }
        packet
    }

    fn discover(&self, now: Instant) -> Transmit {
        let mut packet = self.base_packet(MessageType::Discover, now);
        packet.set_broadcast(true);
        let packet = self.with_parameters(packet);
        broadcast(self.codec.encode(&packet))
    }

    /// REQUEST in SELECTING or INIT-REBOOT: broadcast, `ciaddr` zero,
    /// requested address in Option 50.
    fn selecting_request(&self, now: Instant) -> Transmit {
        let mut packet = self.base_packet(MessageType::Request, now);
        packet.set_broadcast(true);

        if let Some((ip, server)) = self.requested {
            packet.set_option(OptionCode::RequestedIpAddress as u8, OptionValue::Ip(ip));
            if let Some(server) = server {
                packet.set_option(OptionCode::ServerIdentifier as u8, OptionValue::Ip(server));
            }
        }

        let packet = self.with_parameters(packet);
        broadcast(self.codec.encode(&packet))
    }

    /// REQUEST in RENEWING (unicast to the server) or REBINDING (broadcast):
    /// `ciaddr` set, no server identifier, no requested address.
    fn extend_request(&self, lease: &ClientLease, now: Instant) -> Transmit {
        let mut packet = self.base_packet(MessageType::Request, now);
        packet.ciaddr = lease.ip;
        let packet = self.with_parameters(packet);
        let payload = self.codec.encode(&packet);

        if self.state == ClientState::Rebinding {
            broadcast(payload)
        } else {
            Transmit {
                payload,
                destination: SocketAddrV4::new(lease.server_id, DHCP_SERVER_PORT),
            }
        }
    }
}

fn broadcast(payload: Vec<u8>) -> Transmit {
    Transmit {
        payload,
        destination: SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_SERVER_PORT),
    }
}

/// Half the time left until `until`, at least 60 seconds, never past `until`.
fn retransmit_deadline(now: Instant, until: Instant) -> Instant {
    let remaining = until.saturating_duration_since(now);
    let wait = (remaining / 2).max(MIN_RENEW_RETRANSMIT);
    (now + wait).min(until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MacAddr;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    fn test_client() -> DhcpClient {
        let config = ClientConfig {
            mac: MacAddr([0x02, 0, 0, 0, 0, 0x42]),
            hostname: Some("kiosk".to_string()),
            ..Default::default()
        };
        DhcpClient::new(config, OptionCodec::standard()).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn decode(transmit: &Transmit) -> DhcpPacket {
        OptionCodec::standard().decode(&transmit.payload).unwrap()
    }

    fn sent(actions: &[ClientAction]) -> Vec<&Transmit> {
        actions
            .iter()
            .filter_map(|action| match action {
                ClientAction::Send(transmit) => Some(transmit),
                _ => None,
            })
            .collect()
    }

    /// A server reply to the client's current transaction.
    fn server_reply(
        client: &DhcpClient,
        message_type: MessageType,
        lease: Option<(u32, u32, u32)>,
    ) -> Vec<u8> {
        let request = DhcpPacket::request(MessageType::Request, client.xid(), client.config.mac);
        let yiaddr = if message_type == MessageType::Nak {
            Ipv4Addr::UNSPECIFIED
        } else {
            OFFERED
        };
        let mut reply = DhcpPacket::create_reply(&request, message_type, yiaddr, SERVER_IP);
        reply.set_option(
            OptionCode::ServerIdentifier as u8,
            OptionValue::Ip(SERVER_IP),
        );
        if let Some((lease_time, t1, t2)) = lease {
            reply.set_option(OptionCode::LeaseTime as u8, OptionValue::UInt32(lease_time));
            reply.set_option(OptionCode::RenewalTime as u8, OptionValue::UInt32(t1));
            reply.set_option(OptionCode::RebindingTime as u8, OptionValue::UInt32(t2));
        }
        reply.encode()
    }

    fn bound_client(now: Instant, lease: (u32, u32, u32)) -> DhcpClient {
        let mut client = test_client();
        client.send_discover(now).unwrap();
        let offer = server_reply(&client, MessageType::Offer, Some(lease));
        client.handle_datagram(&offer, now).unwrap();
        let ack = server_reply(&client, MessageType::Ack, Some(lease));
        client.handle_datagram(&ack, now).unwrap();
        assert_eq!(client.state(), ClientState::Bound);
        client
    }

    #[test]
    fn test_discover_is_broadcast_with_parameters() {
        let now = Instant::now();
        let mut client = test_client();

        let transmit = client.send_discover(now).unwrap();
        assert!(transmit.is_broadcast());
        assert_eq!(transmit.destination.port(), DHCP_SERVER_PORT);

        let packet = decode(&transmit);
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert_eq!(packet.xid, client.xid());
        assert!(packet.is_broadcast());
        assert_eq!(packet.hostname().as_deref(), Some("kiosk"));
        assert_eq!(packet.max_message_size(), Some(1500));
        assert_eq!(
            packet.parameter_request_list(),
            Some(&[1, 3, 6, 15, 28, 51, 58, 59][..])
        );
        assert_eq!(client.state(), ClientState::Selecting);
        assert!(client.next_deadline().is_some());

        assert!(matches!(
            client.send_discover(now),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_offer_triggers_request() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();
        let xid = client.xid();

        let offer = server_reply(&client, MessageType::Offer, Some((3600, 1800, 3150)));
        let actions = client.handle_datagram(&offer, now).unwrap();

        let transmits = sent(&actions);
        assert_eq!(transmits.len(), 1);
        assert!(transmits[0].is_broadcast());

        let request = decode(transmits[0]);
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(request.xid, xid);
        assert_eq!(request.requested_ip(), Some(OFFERED));
        assert_eq!(request.server_identifier(), Some(SERVER_IP));
        assert_eq!(request.ciaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(client.state(), ClientState::Requesting);

        // Second OFFER is ignored: first come, first served.
        assert!(client.handle_datagram(&offer, now).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_replies_ignored() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();

        let mac = client.config.mac;
        let mut other = DhcpPacket::request(MessageType::Discover, client.xid() ^ 1, mac);
        let wrong_xid = DhcpPacket::create_reply(&other, MessageType::Offer, OFFERED, SERVER_IP);
        assert!(client.handle_datagram(&wrong_xid.encode(), now).unwrap().is_empty());

        other = DhcpPacket::request(MessageType::Discover, client.xid(), MacAddr([9; 6]));
        let wrong_mac = DhcpPacket::create_reply(&other, MessageType::Offer, OFFERED, SERVER_IP);
        assert!(client.handle_datagram(&wrong_mac.encode(), now).unwrap().is_empty());

        assert_eq!(client.state(), ClientState::Selecting);
        assert!(client.handle_datagram(&[1, 2, 3], now).is_err());
    }

    #[test]
    fn test_ack_binds_with_timers() {
        let now = Instant::now();
        let client = bound_client(now, (100, 50, 87));

        let lease = client.lease().unwrap();
        assert_eq!(lease.ip, OFFERED);
        assert_eq!(lease.server_id, SERVER_IP);
        assert_eq!(lease.renew_at(), now + secs(50));
        assert_eq!(lease.rebind_at(), now + secs(87));
        assert_eq!(lease.expires_at(), now + secs(100));
        assert_eq!(client.next_deadline(), Some(now + secs(50)));
    }

    #[test]
    fn test_default_t1_t2() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();
        client
            .handle_datagram(&server_reply(&client, MessageType::Offer, None), now)
            .unwrap();

        let request = DhcpPacket::request(MessageType::Request, client.xid(), client.config.mac);
        let mut ack = DhcpPacket::create_reply(&request, MessageType::Ack, OFFERED, SERVER_IP);
        ack.set_option(OptionCode::LeaseTime as u8, OptionValue::UInt32(1000));

        let actions = client.handle_datagram(&ack.encode(), now).unwrap();
        let ClientAction::Bound(lease) = &actions[0] else {
            panic!("expected Bound, got {:?}", actions);
        };
        assert_eq!(lease.renewal_time, 500);
        assert_eq!(lease.rebinding_time, 875);
        assert_eq!(lease.server_id, SERVER_IP);
    }

    #[test]
    fn test_nak_returns_to_init() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();
        client
            .handle_datagram(&server_reply(&client, MessageType::Offer, Some((60, 30, 50))), now)
            .unwrap();

        let nak = server_reply(&client, MessageType::Nak, None);
        let actions = client.handle_datagram(&nak, now).unwrap();
        assert_eq!(actions, vec![ClientAction::Restart]);
        assert_eq!(client.state(), ClientState::Init);
        assert!(client.next_deadline().is_none());
        assert!(client.send_discover(now).is_ok());
    }

    #[test]
    fn test_selecting_retransmits_with_backoff() {
        let start = Instant::now();
        let mut client = test_client();
        client.send_discover(start).unwrap();
        let xid = client.xid();

        assert!(client.on_timeout(start).is_empty());

        let mut now = start;
        for round in 0..6 {
            let deadline = client.next_deadline().unwrap();
            let wait = deadline - now;
            let expected = secs((4u64 << round).min(64));
            assert!(wait + secs(1) >= expected && wait <= expected + secs(1));

            now = deadline;
            let actions = client.on_timeout(now);
            let transmit = sent(&actions)[0].clone();
            let packet = decode(&transmit);
            assert_eq!(packet.message_type(), Some(MessageType::Discover));
            assert_eq!(packet.xid, xid);
        }
    }

    #[test]
    fn test_requesting_gives_up() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();
        client
            .handle_datagram(&server_reply(&client, MessageType::Offer, Some((60, 30, 50))), now)
            .unwrap();

        let mut retransmits = 0;
        loop {
            let deadline = client.next_deadline().unwrap();
            let actions = client.on_timeout(deadline);
            if actions == vec![ClientAction::Restart] {
                break;
            }
            assert_eq!(decode(sent(&actions)[0]).message_type(), Some(MessageType::Request));
            retransmits += 1;
        }
        assert_eq!(retransmits, 3);
        assert_eq!(client.state(), ClientState::Init);
    }

    #[test]
    fn test_renewing_is_unicast_with_ciaddr() {
        let now = Instant::now();
        let mut client = bound_client(now, (100, 50, 87));

        assert!(client.on_timeout(now + secs(49)).is_empty());
        let actions = client.on_timeout(now + secs(50));
        assert_eq!(client.state(), ClientState::Renewing);

        let transmit = sent(&actions)[0];
        assert_eq!(
            transmit.destination,
            SocketAddrV4::new(SERVER_IP, DHCP_SERVER_PORT)
        );
        let request = decode(transmit);
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(request.ciaddr, OFFERED);
        assert_eq!(request.server_identifier(), None);
        assert_eq!(request.requested_ip(), None);
        assert!(!request.is_broadcast());

        // Fewer than 60s remain until T2, so the next try is at T2.
        assert_eq!(client.next_deadline(), Some(now + secs(87)));

        let ack = server_reply(&client, MessageType::Ack, Some((100, 50, 87)));
        let later = now + secs(55);
        let actions = client.handle_datagram(&ack, later).unwrap();
        assert!(matches!(actions[0], ClientAction::Bound(_)));
        assert_eq!(client.state(), ClientState::Bound);
        assert_eq!(client.next_deadline(), Some(later + secs(50)));
    }

    #[test]
    fn test_rebinding_then_expiry() {
        let now = Instant::now();
        let mut client = bound_client(now, (100, 50, 87));

        client.on_timeout(now + secs(50));
        let actions = client.on_timeout(now + secs(87));
        assert_eq!(client.state(), ClientState::Rebinding);
        assert!(sent(&actions)[0].is_broadcast());
        assert_eq!(decode(sent(&actions)[0]).ciaddr, OFFERED);
        assert_eq!(client.next_deadline(), Some(now + secs(100)));

        let actions = client.on_timeout(now + secs(100));
        assert_eq!(
            actions,
            vec![ClientAction::Deconfigure(OFFERED), ClientAction::Restart]
        );
        assert_eq!(client.state(), ClientState::Init);
        assert!(client.lease().is_none());
    }

    #[test]
    fn test_ack_while_rebinding_binds_again() {
        let now = Instant::now();
        let mut client = bound_client(now, (100, 50, 87));
        client.on_timeout(now + secs(50));
        client.on_timeout(now + secs(87));
        assert_eq!(client.state(), ClientState::Rebinding);

        let ack = server_reply(&client, MessageType::Ack, Some((100, 50, 87)));
        let later = now + secs(90);
        let actions = client.handle_datagram(&ack, later).unwrap();
        let [ClientAction::Bound(lease)] = actions.as_slice() else {
            panic!("expected Bound, got {:?}", actions);
        };
        assert_eq!(lease.ip, OFFERED);
        assert_eq!(lease.expires_at(), later + secs(100));
        assert_eq!(client.state(), ClientState::Bound);
        assert_eq!(client.next_deadline(), Some(later + secs(50)));
    }

    #[test]
    fn test_ack_for_other_address_ignored() {
        let now = Instant::now();
        let mut client = test_client();
        client.send_discover(now).unwrap();
        let offer = server_reply(&client, MessageType::Offer, Some((100, 50, 87)));
        client.handle_datagram(&offer, now).unwrap();
        assert_eq!(client.state(), ClientState::Requesting);

        let ack = server_reply(&client, MessageType::Ack, Some((100, 50, 87)));
        let mut wrong = OptionCodec::standard().decode(&ack).unwrap();
        wrong.yiaddr = Ipv4Addr::new(192, 168, 1, 99);
        assert!(client.handle_datagram(&wrong.encode(), now).unwrap().is_empty());
        assert_eq!(client.state(), ClientState::Requesting);
        assert!(client.lease().is_none());

        let actions = client.handle_datagram(&ack, now).unwrap();
        assert!(matches!(actions.as_slice(), [ClientAction::Bound(_)]));
    }

    #[test]
    fn test_nak_while_renewing_deconfigures() {
        let now = Instant::now();
        let mut client = bound_client(now, (100, 50, 87));
        client.on_timeout(now + secs(50));

        let nak = server_reply(&client, MessageType::Nak, None);
        let actions = client.handle_datagram(&nak, now + secs(51)).unwrap();
        assert_eq!(
            actions,
            vec![ClientAction::Deconfigure(OFFERED), ClientAction::Restart]
        );
    }

    #[test]
    fn test_long_lease_retransmits_at_half_remaining() {
        let now = Instant::now();
        let mut client = bound_client(now, (86400, 43200, 75600));

        client.on_timeout(now + secs(43200));
        assert_eq!(client.next_deadline(), Some(now + secs(43200 + 16200)));
    }

    #[test]
    fn test_release() {
        let now = Instant::now();
        let mut client = test_client();
        assert!(matches!(
            client.send_release(now),
            Err(Error::InvalidState(_))
        ));

        let mut client = bound_client(now, (100, 50, 87));
        let transmit = client.send_release(now).unwrap();
        assert_eq!(
            transmit.destination,
            SocketAddrV4::new(SERVER_IP, DHCP_SERVER_PORT)
        );
        let release = decode(&transmit);
        assert_eq!(release.message_type(), Some(MessageType::Release));
        assert_eq!(release.ciaddr, OFFERED);
        assert_eq!(release.server_identifier(), Some(SERVER_IP));
        assert_eq!(client.state(), ClientState::Init);
        assert!(client.next_deadline().is_none());
    }

    #[test]
    fn test_close() {
        let now = Instant::now();
        let mut client = bound_client(now, (100, 50, 87));
        assert!(client.close(now).is_none());
        assert_eq!(client.state(), ClientState::Init);

        let mut client = bound_client(now, (100, 50, 87));
        client.config.release_on_close = true;
        let release = client.close(now).unwrap();
        assert_eq!(decode(&release).message_type(), Some(MessageType::Release));
        assert!(client.next_deadline().is_none());
    }

    #[test]
    fn test_reboot_shortcut() {
        let now = Instant::now();
        let mut client = test_client();

        let transmit = client.reboot(OFFERED, now).unwrap();
        assert_eq!(client.state(), ClientState::Requesting);
        let request = decode(&transmit);
        assert_eq!(request.requested_ip(), Some(OFFERED));
        assert_eq!(request.server_identifier(), None);
        assert_eq!(request.ciaddr, Ipv4Addr::UNSPECIFIED);

        let ack = server_reply(&client, MessageType::Ack, Some((100, 50, 87)));
        client.handle_datagram(&ack, now).unwrap();
        assert_eq!(client.state(), ClientState::Bound);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(secs(4), secs(16));
        for expected in [4, 8, 16, 16] {
            let delay = backoff.next_delay();
            assert!(delay >= secs(expected - 1) && delay <= secs(expected + 1));
        }
        backoff.reset();
        assert!(backoff.next_delay() <= secs(5));
    }

    #[test]
    fn test_backoff_saturates_with_huge_cap() {
        let mut backoff = Backoff::new(secs(4), secs(u64::MAX));
        let mut last = Duration::ZERO;
        for _ in 0..80 {
            last = backoff.next_delay();
        }
        assert!(last >= secs(1 << 40));
    }

    #[test]
    fn test_retransmit_deadline() {
        let now = Instant::now();
        assert_eq!(retransmit_deadline(now, now + secs(1000)), now + secs(500));
        assert_eq!(retransmit_deadline(now, now + secs(100)), now + secs(60));
        assert_eq!(retransmit_deadline(now, now + secs(30)), now + secs(30));
    }
}
