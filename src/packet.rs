//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. This module handles the wire
//! framing: the fixed header, the option TLV walk, option splitting and
//! concatenation, and reply construction. Typing option payloads is the job
//! of [`OptionCodec`](crate::OptionCodec).
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 3396: Encoding Long Options in DHCPv4

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DecodeError;
use crate::options::{MessageType, OptionCode, OptionValue};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const DHCP_OP_HTYPE_HLEN_HOPS_SIZE: usize = 4;
const DHCP_XID_SIZE: usize = 4;
const DHCP_SECS_SIZE: usize = 2;
const DHCP_FLAGS_SIZE: usize = 2;
const DHCP_CIADDR_SIZE: usize = 4;
const DHCP_YIADDR_SIZE: usize = 4;
const DHCP_SIADDR_SIZE: usize = 4;
const DHCP_GIADDR_SIZE: usize = 4;
const DHCP_CHADDR_SIZE: usize = 16;
const DHCP_SNAME_SIZE: usize = 64;
const DHCP_FILE_SIZE: usize = 128;

const DHCP_CHADDR_OFFSET: usize = DHCP_OP_HTYPE_HLEN_HOPS_SIZE
    + DHCP_XID_SIZE
    + DHCP_SECS_SIZE
    + DHCP_FLAGS_SIZE
    + DHCP_CIADDR_SIZE
    + DHCP_YIADDR_SIZE
    + DHCP_SIADDR_SIZE
    + DHCP_GIADDR_SIZE;

const DHCP_SNAME_OFFSET: usize = DHCP_CHADDR_OFFSET + DHCP_CHADDR_SIZE;

const DHCP_FILE_OFFSET: usize = DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE;

const DHCP_MAGIC_COOKIE_OFFSET: usize = DHCP_FILE_OFFSET + DHCP_FILE_SIZE;

/// Size of the fixed header portion including magic cookie.
pub const DHCP_FIXED_HEADER_SIZE: usize = DHCP_MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Minimum DHCP packet size per RFC 2131 §2.
///
/// DHCP requires packets to be at least 300 bytes for compatibility
/// with BOOTP relay agents.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Initial capacity for packet encoding buffer.
///
/// 576 bytes is the minimum MTU that all hosts must accept per RFC 791.
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Largest payload a single option header can carry.
const MAX_OPTION_PAYLOAD: usize = 255;

/// Maximum hop count before dropping the packet.
///
/// Prevents infinite relay loops. Per RFC 2131 §4.1, relay agents
/// increment hops and should discard packets with excessive counts.
const MAX_HOPS: u8 = 16;

/// Broadcast bit in the `flags` field.
const BROADCAST_FLAG: u16 = 0x8000;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `AA-BB-CC-DD-EE-FF`.
    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = text.trim().to_lowercase().replace('-', ":");
        let parts: Vec<&str> = normalized.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{}'", text));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{}'", text))?;
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One option as it appears on the wire, after concatenating repeated
/// occurrences of the same code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    pub data: Vec<u8>,
}

/// An encoded datagram and where it should go.
///
/// The core never touches sockets; drivers pass these to `send_to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub payload: Vec<u8>,
    pub destination: SocketAddrV4,
}

impl Transmit {
    pub fn is_broadcast(&self) -> bool {
        *self.destination.ip() == Ipv4Addr::BROADCAST
    }
}

/// A DHCP packet.
///
/// This struct represents both client requests and server replies. Options
/// are kept in encounter order as [`RawOption`]s; `values` holds the typed
/// view filled in by [`OptionCodec::decode`](crate::OptionCodec::decode) or
/// by [`set_option`](Self::set_option).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hardware address length. [`HLEN_ETHERNET`] (6) for Ethernet.
    pub hlen: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,

    /// Client IP address (set by client in BOUND/RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,

    /// Server IP address (next server in BOOTP, or DHCP server).
    pub siaddr: Ipv4Addr,

    /// Gateway IP address - set by relay agents.
    pub giaddr: Ipv4Addr,

    /// Client hardware address (MAC for Ethernet).
    pub chaddr: [u8; 16],

    /// Server host name (or option overflow area if Option 52 is set).
    pub sname: [u8; 64],

    /// Boot file name (or option overflow area if Option 52 is set).
    pub file: [u8; 128],

    /// Options in encounter order, repeated codes concatenated.
    pub options: Vec<RawOption>,

    /// Typed option values keyed by code.
    pub values: BTreeMap<u8, OptionValue>,
}

impl DhcpPacket {
    /// Creates an empty Ethernet packet with the given operation code.
    pub fn new(op: u8, xid: u32, mac: MacAddr) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.0);

        Self {
            op,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    /// Creates a client request carrying only the message type option.
    pub fn request(message_type: MessageType, xid: u32, mac: MacAddr) -> Self {
        let mut packet = Self::new(BOOTREQUEST, xid, mac);
        packet.set_option(
            OptionCode::MessageType as u8,
            OptionValue::UInt8(message_type as u8),
        );
        packet
    }

    /// Parses the wire framing of a DHCP packet.
    ///
    /// Option payloads are kept raw; `values` stays empty until the packet is
    /// typed by an [`OptionCodec`](crate::OptionCodec).
    ///
    /// # Errors
    ///
    /// - [`DecodeError::TooShort`] below 240 bytes (fixed header + magic cookie)
    /// - [`DecodeError::BadMagicCookie`] if the cookie is not 99.130.83.99
    /// - [`DecodeError::TooManyHops`] above 16 hops (relay loop protection)
    /// - [`DecodeError::BadHardwareLength`] if Ethernet hlen is not 6
    /// - [`DecodeError::Truncated`] if an option runs past the buffer
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(DecodeError::TooShort(data.len()));
        }

        let magic_cookie = &data[DHCP_MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE];
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(DecodeError::BadMagicCookie);
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        if hops > MAX_HOPS {
            return Err(DecodeError::TooManyHops(hops));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(DecodeError::BadHardwareLength(hlen));
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[DHCP_CHADDR_OFFSET..DHCP_SNAME_OFFSET]);

        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[DHCP_SNAME_OFFSET..DHCP_FILE_OFFSET]);

        let mut file = [0u8; 128];
        file.copy_from_slice(&data[DHCP_FILE_OFFSET..DHCP_MAGIC_COOKIE_OFFSET]);

        let mut options = Vec::new();
        Self::parse_options(&data[DHCP_FIXED_HEADER_SIZE..], &mut options)?;

        let overload = options
            .iter()
            .find(|opt| opt.code == OptionCode::OptionOverload as u8)
            .and_then(|opt| opt.data.first().copied());

        // RFC 2131 §4.1: file is read before sname. Once merged, the
        // carrier fields are blanked and 52 dropped so encode doesn't
        // apply them twice.
        if let Some(flag) = overload {
            if flag == 1 || flag == 3 {
                Self::parse_options(&file, &mut options)?;
                file = [0u8; 128];
            }
            if flag == 2 || flag == 3 {
                Self::parse_options(&sname, &mut options)?;
                sname = [0u8; 64];
            }
            options.retain(|opt| opt.code != OptionCode::OptionOverload as u8);
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
            values: BTreeMap::new(),
        })
    }

    /// Walks `(code, length, value)` triples until End or buffer exhaustion,
    /// appending to `options`. A repeated code is concatenated onto its first
    /// occurrence (RFC 3396 long-option splitting).
    fn parse_options(data: &[u8], options: &mut Vec<RawOption>) -> Result<(), DecodeError> {
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(DecodeError::Truncated(code));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(DecodeError::Truncated(code));
            }

            let option_data = &data[index + 2..index + 2 + length];
            match options.iter_mut().find(|existing| existing.code == code) {
                Some(existing) => existing.data.extend_from_slice(option_data),
                None => options.push(RawOption {
                    code,
                    data: option_data.to_vec(),
                }),
            }

            index += 2 + length;
        }

        Ok(())
    }

    /// Encodes the packet to bytes for transmission.
    ///
    /// The returned buffer is at least 300 bytes (padded per RFC 2131).
    /// Options longer than 255 bytes are split into consecutive entries with
    /// the same code.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            Self::encode_option(option, &mut packet);
        }

        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }

        packet
    }

    fn encode_option(option: &RawOption, packet: &mut Vec<u8>) {
        if option.data.is_empty() {
            packet.push(option.code);
            packet.push(0);
            return;
        }

        for chunk in option.data.chunks(MAX_OPTION_PAYLOAD) {
            packet.push(option.code);
            packet.push(chunk.len() as u8);
            packet.extend_from_slice(chunk);
        }
    }

    /// Length of [`encode`](Self::encode)'s output without allocating it.
    pub fn encoded_len(&self) -> usize {
        let options: usize = self
            .options
            .iter()
            .map(|option| {
                let chunks = option.data.len().div_ceil(MAX_OPTION_PAYLOAD).max(1);
                option.data.len() + 2 * chunks
            })
            .sum();
        (DHCP_FIXED_HEADER_SIZE + options + 1).max(DHCP_MIN_PACKET_SIZE)
    }

    /// Raw payload of an option, if present.
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|opt| opt.code == code)
            .map(|opt| opt.data.as_slice())
    }

    /// Typed value of an option, if the packet has been typed.
    pub fn value(&self, code: u8) -> Option<&OptionValue> {
        self.values.get(&code)
    }

    /// Sets an option, replacing any previous value for the same code.
    ///
    /// New codes are appended, so callers control emission order.
    pub fn set_option(&mut self, code: u8, value: OptionValue) {
        let data = value.to_bytes();
        match self.options.iter_mut().find(|opt| opt.code == code) {
            Some(existing) => existing.data = data,
            None => self.options.push(RawOption { code, data }),
        }
        self.values.insert(code, value);
    }

    /// Sets an option from raw bytes with no typed view.
    pub fn set_raw_option(&mut self, code: u8, data: Vec<u8>) {
        self.values.remove(&code);
        match self.options.iter_mut().find(|opt| opt.code == code) {
            Some(existing) => existing.data = data,
            None => self.options.push(RawOption { code, data }),
        }
    }

    pub fn remove_option(&mut self, code: u8) -> Option<RawOption> {
        self.values.remove(&code);
        let index = self.options.iter().position(|opt| opt.code == code)?;
        Some(self.options.remove(index))
    }

    fn ip_option(&self, code: u8) -> Option<Ipv4Addr> {
        let bytes: [u8; 4] = self.option(code)?.try_into().ok()?;
        Some(Ipv4Addr::from(bytes))
    }

    fn u32_option(&self, code: u8) -> Option<u32> {
        let bytes: [u8; 4] = self.option(code)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Returns the DHCP message type (Option 53) if present and valid.
    ///
    /// Returns `None` for BOOTP packets which don't have this option.
    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(OptionCode::MessageType as u8)? {
            [value] => MessageType::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Returns the requested IP address (Option 50) if present.
    ///
    /// Clients include this in DISCOVER to request a specific IP,
    /// and in REQUEST to confirm the offered IP.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.ip_option(OptionCode::RequestedIpAddress as u8)
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients include this in REQUEST to indicate which server's
    /// offer they are accepting.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.ip_option(OptionCode::ServerIdentifier as u8)
    }

    /// Returns the client identifier (Option 61) if present.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.option(OptionCode::ClientIdentifier as u8)
    }

    /// Returns the relay agent information (Option 82) if present.
    ///
    /// This is added by DHCP relay agents and must be echoed in replies.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.option(OptionCode::RelayAgentInfo as u8)
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<String> {
        self.option(OptionCode::Hostname as u8)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Returns the parameter request list (Option 55) if present.
    ///
    /// This is a list of option codes the client wants in the response.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.option(OptionCode::ParameterRequestList as u8)
    }

    /// Returns the client's maximum DHCP message size (Option 57) if present.
    pub fn max_message_size(&self) -> Option<u16> {
        let bytes: [u8; 2] = self
            .option(OptionCode::MaxMessageSize as u8)?
            .try_into()
            .ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    /// Returns the lease time (Option 51) if present.
    pub fn lease_time(&self) -> Option<u32> {
        self.u32_option(OptionCode::LeaseTime as u8)
    }

    /// Returns the renewal (T1) time (Option 58) if present.
    pub fn renewal_time(&self) -> Option<u32> {
        self.u32_option(OptionCode::RenewalTime as u8)
    }

    /// Returns the rebinding (T2) time (Option 59) if present.
    pub fn rebinding_time(&self) -> Option<u32> {
        self.u32_option(OptionCode::RebindingTime as u8)
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.ip_option(OptionCode::SubnetMask as u8)
    }

    fn ips_option(&self, code: u8) -> Vec<Ipv4Addr> {
        self.option(code)
            .map(|data| {
                data.chunks_exact(4)
                    .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.ips_option(OptionCode::DnsServer as u8)
    }

    pub fn domain_name(&self) -> Option<String> {
        self.option(OptionCode::DomainName as u8)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Returns the client hardware address bytes (respecting hlen).
    pub fn chaddr_bytes(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    /// The first six bytes of `chaddr` as an Ethernet address.
    pub fn mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.chaddr[..6]);
        MacAddr(octets)
    }

    /// Returns a unique client identifier for lease tracking.
    ///
    /// Uses Option 61 (Client Identifier) if present, otherwise
    /// constructs an identifier from hardware type + hardware address.
    pub fn client_id(&self) -> Vec<u8> {
        if let Some(id) = self.client_identifier() {
            id.to_vec()
        } else {
            let mut id = vec![self.htype];
            id.extend_from_slice(self.chaddr_bytes());
            id
        }
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    ///
    /// When set, servers must broadcast replies instead of unicasting.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        if broadcast {
            self.flags |= BROADCAST_FLAG;
        } else {
            self.flags &= !BROADCAST_FLAG;
        }
    }

    /// The `file` field up to the first NUL.
    pub fn file_name(&self) -> String {
        let end = self
            .file
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(self.file.len());
        String::from_utf8_lossy(&self.file[..end]).into_owned()
    }

    /// Writes `name` into the `file` field, truncated to 128 bytes.
    pub fn set_file_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(DHCP_FILE_SIZE);
        self.file = [0u8; 128];
        self.file[..len].copy_from_slice(&bytes[..len]);
    }

    /// Creates a DHCP reply packet from a request.
    ///
    /// The message type is added as the first option; callers append the
    /// rest in emission order.
    ///
    /// # Preserved Fields
    ///
    /// The following fields are copied from the request:
    /// - `xid` (transaction ID)
    /// - `flags` (broadcast flag)
    /// - `giaddr` (relay agent address)
    /// - `chaddr` (client hardware address)
    /// - `htype` and `hlen` (hardware type/length)
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> Self {
        let mut reply = Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
            values: BTreeMap::new(),
        };
        reply.set_option(
            OptionCode::MessageType as u8,
            OptionValue::UInt8(message_type as u8),
        );
        reply
    }
}
