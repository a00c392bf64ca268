//! DHCP options as defined in RFC 2132.
//!
//! DHCP uses options to convey configuration parameters between servers and clients.
//! Each option has a code (1 byte), length (1 byte), and variable-length data.
//!
//! Options are described by an [`OptionRegistry`]: an immutable table mapping
//! each code to a name, a [`ValueType`], the configuration key a server reads
//! its value from, and an optional default. The registry drives both decoding
//! (bytes to [`OptionValue`]) and response building. Codes missing from the
//! table are carried as opaque bytes.
//!
//! Enum labels (e.g. `5 => "DHCPACK"`) live in a side table and are only
//! used for diagnostics.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{DecodeError, Error, Result};

/// DHCP option codes the engine itself relies on.
///
/// The full set of understood options is whatever the [`OptionRegistry`]
/// holds; this enum only names the codes the state machines reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Used for alignment.
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// Indicates sname/file fields contain options (RFC 2132 §9.3).
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    MaxMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
    /// End of options marker.
    End = 255,
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Wire representation of an option's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    UInt8,
    Ascii,
    Ip,
    /// A list of addresses, 4 bytes each.
    Ips,
    UInt16,
    UInt32,
    Bool,
    /// Opaque byte list (parameter request list, client identifier, ...).
    Bytes,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UInt8 => "UInt8",
            Self::Ascii => "ASCII",
            Self::Ip => "IP",
            Self::Ips => "IPs",
            Self::UInt16 => "UInt16",
            Self::UInt32 => "UInt32",
            Self::Bool => "Bool",
            Self::Bytes => "Bytes",
        };
        f.write_str(name)
    }
}

/// A decoded (or to-be-encoded) option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    UInt8(u8),
    /// Text exactly as it appeared on the wire; no encoding is enforced.
    Ascii(Vec<u8>),
    Ip(Ipv4Addr),
    Ips(Vec<Ipv4Addr>),
    UInt16(u16),
    UInt32(u32),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl OptionValue {
    pub fn ascii(text: &str) -> Self {
        Self::Ascii(text.as_bytes().to_vec())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Self::UInt8(_) => ValueType::UInt8,
            Self::Ascii(_) => ValueType::Ascii,
            Self::Ip(_) => ValueType::Ip,
            Self::Ips(_) => ValueType::Ips,
            Self::UInt16(_) => ValueType::UInt16,
            Self::UInt32(_) => ValueType::UInt32,
            Self::Bool(_) => ValueType::Bool,
            Self::Bytes(_) => ValueType::Bytes,
        }
    }

    /// Decodes an option payload according to `value_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::BadLength`] if the byte count doesn't fit the
    /// type: integers and IP must be exactly their width, Bool exactly one
    /// byte, IPs a multiple of 4.
    pub fn decode(
        value_type: ValueType,
        code: u8,
        data: &[u8],
    ) -> std::result::Result<Self, DecodeError> {
        let bad_length = || DecodeError::BadLength {
            code,
            len: data.len(),
        };

        match value_type {
            ValueType::UInt8 => match data {
                [value] => Ok(Self::UInt8(*value)),
                _ => Err(bad_length()),
            },
            ValueType::UInt16 => {
                let bytes: [u8; 2] = data.try_into().map_err(|_| bad_length())?;
                Ok(Self::UInt16(u16::from_be_bytes(bytes)))
            }
            ValueType::UInt32 => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| bad_length())?;
                Ok(Self::UInt32(u32::from_be_bytes(bytes)))
            }
            ValueType::Ip => {
                let bytes: [u8; 4] = data.try_into().map_err(|_| bad_length())?;
                Ok(Self::Ip(Ipv4Addr::from(bytes)))
            }
            ValueType::Ips => {
                if !data.len().is_multiple_of(4) {
                    return Err(bad_length());
                }
                let addrs = data
                    .chunks_exact(4)
                    .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                    .collect();
                Ok(Self::Ips(addrs))
            }
            ValueType::Bool => match data {
                [value] => Ok(Self::Bool(*value != 0)),
                _ => Err(bad_length()),
            },
            ValueType::Ascii => Ok(Self::Ascii(data.to_vec())),
            ValueType::Bytes => Ok(Self::Bytes(data.to_vec())),
        }
    }

    /// Serializes the payload (without code/length header).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::UInt8(value) => vec![*value],
            Self::Ascii(text) => text.clone(),
            Self::Ip(addr) => addr.octets().to_vec(),
            Self::Ips(addrs) => addrs.iter().flat_map(|addr| addr.octets()).collect(),
            Self::UInt16(value) => value.to_be_bytes().to_vec(),
            Self::UInt32(value) => value.to_be_bytes().to_vec(),
            Self::Bool(value) => vec![u8::from(*value)],
            Self::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Converts a configuration JSON value into a value of `value_type`.
    ///
    /// Returns `None` when the JSON shape doesn't fit the type. A single
    /// address string is accepted where a list of addresses is expected.
    pub fn from_json(value_type: ValueType, json: &serde_json::Value) -> Option<Self> {
        let parse_ip = |value: &serde_json::Value| value.as_str()?.parse::<Ipv4Addr>().ok();

        match value_type {
            ValueType::UInt8 => u8::try_from(json.as_u64()?).ok().map(Self::UInt8),
            ValueType::UInt16 => u16::try_from(json.as_u64()?).ok().map(Self::UInt16),
            ValueType::UInt32 => u32::try_from(json.as_u64()?).ok().map(Self::UInt32),
            ValueType::Bool => json.as_bool().map(Self::Bool),
            ValueType::Ascii => json.as_str().map(Self::ascii),
            ValueType::Ip => parse_ip(json).map(Self::Ip),
            ValueType::Ips => match json {
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(parse_ip)
                    .collect::<Option<Vec<_>>>()
                    .map(Self::Ips),
                single => parse_ip(single).map(|addr| Self::Ips(vec![addr])),
            },
            ValueType::Bytes => json
                .as_array()?
                .iter()
                .map(|item| u8::try_from(item.as_u64()?).ok())
                .collect::<Option<Vec<_>>>()
                .map(Self::Bytes),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Self::UInt8(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_ips(&self) -> Option<&[Ipv4Addr]> {
        match self {
            Self::Ips(addrs) => Some(addrs),
            _ => None,
        }
    }

    /// Text value for display; bytes that aren't UTF-8 show as U+FFFD.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Ascii(text) => Some(String::from_utf8_lossy(text)),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8(value) => write!(f, "{}", value),
            Self::Ascii(text) => write!(f, "{:?}", String::from_utf8_lossy(text)),
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Ips(addrs) => {
                let joined: Vec<String> = addrs.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", joined.join(", "))
            }
            Self::UInt16(value) => write!(f, "{}", value),
            Self::UInt32(value) => write!(f, "{}", value),
            Self::Bool(value) => write!(f, "{}", value),
            Self::Bytes(bytes) => {
                let hex: Vec<String> = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
                write!(f, "{}", hex.join(":"))
            }
        }
    }
}

/// Read-only access to configured option values, keyed by `configKey`.
pub trait ConfigLookup {
    fn lookup(&self, key: &str) -> Option<OptionValue>;
}

impl ConfigLookup for HashMap<String, OptionValue> {
    fn lookup(&self, key: &str) -> Option<OptionValue> {
        self.get(key).cloned()
    }
}

/// A default computed from the current configuration at response time.
pub type DeriveFn = Arc<dyn Fn(&dyn ConfigLookup) -> Option<OptionValue> + Send + Sync>;

/// Fallback used when the configuration has no value for an option.
#[derive(Clone)]
pub enum DefaultValue {
    Literal(OptionValue),
    /// Evaluated lazily for every response.
    Derived(DeriveFn),
}

impl DefaultValue {
    pub fn derived<F>(derive: F) -> Self
    where
        F: Fn(&dyn ConfigLookup) -> Option<OptionValue> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(derive))
    }

    pub fn resolve(&self, lookup: &dyn ConfigLookup) -> Option<OptionValue> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Derived(derive) => derive(lookup),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// One row of the option table.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub code: u8,
    /// Diagnostic name, also accepted in `forceOptions`.
    pub name: String,
    pub value_type: ValueType,
    /// Key the server looks the value up under in its configuration.
    pub config_key: Option<String>,
    pub default: Option<DefaultValue>,
}

impl OptionSpec {
    pub fn new(code: u8, name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            code,
            name: name.into(),
            value_type,
            config_key: None,
            default: None,
        }
    }

    pub fn config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = Some(key.into());
        self
    }

    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Resolves the value to emit: configured value first, then the default.
    pub fn resolve(&self, lookup: &dyn ConfigLookup) -> Option<OptionValue> {
        self.config_key
            .as_deref()
            .and_then(|key| lookup.lookup(key))
            .or_else(|| self.default.as_ref()?.resolve(lookup))
    }
}

/// Immutable option table.
///
/// Built once with [`RegistryBuilder`] and shared (usually behind an `Arc`)
/// by the codec, server and client. Iteration follows declaration order,
/// which is also the order options are emitted in responses.
#[derive(Debug, Clone)]
pub struct OptionRegistry {
    specs: Vec<OptionSpec>,
    by_code: HashMap<u8, usize>,
    labels: HashMap<u8, BTreeMap<u32, String>>,
}

impl OptionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The RFC 2132 options this engine understands out of the box.
    pub fn standard() -> Self {
        RegistryBuilder::standard().build()
    }

    pub fn get(&self, code: u8) -> Option<&OptionSpec> {
        self.by_code.get(&code).map(|&index| &self.specs[index])
    }

    /// Finds an entry by its diagnostic name or its config key.
    pub fn find(&self, name: &str) -> Option<&OptionSpec> {
        self.specs
            .iter()
            .find(|spec| spec.name == name || spec.config_key.as_deref() == Some(name))
    }

    pub fn by_config_key(&self, key: &str) -> Option<&OptionSpec> {
        self.specs
            .iter()
            .find(|spec| spec.config_key.as_deref() == Some(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Decodes a payload by the table's type for `code`.
    ///
    /// Codes not in the table come back as [`OptionValue::Bytes`].
    pub fn decode_value(
        &self,
        code: u8,
        data: &[u8],
    ) -> std::result::Result<OptionValue, DecodeError> {
        match self.get(code) {
            Some(spec) => OptionValue::decode(spec.value_type, code, data),
            None => Ok(OptionValue::Bytes(data.to_vec())),
        }
    }

    pub fn label(&self, code: u8, value: u32) -> Option<&str> {
        self.labels.get(&code)?.get(&value).map(String::as_str)
    }

    /// Human-readable rendering of an option, e.g. `messageType=DHCPACK`.
    pub fn describe(&self, code: u8, value: &OptionValue) -> String {
        let name = self
            .get(code)
            .map(|spec| spec.name.clone())
            .unwrap_or_else(|| format!("option{}", code));

        let numeric = match value {
            OptionValue::UInt8(value) => Some(u32::from(*value)),
            OptionValue::UInt16(value) => Some(u32::from(*value)),
            OptionValue::UInt32(value) => Some(*value),
            _ => None,
        };

        match numeric.and_then(|number| self.label(code, number)) {
            Some(label) => format!("{}={}", name, label),
            None => format!("{}={}", name, value),
        }
    }
}

/// Builder for [`OptionRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    specs: Vec<OptionSpec>,
    by_code: HashMap<u8, usize>,
    labels: HashMap<u8, BTreeMap<u32, String>>,
}

impl RegistryBuilder {
    /// Starts from the standard table so callers can append site options.
    pub fn standard() -> Self {
        let broadcast = DefaultValue::derived(|config| {
            let server = config.lookup("server")?.as_ip()?;
            let mask = config.lookup("netmask")?.as_ip()?;
            Some(OptionValue::Ip(Ipv4Addr::from(
                u32::from(server) | !u32::from(mask),
            )))
        });

        let specs = vec![
            OptionSpec::new(1, "subnetMask", ValueType::Ip).config_key("netmask"),
            OptionSpec::new(2, "timeOffset", ValueType::UInt32).config_key("timeOffset"),
            OptionSpec::new(3, "router", ValueType::Ips).config_key("router"),
            OptionSpec::new(6, "dns", ValueType::Ips).config_key("dns"),
            OptionSpec::new(12, "hostname", ValueType::Ascii).config_key("hostname"),
            OptionSpec::new(15, "domainName", ValueType::Ascii).config_key("domainName"),
            OptionSpec::new(19, "ipForwarding", ValueType::Bool).config_key("ipForwarding"),
            OptionSpec::new(26, "interfaceMtu", ValueType::UInt16).config_key("mtu"),
            OptionSpec::new(28, "broadcast", ValueType::Ip)
                .config_key("broadcast")
                .default_value(broadcast),
            OptionSpec::new(42, "ntpServers", ValueType::Ips).config_key("ntp"),
            OptionSpec::new(44, "netbiosNameServers", ValueType::Ips).config_key("wins"),
            OptionSpec::new(50, "requestedIpAddress", ValueType::Ip),
            OptionSpec::new(51, "leaseTime", ValueType::UInt32)
                .config_key("leaseTime")
                .default_value(DefaultValue::Literal(OptionValue::UInt32(86400))),
            OptionSpec::new(52, "optionOverload", ValueType::UInt8),
            OptionSpec::new(53, "messageType", ValueType::UInt8),
            OptionSpec::new(54, "serverIdentifier", ValueType::Ip).config_key("server"),
            OptionSpec::new(55, "parameterRequestList", ValueType::Bytes),
            OptionSpec::new(57, "maxMessageSize", ValueType::UInt16)
                .config_key("maxMessageSize")
                .default_value(DefaultValue::Literal(OptionValue::UInt16(1500))),
            OptionSpec::new(58, "renewalTime", ValueType::UInt32)
                .config_key("renewalTime")
                .default_value(DefaultValue::Literal(OptionValue::UInt32(3600))),
            OptionSpec::new(59, "rebindingTime", ValueType::UInt32)
                .config_key("rebindingTime")
                .default_value(DefaultValue::Literal(OptionValue::UInt32(14400))),
            OptionSpec::new(60, "vendorClassIdentifier", ValueType::Ascii),
            OptionSpec::new(61, "clientIdentifier", ValueType::Bytes),
            OptionSpec::new(66, "tftpServerName", ValueType::Ascii).config_key("tftpServer"),
            OptionSpec::new(67, "bootFileName", ValueType::Ascii).config_key("bootFileName"),
            OptionSpec::new(82, "relayAgentInformation", ValueType::Bytes),
        ];

        let mut builder = Self::default();
        for spec in specs {
            builder.insert(spec);
        }

        builder
            .labels(
                OptionCode::MessageType as u8,
                &[
                    (1, "DHCPDISCOVER"),
                    (2, "DHCPOFFER"),
                    (3, "DHCPREQUEST"),
                    (4, "DHCPDECLINE"),
                    (5, "DHCPACK"),
                    (6, "DHCPNAK"),
                    (7, "DHCPRELEASE"),
                    (8, "DHCPINFORM"),
                ],
            )
            .labels(
                OptionCode::OptionOverload as u8,
                &[(1, "file"), (2, "sname"), (3, "both")],
            )
    }

    fn insert(&mut self, spec: OptionSpec) {
        self.by_code.insert(spec.code, self.specs.len());
        self.specs.push(spec);
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the code is already defined or is
    /// one of the framing codes (0 and 255).
    pub fn add(mut self, spec: OptionSpec) -> Result<Self> {
        if spec.code == OptionCode::Pad as u8 || spec.code == OptionCode::End as u8 {
            return Err(Error::InvalidConfig(format!(
                "option code {} is reserved for framing",
                spec.code
            )));
        }
        if self.by_code.contains_key(&spec.code) {
            return Err(Error::InvalidConfig(format!(
                "option code {} ({}) is already defined",
                spec.code, spec.name
            )));
        }
        self.insert(spec);
        Ok(self)
    }

    /// Attaches diagnostic labels for the values of `code`.
    pub fn labels(mut self, code: u8, labels: &[(u32, &str)]) -> Self {
        let entry = self.labels.entry(code).or_default();
        for (value, label) in labels {
            entry.insert(*value, (*label).to_string());
        }
        self
    }

    pub fn build(self) -> OptionRegistry {
        OptionRegistry {
            specs: self.specs,
            by_code: self.by_code,
            labels: self.labels,
        }
    }
}
