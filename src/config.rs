//! Server and client configuration.
//!
//! [`ServerConfig`] is the JSON surface an operator edits. Before the server
//! starts it is turned into [`ConfigValues`]: every value converted to an
//! [`OptionValue`] and checked against the option table, so a wrongly shaped
//! value is rejected at startup instead of while answering a client.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options::{ConfigLookup, OptionRegistry, OptionValue};
use crate::packet::MacAddr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Inclusive address range handed out dynamically.
    pub range: (Ipv4Addr, Ipv4Addr),
    /// Option names (or config keys) sent even when the client didn't ask.
    pub force_options: Vec<String>,
    #[serde(rename = "randomIP")]
    pub random_ip: bool,
    /// Fixed mac to ip assignments. These win over the dynamic range.
    #[serde(rename = "static")]
    pub static_bindings: BTreeMap<MacAddr, Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub router: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
    pub domain_name: Option<String>,
    pub broadcast: Option<Ipv4Addr>,
    /// Our own address, sent as the server identifier.
    pub server: Ipv4Addr,
    pub max_message_size: u16,
    pub lease_time: u32,
    pub renewal_time: u32,
    pub rebinding_time: u32,
    /// Seconds an offered address stays reserved without a REQUEST.
    pub offer_timeout: u32,
    /// Seconds between expiry sweeps.
    pub sweep_interval: u32,
    /// Extra values keyed by an option's config key, e.g. `"ntp"`.
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            range: (
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 200),
            ),
            force_options: Vec::new(),
            random_ip: false,
            static_bindings: BTreeMap::new(),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            router: vec![Ipv4Addr::new(192, 168, 1, 1)],
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            hostname: None,
            domain_name: None,
            broadcast: None,
            server: Ipv4Addr::new(192, 168, 1, 1),
            max_message_size: 1500,
            lease_time: 86400,
            renewal_time: 3600,
            rebinding_time: 14400,
            offer_timeout: 60,
            sweep_interval: 60,
            options: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServerConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ServerConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.range;
        if u32::from(low) > u32::from(high) {
            return Err(Error::InvalidConfig(format!(
                "range start {} is above range end {}",
                low, high
            )));
        }

        if self.in_range(self.server) {
            return Err(Error::InvalidConfig(
                "server address must not be within the range".to_string(),
            ));
        }

        let mut seen: HashMap<Ipv4Addr, MacAddr> = HashMap::new();
        for (mac, ip) in &self.static_bindings {
            if let Some(other) = seen.insert(*ip, *mac) {
                return Err(Error::InvalidConfig(format!(
                    "static address {} is bound to both {} and {}",
                    ip, other, mac
                )));
            }
        }

        if self.lease_time == 0 {
            return Err(Error::InvalidConfig(
                "leaseTime must be greater than 0".to_string(),
            ));
        }

        if self.renewal_time > self.rebinding_time || self.rebinding_time > self.lease_time {
            return Err(Error::InvalidConfig(format!(
                "expected renewalTime ({}) <= rebindingTime ({}) <= leaseTime ({})",
                self.renewal_time, self.rebinding_time, self.lease_time
            )));
        }

        if self.offer_timeout == 0 || self.sweep_interval == 0 {
            return Err(Error::InvalidConfig(
                "offerTimeout and sweepInterval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range.0) && addr <= u32::from(self.range.1)
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.range.1)
            .saturating_sub(u32::from(self.range.0))
            .saturating_add(1)
    }

    /// Converts the configuration into typed option values.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when a value's type disagrees with the table
    /// entry for its key, an `options` key has no table entry, or a
    /// `forceOptions` name is unknown.
    pub fn option_values(&self, registry: &OptionRegistry) -> Result<ConfigValues> {
        let mut values = HashMap::new();

        let mut fixed: Vec<(&str, OptionValue)> = vec![
            ("server", OptionValue::Ip(self.server)),
            ("maxMessageSize", OptionValue::UInt16(self.max_message_size)),
            ("leaseTime", OptionValue::UInt32(self.lease_time)),
            ("renewalTime", OptionValue::UInt32(self.renewal_time)),
            ("rebindingTime", OptionValue::UInt32(self.rebinding_time)),
        ];
        if let Some(netmask) = self.netmask {
            fixed.push(("netmask", OptionValue::Ip(netmask)));
        }
        if !self.router.is_empty() {
            fixed.push(("router", OptionValue::Ips(self.router.clone())));
        }
        if !self.dns.is_empty() {
            fixed.push(("dns", OptionValue::Ips(self.dns.clone())));
        }
        if let Some(hostname) = &self.hostname {
            fixed.push(("hostname", OptionValue::ascii(hostname)));
        }
        if let Some(domain) = &self.domain_name {
            fixed.push(("domainName", OptionValue::ascii(domain)));
        }
        if let Some(broadcast) = self.broadcast {
            fixed.push(("broadcast", OptionValue::Ip(broadcast)));
        }

        for (key, value) in fixed {
            if let Some(spec) = registry.by_config_key(key)
                && spec.value_type != value.value_type()
            {
                return Err(Error::InvalidConfig(format!(
                    "'{}' is {} but option {} ({}) expects {}",
                    key,
                    value.value_type(),
                    spec.code,
                    spec.name,
                    spec.value_type
                )));
            }
            values.insert(key.to_string(), value);
        }

        for (key, json) in &self.options {
            let spec = registry.by_config_key(key).ok_or_else(|| {
                Error::InvalidConfig(format!("no option uses config key '{}'", key))
            })?;

            if values.contains_key(key) {
                return Err(Error::InvalidConfig(format!(
                    "'{}' is configured twice",
                    key
                )));
            }

            let value = OptionValue::from_json(spec.value_type, json).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "'{}' = {} does not fit option {} ({}) of type {}",
                    key, json, spec.code, spec.name, spec.value_type
                ))
            })?;
            values.insert(key.clone(), value);
        }

        let mut forced = Vec::with_capacity(self.force_options.len());
        for name in &self.force_options {
            let spec = registry.find(name).ok_or_else(|| {
                Error::InvalidConfig(format!("unknown option '{}' in forceOptions", name))
            })?;
            forced.push(spec.code);
        }

        Ok(ConfigValues { values, forced })
    }
}

/// Validated, typed configuration values keyed by config key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigValues {
    values: HashMap<String, OptionValue>,
    forced: Vec<u8>,
}

impl ConfigValues {
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    /// Codes listed in `forceOptions`.
    pub fn forced(&self) -> &[u8] {
        &self.forced
    }
}

impl ConfigLookup for ConfigValues {
    fn lookup(&self, key: &str) -> Option<OptionValue> {
        self.values.get(key).cloned()
    }
}

/// Upper bound on `maxRetransmitSecs`.
pub const MAX_RETRANSMIT_SECS: u64 = 3600;

/// Settings for one client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub mac: MacAddr,
    pub hostname: Option<String>,
    /// Sent verbatim as option 61 when set.
    pub client_id: Option<String>,
    /// Parameter request list (option 55).
    pub requested_options: Vec<u8>,
    pub initial_retransmit_secs: u64,
    pub max_retransmit_secs: u64,
    /// REQUEST transmissions in REQUESTING before falling back to INIT.
    pub max_request_attempts: u32,
    pub release_on_close: bool,
    pub max_message_size: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            hostname: None,
            client_id: None,
            requested_options: vec![1, 3, 6, 15, 28, 51, 58, 59],
            initial_retransmit_secs: 4,
            max_retransmit_secs: 64,
            max_request_attempts: 4,
            release_on_close: false,
            max_message_size: 1500,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_retransmit_secs == 0
            || self.initial_retransmit_secs > self.max_retransmit_secs
        {
            return Err(Error::InvalidConfig(format!(
                "expected 0 < initialRetransmitSecs ({}) <= maxRetransmitSecs ({})",
                self.initial_retransmit_secs, self.max_retransmit_secs
            )));
        }

        if self.max_retransmit_secs > MAX_RETRANSMIT_SECS {
            return Err(Error::InvalidConfig(format!(
                "maxRetransmitSecs {} exceeds {}",
                self.max_retransmit_secs, MAX_RETRANSMIT_SECS
            )));
        }

        if self.max_request_attempts == 0 {
            return Err(Error::InvalidConfig(
                "maxRequestAttempts must be greater than 0".to_string(),
            ));
        }

        // RFC 2132 §9.10: the minimum legal value is 576.
        if self.max_message_size < 576 {
            return Err(Error::InvalidConfig(format!(
                "maxMessageSize {} is below 576",
                self.max_message_size
            )));
        }

        Ok(())
    }
}
