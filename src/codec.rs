//! Registry-driven option encoding and decoding.
//!
//! [`DhcpPacket`] knows the wire framing; [`OptionCodec`] knows what the
//! bytes mean. Decoding types every option through the [`OptionRegistry`],
//! and [`OptionCodec::select_options`] decides which options a response
//! carries and where their values come from.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::error::DecodeError;
use crate::options::{ConfigLookup, OptionCode, OptionRegistry, OptionValue};
use crate::packet::DhcpPacket;

/// Encoder/decoder bound to one option table.
#[derive(Debug, Clone)]
pub struct OptionCodec {
    registry: Arc<OptionRegistry>,
}

impl OptionCodec {
    pub fn new(registry: Arc<OptionRegistry>) -> Self {
        Self { registry }
    }

    /// Codec over [`OptionRegistry::standard`].
    pub fn standard() -> Self {
        Self::new(Arc::new(OptionRegistry::standard()))
    }

    pub fn registry(&self) -> &OptionRegistry {
        &self.registry
    }

    /// Decodes a datagram and types its options.
    ///
    /// Codes missing from the registry are kept as
    /// [`OptionValue::Bytes`](crate::OptionValue::Bytes).
    ///
    /// # Errors
    ///
    /// Any framing error from [`DhcpPacket::parse`], a
    /// [`DecodeError::BadLength`] for a payload that doesn't fit its declared
    /// type, or [`DecodeError::BadMessageType`] when option 53 is outside 1..=8.
    pub fn decode(&self, bytes: &[u8]) -> Result<DhcpPacket, DecodeError> {
        let mut packet = DhcpPacket::parse(bytes)?;

        for option in &packet.options {
            let value = self.registry.decode_value(option.code, &option.data)?;

            if option.code == OptionCode::MessageType as u8
                && let Some(raw) = value.as_u8()
                && !(1..=8).contains(&raw)
            {
                return Err(DecodeError::BadMessageType(raw));
            }

            packet.values.insert(option.code, value);
        }

        Ok(packet)
    }

    /// Encodes a packet; payloads over 255 bytes are split across repeated
    /// option headers and the result is padded to 300 bytes.
    pub fn encode(&self, packet: &DhcpPacket) -> Vec<u8> {
        packet.encode()
    }

    /// Chooses the options a response carries, in registry order.
    ///
    /// An entry is emitted when its code is in `always`, in `forced`, or in
    /// the client's parameter request list, and it resolves to a value
    /// (configured, else its default). Entries with no value, or whose value
    /// is empty, are silently omitted. A derived default that yields the
    /// wrong type is dropped with a warning.
    pub fn select_options(
        &self,
        requested: Option<&[u8]>,
        forced: &[u8],
        always: &[u8],
        config: &dyn ConfigLookup,
    ) -> Vec<(u8, OptionValue)> {
        let wanted: HashSet<u8> = always
            .iter()
            .chain(forced)
            .chain(requested.unwrap_or_default())
            .copied()
            .collect();

        let mut selected = Vec::new();

        for spec in self.registry.iter() {
            if !wanted.contains(&spec.code) {
                continue;
            }

            let Some(value) = spec.resolve(config) else {
                continue;
            };

            if value.value_type() != spec.value_type {
                warn!(
                    "Option {} ({}) resolved to {} but is declared {}, skipping",
                    spec.code,
                    spec.name,
                    value.value_type(),
                    spec.value_type
                );
                continue;
            }

            if is_empty(&value) {
                continue;
            }

            selected.push((spec.code, value));
        }

        selected
    }
}

fn is_empty(value: &OptionValue) -> bool {
    match value {
        OptionValue::Ascii(text) => text.is_empty(),
        OptionValue::Ips(addrs) => addrs.is_empty(),
        OptionValue::Bytes(bytes) => bytes.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DefaultValue, MessageType, OptionSpec, RegistryBuilder, ValueType};
    use crate::packet::MacAddr;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn discover() -> DhcpPacket {
        DhcpPacket::request(MessageType::Discover, 42, MacAddr([2, 0, 0, 0, 0, 1]))
    }

    #[test]
    fn test_decode_types_options() {
        let codec = OptionCodec::standard();
        let mut packet = discover();
        packet.set_raw_option(51, 3600u32.to_be_bytes().to_vec());
        packet.set_raw_option(6, vec![8, 8, 8, 8, 1, 1, 1, 1]);
        packet.set_raw_option(224, vec![9, 9]);

        let decoded = codec.decode(&codec.encode(&packet)).unwrap();
        assert_eq!(decoded.value(53), Some(&OptionValue::UInt8(1)));
        assert_eq!(decoded.value(51), Some(&OptionValue::UInt32(3600)));
        assert_eq!(
            decoded.value(6),
            Some(&OptionValue::Ips(vec![
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(1, 1, 1, 1)
            ]))
        );
        assert_eq!(decoded.value(224), Some(&OptionValue::Bytes(vec![9, 9])));
    }

    #[test]
    fn test_ascii_bytes_survive_round_trip() {
        let codec = OptionCodec::standard();
        let raw = vec![0xff, 0x41, 0xe9];
        let mut packet = discover();
        packet.set_raw_option(12, raw.clone());

        let decoded = codec.decode(&codec.encode(&packet)).unwrap();
        let value = decoded.value(12).unwrap();
        assert_eq!(value, &OptionValue::Ascii(raw.clone()));
        assert_eq!(value.to_bytes(), raw);
        assert_eq!(value.as_text().as_deref(), Some("\u{fffd}A\u{fffd}"));

        let mut reply = discover();
        reply.set_option(12, value.clone());
        let again = codec.decode(&codec.encode(&reply)).unwrap();
        assert_eq!(again.option(12), Some(raw.as_slice()));
    }

    #[test]
    fn test_decode_rejects_bad_message_type() {
        let codec = OptionCodec::standard();
        let mut packet = discover();
        packet.set_raw_option(53, vec![9]);
        assert_eq!(
            codec.decode(&packet.encode()),
            Err(DecodeError::BadMessageType(9))
        );
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let codec = OptionCodec::standard();
        let mut packet = discover();
        packet.set_raw_option(51, vec![0, 0, 1]);
        assert_eq!(
            codec.decode(&packet.encode()),
            Err(DecodeError::BadLength { code: 51, len: 3 })
        );
    }

    #[test]
    fn test_select_follows_registry_order() {
        let codec = OptionCodec::standard();
        let mut config = HashMap::new();
        config.insert("dns".to_string(), OptionValue::Ips(vec![Ipv4Addr::new(8, 8, 8, 8)]));
        config.insert("router".to_string(), OptionValue::Ips(vec![Ipv4Addr::new(10, 0, 0, 1)]));
        config.insert("netmask".to_string(), OptionValue::Ip(Ipv4Addr::new(255, 0, 0, 0)));

        let selected = codec.select_options(Some(&[6, 3, 1]), &[], &[], &config);
        let codes: Vec<u8> = selected.iter().map(|(code, _)| *code).collect();
        assert_eq!(codes, vec![1, 3, 6]);
    }

    #[test]
    fn test_requested_without_value_is_omitted() {
        let codec = OptionCodec::standard();
        let config: HashMap<String, OptionValue> = HashMap::new();

        let selected = codec.select_options(Some(&[15, 42, 51]), &[], &[], &config);
        assert_eq!(selected, vec![(51, OptionValue::UInt32(86400))]);
    }

    #[test]
    fn test_forced_emitted_without_request() {
        let codec = OptionCodec::standard();
        let mut config = HashMap::new();
        config.insert(
            "domainName".to_string(),
            OptionValue::ascii("lan"),
        );

        assert!(codec.select_options(None, &[], &[], &config).is_empty());
        assert_eq!(
            codec.select_options(None, &[15], &[], &config),
            vec![(15, OptionValue::ascii("lan"))]
        );
    }

    #[test]
    fn test_derived_default_of_wrong_type_is_dropped() {
        let registry = RegistryBuilder::default()
            .add(
                OptionSpec::new(150, "odd", ValueType::Ip)
                    .default_value(DefaultValue::derived(|_| Some(OptionValue::UInt8(1)))),
            )
            .unwrap()
            .build();
        let codec = OptionCodec::new(Arc::new(registry));
        let config: HashMap<String, OptionValue> = HashMap::new();

        assert!(codec.select_options(None, &[150], &[], &config).is_empty());
    }

    #[test]
    fn test_empty_list_is_omitted() {
        let codec = OptionCodec::standard();
        let mut config = HashMap::new();
        config.insert("dns".to_string(), OptionValue::Ips(Vec::new()));
        assert!(codec.select_options(Some(&[6]), &[], &[], &config).is_empty());
    }
}
