//! Error types for the DHCP engine.
//!
//! Wire-level failures are reported as [`DecodeError`] so the transport can
//! drop a datagram without touching protocol state. Everything else goes
//! through [`Error`] and the crate-wide [`Result<T>`].

use std::net::Ipv4Addr;

/// Reasons a datagram could not be decoded into a [`DhcpPacket`](crate::DhcpPacket).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Shorter than the fixed header plus magic cookie.
    #[error("packet too short: {0} bytes (minimum 240)")]
    TooShort(usize),

    #[error("invalid magic cookie")]
    BadMagicCookie,

    /// Relay loop protection (RFC 2131 §4.1).
    #[error("hop count {0} exceeds maximum 16")]
    TooManyHops(u8),

    #[error("invalid hlen {0} for Ethernet (expected 6)")]
    BadHardwareLength(u8),

    /// An option's code/length/value triple runs past the end of the buffer.
    #[error("option {0} truncated")]
    Truncated(u8),

    /// A typed option carries a byte count its value type cannot hold.
    #[error("option {code} has invalid length {len}")]
    BadLength { code: u8, len: usize },

    /// Option 53 holds a value outside 1..=8.
    #[error("unknown message type {0}")]
    BadMessageType(u8),
}

/// Errors that can occur while running the server or client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP datagram.
    #[error("Invalid DHCP packet: {0}")]
    Decode(#[from] DecodeError),

    /// Every address in the range is leased, offered, static or quarantined.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// A REQUEST does not match any outstanding offer or lease for the client.
    ///
    /// The server answers this with a NAK.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Invalid configuration, including option values whose shape does not
    /// match the option table.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation was invoked from a protocol state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67/68 without administrator
    /// privileges.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Lease bookkeeping would become inconsistent, e.g. two clients mapped to
    /// the same address. This is a bug, never a client error.
    #[error("Internal lease fault: {0}")]
    InternalFault(String),

    /// Address given to an administrative operation is not managed by the pool.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
