//! # leasewire
//!
//! A DHCPv4 engine implementing RFC 2131 (DHCP) and RFC 2132 (DHCP Options):
//! a server and a client, both written as sans-IO state machines, plus thin
//! Tokio drivers that put them on a UDP socket.
//!
//! ## Features
//!
//! - Full server exchange: DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE, INFORM
//! - Client with SELECTING, REQUESTING, RENEWING and REBINDING, T1/T2 timers and backoff
//! - Table-driven options: a pluggable [`OptionRegistry`] decides wire types,
//!   config keys, defaults and the order options appear in replies
//! - Static MAC-to-IP bindings, sequential or random allocation
//! - Relay agent support (Option 82, `giaddr`)
//! - Reply size fitting to the client's maximum message size
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasewire::{DhcpServer, OptionCodec, ServerConfig, ServerService};
//!
//! #[tokio::main]
//! async fn main() -> leasewire::Result<()> {
//!     let config = ServerConfig::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config, OptionCodec::standard())?;
//!     let service = ServerService::bind(server)?;
//!     service
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`OptionCodec`] - Registry-driven option typing and reply option selection
//! - [`DhcpPacket`] - DHCP packet parsing and encoding
//! - [`LeasePool`] - Address ownership and the lease lifecycle
//! - [`DhcpServer`] - Server protocol: request in, reply out
//! - [`DhcpClient`] - Client protocol: datagrams and timeouts in, actions out
//! - [`ServerService`] / [`ClientService`] - UDP drivers

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;
pub mod transport;

pub use client::{Backoff, ClientAction, ClientLease, ClientState, DhcpClient};
pub use codec::OptionCodec;
pub use config::{ClientConfig, ConfigValues, ServerConfig};
pub use error::{DecodeError, Error, Result};
pub use lease::{Lease, LeasePool, LeaseState};
pub use options::{
    ConfigLookup, DefaultValue, MessageType, OptionCode, OptionRegistry, OptionSpec, OptionValue,
    RegistryBuilder, ValueType,
};
pub use packet::{DhcpPacket, MacAddr, Transmit};
pub use server::{BootFileFn, DhcpServer, Response};
pub use transport::{ClientService, ServerService, create_socket};
