//! dnsveil: a covert tunnel client over recursive DNS resolvers.
//!
//! A local application connects to a loopback TCP endpoint; its bytes
//! are carried inside TXT record exchanges with an ordinary recursive
//! resolver, which forwards them through the DNS hierarchy to the
//! authoritative server terminating the tunnel. The channel only allows
//! short base32-constrained queries out, only returns data inside TXT
//! answers, cannot push, and is lossy and rate-limited; everything here
//! exists to make a reliable, multiplexed byte-stream out of that.
//!
//! ## Layering
//!
//! ```text
//! application bytes
//!     ↓ mux         (streams over one channel, smux-v2 semantics)
//!     ↓ noise       (Noise NK, server authenticated by pinned key)
//!     ↓ reliable    (KCP ARQ: ordering, retransmission, windows)
//!     ↓ packet_conn (send/receive workers, adaptive polling)
//!     ↓ framing     (packets ↔ QNAME labels / TXT records)
//!     ↓ dns         (wire format)
//!     ↓ UDP to the resolver
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dnsveil::TunnelClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dnsveil::Error> {
//!     let client = TunnelClient::new(
//!         "192.0.2.53",
//!         "t.example.com",
//!         &"ab".repeat(32),
//!         "127.0.0.1:1080",
//!     )?;
//!     client.start().await?;
//!     let stream = client.dial_tunnel("example.com:443")?;
//!     // read/write the stream, then:
//!     drop(stream);
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod dns;
pub mod ffi;
pub mod framing;
pub mod mux;
pub mod noise;
pub mod packet_conn;
pub mod reliable;

pub use client::{local_lan_addresses, ClientConfig, ProtectSocketFn, TunnelClient};
pub use framing::ClientId;
pub use mux::{MuxConfig, Session, Stream};
pub use noise::{decode_key, generate_keypair, NoiseChannel};
pub use packet_conn::DnsPacketConn;
pub use reliable::KcpConn;

use thiserror::Error as ThisError;

/// dnsveil error types. Errors surface at construction, at start, and
/// at `dial_tunnel`; worker loops log and carry on or die quietly.
#[derive(ThisError, Debug)]
pub enum Error {
    /// The server public key is not a 64-character hex string.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// Bad domain or malformed DNS data.
    #[error("invalid domain: {0}")]
    Dns(#[from] dns::DnsError),

    /// The tunnel domain is too long to leave room for payload.
    #[error("domain {domain} leaves only {mtu} bytes for payload")]
    MtuTooSmall { domain: String, mtu: isize },

    /// Resolution, socket, hook, or listener failure during start.
    #[error("{0}")]
    Start(String),

    /// The Noise handshake failed cryptographically.
    #[error("{0}")]
    Handshake(String),

    /// The Noise handshake did not complete in time.
    #[error("connection timeout: DNS server not responding")]
    HandshakeTimeout,

    /// Noise protocol failure after the handshake.
    #[error("noise: {0}")]
    Noise(#[from] snow::Error),

    /// The reliable-datagram layer failed to establish.
    #[error("reliable transport: {0}")]
    Protocol(String),

    /// An outbound packet exceeded what one query can carry.
    #[error("packet too long: {0} bytes")]
    PacketTooLong(usize),

    /// `dial_tunnel` without a running session.
    #[error("tunnel not connected")]
    NotConnected,

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
