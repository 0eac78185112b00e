//! Client facade: lifecycle and wiring of the full tunnel stack.
//!
//! `Start` assembles, in order: tunnel suffix and MTU validation, DNS
//! resolver resolution, the UDP socket (IPv4 only; dual-stack routing on
//! captive networks has burned this code path before), the packet conn,
//! KCP, the Noise handshake under a hard deadline, the multiplexer, and
//! finally the local TCP listener whose connections are piped into
//! tunnel streams. Each failure unwinds in reverse construction order.

use crate::dns::Name;
use crate::framing;
use crate::mux::{MuxConfig, Session, Stream};
use crate::noise::{self, NoiseChannel};
use crate::packet_conn::DnsPacketConn;
use crate::reliable::KcpConn;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// The Noise handshake must complete within this window or Start fails.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest workable payload capacity; a longer tunnel domain is a
/// configuration mistake.
pub const MIN_MTU: isize = 80;

const DEFAULT_DNS_PORT: u16 = 53;

/// Callback protecting the UDP socket from being routed back through a
/// VPN tunnel. Returning false vetoes startup. Never invoked on
/// platforms without raw file descriptors.
pub type ProtectSocketFn = Box<dyn Fn(i32) -> bool + Send + Sync>;

/// Startup configuration for a [`TunnelClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Recursive resolver, `host` or `host:port`; port defaults to 53.
    pub dns_server: String,
    /// The authoritative zone terminating the tunnel.
    pub tunnel_domain: String,
    /// Server X25519 public key, 64 hex characters.
    pub server_pubkey: String,
    /// Local TCP listen address handed to the application.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Rewrite a loopback listen address to 0.0.0.0 so other devices on
    /// the LAN can use the proxy.
    #[serde(default)]
    pub share_proxy: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:1080".to_string()
}

struct Running {
    session: Arc<Session>,
    packet_conn: Arc<DnsPacketConn>,
    accept_task: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
}

/// The tunnel client. One instance owns one UDP socket, one packet
/// conn, one KCP conversation, one Noise session, and one multiplexer,
/// exactly while running.
pub struct TunnelClient {
    pubkey: [u8; noise::KEY_LEN],
    domain: String,
    dns_addr: String,
    listen_addr: String,
    share_proxy: AtomicBool,
    tun_fd: AtomicI32,
    protect_socket: Mutex<Option<ProtectSocketFn>>,
    state: Mutex<Option<Running>>,
    // Serializes start/stop without holding `state` across I/O.
    lifecycle: tokio::sync::Mutex<()>,
}

impl TunnelClient {
    /// Validate the key and record the configuration. Domain and
    /// addresses are checked at start, matching where failures can
    /// actually be observed.
    pub fn new(
        dns_server: &str,
        tunnel_domain: &str,
        pubkey_hex: &str,
        listen_addr: &str,
    ) -> Result<Self> {
        let pubkey = noise::decode_key(pubkey_hex)?;
        Ok(TunnelClient {
            pubkey,
            domain: tunnel_domain.to_string(),
            dns_addr: dns_server.to_string(),
            listen_addr: listen_addr.to_string(),
            share_proxy: AtomicBool::new(false),
            tun_fd: AtomicI32::new(-1),
            protect_socket: Mutex::new(None),
            state: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let client = Self::new(
            &config.dns_server,
            &config.tunnel_domain,
            &config.server_pubkey,
            &config.listen_addr,
        )?;
        client.set_share_proxy(config.share_proxy);
        Ok(client)
    }

    /// Register a TUN file descriptor. Diagnostic only; no packets are
    /// routed through it.
    pub fn set_tun_fd(&self, fd: i32) {
        self.tun_fd.store(fd, Ordering::SeqCst);
        log::info!("TUN fd {} registered", fd);
    }

    pub fn set_protect_socket(&self, hook: ProtectSocketFn) {
        *self.protect_socket.lock().unwrap() = Some(hook);
    }

    pub fn set_share_proxy(&self, enabled: bool) {
        self.share_proxy.store(enabled, Ordering::SeqCst);
    }

    pub fn is_share_proxy_enabled(&self) -> bool {
        self.share_proxy.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// The actually bound listen address, once running.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().and_then(|r| r.local_addr)
    }

    /// Bring the tunnel up. A no-op returning success when already
    /// running.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let suffix = Name::parse(&self.domain)?;
        let mtu = framing::effective_mtu(&suffix);
        if mtu < MIN_MTU {
            return Err(Error::MtuTooSmall {
                domain: suffix.to_string(),
                mtu,
            });
        }
        log::info!("effective MTU {}", mtu);

        let resolver = resolve_dns_addr(&self.dns_addr).await?;

        // IPv4 wildcard, ephemeral port.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| Error::Start(format!("failed to bind UDP socket: {}", e)))?;

        if let Some(hook) = self.protect_socket.lock().unwrap().as_ref() {
            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                let fd = socket.as_raw_fd();
                if !hook(fd) {
                    return Err(Error::Start(format!(
                        "protect-socket hook rejected fd {}",
                        fd
                    )));
                }
                log::info!("UDP socket protected from VPN routing (fd={})", fd);
            }
            #[cfg(not(unix))]
            let _ = hook;
        }

        let packet_conn = DnsPacketConn::new(socket, resolver, suffix);

        let kcp = match KcpConn::new(packet_conn.clone(), mtu as usize) {
            Ok(kcp) => kcp,
            Err(e) => {
                packet_conn.close();
                return Err(e);
            }
        };

        let channel =
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, NoiseChannel::client(kcp, &self.pubkey))
                .await
            {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    packet_conn.close();
                    return Err(Error::Handshake(format!(
                        "failed to establish noise session: {}",
                        e
                    )));
                }
                Err(_) => {
                    packet_conn.close();
                    return Err(Error::HandshakeTimeout);
                }
            };

        let session = Arc::new(Session::client(channel, MuxConfig::default()));

        let mut listen_addr = self.listen_addr.clone();
        if self.is_share_proxy_enabled() {
            let rewritten = rewrite_listen_addr(&listen_addr);
            if rewritten != listen_addr {
                log::info!("proxy sharing enabled, listening on {}", rewritten);
                listen_addr = rewritten;
            }
        }

        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close();
                packet_conn.close();
                return Err(Error::Start(format!(
                    "failed to listen on {}: {}",
                    listen_addr, e
                )));
            }
        };
        let local_addr = listener.local_addr().ok();
        let accept_task = tokio::spawn(accept_loop(listener, session.clone()));

        *self.state.lock().unwrap() = Some(Running {
            session,
            packet_conn,
            accept_task,
            local_addr,
        });
        log::info!("tunnel client started, listening on {}", listen_addr);
        Ok(())
    }

    /// Tear the tunnel down. Safe to call repeatedly and concurrently
    /// with `start`.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.shutdown();
    }

    fn shutdown(&self) {
        let Some(running) = self.state.lock().unwrap().take() else {
            return;
        };
        running.session.close();
        running.packet_conn.close();
        running.accept_task.abort();
        log::info!("tunnel client stopped");
    }

    /// Open a new stream through the tunnel. The terminating server
    /// decides where bytes go; `addr` is recorded for diagnostics.
    pub fn dial_tunnel(&self, addr: &str) -> Result<Stream> {
        let session = self
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.session.clone())
            .ok_or(Error::NotConnected)?;
        log::debug!("dialing {} through the tunnel", addr);
        session.open_stream()
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve the resolver address, defaulting the port to 53.
async fn resolve_dns_addr(addr: &str) -> Result<SocketAddr> {
    let target = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_DNS_PORT)
    };
    let addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| Error::Start(format!("failed to resolve DNS server {}: {}", addr, e)))?;
    let result = addrs
        .into_iter()
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::Start(format!("no IPv4 address for DNS server {}", addr)));
    result
}

/// The share-proxy rewrite: only a loopback listen address is touched.
fn rewrite_listen_addr(listen: &str) -> String {
    match listen.strip_prefix("127.0.0.1:") {
        Some(port) => format!("0.0.0.0:{}", port),
        None => listen.to_string(),
    }
}

/// Comma-joined private IPv4 addresses of this host's interfaces
/// (10/8, 172.16/12, 192.168/16), for showing users where a shared
/// proxy is reachable. Loopback, IPv6, and public addresses are
/// skipped. Empty when nothing qualifies.
pub fn local_lan_addresses() -> String {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return String::new();
    };
    let mut ips = Vec::new();
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        let IpAddr::V4(ip) = interface.ip() else {
            continue;
        };
        if ip.is_private() {
            ips.push(ip.to_string());
        }
    }
    ips.join(",")
}

/// The listener keeps accepting even after session failure; connections
/// then see an immediate EOF because `open_stream` fails. A supervisor
/// can observe the failure without the process falling over.
async fn accept_loop(listener: TcpListener, session: Arc<Session>) {
    loop {
        let (local, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        log::debug!("accepted connection from {}", peer);
        tokio::spawn(handle_connection(local, session.clone()));
    }
}

async fn handle_connection(local: TcpStream, session: Arc<Session>) {
    let stream = match session.open_stream() {
        Ok(stream) => stream,
        Err(e) => {
            log::debug!("failed to open stream: {}", e);
            return;
        }
    };
    log::debug!("new stream {} opened", stream.id());

    let (mut local_read, mut local_write) = local.into_split();
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    let up = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut local_read, &mut stream_write).await;
        let _ = stream_write.shutdown().await;
    });
    let down = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stream_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
    });
    let _ = up.await;
    let _ = down.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey_hex() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            TunnelClient::new("192.0.2.1", "t.example", "not-hex", "127.0.0.1:0"),
            Err(Error::InvalidKey(_))
        ));
        assert!(TunnelClient::new("192.0.2.1", "t.example", &pubkey_hex(), "127.0.0.1:0").is_ok());
    }

    #[tokio::test]
    async fn test_mtu_rejection_before_any_socket() {
        let domain = format!(
            "{}.{}.{}.example",
            "a".repeat(60),
            "b".repeat(60),
            "c".repeat(60)
        );
        let client = TunnelClient::new("192.0.2.1", &domain, &pubkey_hex(), "127.0.0.1:0").unwrap();
        let err = client.start().await.unwrap_err();
        match err {
            Error::MtuTooSmall { mtu, .. } => assert!(mtu < MIN_MTU),
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("leaves only"));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_bad_domain_rejected() {
        let domain = format!("{}.example", "x".repeat(64));
        let client = TunnelClient::new("192.0.2.1", &domain, &pubkey_hex(), "127.0.0.1:0").unwrap();
        assert!(matches!(client.start().await, Err(Error::Dns(_))));
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let client =
            TunnelClient::new("192.0.2.1", "t.example", &pubkey_hex(), "127.0.0.1:0").unwrap();
        client.stop().await;
        client.stop().await;
        assert!(!client.is_running());
    }

    #[test]
    fn test_dial_before_start() {
        let client =
            TunnelClient::new("192.0.2.1", "t.example", &pubkey_hex(), "127.0.0.1:0").unwrap();
        assert!(matches!(
            client.dial_tunnel("example.com:80"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_rewrite_listen_addr() {
        assert_eq!(rewrite_listen_addr("127.0.0.1:9999"), "0.0.0.0:9999");
        assert_eq!(rewrite_listen_addr("0.0.0.0:9999"), "0.0.0.0:9999");
        assert_eq!(rewrite_listen_addr("127.0.0.2:9999"), "127.0.0.2:9999");
        assert_eq!(rewrite_listen_addr("localhost:9999"), "localhost:9999");
    }

    #[test]
    fn test_local_lan_addresses_shape() {
        // Contents depend on the host; every entry must be a private
        // IPv4 address and the list comma-joined with no blanks.
        let list = local_lan_addresses();
        for entry in list.split(',').filter(|e| !e.is_empty()) {
            let ip: Ipv4Addr = entry.parse().unwrap();
            assert!(ip.is_private(), "{} is not private", ip);
        }
        assert!(!list.contains(",,"));
    }

    #[test]
    fn test_config_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "dns_server": "1.1.1.1",
                "tunnel_domain": "t.example",
                "server_pubkey": "aabb"
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:1080");
        assert!(!config.share_proxy);
    }
}
