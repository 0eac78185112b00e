//! End-to-end tests against an in-process stand-in for the
//! authoritative server: a UDP responder that answers TXT queries,
//! terminates the KCP + Noise + mux stack, and echoes stream data.

use bytes::{Buf, BytesMut};
use dnsveil::dns::{self, Message, Name, ResourceRecord};
use dnsveil::framing::{self, ClientId};
use dnsveil::mux::{Command, Frame};
use dnsveil::noise::NOISE_PROTOCOL;
use dnsveil::{Error, TunnelClient};
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

const SUFFIX: &str = "t.example";

/// Query log: arrival time and whether the query was a pure poll.
#[derive(Default)]
struct QueryLog {
    queries: Mutex<Vec<(Instant, bool)>>,
}

impl QueryLog {
    fn record(&self, is_poll: bool) {
        self.queries.lock().unwrap().push((Instant::now(), is_poll));
    }

    fn polls_since(&self, t: Instant) -> Vec<Instant> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(at, is_poll)| *is_poll && *at >= t)
            .map(|(at, _)| *at)
            .collect()
    }
}

/// Collects KCP's outbound segments so they can be packed into the next
/// TXT response.
#[derive(Clone)]
struct SegmentQueue(Arc<Mutex<VecDeque<Vec<u8>>>>);

impl Write for SegmentQueue {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum NoiseState {
    Handshake(snow::HandshakeState),
    Transport(snow::TransportState),
    Failed,
}

/// Server-side state for one tunnel client.
struct ServerConn {
    kcp: kcp::Kcp<SegmentQueue>,
    epoch: Instant,
    segments: SegmentQueue,
    noise: NoiseState,
    framed: BytesMut,
    stream_buf: BytesMut,
}

impl ServerConn {
    fn new(conv: u32, mtu: usize, private_key: &[u8]) -> Self {
        let segments = SegmentQueue(Arc::new(Mutex::new(VecDeque::new())));
        let mut kcp = kcp::Kcp::new_stream(conv, segments.clone());
        kcp.set_nodelay(false, 0, 0, true);
        kcp.set_wndsize(128, 128);
        kcp.set_mtu(mtu).unwrap();
        let handshake = snow::Builder::new(NOISE_PROTOCOL.parse().unwrap())
            .local_private_key(private_key)
            .build_responder()
            .unwrap();
        ServerConn {
            kcp,
            epoch: Instant::now(),
            segments,
            noise: NoiseState::Handshake(handshake),
            framed: BytesMut::new(),
            stream_buf: BytesMut::new(),
        }
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Feed one upstream packet and run the whole server pipeline.
    fn process(&mut self, payload: &[u8]) {
        if !payload.is_empty() {
            let _ = self.kcp.input(payload);
        }
        let _ = self.kcp.update(self.now_ms());
        let _ = self.kcp.flush();

        loop {
            let size = match self.kcp.peeksize() {
                Ok(size) if size > 0 => size,
                _ => break,
            };
            let mut buf = vec![0u8; size];
            match self.kcp.recv(&mut buf) {
                Ok(n) => self.framed.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }

        while self.framed.len() >= 2 {
            let len = u16::from_be_bytes([self.framed[0], self.framed[1]]) as usize;
            if self.framed.len() < 2 + len {
                break;
            }
            self.framed.advance(2);
            let ciphertext = self.framed.split_to(len);
            self.handle_noise_msg(&ciphertext);
        }

        let _ = self.kcp.flush();
    }

    fn send_framed(&mut self, data: &[u8]) {
        let mut framed = Vec::with_capacity(2 + data.len());
        framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
        framed.extend_from_slice(data);
        let _ = self.kcp.send(&framed);
    }

    fn handle_noise_msg(&mut self, ciphertext: &[u8]) {
        let mut buf = vec![0u8; 65535];
        self.noise = match std::mem::replace(&mut self.noise, NoiseState::Failed) {
            NoiseState::Handshake(mut handshake) => {
                if handshake.read_message(ciphertext, &mut buf).is_err() {
                    NoiseState::Failed
                } else {
                    let len = handshake.write_message(&[], &mut buf).unwrap();
                    let reply = buf[..len].to_vec();
                    self.send_framed(&reply);
                    assert!(handshake.is_handshake_finished());
                    NoiseState::Transport(handshake.into_transport_mode().unwrap())
                }
            }
            NoiseState::Transport(mut transport) => {
                if let Ok(len) = transport.read_message(ciphertext, &mut buf) {
                    self.stream_buf.extend_from_slice(&buf[..len]);
                    let mut replies = Vec::new();
                    while let Ok(Some(frame)) = Frame::decode(&mut self.stream_buf) {
                        match frame.cmd {
                            Command::Psh => {
                                // echo the data, then hand the credit back
                                replies.push(Frame::psh(frame.stream_id, frame.payload.clone()));
                                replies
                                    .push(Frame::upd(frame.stream_id, frame.payload.len() as u32));
                            }
                            Command::Fin => replies.push(Frame::fin(frame.stream_id)),
                            Command::Syn | Command::Nop | Command::Upd => {}
                        }
                    }
                    for frame in replies {
                        let plaintext = frame.encode();
                        let len = transport.write_message(&plaintext, &mut buf).unwrap();
                        let ct = buf[..len].to_vec();
                        self.send_framed(&ct);
                    }
                }
                NoiseState::Transport(transport)
            }
            NoiseState::Failed => NoiseState::Failed,
        };
    }

    /// Pop queued downstream segments, bounded by what one EDNS0
    /// response can carry.
    fn take_downstream(&mut self) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        let mut total = 0usize;
        let mut queue = self.segments.0.lock().unwrap();
        while let Some(front) = queue.front() {
            if total + 2 + front.len() > 3500 {
                break;
            }
            total += 2 + front.len();
            records.push(queue.pop_front().unwrap());
        }
        records
    }
}

struct Fixture {
    addr: std::net::SocketAddr,
    pubkey_hex: String,
    log: Arc<QueryLog>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the authoritative-server fixture. When `mute` is set it still
/// answers every query, but with an empty TXT record, so no Noise reply
/// ever arrives.
async fn spawn_fixture(mute: bool) -> Fixture {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let keys = snow::Builder::new(NOISE_PROTOCOL.parse().unwrap())
        .generate_keypair()
        .unwrap();
    let pubkey_hex = hex::encode(&keys.public);
    let log = Arc::new(QueryLog::default());

    let suffix = Name::parse(SUFFIX).unwrap();
    let mtu = framing::effective_mtu(&suffix) as usize;
    let run_log = log.clone();
    let task = tokio::spawn(async move {
        let mut conns: HashMap<ClientId, ServerConn> = HashMap::new();
        let mut buf = [0u8; 4096];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let Ok(query) = Message::from_wire(&buf[..n]) else {
                continue;
            };
            let Some(question) = query.questions.first() else {
                continue;
            };
            let Some((client_id, payload)) = framing::decode_query(&question.name, &suffix)
            else {
                continue;
            };
            run_log.record(payload.is_empty());

            let records = if mute {
                Vec::new()
            } else {
                if !conns.contains_key(&client_id) && payload.len() >= 4 {
                    let conv = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    conns.insert(client_id, ServerConn::new(conv, mtu, &keys.private));
                }
                match conns.get_mut(&client_id) {
                    Some(conn) => {
                        conn.process(&payload);
                        conn.take_downstream()
                    }
                    None => Vec::new(),
                }
            };

            let response = Message {
                id: query.id,
                flags: 0x8180,
                questions: query.questions.clone(),
                answers: vec![ResourceRecord {
                    name: question.name.clone(),
                    rtype: dns::RR_TYPE_TXT,
                    class: dns::CLASS_IN,
                    ttl: 60,
                    rdata: dns::pack_txt(&framing::join_packets(&records)),
                }],
                authority: vec![],
                additional: vec![],
            };
            let _ = socket.send_to(&response.to_wire(), from).await;
        }
    });

    Fixture {
        addr,
        pubkey_hex,
        log,
        task,
    }
}

async fn started_client(fixture: &Fixture) -> TunnelClient {
    let client = TunnelClient::new(
        &fixture.addr.to_string(),
        SUFFIX,
        &fixture.pubkey_hex,
        "127.0.0.1:0",
    )
    .unwrap();
    client.start().await.unwrap();
    client
}

#[tokio::test]
async fn test_echo_one_byte() {
    let fixture = spawn_fixture(false).await;
    let client = started_client(&fixture).await;

    let mut stream = client.dial_tunnel("echo:7").unwrap();
    stream.write_all(&[0x41]).await.unwrap();

    let mut got = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .expect("no echo within 5 seconds")
        .unwrap();
    assert_eq!(got, [0x41]);

    client.stop().await;
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_tcp_listener_pipes_through_tunnel() {
    let fixture = spawn_fixture(false).await;
    let client = started_client(&fixture).await;
    let listen = client.listen_addr().unwrap();

    let mut conn = tokio::net::TcpStream::connect(listen).await.unwrap();
    conn.write_all(b"through the listener").await.unwrap();

    let mut got = [0u8; 20];
    tokio::time::timeout(Duration::from_secs(10), conn.read_exact(&mut got))
        .await
        .expect("no echo within 10 seconds")
        .unwrap();
    assert_eq!(&got, b"through the listener");

    client.stop().await;
}

#[tokio::test]
async fn test_large_payload_reassembly() {
    let fixture = spawn_fixture(false).await;
    let client = started_client(&fixture).await;

    let mut data = vec![0u8; 64 * 1024];
    rand::rngs::StdRng::seed_from_u64(0xC0FFEE).fill_bytes(&mut data);

    let stream = client.dial_tunnel("echo:7").unwrap();
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let to_send = data.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&to_send).await.unwrap();
        write_half
    });

    let mut got = vec![0u8; data.len()];
    tokio::time::timeout(Duration::from_secs(120), read_half.read_exact(&mut got))
        .await
        .expect("no full echo within 120 seconds")
        .unwrap();
    assert_eq!(got, data);

    let _ = writer.await.unwrap();
    client.stop().await;
}

#[tokio::test]
async fn test_polls_continue_while_idle() {
    let fixture = spawn_fixture(false).await;
    let client = started_client(&fixture).await;

    // Let the handshake traffic settle, then watch a quiet tunnel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mark = Instant::now();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let polls = fixture.log.polls_since(mark);
    assert!(
        polls.len() >= 2,
        "expected at least 2 idle polls, saw {}",
        polls.len()
    );

    client.stop().await;
}

#[tokio::test]
async fn test_handshake_timeout_against_mute_server() {
    let fixture = spawn_fixture(true).await;
    let client = TunnelClient::new(
        &fixture.addr.to_string(),
        SUFFIX,
        &fixture.pubkey_hex,
        "127.0.0.1:0",
    )
    .unwrap();

    let begin = Instant::now();
    let err = client.start().await.unwrap_err();
    let elapsed = begin.elapsed();

    assert!(matches!(err, Error::HandshakeTimeout), "got: {}", err);
    assert!(
        elapsed >= Duration::from_millis(9500) && elapsed <= Duration::from_millis(12000),
        "timeout took {:?}",
        elapsed
    );
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let fixture = spawn_fixture(false).await;
    let client = started_client(&fixture).await;

    // second start on a running client is a no-op returning success
    client.start().await.unwrap();
    assert!(client.is_running());

    client.stop().await;
    client.stop().await;
    assert!(!client.is_running());

    // a stopped client can be started again
    client.start().await.unwrap();
    assert!(client.is_running());
    client.stop().await;
}
