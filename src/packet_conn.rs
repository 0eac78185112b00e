//! Connection-less datagram endpoint over the DNS channel.
//!
//! [`DnsPacketConn`] presents `send_packet`/`recv_packet` to the
//! reliability layer and internally runs two workers against the UDP
//! socket:
//!
//! - the receive worker reads datagrams, parses them as DNS responses,
//!   extracts tunnel packets, and signals the send worker that the
//!   server very likely has more buffered;
//! - the send worker turns outbound packets into queries and, when there
//!   is nothing to send, emits empty poll queries on an adaptive delay
//!   so the server has answers to attach downstream data to.
//!
//! A recursive resolver only delivers data in response to queries, so
//! polling is what makes the channel bidirectional at all; the delay
//! doubles while idle and snaps back to the floor the moment anything
//! moves.

use crate::dns::{Message, Name};
use crate::framing::{self, ClientId};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// High watermark for the packet queues. The reliability layer's window
/// is sized to half of this.
pub const QUEUE_SIZE: usize = 256;

/// Pending poll wakeups are collapsed to at most this many.
pub const POLL_LIMIT: usize = 16;

/// Poll delay floor, used whenever the channel is moving data.
pub const INIT_POLL_DELAY: Duration = Duration::from_millis(500);
/// Poll delay ceiling while fully idle.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

const POLL_DELAY_MULTIPLIER: f64 = 2.0;

const RECV_BUF_SIZE: usize = 4096;

/// Bounded FIFO of packets with drop-oldest overflow. Dropping the
/// oldest keeps the queue advancing under pressure; the reliability
/// layer retransmits whatever was lost.
pub(crate) struct PacketQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    capacity: usize,
}

impl PacketQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        PacketQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    pub(crate) fn push(&self, packet: Vec<u8>) {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() == self.capacity {
            queue.pop_front();
            log::debug!("packet queue full, dropping oldest");
        }
        queue.push_back(packet);
        drop(queue);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().pop_front()
    }

    pub(crate) async fn pop(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Adaptive poll delay: doubles on idle expiry, resets to the floor on
/// any activity. Owned exclusively by the send worker.
pub(crate) struct PollDelay {
    current: Duration,
}

impl PollDelay {
    pub(crate) fn new() -> Self {
        PollDelay {
            current: INIT_POLL_DELAY,
        }
    }

    /// The timer expired with nothing to send: back off.
    pub(crate) fn grow(&mut self) -> Duration {
        self.current = self.current.mul_f64(POLL_DELAY_MULTIPLIER);
        if self.current > MAX_POLL_DELAY {
            self.current = MAX_POLL_DELAY;
        }
        self.current
    }

    /// A send carried data or a wakeup arrived: back to the floor.
    pub(crate) fn reset(&mut self) -> Duration {
        self.current = INIT_POLL_DELAY;
        self.current
    }
}

/// Datagram endpoint bound to one logical peer: the authoritative
/// server, reached through the configured resolver.
pub struct DnsPacketConn {
    client_id: ClientId,
    incoming: Arc<PacketQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    outgoing: Arc<PacketQueue>,
}

impl DnsPacketConn {
    /// Wrap `socket` and start the workers. The connection owns the
    /// socket from here on.
    pub fn new(socket: UdpSocket, resolver: SocketAddr, suffix: Name) -> Arc<Self> {
        let socket = Arc::new(socket);
        let client_id = ClientId::random();
        let incoming = Arc::new(PacketQueue::new(QUEUE_SIZE));
        let outgoing = Arc::new(PacketQueue::new(QUEUE_SIZE));
        let poll_signal = Arc::new(Semaphore::new(0));

        log::debug!("packet conn starting, client id {}", client_id);

        let recv_worker = tokio::spawn(recv_loop(
            socket.clone(),
            suffix.clone(),
            incoming.clone(),
            poll_signal.clone(),
        ));
        let send_worker = tokio::spawn(send_loop(
            socket,
            resolver,
            suffix,
            client_id,
            outgoing.clone(),
            poll_signal,
        ));

        Arc::new(DnsPacketConn {
            client_id,
            incoming,
            workers: Mutex::new(vec![recv_worker, send_worker]),
            outgoing,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Queue one packet for transmission. Never blocks; overflow drops
    /// the oldest queued packet.
    pub fn send_packet(&self, packet: Vec<u8>) {
        self.outgoing.push(packet);
    }

    /// Wait for the next inbound packet.
    pub async fn recv_packet(&self) -> Vec<u8> {
        self.incoming.pop().await
    }

    /// Stop both workers. Queued packets are discarded.
    pub fn close(&self) {
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }
}

impl Drop for DnsPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// UDP read errors that are worth retrying: interruptions and ICMP
/// back-pressure surfaced on the socket. Anything else kills the worker.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Write errors swallowed by the send path. Transient unreachability of
/// the resolver must not kill the tunnel; the poll loop keeps retrying.
fn is_network_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
    )
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    suffix: Name,
    incoming: Arc<PacketQueue>,
    poll_signal: Arc<Semaphore>,
) {
    let mut buf = [0u8; RECV_BUF_SIZE];
    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => n,
            Err(e) if is_transient(&e) => {
                log::trace!("transient receive error: {}", e);
                continue;
            }
            Err(e) => {
                log::warn!("receive worker exiting: {}", e);
                return;
            }
        };

        let resp = match Message::from_wire(&buf[..n]) {
            Ok(resp) => resp,
            Err(e) => {
                log::trace!("dropping undecodable datagram: {}", e);
                continue;
            }
        };
        let Some(payload) = framing::response_payload(&resp, &suffix) else {
            continue;
        };
        let packets = framing::split_packets(&payload);
        if packets.is_empty() {
            continue;
        }
        for packet in packets {
            incoming.push(packet);
        }
        // The server just had data for us; odds are it has more. Wake
        // the send worker, collapsing signals when plenty are pending.
        if poll_signal.available_permits() < POLL_LIMIT {
            poll_signal.add_permits(1);
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    resolver: SocketAddr,
    suffix: Name,
    client_id: ClientId,
    outgoing: Arc<PacketQueue>,
    poll_signal: Arc<Semaphore>,
) {
    let mut delay = PollDelay::new();
    let timer = tokio::time::sleep(INIT_POLL_DELAY);
    tokio::pin!(timer);

    loop {
        // Prefer transmitting queued data over emitting an empty poll.
        let mut packet = outgoing.try_pop();
        let mut timer_expired = false;
        if packet.is_none() {
            tokio::select! {
                p = outgoing.pop() => packet = Some(p),
                permit = poll_signal.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = &mut timer => timer_expired = true,
            }
        }
        let packet = packet.unwrap_or_default();

        if !packet.is_empty() {
            // We are about to transmit anyway; one pending wakeup is
            // satisfied by this very query.
            if let Ok(permit) = poll_signal.try_acquire() {
                permit.forget();
            }
        }

        let next = if timer_expired {
            delay.grow()
        } else {
            delay.reset()
        };
        timer
            .as_mut()
            .reset(tokio::time::Instant::now() + next);

        if let Err(e) = send_query(&socket, resolver, &suffix, client_id, &packet).await {
            log::warn!("send: {}", e);
        }
    }
}

async fn send_query(
    socket: &UdpSocket,
    resolver: SocketAddr,
    suffix: &Name,
    client_id: ClientId,
    packet: &[u8],
) -> crate::Result<()> {
    let qname = framing::encode_packet(client_id, packet, suffix)?;
    let query = Message::query(qname);
    match socket.send_to(&query.to_wire(), resolver).await {
        Ok(_) => Ok(()),
        Err(e) if is_network_closed(&e) => {
            log::debug!("ignoring send error: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_delay_bounds() {
        let mut delay = PollDelay::new();
        let mut last = INIT_POLL_DELAY;
        for _ in 0..16 {
            let next = delay.grow();
            assert!(next >= INIT_POLL_DELAY);
            assert!(next <= MAX_POLL_DELAY);
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, MAX_POLL_DELAY);
    }

    #[test]
    fn test_poll_delay_doubles_then_resets() {
        let mut delay = PollDelay::new();
        assert_eq!(delay.grow(), Duration::from_secs(1));
        assert_eq!(delay.grow(), Duration::from_secs(2));
        assert_eq!(delay.reset(), INIT_POLL_DELAY);
        assert_eq!(delay.grow(), Duration::from_secs(1));
    }

    #[test]
    fn test_queue_drop_oldest() {
        let queue = PacketQueue::new(3);
        for i in 0..5u8 {
            queue.push(vec![i]);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(vec![2]));
        assert_eq!(queue.try_pop(), Some(vec![3]));
        assert_eq!(queue.try_pop(), Some(vec![4]));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_queue_pop_wakes_on_push() {
        let queue = Arc::new(PacketQueue::new(4));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(b"ping".to_vec());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"ping".to_vec());
    }
}
