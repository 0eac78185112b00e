//! KCP reliability layer over the DNS packet conn.
//!
//! The DNS channel loses, reorders, and rate-limits packets; KCP's
//! aggressive ARQ with small windows tolerates that far better than a
//! TCP-style congestion controller would. [`KcpConn`] drives a `kcp`
//! state machine from two tasks (a 10 ms clock and an input pump fed by
//! the packet conn) and exposes the result as an ordered byte stream
//! via `AsyncRead`/`AsyncWrite`, which is what the Noise layer above
//! expects to sit on.

use crate::packet_conn::{DnsPacketConn, QUEUE_SIZE};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use kcp::Kcp;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// KCP clock granularity.
const UPDATE_INTERVAL_MS: u64 = 10;

/// Send/receive window in segments: half the transport queue size, so a
/// full window burst cannot overflow the packet queues by itself.
const WINDOW_SIZE: u16 = (QUEUE_SIZE / 2) as u16;

/// Feeds KCP's outbound segments into the packet conn. Each write is
/// one segment batch, which becomes exactly one DNS query.
struct QueueOutput {
    conn: Arc<DnsPacketConn>,
}

impl Write for QueueOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.send_packet(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An ordered, reliable byte stream over the unreliable DNS packet conn.
pub struct KcpConn {
    kcp: Arc<Mutex<Kcp<QueueOutput>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: BytesMut,
    tasks: Vec<JoinHandle<()>>,
}

impl KcpConn {
    /// Open a KCP conversation over `conn` with the given segment MTU.
    /// Stream mode, no-delay acks, and the fixed window size match what
    /// the high-latency polled channel needs.
    pub fn new(conn: Arc<DnsPacketConn>, mtu: usize) -> Result<Self> {
        let conv: u32 = rand::random();
        let output = QueueOutput { conn: conn.clone() };
        let mut kcp = Kcp::new_stream(conv, output);
        kcp.set_nodelay(false, 0, 0, true);
        kcp.set_wndsize(WINDOW_SIZE, WINDOW_SIZE);
        kcp.set_mtu(mtu)
            .map_err(|e| Error::Protocol(format!("failed to set KCP MTU {}: {:?}", mtu, e)))?;
        log::debug!("kcp conversation {:08x}, mtu {}", conv, mtu);

        let kcp = Arc::new(Mutex::new(kcp));
        let epoch = Instant::now();
        let (tx, rx) = mpsc::unbounded_channel();

        let clock = tokio::spawn(clock_loop(kcp.clone(), epoch));
        let input = tokio::spawn(input_loop(conn, kcp.clone(), epoch, tx));

        Ok(KcpConn {
            kcp,
            rx,
            leftover: BytesMut::new(),
            tasks: vec![clock, input],
        })
    }
}

impl Drop for KcpConn {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn now_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

async fn clock_loop(kcp: Arc<Mutex<Kcp<QueueOutput>>>, epoch: Instant) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(UPDATE_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut kcp = kcp.lock().unwrap();
        if let Err(e) = kcp.update(now_ms(epoch)) {
            log::warn!("kcp update: {:?}", e);
        }
    }
}

async fn input_loop(
    conn: Arc<DnsPacketConn>,
    kcp: Arc<Mutex<Kcp<QueueOutput>>>,
    epoch: Instant,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        let packet = conn.recv_packet().await;
        let mut kcp = kcp.lock().unwrap();
        if let Err(e) = kcp.input(&packet) {
            log::debug!("dropping bad kcp segment: {:?}", e);
            continue;
        }
        // Push acks out promptly; the peer's RTT estimate over this
        // channel is bad enough already.
        if let Err(e) = kcp.update(now_ms(epoch)) {
            log::warn!("kcp update: {:?}", e);
        }
        if let Err(e) = kcp.flush() {
            log::warn!("kcp flush: {:?}", e);
        }
        loop {
            let size = match kcp.peeksize() {
                Ok(size) if size > 0 => size,
                _ => break,
            };
            let mut buf = vec![0u8; size];
            match kcp.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(buf).is_err() {
                        return;
                    }
                }
                Err(kcp::Error::RecvQueueEmpty) => break,
                Err(e) => {
                    log::warn!("kcp recv: {:?}", e);
                    break;
                }
            }
        }
    }
}

impl AsyncRead for KcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leftover.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => this.leftover.extend_from_slice(&data),
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover[..n]);
        this.leftover.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for KcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut kcp = self.kcp.lock().unwrap();
        if let Err(e) = kcp.send(buf) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("kcp send: {:?}", e),
            )));
        }
        if let Err(e) = kcp.flush() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("kcp flush: {:?}", e),
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut kcp = self.kcp.lock().unwrap();
        match kcp.flush() {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("kcp flush: {:?}", e),
            ))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
