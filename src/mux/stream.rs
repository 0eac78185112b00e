//! A single multiplexed byte-stream.

use super::frame::{Frame, MAX_FRAME_PAYLOAD};
use super::session::SessionShared;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Return receive credit to the peer once this many bytes have been
/// consumed since the last update.
const UPD_THRESHOLD: u32 = 32 * 1024;

/// Send-side credit for one stream: how many bytes the peer is still
/// willing to buffer for us. Writers park here when it runs out.
pub(crate) struct SendWindow {
    remaining: Mutex<u32>,
    wakers: Mutex<Vec<Waker>>,
    closed: AtomicBool,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        SendWindow {
            remaining: Mutex::new(initial),
            wakers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Take up to `want` bytes of credit. When exhausted, registers the
    /// waker (under the credit lock, so a racing grant cannot slip
    /// between the check and the registration) and returns `None`.
    fn poll_take(&self, want: usize, waker: &Waker) -> Option<usize> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            let mut wakers = self.wakers.lock().unwrap();
            if !wakers.iter().any(|w| w.will_wake(waker)) {
                wakers.push(waker.clone());
            }
            return None;
        }
        let n = (*remaining as usize).min(want);
        *remaining -= n as u32;
        Some(n)
    }

    pub(crate) fn grant(&self, credit: u32) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_add(credit);
        drop(remaining);
        self.wake_all();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn wake_all(&self) {
        for waker in self.wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
    }
}

/// One ordered byte-stream over the session. Obtained from
/// [`super::Session::open_stream`]; becomes unusable (EOF on read,
/// errors on write) once the session closes.
pub struct Stream {
    id: u32,
    shared: Arc<SessionShared>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    leftover: BytesMut,
    window: Arc<SendWindow>,
    write_closed: bool,
    consumed_pending: u32,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<SessionShared>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        window: Arc<SendWindow>,
    ) -> Self {
        Stream {
            id,
            shared,
            rx,
            leftover: BytesMut::new(),
            window,
            write_closed: false,
            consumed_pending: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Account consumed bytes and return credit to the peer in batches.
    fn record_consumed(&mut self, n: usize) {
        self.consumed_pending = self.consumed_pending.saturating_add(n as u32);
        if self.consumed_pending >= UPD_THRESHOLD {
            self.shared.send(Frame::upd(self.id, self.consumed_pending));
            self.consumed_pending = 0;
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.leftover.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => this.leftover.extend_from_slice(&data),
                // Sender gone: peer FIN or session closed. Clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover[..n]);
        this.leftover.advance(n);
        this.record_consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.window.is_closed() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match this
            .window
            .poll_take(buf.len().min(MAX_FRAME_PAYLOAD), cx.waker())
        {
            Some(n) => {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                if !this.shared.send(Frame::psh(this.id, payload)) {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
            None => {
                // A close racing with the registration above would have
                // fired wake_all already; re-checking here closes the gap.
                if this.window.is_closed() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are handed to the session write loop immediately.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            this.shared.send(Frame::fin(this.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.write_closed {
            self.shared.send(Frame::fin(self.id));
        }
        self.shared.remove_stream(self.id);
    }
}
