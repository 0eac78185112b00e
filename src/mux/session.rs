//! Multiplexer session: frame routing over the Noise channel.

use super::frame::{Command, Frame};
use super::stream::{SendWindow, Stream};
use crate::noise::{NoiseChannel, NoiseReader, NoiseWriter};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Session tuning. Defaults match the tunnel's needs: a long keep-alive
/// horizon (DNS polling is slow when idle) and a 1 MiB per-stream
/// receive buffer.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Nop cadence on the write side.
    pub keep_alive_interval: Duration,
    /// Close the session after this long without any inbound frame.
    pub idle_timeout: Duration,
    /// Receive credit initially granted to the peer, per stream.
    pub max_stream_window: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            keep_alive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_stream_window: 1024 * 1024,
        }
    }
}

pub(crate) struct StreamEntry {
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    window: Arc<SendWindow>,
}

pub(crate) struct SessionShared {
    out_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    config: MuxConfig,
}

impl SessionShared {
    /// Queue a frame for the write loop. False once the session is gone.
    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.out_tx.send(frame).is_ok()
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        self.streams.lock().unwrap().remove(&id);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.drain() {
            // Dropping the sender gives readers EOF; closing the window
            // errors out parked writers.
            entry.window.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A client-side multiplexer session over an established Noise channel.
pub struct Session {
    shared: Arc<SessionShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Take ownership of the channel and start the session tasks.
    pub fn client<S>(channel: NoiseChannel<S>, config: MuxConfig) -> Session
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = channel.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            config,
        });

        let read_task = tokio::spawn(read_loop(reader, shared.clone()));
        let write_task = tokio::spawn(write_loop(writer, out_rx, shared.clone()));

        Session {
            shared,
            tasks: vec![read_task, write_task],
        }
    }

    /// Open a new stream. Stream IDs are odd on the initiating side.
    pub fn open_stream(&self) -> Result<Stream> {
        if self.shared.is_closed() {
            return Err(Error::NotConnected);
        }
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let window = Arc::new(SendWindow::new(self.shared.config.max_stream_window));
        self.shared.streams.lock().unwrap().insert(
            id,
            StreamEntry {
                data_tx: Some(data_tx),
                window: window.clone(),
            },
        );
        if !self.shared.send(Frame::syn(id)) {
            self.shared.remove_stream(id);
            return Err(Error::NotConnected);
        }
        log::debug!("opened stream {}", id);
        Ok(Stream::new(id, self.shared.clone(), data_rx, window))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Tear the session down: existing streams observe EOF, later
    /// `open_stream` calls fail.
    pub fn close(&self) {
        self.shared.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<S>(mut reader: NoiseReader<S>, shared: Arc<SessionShared>)
where
    S: AsyncRead + Unpin,
{
    let idle_timeout = shared.config.idle_timeout;
    let mut buf = BytesMut::new();
    'outer: loop {
        let msg = match tokio::time::timeout(idle_timeout, reader.read_msg()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                log::debug!("session read: {}", e);
                break;
            }
            Err(_) => {
                log::info!("session idle for {:?}, closing", idle_timeout);
                break;
            }
        };
        buf.extend_from_slice(&msg);
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => handle_frame(&shared, frame),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("session frame error: {}", e);
                    break 'outer;
                }
            }
        }
    }
    shared.close();
}

fn handle_frame(shared: &Arc<SessionShared>, frame: Frame) {
    match frame.cmd {
        Command::Psh => {
            let streams = shared.streams.lock().unwrap();
            match streams.get(&frame.stream_id).and_then(|e| e.data_tx.as_ref()) {
                Some(tx) => {
                    let _ = tx.send(frame.payload);
                }
                None => log::trace!("data for unknown stream {}", frame.stream_id),
            }
        }
        Command::Fin => {
            let mut streams = shared.streams.lock().unwrap();
            if let Some(entry) = streams.get_mut(&frame.stream_id) {
                // Half-close: reads end, writes may continue.
                entry.data_tx = None;
            }
        }
        Command::Upd => {
            if let Some(credit) = frame.upd_consumed() {
                let streams = shared.streams.lock().unwrap();
                if let Some(entry) = streams.get(&frame.stream_id) {
                    entry.window.grant(credit);
                }
            }
        }
        Command::Nop => {}
        Command::Syn => {
            // The terminating server never opens streams toward us.
            log::debug!("ignoring unexpected SYN for stream {}", frame.stream_id);
        }
    }
}

async fn write_loop<S>(
    mut writer: NoiseWriter<S>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<SessionShared>,
) where
    S: AsyncWrite + Unpin,
{
    let mut keepalive = tokio::time::interval(shared.config.keep_alive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_msg(&frame.encode()).await {
                        log::debug!("session write: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if let Err(e) = writer.write_msg(&Frame::nop().encode()).await {
                    log::debug!("keep-alive write: {}", e);
                    break;
                }
            }
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{generate_keypair, NoiseChannel, KEY_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Establish a Noise channel pair over an in-memory duplex.
    async fn channel_pair() -> (
        NoiseChannel<tokio::io::DuplexStream>,
        NoiseChannel<tokio::io::DuplexStream>,
    ) {
        let keys = generate_keypair().unwrap();
        let mut server_pub = [0u8; KEY_LEN];
        server_pub.copy_from_slice(&keys.public);
        let (a, b) = tokio::io::duplex(1 << 16);
        let client = tokio::spawn(async move { NoiseChannel::client(a, &server_pub).await });
        let server = tokio::spawn(async move { NoiseChannel::responder(b, &keys.private).await });
        (
            client.await.unwrap().unwrap(),
            server.await.unwrap().unwrap(),
        )
    }

    /// Peer loop that echoes stream data and returns credit, standing in
    /// for the terminating server.
    async fn echo_peer(mut channel: NoiseChannel<tokio::io::DuplexStream>) {
        let mut buf = BytesMut::new();
        loop {
            let msg = match channel.read_msg().await {
                Ok(msg) => msg,
                Err(_) => return,
            };
            buf.extend_from_slice(&msg);
            while let Ok(Some(frame)) = Frame::decode(&mut buf) {
                match frame.cmd {
                    Command::Psh => {
                        let upd = Frame::upd(frame.stream_id, frame.payload.len() as u32);
                        let echo = Frame::psh(frame.stream_id, frame.payload.clone());
                        if channel.write_msg(&echo.encode()).await.is_err() {
                            return;
                        }
                        if channel.write_msg(&upd.encode()).await.is_err() {
                            return;
                        }
                    }
                    Command::Fin => {
                        let _ = channel.write_msg(&Frame::fin(frame.stream_id).encode()).await;
                    }
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn test_open_stream_echo() {
        let (client_chan, server_chan) = channel_pair().await;
        tokio::spawn(echo_peer(server_chan));
        let session = Session::client(client_chan, MuxConfig::default());

        let mut stream = session.open_stream().unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (client_chan, server_chan) = channel_pair().await;
        tokio::spawn(echo_peer(server_chan));
        let session = Session::client(client_chan, MuxConfig::default());

        let mut one = session.open_stream().unwrap();
        let mut two = session.open_stream().unwrap();
        assert_ne!(one.id(), two.id());

        two.write_all(b"second").await.unwrap();
        one.write_all(b"first").await.unwrap();

        let mut buf1 = [0u8; 5];
        one.read_exact(&mut buf1).await.unwrap();
        assert_eq!(&buf1, b"first");
        let mut buf2 = [0u8; 6];
        two.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"second");
    }

    #[tokio::test]
    async fn test_large_transfer_respects_window() {
        let (client_chan, server_chan) = channel_pair().await;
        tokio::spawn(echo_peer(server_chan));
        let session = Session::client(client_chan, MuxConfig::default());

        let data: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| i as u8).collect();
        let mut stream = session.open_stream().unwrap();

        let expected = data.clone();
        let writer = tokio::spawn(async move {
            stream.write_all(&data).await.unwrap();
            stream
        });
        // Writing 2 MiB against a 1 MiB window only completes because
        // the peer keeps returning credit; reading back then drains it.
        let mut stream = writer.await.unwrap();
        let mut got = vec![0u8; expected.len()];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_session_close_gives_eof_and_errors() {
        let (client_chan, server_chan) = channel_pair().await;
        tokio::spawn(echo_peer(server_chan));
        let session = Session::client(client_chan, MuxConfig::default());

        let mut stream = session.open_stream().unwrap();
        session.close();

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0); // EOF
        assert!(stream.write_all(b"late").await.is_err());
        assert!(session.open_stream().is_err());
    }
}
