//! Noise NK channel over the reliable layer.
//!
//! The client knows the server's static X25519 key ahead of time and
//! stays anonymous itself, which is exactly the NK pattern. After the
//! two handshake messages, transport messages are framed as a 2-byte
//! big-endian length followed by ciphertext.
//!
//! The post-handshake state is split into independent read and write
//! halves (each tracking its own nonce counter) so the multiplexer can
//! run full-duplex without a lock around the cipher state.

use crate::{Error, Result};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, StatelessTransportState};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Noise protocol: server authentication, client anonymity.
pub const NOISE_PROTOCOL: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Largest framed message, bounded by the u16 length prefix.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// AEAD tag bytes per message.
const TAG_LEN: usize = 16;

/// Largest plaintext per transport message.
const MAX_PLAINTEXT: usize = MAX_MESSAGE_SIZE - TAG_LEN;

/// X25519 key length.
pub const KEY_LEN: usize = 32;

/// Decode a 64-hex-character X25519 public key.
pub fn decode_key(hex_key: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::InvalidKey(format!("bad hex: {}", e)))?;
    if bytes.len() != KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a fresh X25519 keypair for the configured protocol.
pub fn generate_keypair() -> Result<snow::Keypair> {
    let params: NoiseParams = NOISE_PROTOCOL.parse()?;
    Ok(Builder::new(params).generate_keypair()?)
}

/// Decrypting half of an established channel.
pub struct NoiseReader<S> {
    inner: ReadHalf<S>,
    state: Arc<StatelessTransportState>,
    nonce: u64,
    buf: Vec<u8>,
}

/// Encrypting half of an established channel.
pub struct NoiseWriter<S> {
    inner: WriteHalf<S>,
    state: Arc<StatelessTransportState>,
    nonce: u64,
    buf: Vec<u8>,
}

/// An authenticated, encrypted message channel.
pub struct NoiseChannel<S> {
    pub reader: NoiseReader<S>,
    pub writer: NoiseWriter<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> NoiseChannel<S> {
    /// Run the initiator side of the NK handshake against a server
    /// whose static public key is already known.
    pub async fn client(mut stream: S, remote_pubkey: &[u8; KEY_LEN]) -> Result<Self> {
        let params: NoiseParams = NOISE_PROTOCOL.parse()?;
        let mut handshake = Builder::new(params)
            .remote_public_key(remote_pubkey)
            .build_initiator()?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        // -> e, es
        let len = handshake.write_message(&[], &mut buf)?;
        write_frame(&mut stream, &buf[..len]).await?;
        // <- e, ee
        let msg = read_frame(&mut stream).await?;
        handshake.read_message(&msg, &mut buf)?;

        Self::finish(stream, handshake)
    }

    /// Run the responder side. The tunnel client never acts as a
    /// responder in production; this exists for loopback tests and
    /// fixtures standing in for the server.
    pub async fn responder(mut stream: S, local_private: &[u8]) -> Result<Self> {
        let params: NoiseParams = NOISE_PROTOCOL.parse()?;
        let mut handshake = Builder::new(params)
            .local_private_key(local_private)
            .build_responder()?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let msg = read_frame(&mut stream).await?;
        handshake.read_message(&msg, &mut buf)?;
        let len = handshake.write_message(&[], &mut buf)?;
        write_frame(&mut stream, &buf[..len]).await?;

        Self::finish(stream, handshake)
    }

    fn finish(stream: S, handshake: HandshakeState) -> Result<Self> {
        if !handshake.is_handshake_finished() {
            return Err(Error::Handshake("handshake incomplete".into()));
        }
        let state = Arc::new(handshake.into_stateless_transport_mode()?);
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(NoiseChannel {
            reader: NoiseReader {
                inner: read_half,
                state: state.clone(),
                nonce: 0,
                buf: vec![0u8; MAX_MESSAGE_SIZE],
            },
            writer: NoiseWriter {
                inner: write_half,
                state,
                nonce: 0,
                buf: vec![0u8; MAX_MESSAGE_SIZE],
            },
        })
    }

    /// Receive and decrypt one message.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>> {
        self.reader.read_msg().await
    }

    /// Encrypt and send one message.
    pub async fn write_msg(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_msg(data).await
    }

    pub fn split(self) -> (NoiseReader<S>, NoiseWriter<S>) {
        (self.reader, self.writer)
    }
}

impl<S: AsyncRead + Unpin> NoiseReader<S> {
    /// Receive and decrypt the next message. A MAC failure or replay
    /// surfaces as an error and terminates the session.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>> {
        let ciphertext = read_frame(&mut self.inner).await?;
        let len = self
            .state
            .read_message(self.nonce, &ciphertext, &mut self.buf)?;
        self.nonce += 1;
        Ok(self.buf[..len].to_vec())
    }
}

impl<S: AsyncWrite + Unpin> NoiseWriter<S> {
    /// Encrypt and send `data`, chunking to the Noise message limit.
    pub async fn write_msg(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_PLAINTEXT) {
            let len = self.state.write_message(self.nonce, chunk, &mut self.buf)?;
            self.nonce += 1;
            let frame = self.buf[..len].to_vec();
            write_frame(&mut self.inner, &frame).await?;
        }
        Ok(())
    }
}

/// Read one `u16`-BE length-prefixed frame.
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Write one `u16`-BE length-prefixed frame.
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    debug_assert!(data.len() <= MAX_MESSAGE_SIZE);
    stream.write_all(&(data.len() as u16).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_key() {
        let key = decode_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);
        // uppercase accepted
        assert!(decode_key(&"AB".repeat(32)).is_ok());
        // wrong length
        assert!(decode_key(&"ab".repeat(31)).is_err());
        // not hex
        assert!(decode_key(&"zz".repeat(32)).is_err());
    }

    #[tokio::test]
    async fn test_nk_handshake_and_transport() {
        let server_keys = generate_keypair().unwrap();
        let mut server_pub = [0u8; KEY_LEN];
        server_pub.copy_from_slice(&server_keys.public);

        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let client = tokio::spawn(async move {
            NoiseChannel::client(client_stream, &server_pub).await
        });
        let server = tokio::spawn(async move {
            NoiseChannel::responder(server_stream, &server_keys.private).await
        });

        let mut client = client.await.unwrap().unwrap();
        let mut server = server.await.unwrap().unwrap();

        client.write_msg(b"hello from initiator").await.unwrap();
        assert_eq!(server.read_msg().await.unwrap(), b"hello from initiator");

        server.write_msg(b"hello back").await.unwrap();
        assert_eq!(client.read_msg().await.unwrap(), b"hello back");

        // a message larger than one Noise frame round-trips chunked
        let big = vec![0x5au8; MAX_PLAINTEXT + 1000];
        client.write_msg(&big).await.unwrap();
        let first = server.read_msg().await.unwrap();
        let second = server.read_msg().await.unwrap();
        assert_eq!([first, second].concat(), big);
    }

    #[tokio::test]
    async fn test_wrong_server_key_fails() {
        let server_keys = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let mut wrong_pub = [0u8; KEY_LEN];
        wrong_pub.copy_from_slice(&other.public);

        let (client_stream, server_stream) = tokio::io::duplex(8192);

        let client = tokio::spawn(async move {
            NoiseChannel::client(client_stream, &wrong_pub).await
        });
        let server = tokio::spawn(async move {
            NoiseChannel::responder(server_stream, &server_keys.private).await
        });

        // NK fails during the handshake when the static key disagrees.
        let client_res = client.await.unwrap();
        let server_res = server.await.unwrap();
        assert!(client_res.is_err() || server_res.is_err());
    }
}
