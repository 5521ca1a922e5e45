//! Framed message channel over TCP.
//!
//! Every message travels as one base64 line. Once a handshake has produced
//! session keys the channel switches to its encrypted stage, where each
//! message is run through AES-256-CTR before encoding:
//!
//! ```text
//! Encoded:    line = base64(message)
//! Encrypted:  line = base64(aes256ctr(message))
//! ```
//!
//! The two directions keep independent keystreams so a reply never reuses
//! the keystream of a request.

use aes::Aes256;
use base64::{Engine, engine::general_purpose::STANDARD};
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::constants::{MAX_FRAME_LEN, SESSION_IV_LEN, SESSION_KEY_LEN};
use crate::error::{GridError, Result};
use crate::wire::read_frame;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Symmetric material agreed during the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub key: [u8; SESSION_KEY_LEN],
    pub iv: [u8; SESSION_IV_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn generate() -> Self {
        Self {
            key: crate::keys::random_bytes(),
            iv: crate::keys::random_bytes(),
        }
    }
}

/// Which end of the handshake this channel played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-direction IV: the handshake IV with the top bit of the first byte
/// set for responder-to-initiator traffic.
fn direction_iv(iv: &[u8; SESSION_IV_LEN], from_responder: bool) -> [u8; SESSION_IV_LEN] {
    let mut out = *iv;
    if from_responder {
        out[0] ^= 0x80;
    }
    out
}

struct SessionCipher {
    encrypt: Aes256Ctr,
    decrypt: Aes256Ctr,
}

impl SessionCipher {
    fn new(keys: &SessionKeys, role: Role) -> Result<Self> {
        let outbound = direction_iv(&keys.iv, role == Role::Responder);
        let inbound = direction_iv(&keys.iv, role == Role::Initiator);

        let encrypt = Aes256Ctr::new_from_slices(&keys.key, &outbound)
            .map_err(|e| GridError::Crypto(format!("cipher init failed: {}", e)))?;
        let decrypt = Aes256Ctr::new_from_slices(&keys.key, &inbound)
            .map_err(|e| GridError::Crypto(format!("cipher init failed: {}", e)))?;

        Ok(Self { encrypt, decrypt })
    }
}

enum Stage {
    Encoded,
    Encrypted(Box<SessionCipher>),
}

/// Message channel offering connect / send / receive / close
pub struct SecureChannel {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    stage: Stage,
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureChannel {
    /// An unconnected channel
    pub fn new() -> Self {
        Self {
            reader: None,
            writer: None,
            peer: None,
            stage: Stage::Encoded,
        }
    }

    /// Wrap an accepted or freshly connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            reader: Some(BufReader::new(read)),
            writer: Some(write),
            peer,
            stage: Stage::Encoded,
        }
    }

    /// Connect to `addr`, replacing any previous transport
    pub async fn connect(&mut self, addr: impl ToSocketAddrs) -> Result<()> {
        self.close().await;
        let stream = TcpStream::connect(addr).await?;
        *self = Self::from_stream(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some() && self.reader.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.stage, Stage::Encrypted(_))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Switch to the encrypted stage. A channel is keyed at most once.
    pub fn enable_encryption(&mut self, keys: &SessionKeys, role: Role) -> Result<()> {
        if !self.is_connected() {
            return Err(GridError::NotConnected);
        }
        if self.is_encrypted() {
            return Err(GridError::Crypto("channel already has a session key".to_string()));
        }
        self.stage = Stage::Encrypted(Box::new(SessionCipher::new(keys, role)?));
        Ok(())
    }

    /// Release the transport. Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reader = None;
    }

    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(GridError::NotConnected)?;

        let mut line = match &mut self.stage {
            Stage::Encoded => STANDARD.encode(message),
            Stage::Encrypted(cipher) => {
                let mut buf = message.to_vec();
                cipher.encrypt.apply_keystream(&mut buf);
                STANDARD.encode(buf)
            }
        };
        line.push('\n');

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, message: &str) -> Result<()> {
        self.send(message.as_bytes()).await
    }

    /// Next message, or `None` once the peer closed the connection.
    /// Frames longer than `MAX_FRAME_LEN` are refused.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        let reader = self.reader.as_mut().ok_or(GridError::NotConnected)?;

        let Some(line) = read_frame(reader, MAX_FRAME_LEN).await? else {
            return Ok(None);
        };

        let mut message = STANDARD
            .decode(line.trim_end())
            .map_err(|e| GridError::Protocol(format!("invalid base64 frame: {}", e)))?;

        if let Stage::Encrypted(cipher) = &mut self.stage {
            cipher.decrypt.apply_keystream(&mut message);
        }
        Ok(Some(message))
    }

    pub async fn receive_text(&mut self) -> Result<Option<String>> {
        match self.receive().await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| GridError::Protocol("message is not valid UTF-8".to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (SecureChannel, SecureChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = SecureChannel::new();
        let (connected, accepted) = tokio::join!(client.connect(addr), listener.accept());
        connected.unwrap();
        let server = SecureChannel::from_stream(accepted.unwrap().0);
        (client, server)
    }

    #[tokio::test]
    async fn test_encoded_stage_delivers_bytes() {
        let (mut a, mut b) = pair().await;
        let payload = vec![0u8, 10, 13, 255, b' ', b'\n'];
        a.send(&payload).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_encrypted_stage_both_directions() {
        let (mut a, mut b) = pair().await;
        let keys = SessionKeys::generate();
        a.enable_encryption(&keys, Role::Initiator).unwrap();
        b.enable_encryption(&keys, Role::Responder).unwrap();

        for msg in ["login", "compute 3 + 4 - 2", "", "buy 100"] {
            a.send_text(msg).await.unwrap();
            assert_eq!(b.receive_text().await.unwrap().as_deref(), Some(msg));
            b.send_text(msg).await.unwrap();
            assert_eq!(a.receive_text().await.unwrap().as_deref(), Some(msg));
        }
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let (mut a, b) = pair().await;
        let keys = SessionKeys::generate();
        a.enable_encryption(&keys, Role::Initiator).unwrap();
        a.send_text("credits").await.unwrap();

        // Read the raw line without decrypting
        let mut raw = b;
        let line = raw.receive().await.unwrap().unwrap();
        assert_ne!(line, b"credits");
    }

    #[tokio::test]
    async fn test_second_key_is_rejected() {
        let (mut a, _b) = pair().await;
        let keys = SessionKeys::generate();
        a.enable_encryption(&keys, Role::Initiator).unwrap();
        assert!(a.enable_encryption(&keys, Role::Initiator).is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = connected.unwrap();
        let mut channel = SecureChannel::from_stream(accepted.unwrap().0);

        let endless = vec![b'A'; MAX_FRAME_LEN + 100];
        let (written, received) = tokio::join!(raw.write_all(&endless), channel.receive());
        written.unwrap();
        assert!(matches!(received, Err(GridError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut channel = SecureChannel::new();
        assert!(!channel.is_connected());
        assert!(matches!(channel.send(b"x").await, Err(GridError::NotConnected)));
        assert!(matches!(channel.receive().await, Err(GridError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_peer_sees_eof() {
        let (mut a, mut b) = pair().await;
        a.close().await;
        a.close().await;
        assert!(!a.is_connected());
        assert!(matches!(a.send_text("x").await, Err(GridError::NotConnected)));
        assert_eq!(b.receive().await.unwrap(), None);
    }
}
