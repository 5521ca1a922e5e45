//! Mutual authentication between a client and the controller.
//!
//! ```text
//! client -> controller   seal(controller_pub, "AUTH <user> <clientChallenge>")
//! controller -> client   seal(user_pub, "OK <clientChallenge> <controllerChallenge> <key> <iv>")
//!                        -- both sides switch to AES-256-CTR --
//! client -> controller   "<controllerChallenge>"
//! ```
//!
//! Challenges, key and IV are base64 text inside the messages. Any failure
//! closes the channel.

use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::channel::{Role, SecureChannel, SessionKeys};
use crate::constants::{CHALLENGE_LEN, SESSION_IV_LEN, SESSION_KEY_LEN, wire};
use crate::error::{GridError, Result};
use crate::keys::{IdentityKey, KeyDirectory, PublicIdentity, is_valid_identity, random_bytes};

fn new_challenge() -> String {
    STANDARD.encode(random_bytes::<CHALLENGE_LEN>())
}

fn same_challenge(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn decode_exact<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|_| GridError::MalformedHandshake(format!("{} is not base64", what)))?;
    raw.try_into()
        .map_err(|_| GridError::MalformedHandshake(format!("{} has wrong length", what)))
}

async fn next_message(channel: &mut SecureChannel) -> Result<Vec<u8>> {
    channel
        .receive()
        .await?
        .ok_or_else(|| GridError::HandshakeFailed("connection closed during handshake".to_string()))
}

/// Authenticate as `identity` to the holder of `responder`.
///
/// On success the channel is in its encrypted stage.
pub async fn initiate(
    channel: &mut SecureChannel,
    identity: &str,
    own_key: &IdentityKey,
    responder: &PublicIdentity,
) -> Result<()> {
    let outcome = initiate_inner(channel, identity, own_key, responder).await;
    if outcome.is_err() {
        channel.close().await;
    }
    outcome
}

async fn initiate_inner(
    channel: &mut SecureChannel,
    identity: &str,
    own_key: &IdentityKey,
    responder: &PublicIdentity,
) -> Result<()> {
    let challenge = new_challenge();
    let hello = format!("{} {} {}", wire::AUTH, identity, challenge);
    channel.send(&responder.seal(hello.as_bytes())?).await?;

    let sealed = next_message(channel).await?;
    let reply = own_key
        .open(&sealed)
        .map_err(|_| GridError::MalformedHandshake("cannot decrypt responder reply".to_string()))?;
    let reply = String::from_utf8(reply)
        .map_err(|_| GridError::MalformedHandshake("reply is not text".to_string()))?;

    let parts: Vec<&str> = reply.split(' ').collect();
    let [keyword, echo, theirs, key, iv] = parts.as_slice() else {
        return Err(GridError::MalformedHandshake("unexpected reply shape".to_string()));
    };
    if *keyword != wire::AUTH_OK {
        return Err(GridError::MalformedHandshake(format!("unexpected keyword {}", keyword)));
    }
    if !same_challenge(echo, &challenge) {
        return Err(GridError::ChallengeMismatch);
    }

    let keys = SessionKeys {
        key: decode_exact::<SESSION_KEY_LEN>(key, "session key")?,
        iv: decode_exact::<SESSION_IV_LEN>(iv, "session iv")?,
    };
    channel.enable_encryption(&keys, Role::Initiator)?;
    channel.send_text(theirs).await?;

    debug!(identity = %identity, "Handshake completed");
    Ok(())
}

/// Authenticate an incoming client; returns the proven identity.
///
/// On success the channel is in its encrypted stage. Key lookups run on the
/// blocking pool since a directory may read from disk.
pub async fn respond(
    channel: &mut SecureChannel,
    own_key: &IdentityKey,
    directory: &Arc<dyn KeyDirectory>,
) -> Result<String> {
    let outcome = respond_inner(channel, own_key, directory).await;
    if outcome.is_err() {
        channel.close().await;
    }
    outcome
}

async fn respond_inner(
    channel: &mut SecureChannel,
    own_key: &IdentityKey,
    directory: &Arc<dyn KeyDirectory>,
) -> Result<String> {
    let sealed = next_message(channel).await?;
    let hello = own_key
        .open(&sealed)
        .map_err(|_| GridError::MalformedHandshake("cannot decrypt first message".to_string()))?;
    let hello = String::from_utf8(hello)
        .map_err(|_| GridError::MalformedHandshake("first message is not text".to_string()))?;

    let parts: Vec<&str> = hello.split(' ').collect();
    let [keyword, identity, challenge] = parts.as_slice() else {
        return Err(GridError::MalformedHandshake("unexpected first message shape".to_string()));
    };
    if *keyword != wire::AUTH {
        return Err(GridError::MalformedHandshake(format!("unexpected keyword {}", keyword)));
    }
    if !is_valid_identity(identity) {
        return Err(GridError::MalformedHandshake("invalid identity".to_string()));
    }
    decode_exact::<CHALLENGE_LEN>(challenge, "challenge")?;

    let lookup = {
        let directory = Arc::clone(directory);
        let identity = identity.to_string();
        tokio::task::spawn_blocking(move || directory.lookup(&identity))
    };
    let peer_key = lookup
        .await
        .map_err(|e| GridError::KeyMaterial(format!("key lookup failed: {}", e)))?
        .ok_or_else(|| GridError::MalformedHandshake(format!("unknown identity {}", identity)))?;

    let own_challenge = new_challenge();
    let keys = SessionKeys::generate();
    let reply = format!(
        "{} {} {} {} {}",
        wire::AUTH_OK,
        challenge,
        own_challenge,
        STANDARD.encode(keys.key),
        STANDARD.encode(keys.iv)
    );
    channel.send(&peer_key.seal(reply.as_bytes())?).await?;
    channel.enable_encryption(&keys, Role::Responder)?;

    let proof = next_message(channel).await?;
    if !same_challenge(&String::from_utf8_lossy(&proof), &own_challenge) {
        return Err(GridError::HandshakeFailed("challenge proof mismatch".to_string()));
    }

    debug!(identity = %identity, "Client authenticated");
    Ok(identity.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyDir;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn pair() -> (SecureChannel, SecureChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = SecureChannel::new();
        let (connected, accepted) = tokio::join!(client.connect(addr), listener.accept());
        connected.unwrap();
        (client, SecureChannel::from_stream(accepted.unwrap().0))
    }

    fn directory(name: &str, key: &IdentityKey) -> Arc<dyn KeyDirectory> {
        Arc::new(HashMap::from([(name.to_string(), key.public())]))
    }

    #[tokio::test]
    async fn test_handshake_then_encrypted_exchange() {
        let controller = IdentityKey::generate();
        let alice = IdentityKey::generate();
        let users = directory("alice", &alice);
        let (mut client, mut server) = pair().await;

        let controller_pub = controller.public();
        let (initiated, responded) = tokio::join!(
            initiate(&mut client, "alice", &alice, &controller_pub),
            respond(&mut server, &controller, &users)
        );
        initiated.unwrap();
        assert_eq!(responded.unwrap(), "alice");
        assert!(client.is_encrypted() && server.is_encrypted());

        client.send_text("credits").await.unwrap();
        assert_eq!(server.receive_text().await.unwrap().as_deref(), Some("credits"));
        server.send_text("You have 500 credits left.").await.unwrap();
        assert_eq!(
            client.receive_text().await.unwrap().as_deref(),
            Some("You have 500 credits left.")
        );
    }

    #[tokio::test]
    async fn test_unknown_user_closes_channel() {
        let controller = IdentityKey::generate();
        let mallory = IdentityKey::generate();
        let users = directory("alice", &IdentityKey::generate());
        let (mut client, mut server) = pair().await;

        let controller_pub = controller.public();
        let (initiated, responded) = tokio::join!(
            initiate(&mut client, "mallory", &mallory, &controller_pub),
            respond(&mut server, &controller, &users)
        );
        assert!(matches!(responded, Err(GridError::MalformedHandshake(_))));
        assert!(initiated.is_err());
        assert!(!server.is_connected());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_garbage_first_message_is_malformed() {
        let controller = IdentityKey::generate();
        let users: Arc<dyn KeyDirectory> = Arc::new(HashMap::<String, PublicIdentity>::new());
        let (mut client, mut server) = pair().await;

        client.send(b"not a sealed box at all").await.unwrap();
        let result = respond(&mut server, &controller, &users).await;
        assert!(matches!(result, Err(GridError::MalformedHandshake(_))));
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_echo_is_challenge_mismatch() {
        let controller = IdentityKey::generate();
        let alice = IdentityKey::generate();
        let (mut client, mut server) = pair().await;

        // A responder that answers with a challenge it made up
        let alice_pub = alice.public();
        let fake = async {
            let _ = server.receive().await.unwrap();
            let keys = SessionKeys::generate();
            let reply = format!(
                "OK {} {} {} {}",
                new_challenge(),
                new_challenge(),
                STANDARD.encode(keys.key),
                STANDARD.encode(keys.iv)
            );
            server.send(&alice_pub.seal(reply.as_bytes()).unwrap()).await.unwrap();
        };

        let controller_pub = controller.public();
        let (initiated, ()) = tokio::join!(
            initiate(&mut client, "alice", &alice, &controller_pub),
            fake
        );
        assert!(matches!(initiated, Err(GridError::ChallengeMismatch)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_proof_fails_handshake() {
        let controller = IdentityKey::generate();
        let alice = IdentityKey::generate();
        let users = directory("alice", &alice);
        let (mut client, mut server) = pair().await;

        // A client that completes the key exchange but proves the wrong challenge
        let controller_pub = controller.public();
        let cheat = async {
            let challenge = new_challenge();
            let hello = format!("AUTH alice {}", challenge);
            client.send(&controller_pub.seal(hello.as_bytes()).unwrap()).await.unwrap();
            let sealed = client.receive().await.unwrap().unwrap();
            let reply = String::from_utf8(alice.open(&sealed).unwrap()).unwrap();
            let parts: Vec<&str> = reply.split(' ').collect();
            let keys = SessionKeys {
                key: decode_exact(parts[3], "key").unwrap(),
                iv: decode_exact(parts[4], "iv").unwrap(),
            };
            client.enable_encryption(&keys, Role::Initiator).unwrap();
            client.send_text(&new_challenge()).await.unwrap();
        };

        let ((), responded) = tokio::join!(cheat, respond(&mut server, &controller, &users));
        assert!(matches!(responded, Err(GridError::HandshakeFailed(_))));
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_against_key_files() {
        let dir = std::env::temp_dir().join(format!("cumulus-hs-keys-{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let alice = IdentityKey::generate();
        std::fs::write(dir.join("alice.pub"), alice.public().to_base64()).unwrap();
        let users: Arc<dyn KeyDirectory> = Arc::new(KeyDir::new(&dir));

        let controller = IdentityKey::generate();
        let controller_pub = controller.public();
        let (mut client, mut server) = pair().await;
        let (initiated, responded) = tokio::join!(
            initiate(&mut client, "alice", &alice, &controller_pub),
            respond(&mut server, &controller, &users)
        );
        initiated.unwrap();
        assert_eq!(responded.unwrap(), "alice");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
