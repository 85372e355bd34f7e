//! Challenge-response authentication of nodes against the relay roster.
//!
//! The node announces `(method, roster id)`. The relay embeds a random
//! challenge in a point, ElGamal-encrypts it to the roster key and expects
//! a Schnorr signature over the recovered bytes in return.

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};

use super::framing::{read_message, write_message, FramingError, WireReader, WireWriter};
use crate::crypto::{decrypt, encrypt, Ciphertext, PublicKey, SecretKey, Signature, Suite};
use crate::error::ProtocolError;
use crate::roster::{Role, Roster};

/// Public-key challenge-response; the only method implemented.
pub const METHOD_PUBLIC_KEY: u8 = 0x01;
pub const VERDICT_ACCEPT: u8 = 0x01;
pub const VERDICT_REJECT: u8 = 0x00;
/// 160-bit challenge
pub const CHALLENGE_SIZE: usize = 20;

const AUTH_CONTEXT: &[u8] = b"prifi-auth-challenge";
const MAX_AUTH_FRAME: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unsupported authentication method {0:#04x}")]
    UnsupportedMethod(u8),
    #[error("node {0} is not in the roster")]
    UnknownNode(u32),
    #[error("node {0} is banned")]
    Banned(u32),
    #[error("challenge signature from node {0} does not verify")]
    BadSignature(u32),
    #[error("relay rejected the authentication")]
    Rejected,
    #[error("challenge of {0} bytes cannot be embedded")]
    ChallengeTooLarge(usize),
}

impl From<AuthError> for ProtocolError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Framing(f) => f.into(),
            AuthError::ChallengeTooLarge(_) => ProtocolError::AuthInternal(e.to_string()),
            other => ProtocolError::AuthRejected(other.to_string()),
        }
    }
}

/// A node the relay has authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub roster_id: u32,
    pub role: Role,
    pub public_key: PublicKey,
}

/// Node side of the handshake.
pub async fn authenticate_to_relay<S>(
    stream: &mut S,
    roster_id: u32,
    secret: &SecretKey,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = WireWriter::new();
    hello.put_u8(METHOD_PUBLIC_KEY).put_u32(roster_id);
    write_message(stream, &hello.finish()).await?;

    let frame = read_message(stream, MAX_AUTH_FRAME).await?;
    if frame.as_ref() == [VERDICT_REJECT] {
        return Err(AuthError::Rejected);
    }
    let mut r = WireReader::new(&frame);
    let ciphertext = Ciphertext {
        k: r.get_point()?,
        c: r.get_point()?,
    };
    r.finish()?;

    // A wrong key decrypts to a random point. Sign its bytes anyway so the
    // relay, not a hang-up, settles the outcome.
    let recovered = decrypt(secret, &ciphertext);
    let challenge = Suite
        .data(&recovered)
        .unwrap_or_else(|_| Suite.point_to_bytes(&recovered).to_vec());
    let signature = Signature::sign(secret, AUTH_CONTEXT, &challenge);
    let mut response = WireWriter::new();
    response.put_bytes(&signature.to_bytes());
    write_message(stream, &response.finish()).await?;

    let verdict = read_message(stream, MAX_AUTH_FRAME).await?;
    match verdict.as_ref() {
        [VERDICT_ACCEPT] => Ok(()),
        _ => Err(AuthError::Rejected),
    }
}

/// Relay side of the handshake.
///
/// `is_banned` is consulted after the roster lookup; every rejection sends
/// the reject verdict before returning the error.
pub async fn authenticate_peer<S, F>(
    stream: &mut S,
    roster: &Roster,
    is_banned: F,
) -> Result<Authenticated, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&PublicKey) -> bool,
{
    let hello = read_message(stream, MAX_AUTH_FRAME).await?;
    let mut r = WireReader::new(&hello);
    let method = r.get_u8()?;
    let roster_id = r.get_u32()?;
    r.finish()?;

    if method != METHOD_PUBLIC_KEY {
        return reject(stream, AuthError::UnsupportedMethod(method)).await;
    }
    let (role, public_key) = match roster.lookup(roster_id) {
        Some((role, pk)) => (role, *pk),
        None => return reject(stream, AuthError::UnknownNode(roster_id)).await,
    };
    if is_banned(&public_key) {
        return reject(stream, AuthError::Banned(roster_id)).await;
    }

    let challenge = challenge_bytes();
    let (point, rest) = Suite.pick(&challenge, &mut OsRng);
    if !rest.is_empty() {
        return reject(stream, AuthError::ChallengeTooLarge(challenge.len())).await;
    }
    let ciphertext = encrypt(&public_key, &point, &mut OsRng);
    let mut w = WireWriter::new();
    w.put_point(&ciphertext.k).put_point(&ciphertext.c);
    write_message(stream, &w.finish()).await?;

    let response = read_message(stream, MAX_AUTH_FRAME).await?;
    let mut r = WireReader::new(&response);
    let signature = Signature::from_bytes(r.get_bytes()?);
    r.finish()?;

    match signature.map(|sig| sig.verify(&public_key, AUTH_CONTEXT, &challenge)) {
        Ok(Ok(())) => {
            write_message(stream, &[VERDICT_ACCEPT]).await?;
            Ok(Authenticated {
                roster_id,
                role,
                public_key,
            })
        }
        _ => reject(stream, AuthError::BadSignature(roster_id)).await,
    }
}

fn challenge_bytes() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

async fn reject<S, T>(stream: &mut S, err: AuthError) -> Result<T, AuthError>
where
    S: AsyncWrite + Unpin,
{
    tracing::debug!("rejecting authentication: {}", err);
    // the peer may already be gone; the original error is what matters
    let _ = write_message(stream, &[VERDICT_REJECT]).await;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RistrettoPoint;
    use crate::error::ErrorKind;
    use crate::roster::RosterEntry;

    fn roster(trustee: &SecretKey, client: &SecretKey) -> Roster {
        Roster {
            trustees: vec![RosterEntry {
                id: 0,
                public_key: trustee.public(),
            }],
            clients: vec![RosterEntry {
                id: 1,
                public_key: client.public(),
            }],
        }
    }

    #[tokio::test]
    async fn test_known_node_is_accepted() {
        let trustee = SecretKey::generate();
        let client = SecretKey::generate();
        let roster = roster(&trustee, &client);
        let (mut node_end, mut relay_end) = tokio::io::duplex(1024);

        let node = tokio::spawn(async move {
            authenticate_to_relay(&mut node_end, 1, &client).await
        });
        let auth = authenticate_peer(&mut relay_end, &roster, |_| false)
            .await
            .unwrap();
        node.await.unwrap().unwrap();

        assert_eq!(auth.roster_id, 1);
        assert_eq!(auth.role, Role::Client);
        assert_eq!(auth.public_key, roster.clients[0].public_key);
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let trustee = SecretKey::generate();
        let client = SecretKey::generate();
        let roster = roster(&trustee, &client);

        // most wrong keys decrypt to a point with no embedded data; every
        // attempt must still end in a verdict
        for _ in 0..32 {
            let (mut node_end, mut relay_end) = tokio::io::duplex(1024);
            let impostor = SecretKey::generate();
            let node = tokio::spawn(async move {
                authenticate_to_relay(&mut node_end, 0, &impostor).await
            });
            let err = authenticate_peer(&mut relay_end, &roster, |_| false)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::BadSignature(0)), "got {:?}", err);
            assert_eq!(ProtocolError::from(err).kind(), ErrorKind::AuthRejected);
            assert!(matches!(node.await.unwrap(), Err(AuthError::Rejected)));
        }
    }

    #[tokio::test]
    async fn test_undecodable_challenge_still_gets_a_response() {
        let client = SecretKey::generate();
        let (mut node_end, mut relay_end) = tokio::io::duplex(1024);
        let node = tokio::spawn(async move {
            authenticate_to_relay(&mut node_end, 1, &client).await
        });

        let hello = read_message(&mut relay_end, MAX_AUTH_FRAME).await.unwrap();
        assert_eq!(hello.len(), 5);
        // with K the identity the node recovers C itself, a point whose
        // length byte is out of range
        let mut rng = OsRng;
        let garbage = loop {
            let p = Suite.random_point(&mut rng);
            if Suite.data(&p).is_err() {
                break p;
            }
        };
        let mut w = WireWriter::new();
        w.put_point(&RistrettoPoint::default()).put_point(&garbage);
        write_message(&mut relay_end, &w.finish()).await.unwrap();

        let response = read_message(&mut relay_end, MAX_AUTH_FRAME).await.unwrap();
        let mut r = WireReader::new(&response);
        assert!(Signature::from_bytes(r.get_bytes().unwrap()).is_ok());
        write_message(&mut relay_end, &[VERDICT_REJECT]).await.unwrap();
        assert!(matches!(node.await.unwrap(), Err(AuthError::Rejected)));
    }

    #[tokio::test]
    async fn test_unknown_and_banned_nodes_are_rejected() {
        let trustee = SecretKey::generate();
        let client = SecretKey::generate();
        let roster = roster(&trustee, &client);

        let (mut node_end, mut relay_end) = tokio::io::duplex(1024);
        let stranger = SecretKey::generate();
        let node = tokio::spawn(async move {
            authenticate_to_relay(&mut node_end, 9, &stranger).await
        });
        let err = authenticate_peer(&mut relay_end, &roster, |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownNode(9)));
        assert!(node.await.unwrap().is_err());

        let banned = trustee.public();
        let (mut node_end, mut relay_end) = tokio::io::duplex(1024);
        let node = tokio::spawn(async move {
            authenticate_to_relay(&mut node_end, 0, &trustee).await
        });
        let err = authenticate_peer(&mut relay_end, &roster, |pk| *pk == banned)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Banned(0)));
        assert!(matches!(node.await.unwrap(), Err(AuthError::Rejected)));
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let roster = Roster::default();
        let (mut node_end, mut relay_end) = tokio::io::duplex(1024);
        let mut hello = WireWriter::new();
        hello.put_u8(0x02).put_u32(0);
        write_message(&mut node_end, &hello.finish()).await.unwrap();

        let err = authenticate_peer(&mut relay_end, &roster, |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedMethod(0x02)));
        let verdict = read_message(&mut node_end, MAX_AUTH_FRAME).await.unwrap();
        assert_eq!(verdict.as_ref(), &[VERDICT_REJECT]);
    }

    #[test]
    fn test_challenge_fits_one_point() {
        let challenge = challenge_bytes();
        let (point, rest) = Suite.pick(&challenge, &mut OsRng);
        assert!(rest.is_empty());
        assert_eq!(Suite.data(&point).unwrap(), challenge.to_vec());
    }
}
