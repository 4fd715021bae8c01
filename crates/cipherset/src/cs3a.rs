//! CS3a: X25519 key agreement with ChaCha20-Poly1305 sealing.
//!
//! Handshake body layout:
//!
//! ```text
//! eph_pub(32) ‖ at(4, BE seconds) ‖ ciphertext ‖ tag(16)
//! ```
//!
//! Line packet body layout:
//!
//! ```text
//! token(16) ‖ nonce(16) ‖ ciphertext ‖ tag(16)
//! ```
//!
//! The AEAD consumes the first 12 bytes of the 16-byte wire nonce; the
//! remaining 4 are random padding kept for the frame layout.

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CipherError;
use crate::token::Token;

/// Cipher-set id for CS3a.
pub const CSID: u8 = 0x3a;

const EPH_LEN: usize = 32;
const AT_LEN: usize = 4;
const TAG_LEN: usize = 16;
const WIRE_NONCE_LEN: usize = 16;
const AEAD_NONCE_LEN: usize = 12;

/// A CS3a long-term keypair.
#[derive(Clone)]
pub struct Cs3a {
    secret: StaticSecret,
    public: PublicKey,
}

/// A decrypted, verified handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedHandshake {
    /// Sender's ephemeral public key, needed to derive the line.
    pub remote_ephemeral: [u8; 32],
    /// Sender timestamp, checked for monotonicity by the exchange.
    pub at: u32,
    /// Inner plaintext, itself a LOB frame.
    pub inner: Bytes,
}

impl Cs3a {
    /// Generate a fresh long-term keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Cs3a { secret, public }
    }

    /// Restore a keypair from secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Cs3a { secret, public }
    }

    /// The long-term public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// The long-term secret key bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Seal a handshake addressed to `remote_static`.
    ///
    /// `ephemeral` is kept by the caller; the same ephemeral later derives
    /// the line once the peer's ephemeral arrives.
    pub fn encrypt_handshake(
        &self,
        remote_static: &[u8; 32],
        ephemeral: &StaticSecret,
        at: u32,
        inner: &[u8],
    ) -> Result<Bytes, CipherError> {
        let eph_pub = PublicKey::from(ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*remote_static));
        let key: [u8; 32] = Sha256::digest(shared.as_bytes()).into();

        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CipherError::InvalidKey)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&at_nonce(at)), inner)
            .map_err(|_| CipherError::Mac)?;

        let mut buf = BytesMut::with_capacity(EPH_LEN + AT_LEN + ciphertext.len());
        buf.put_slice(eph_pub.as_bytes());
        buf.put_u32(at);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Open a handshake body sealed to our long-term key.
    pub fn decrypt_handshake(&self, body: &[u8]) -> Result<OpenedHandshake, CipherError> {
        if body.len() < EPH_LEN + AT_LEN + TAG_LEN {
            return Err(CipherError::ShortPacket);
        }

        let mut remote_ephemeral = [0u8; 32];
        remote_ephemeral.copy_from_slice(&body[..EPH_LEN]);
        let at = u32::from_be_bytes(body[EPH_LEN..EPH_LEN + AT_LEN].try_into().unwrap());

        let shared = self.secret.diffie_hellman(&PublicKey::from(remote_ephemeral));
        let key: [u8; 32] = Sha256::digest(shared.as_bytes()).into();

        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CipherError::InvalidKey)?;
        let inner = cipher
            .decrypt(Nonce::from_slice(&at_nonce(at)), &body[EPH_LEN + AT_LEN..])
            .map_err(|_| CipherError::Mac)?;

        Ok(OpenedHandshake {
            remote_ephemeral,
            at,
            inner: Bytes::from(inner),
        })
    }
}

/// Symmetric keying state of an open exchange.
#[derive(Clone)]
pub struct Line {
    inbound_key: [u8; 32],
    outbound_key: [u8; 32],
    local_token: Token,
    remote_token: Token,
}

impl Line {
    /// Derive directional keys and tokens from the two ephemerals.
    pub fn derive(local_ephemeral: &StaticSecret, remote_ephemeral: &[u8; 32]) -> Line {
        let local_pub = PublicKey::from(local_ephemeral).to_bytes();
        let shared = local_ephemeral.diffie_hellman(&PublicKey::from(*remote_ephemeral));

        let inbound_key = direction_key(shared.as_bytes(), remote_ephemeral, &local_pub);
        let outbound_key = direction_key(shared.as_bytes(), &local_pub, remote_ephemeral);

        Line {
            inbound_key,
            outbound_key,
            local_token: key_token(&inbound_key),
            remote_token: key_token(&outbound_key),
        }
    }

    /// Token peers prefix packets to us with. Registered in the endpoint
    /// token table.
    pub fn local_token(&self) -> Token {
        self.local_token
    }

    /// Token we prefix outbound packets with.
    pub fn remote_token(&self) -> Token {
        self.remote_token
    }

    /// Seal a plaintext LOB frame into a line packet body.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Bytes, CipherError> {
        let mut wire_nonce = [0u8; WIRE_NONCE_LEN];
        OsRng.fill_bytes(&mut wire_nonce);

        let cipher = ChaCha20Poly1305::new_from_slice(&self.outbound_key)
            .map_err(|_| CipherError::InvalidKey)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&wire_nonce[..AEAD_NONCE_LEN]), plaintext)
            .map_err(|_| CipherError::Mac)?;

        let mut buf =
            BytesMut::with_capacity(Token::LEN + WIRE_NONCE_LEN + ciphertext.len());
        buf.put_slice(self.remote_token.as_bytes());
        buf.put_slice(&wire_nonce);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Open a line packet body into the plaintext LOB frame.
    pub fn open(&self, body: &[u8]) -> Result<Bytes, CipherError> {
        if body.len() < Token::LEN + WIRE_NONCE_LEN + TAG_LEN {
            return Err(CipherError::ShortPacket);
        }

        let nonce = &body[Token::LEN..Token::LEN + WIRE_NONCE_LEN];
        let cipher = ChaCha20Poly1305::new_from_slice(&self.inbound_key)
            .map_err(|_| CipherError::InvalidKey)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce[..AEAD_NONCE_LEN]),
                &body[Token::LEN + WIRE_NONCE_LEN..],
            )
            .map_err(|_| CipherError::Mac)?;

        Ok(Bytes::from(plaintext))
    }
}

fn at_nonce(at: u32) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[..4].copy_from_slice(&at.to_be_bytes());
    nonce
}

fn direction_key(shared: &[u8], first: &[u8; 32], second: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(first);
    hasher.update(second);
    hasher.finalize().into()
}

fn key_token(key: &[u8; 32]) -> Token {
    let digest: [u8; 32] = Sha256::digest(key).into();
    Token::from_prefix(&digest).expect("digest longer than token")
}

/// Generate a fresh ephemeral secret for one handshake generation.
pub fn generate_ephemeral() -> StaticSecret {
    StaticSecret::random_from_rng(OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Cs3a, Cs3a) {
        (Cs3a::generate(), Cs3a::generate())
    }

    #[test]
    fn test_handshake_roundtrip() {
        let (a, b) = pair();
        let eph = generate_ephemeral();

        let body = a
            .encrypt_handshake(&b.public_key(), &eph, 1700000001, b"inner frame")
            .unwrap();
        let opened = b.decrypt_handshake(&body).unwrap();

        assert_eq!(opened.at, 1700000001);
        assert_eq!(&opened.inner[..], b"inner frame");
        assert_eq!(
            opened.remote_ephemeral,
            PublicKey::from(&eph).to_bytes()
        );
    }

    #[test]
    fn test_handshake_wrong_recipient_fails() {
        let (a, b) = pair();
        let c = Cs3a::generate();
        let eph = generate_ephemeral();

        let body = a
            .encrypt_handshake(&b.public_key(), &eph, 1, b"inner")
            .unwrap();
        assert_eq!(c.decrypt_handshake(&body), Err(CipherError::Mac));
    }

    #[test]
    fn test_handshake_tamper_fails() {
        let (a, b) = pair();
        let eph = generate_ephemeral();

        let body = a
            .encrypt_handshake(&b.public_key(), &eph, 7, b"inner")
            .unwrap();
        let mut tampered = body.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(b.decrypt_handshake(&tampered), Err(CipherError::Mac));

        // Flipping `at` breaks the nonce binding too.
        let mut tampered = body.to_vec();
        tampered[EPH_LEN] ^= 0x01;
        assert_eq!(b.decrypt_handshake(&tampered), Err(CipherError::Mac));
    }

    #[test]
    fn test_line_directional_keys_mirror() {
        let eph_a = generate_ephemeral();
        let eph_b = generate_ephemeral();
        let pub_a = PublicKey::from(&eph_a).to_bytes();
        let pub_b = PublicKey::from(&eph_b).to_bytes();

        let line_a = Line::derive(&eph_a, &pub_b);
        let line_b = Line::derive(&eph_b, &pub_a);

        assert_eq!(line_a.inbound_key, line_b.outbound_key);
        assert_eq!(line_a.outbound_key, line_b.inbound_key);
        assert_eq!(line_a.local_token(), line_b.remote_token());
        assert_eq!(line_b.local_token(), line_a.remote_token());
        assert_ne!(line_a.local_token(), line_a.remote_token());
    }

    #[test]
    fn test_line_seal_open() {
        let eph_a = generate_ephemeral();
        let eph_b = generate_ephemeral();
        let pub_a = PublicKey::from(&eph_a).to_bytes();
        let pub_b = PublicKey::from(&eph_b).to_bytes();

        let line_a = Line::derive(&eph_a, &pub_b);
        let line_b = Line::derive(&eph_b, &pub_a);

        let body = line_a.seal(b"channel frame").unwrap();
        assert_eq!(&body[..Token::LEN], line_b.local_token().as_bytes());
        assert_eq!(&line_b.open(&body).unwrap()[..], b"channel frame");

        // Tampered ciphertext is a single Mac error.
        let mut tampered = body.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(line_b.open(&tampered), Err(CipherError::Mac));
    }

    #[test]
    fn test_short_bodies_rejected() {
        let (a, _) = pair();
        assert_eq!(
            a.decrypt_handshake(&[0u8; 10]),
            Err(CipherError::ShortPacket)
        );

        let eph_a = generate_ephemeral();
        let line = Line::derive(&eph_a, &[9u8; 32]);
        assert_eq!(line.open(&[0u8; 20]), Err(CipherError::ShortPacket));
    }
}
