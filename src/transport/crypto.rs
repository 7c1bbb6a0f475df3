//! Connection Encryption
//!
//! Authenticated encryption for stream connections: each side generates an
//! ephemeral Curve25519 keypair, the 32-byte public keys are exchanged right
//! after the protocol signature, and both sides precompute a shared secret.
//! Frames are then sealed with XSalsa20-Poly1305 using a detached MAC.

use crate::error::{Error, Result};
use crypto_box::aead::{AeadCore, AeadInPlace, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

pub(crate) const PUBLIC_KEY_LEN: usize = 32;
pub(crate) const MAC_LEN: usize = 16;
pub(crate) const NONCE_LEN: usize = 24;

/// Generates the per-connection ephemeral keypair.
pub(crate) fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (secret, public)
}

/// Precomputed shared-secret cipher for one connection.
pub(crate) struct SessionCrypto {
    shared: SalsaBox,
}

impl SessionCrypto {
    /// Derives the shared secret from the peer's public key and our secret
    /// key.
    pub fn new(peer_public: &[u8; PUBLIC_KEY_LEN], secret: &SecretKey) -> Self {
        let peer_public = PublicKey::from(*peer_public);
        Self { shared: SalsaBox::new(&peer_public, secret) }
    }

    /// Seals a plaintext into the encrypted frame body
    /// `[mac(16)][nonce(24)][ciphertext]`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let mut body = Vec::with_capacity(MAC_LEN + NONCE_LEN + plaintext.len());
        body.extend_from_slice(&[0u8; MAC_LEN]);
        body.extend_from_slice(&nonce);
        body.extend_from_slice(plaintext);

        let mac = self
            .shared
            .encrypt_in_place_detached(&nonce, b"", &mut body[MAC_LEN + NONCE_LEN..])
            .map_err(|_| Error::security("Failed message encryption"))?;
        body[..MAC_LEN].copy_from_slice(&mac);
        Ok(body)
    }

    /// Opens an encrypted frame body produced by [`SessionCrypto::seal`].
    pub fn open(&self, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < MAC_LEN + NONCE_LEN {
            return Err(Error::security(format!(
                "Encrypted frame body too short: {} bytes",
                body.len()
            )));
        }
        let mac = crypto_box::aead::Tag::<SalsaBox>::clone_from_slice(&body[..MAC_LEN]);
        let nonce = crypto_box::aead::Nonce::<SalsaBox>::clone_from_slice(
            &body[MAC_LEN..MAC_LEN + NONCE_LEN],
        );
        let mut plaintext = body[MAC_LEN + NONCE_LEN..].to_vec();
        self.shared
            .decrypt_in_place_detached(&nonce, b"", &mut plaintext, &mac)
            .map_err(|_| Error::security("Failed message decryption"))?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SessionCrypto, SessionCrypto) {
        let (client_secret, client_public) = generate_keypair();
        let (server_secret, server_public) = generate_keypair();
        let client = SessionCrypto::new(server_public.as_bytes(), &client_secret);
        let server = SessionCrypto::new(client_public.as_bytes(), &server_secret);
        (client, server)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (client, server) = session_pair();
        let plaintext = b"framed message bytes".to_vec();

        let body = client.seal(&plaintext).unwrap();
        assert_eq!(body.len(), MAC_LEN + NONCE_LEN + plaintext.len());
        assert_ne!(&body[MAC_LEN + NONCE_LEN..], plaintext.as_slice());

        assert_eq!(server.open(&body).unwrap(), plaintext);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (client, server) = session_pair();
        let mut body = client.seal(b"payload").unwrap();
        let last = body.len() - 1;
        body[last] ^= 0xFF;
        assert!(server.open(&body).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (client, _) = session_pair();
        let (_, stranger) = session_pair();
        let body = client.seal(b"payload").unwrap();
        assert!(stranger.open(&body).is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        let (_, server) = session_pair();
        assert!(server.open(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_keypair_uniqueness() {
        let (_, public1) = generate_keypair();
        let (_, public2) = generate_keypair();
        assert_ne!(public1.as_bytes(), public2.as_bytes());
    }
}
