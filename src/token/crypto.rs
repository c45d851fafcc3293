//! Sealing and opening token payloads.
//!
//! `aes-256-gcm` keys seal directly with the stored secret. For
//! `x25519-aes-256-gcm` the secret is a static X25519 private key: each
//! token carries a fresh ephemeral public key, and the content key is
//! `HMAC-SHA256(shared_secret, label || ephemeral_public || static_public)`.

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use aws_lc_rs::agreement::{self, PrivateKey, UnparsedPublicKey, X25519};
use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;

use super::TokenError;
use super::envelope::{self, Envelope, NONCE_LEN};
use crate::keyring::{KeyAlgorithm, KeyMaterial};
use crate::{Error, Result};

const KDF_LABEL: &[u8] = b"cluster-auth-gateway/x25519-aes-256-gcm/v1";

/// Seal `plaintext` under `key`, returning the full envelope bytes.
pub fn seal(key: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    aws_lc_rs::rand::fill(&mut nonce).map_err(|_| crypto("random generator failure"))?;

    let (content_key, ephemeral_public) = match key.algorithm {
        KeyAlgorithm::Aes256Gcm => (key.secret().to_vec(), None),
        KeyAlgorithm::X25519Aes256Gcm => {
            let static_public = static_public_key(key)?;
            let ephemeral =
                PrivateKey::generate(&X25519).map_err(|_| crypto("ephemeral key generation"))?;
            let ephemeral_public = ephemeral
                .compute_public_key()
                .map_err(|_| crypto("ephemeral public key"))?
                .as_ref()
                .to_vec();
            let peer = UnparsedPublicKey::new(&X25519, static_public.as_slice());
            let content_key = agreement::agree(&ephemeral, &peer, crypto("key agreement"), |shared| {
                derive_content_key(shared, &ephemeral_public, &static_public)
                    .ok_or_else(|| crypto("content key derivation"))
            })?;
            (content_key, Some(ephemeral_public))
        }
    };

    let header =
        envelope::encode_header(key.algorithm, &key.id, &nonce, ephemeral_public.as_deref())?;

    let sealing = aead_key(&content_key).map_err(|()| crypto("invalid content key"))?;
    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(header.as_slice()),
            &mut in_out,
        )
        .map_err(|_| crypto("seal"))?;

    let mut token = header;
    token.extend_from_slice(&in_out);
    Ok(token)
}

/// Authenticate and decrypt an envelope. Any failure is `Tampered`.
pub fn open(key: &KeyMaterial, envelope: &Envelope) -> std::result::Result<Vec<u8>, TokenError> {
    if envelope.algorithm != key.algorithm {
        return Err(TokenError::Tampered);
    }

    let content_key = match (key.algorithm, envelope.ephemeral_public.as_ref()) {
        (KeyAlgorithm::Aes256Gcm, None) => key.secret().to_vec(),
        (KeyAlgorithm::X25519Aes256Gcm, Some(ephemeral_public)) => {
            let private = PrivateKey::from_private_key(&X25519, key.secret())
                .map_err(|_| TokenError::Tampered)?;
            let static_public = private
                .compute_public_key()
                .map_err(|_| TokenError::Tampered)?
                .as_ref()
                .to_vec();
            let peer = UnparsedPublicKey::new(&X25519, ephemeral_public);
            agreement::agree(&private, &peer, TokenError::Tampered, |shared| {
                derive_content_key(shared, ephemeral_public, &static_public)
                    .ok_or(TokenError::Tampered)
            })?
        }
        _ => return Err(TokenError::Tampered),
    };

    let opening = aead_key(&content_key).map_err(|()| TokenError::Tampered)?;
    let mut in_out = envelope.sealed.clone();
    let plaintext = opening
        .open_in_place(
            Nonce::assume_unique_for_key(envelope.nonce),
            Aad::from(envelope.header.as_slice()),
            &mut in_out,
        )
        .map_err(|_| TokenError::Tampered)?;
    Ok(plaintext.to_vec())
}

/// Public half of an X25519 ring key
pub fn static_public_key(key: &KeyMaterial) -> Result<Vec<u8>> {
    let private = PrivateKey::from_private_key(&X25519, key.secret())
        .map_err(|e| Error::Crypto(format!("invalid X25519 key {}: {e}", key.id)))?;
    Ok(private
        .compute_public_key()
        .map_err(|_| crypto("static public key"))?
        .as_ref()
        .to_vec())
}

fn aead_key(bytes: &[u8]) -> std::result::Result<LessSafeKey, ()> {
    UnboundKey::new(&AES_256_GCM, bytes)
        .map(LessSafeKey::new)
        .map_err(|_| ())
}

fn derive_content_key(
    shared: &[u8],
    ephemeral_public: &[u8],
    static_public: &[u8],
) -> Option<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(shared).ok()?;
    mac.update(KDF_LABEL);
    mac.update(ephemeral_public);
    mac.update(static_public);
    Some(mac.finalize().into_bytes().as_slice().to_vec())
}

fn crypto(what: &str) -> Error {
    Error::Crypto(what.to_string())
}
