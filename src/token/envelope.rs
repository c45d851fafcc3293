//! Binary layout of an opaque token.
//!
//! ```text
//! version (1) | algorithm (1) | key id length (1) | key id | nonce (12)
//!   | ephemeral public key (32, x25519 only) | ciphertext | tag (16)
//! ```
//!
//! Everything before the ciphertext is the header and is bound to the
//! ciphertext as AEAD associated data.

use super::TokenError;
use crate::keyring::KeyAlgorithm;

/// Envelope format version
pub const VERSION: u8 = 1;
/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag length
pub const TAG_LEN: usize = 16;
/// X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// A parsed, still-encrypted token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Scheme named by the token
    pub algorithm: KeyAlgorithm,
    /// Key the token claims to be sealed with
    pub key_id: String,
    /// AEAD nonce
    pub nonce: [u8; NONCE_LEN],
    /// Sender's ephemeral X25519 key
    pub ephemeral_public: Option<[u8; PUBLIC_KEY_LEN]>,
    /// Header bytes, used as associated data
    pub header: Vec<u8>,
    /// Ciphertext followed by the tag
    pub sealed: Vec<u8>,
}

/// Serialize the header for a token about to be sealed.
pub fn encode_header(
    algorithm: KeyAlgorithm,
    key_id: &str,
    nonce: &[u8; NONCE_LEN],
    ephemeral_public: Option<&[u8]>,
) -> Result<Vec<u8>, TokenError> {
    let id_len = u8::try_from(key_id.len()).map_err(|_| TokenError::Malformed)?;
    let mut header =
        Vec::with_capacity(3 + key_id.len() + NONCE_LEN + ephemeral_public.map_or(0, <[u8]>::len));
    header.push(VERSION);
    header.push(algorithm.wire_id());
    header.push(id_len);
    header.extend_from_slice(key_id.as_bytes());
    header.extend_from_slice(nonce);
    if let Some(public) = ephemeral_public {
        header.extend_from_slice(public);
    }
    Ok(header)
}

/// Split raw token bytes into header fields and sealed payload.
pub fn parse(bytes: &[u8]) -> Result<Envelope, TokenError> {
    let mut reader = Reader { bytes, pos: 0 };

    if reader.byte()? != VERSION {
        return Err(TokenError::Malformed);
    }
    let algorithm = KeyAlgorithm::from_wire_id(reader.byte()?).ok_or(TokenError::Malformed)?;
    let id_len = usize::from(reader.byte()?);
    let key_id = std::str::from_utf8(reader.take(id_len)?)
        .map_err(|_| TokenError::Malformed)?
        .to_string();
    if key_id.is_empty() {
        return Err(TokenError::Malformed);
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(reader.take(NONCE_LEN)?);

    let ephemeral_public = match algorithm {
        KeyAlgorithm::Aes256Gcm => None,
        KeyAlgorithm::X25519Aes256Gcm => {
            let mut public = [0u8; PUBLIC_KEY_LEN];
            public.copy_from_slice(reader.take(PUBLIC_KEY_LEN)?);
            Some(public)
        }
    };

    let header_len = reader.pos;
    if bytes.len() - header_len < TAG_LEN {
        return Err(TokenError::Malformed);
    }

    Ok(Envelope {
        algorithm,
        key_id,
        nonce,
        ephemeral_public,
        header: bytes[..header_len].to_vec(),
        sealed: bytes[header_len..].to_vec(),
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, TokenError> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TokenError> {
        let end = self.pos.checked_add(n).ok_or(TokenError::Malformed)?;
        let slice = self.bytes.get(self.pos..end).ok_or(TokenError::Malformed)?;
        self.pos = end;
        Ok(slice)
    }
}
