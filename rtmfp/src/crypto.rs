use std::fmt::{Debug, Formatter};
use std::sync::{Arc, LazyLock};
use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use crate::error::RtmfpError;

pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// well-known key for packets exchanged before a session key exists (handshake)
pub const DEFAULT_KEY: &[u8; KEY_SIZE] = b"Adobe Systems 02";

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

static DEFAULT_KEY_MATERIAL: LazyLock<Arc<RtmfpKey>> = LazyLock::new(|| Arc::new(RtmfpKey::new(*DEFAULT_KEY)));

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Raw AES-128 key. The key bytes are immutable, cipher state is created per call by
///  [RtmfpEngine].
#[derive(Clone, PartialEq, Eq)]
pub struct RtmfpKey([u8; KEY_SIZE]);

impl Debug for RtmfpKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RtmfpKey(..)")
    }
}

impl RtmfpKey {
    pub fn new(key: [u8; KEY_SIZE]) -> RtmfpKey {
        RtmfpKey(key)
    }

    pub fn from_slice(key: &[u8]) -> anyhow::Result<RtmfpKey> {
        let key: [u8; KEY_SIZE] = key.try_into()
            .map_err(|_| RtmfpError::crypto(format!("key must have {} bytes, was {}", KEY_SIZE, key.len())))?;
        Ok(RtmfpKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// AES-128-CBC with a zero IV that is re-initialized for every packet.
///
/// Engines are cheap to clone and can be shared between threads: each call to
///  [RtmfpEngine::process] sets up its own cipher context from the immutable key, so the
///  process-wide default engines need no locking.
#[derive(Clone, Debug)]
pub struct RtmfpEngine {
    key: Arc<RtmfpKey>,
    direction: Direction,
}

impl RtmfpEngine {
    pub fn new(key: Arc<RtmfpKey>, direction: Direction) -> RtmfpEngine {
        RtmfpEngine { key, direction }
    }

    pub fn default_encrypt() -> RtmfpEngine {
        RtmfpEngine::new(DEFAULT_KEY_MATERIAL.clone(), Direction::Encrypt)
    }

    pub fn default_decrypt() -> RtmfpEngine {
        RtmfpEngine::new(DEFAULT_KEY_MATERIAL.clone(), Direction::Decrypt)
    }

    /// Encrypts or decrypts `buf` in place. The length must be a multiple of the block size.
    pub fn process(&self, buf: &mut [u8]) -> anyhow::Result<()> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(RtmfpError::crypto(format!("length {} is not a multiple of the cipher block size", buf.len())));
        }

        match self.direction {
            Direction::Encrypt => {
                let len = buf.len();
                Aes128CbcEnc::new_from_slices(self.key.as_bytes(), &ZERO_IV)
                    .map_err(|e| RtmfpError::crypto(e.to_string()))?
                    .encrypt_padded_mut::<NoPadding>(buf, len)
                    .map_err(|_| RtmfpError::crypto("encryption failed"))?;
            }
            Direction::Decrypt => {
                Aes128CbcDec::new_from_slices(self.key.as_bytes(), &ZERO_IV)
                    .map_err(|e| RtmfpError::crypto(e.to_string()))?
                    .decrypt_padded_mut::<NoPadding>(buf)
                    .map_err(|_| RtmfpError::crypto("decryption failed"))?;
            }
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> anyhow::Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| RtmfpError::crypto(e.to_string()))?;
    mac.update(data);

    let mut result = [0u8; 32];
    result.copy_from_slice(&mac.finalize().into_bytes());
    Ok(result)
}

/// Derives the session keys from the Diffie-Hellman shared secret and the nonces exchanged
///  during the handshake.
///
/// Returns `(request_key, response_key)`: the initiator encrypts with the request key and
///  decrypts with the response key, the responder the other way round.
pub fn derive_keys(shared_secret: &[u8], initiator_nonce: &[u8], responder_nonce: &[u8]) -> anyhow::Result<(RtmfpKey, RtmfpKey)> {
    let md1 = hmac_sha256(responder_nonce, initiator_nonce)?;
    let md2 = hmac_sha256(initiator_nonce, responder_nonce)?;

    let request = hmac_sha256(shared_secret, &md1)?;
    let response = hmac_sha256(shared_secret, &md2)?;

    Ok((
        RtmfpKey::from_slice(&request[..KEY_SIZE])?,
        RtmfpKey::from_slice(&response[..KEY_SIZE])?,
    ))
}
