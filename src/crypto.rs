//! Payload ciphers for the local protocol.
//! AES-128-ECB with PKCS7 for v3.1 to v3.4, AES-128-GCM for v3.5,
//! plus the MD5 signature carried by v3.1 control payloads.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, generic_array::GenericArray};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};

const BLOCK: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

/// AES-128 cipher bound to one key (local key or negotiated session key).
pub struct TuyaCipher {
    key: [u8; 16],
    gcm: Aes128Gcm,
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key.try_into().map_err(|_| TuyaError::EncryptionFailed)?;
        let gcm = Aes128Gcm::new(&key.into());
        Ok(Self { key, gcm })
    }

    /// ECB-encrypt `data`. Without `padding` the input must already be block aligned.
    pub fn encrypt_ecb(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        if padding {
            let pad = BLOCK - data.len() % BLOCK;
            buf.resize(data.len() + pad, pad as u8);
        } else if !buf.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::EncryptionFailed);
        }

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// ECB-decrypt `data` and strip the PKCS7 padding.
    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(TuyaError::DecryptionFailed);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }

    /// GCM-encrypt `data`. Returns `iv || ciphertext || tag`.
    pub fn encrypt_gcm(&self, data: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_IV_LEN {
            return Err(TuyaError::EncryptionFailed);
        }
        let iv = &iv[..GCM_IV_LEN];
        let sealed = self
            .gcm
            .encrypt(Nonce::from_slice(iv), Payload { msg: data, aad })
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(GCM_IV_LEN + sealed.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// GCM-decrypt `sealed` (`ciphertext || tag`) and verify the tag.
    pub fn decrypt_gcm(&self, sealed: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_IV_LEN || sealed.len() < GCM_TAG_LEN {
            return Err(TuyaError::DecryptionFailed);
        }
        self.gcm
            .decrypt(Nonce::from_slice(&iv[..GCM_IV_LEN]), Payload { msg: sealed, aad })
            .map_err(|_| TuyaError::DecryptionFailed)
    }

    /// v3.1 control payload: `"3.1" || md5 signature || base64(ecb(data))`.
    pub fn seal_v31(&self, data: &[u8]) -> Result<Vec<u8>> {
        let b64 = general_purpose::STANDARD.encode(self.encrypt_ecb(data, true)?);
        let mut out = b"3.1".to_vec();
        out.extend_from_slice(sign_v31(&b64, &self.key).as_bytes());
        out.extend_from_slice(b64.as_bytes());
        Ok(out)
    }

    /// Reverse of [`seal_v31`](Self::seal_v31). The signature is checked.
    pub fn open_v31(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < V31_HEADER_LEN || &data[..3] != b"3.1" {
            return Err(TuyaError::DecodeError("missing 3.1 header".into()));
        }
        let signature = &data[3..V31_HEADER_LEN];
        let b64 = std::str::from_utf8(&data[V31_HEADER_LEN..])
            .map_err(|e| TuyaError::DecodeError(e.to_string()))?;
        if sign_v31(b64, &self.key).as_bytes() != signature {
            return Err(TuyaError::KeyOrVersionError);
        }
        let raw = general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| TuyaError::DecodeError(e.to_string()))?;
        self.decrypt_ecb(&raw)
    }
}

/// Length of `"3.1"` plus the 16-char signature.
pub const V31_HEADER_LEN: usize = 3 + 16;

fn sign_v31(b64: &str, key: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"data=");
    hasher.update(b64.as_bytes());
    hasher.update(b"||lpv=3.1||");
    hasher.update(key);
    hex::encode(hasher.finalize())[8..24].to_string()
}
