//! Cryptographic primitives for the command-channel protocol.
//!
//! Provides:
//! - SHA-256 secret-to-key derivation
//! - AES-256-CBC framing with manual zero padding (not PKCS7)
//! - HMAC-MD5 message signing, truncated to the protocol's 22-character form
//! - Raw DEFLATE (no zlib header) compression
//! - CSPRNG helpers for IVs and connection nonces

#![deny(unsafe_code)]

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Read, Write};

type HmacMd5 = Hmac<Md5>;
type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;

/// AES block size in octets; also the CBC IV length used here.
pub const AES_BLOCK_SIZE: usize = 16;

/// Errors from the routines in this crate.
#[derive(Clone, Debug, PartialEq)]
pub enum CryptoError {
    /// Ciphertext shorter than one IV's worth of bytes.
    ShortCiphertext,
    /// A buffer expected to be a multiple of [`AES_BLOCK_SIZE`] was not.
    NotBlockAligned,
    /// The platform RNG failed to produce randomness.
    RandomSourceFailed,
    /// The raw-deflate stream was malformed.
    Inflate(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortCiphertext => write!(f, "ciphertext shorter than one IV"),
            Self::NotBlockAligned => write!(f, "buffer is not a multiple of the AES block size"),
            Self::RandomSourceFailed => write!(f, "random source failed"),
            Self::Inflate(msg) => write!(f, "decompression failed: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Derive a 32-octet AES-256 key from an arbitrary shared secret.
pub fn derive_key(secret: &[u8]) -> [u8; 32] {
    Sha256::digest(secret).into()
}

/// Zero-pad `data` up to the next AES block boundary. A message already on
/// a block boundary is returned unchanged (zero bytes of padding).
pub fn pad_to_block(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let padlen = (AES_BLOCK_SIZE - (out.len() % AES_BLOCK_SIZE)) % AES_BLOCK_SIZE;
    out.extend(std::iter::repeat(0u8).take(padlen));
    out
}

/// Encrypt `padded_plaintext` (which must already be block-aligned, see
/// [`pad_to_block`]) under a random IV. Returns `iv || ciphertext`.
pub fn encrypt_cbc(key: &[u8; 32], padded_plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded_plaintext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned);
    }
    let iv = random_bytes::<AES_BLOCK_SIZE>()?;
    let ciphertext =
        CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<NoPadding>(padded_plaintext);
    let mut out = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `iv || ciphertext` payload produced by [`encrypt_cbc`].
///
/// The returned plaintext still carries any trailing zero padding; callers
/// recover the true length from the 4-octet length prefix the frame layer
/// stores inside the plaintext.
pub fn decrypt_cbc(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < AES_BLOCK_SIZE {
        return Err(CryptoError::ShortCiphertext);
    }
    let (iv, ciphertext) = payload.split_at(AES_BLOCK_SIZE);
    if ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned);
    }
    let iv: [u8; AES_BLOCK_SIZE] = iv.try_into().expect("checked length above");
    CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| CryptoError::NotBlockAligned)
}

/// Sign `data` with HMAC-MD5 under `secret`, returning the protocol's
/// 22-character base64 form (the trailing `==` padding is always stripped,
/// since an MD5 digest is exactly 16 octets).
pub fn sign_hmac_md5_base64(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC-MD5 accepts any key length");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let encoded = BASE64.encode(digest);
    debug_assert_eq!(encoded.len(), 24);
    encoded[..22].to_string()
}

/// Verify a signature produced by [`sign_hmac_md5_base64`] in constant time.
pub fn verify_hmac_md5_base64(secret: &[u8], data: &[u8], signature: &str) -> bool {
    let expected = sign_hmac_md5_base64(secret, data);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

/// Constant-time byte equality, to avoid leaking signature mismatches
/// through early-exit comparisons.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compress with raw DEFLATE (no zlib header, window bits -15).
pub fn deflate_raw(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).expect("writing to an in-memory buffer cannot fail");
    enc.finish().expect("flushing an in-memory buffer cannot fail")
}

/// Decompress a raw DEFLATE stream produced by [`deflate_raw`] (or a peer
/// using the same convention).
pub fn inflate_raw(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut dec = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)
        .map_err(|e| CryptoError::Inflate(e.to_string()))?;
    Ok(out)
}

/// Fill and return an array of `N` cryptographically random bytes.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|_| CryptoError::RandomSourceFailed)?;
    Ok(buf)
}

/// Generate a random 63-bit value suitable for use as a connection nonce
/// (the top bit is always clear).
pub fn random_u63() -> Result<u64, CryptoError> {
    let bytes = random_bytes::<8>()?;
    Ok(u64::from_be_bytes(bytes) & 0x7fff_ffff_ffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrips_block_aligned_data() {
        let key = derive_key(b"shared secret");
        let plaintext = pad_to_block(b"hello, command channel");
        let wire = encrypt_cbc(&key, &plaintext).unwrap();
        let recovered = decrypt_cbc(&key, &wire).unwrap();
        assert_eq!(&recovered[..plaintext.len()], &plaintext[..]);
    }

    #[test]
    fn cbc_rejects_unaligned_plaintext() {
        let key = derive_key(b"secret");
        assert_eq!(
            encrypt_cbc(&key, b"not aligned"),
            Err(CryptoError::NotBlockAligned)
        );
    }

    #[test]
    fn pad_to_block_is_idempotent_on_aligned_input() {
        let data = vec![1u8; 32];
        assert_eq!(pad_to_block(&data), data);
    }

    #[test]
    fn hmac_md5_signature_is_22_chars() {
        let sig = sign_hmac_md5_base64(b"secret", b"payload bytes");
        assert_eq!(sig.len(), 22);
        assert!(verify_hmac_md5_base64(b"secret", b"payload bytes", &sig));
        assert!(!verify_hmac_md5_base64(b"secret", b"tampered", &sig));
    }

    #[test]
    fn deflate_roundtrips() {
        let data = b"zone.list zone.list zone.list zone.list".repeat(4);
        let compressed = deflate_raw(&data);
        let decompressed = inflate_raw(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
