//! Payload encryption used by the wallet-connect and remote-signing protocols.
//!
//! - NIP-04: AES-256-CBC keyed by the raw ECDH x coordinate, encoded as
//!   `base64(ciphertext)?iv=base64(iv)`.
//! - NIP-44 v2: ChaCha20 + HMAC-SHA256 with HKDF-derived message keys and
//!   length-hiding padding.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chacha20::cipher::StreamCipher;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};
use sha2::Sha256;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const NIP44_VERSION: u8 = 2;
const NIP44_SALT: &[u8] = b"nip44-v2";
const NIP44_MIN_PLAINTEXT: usize = 1;
const NIP44_MAX_PLAINTEXT: usize = 65535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid MAC")]
    InvalidMac,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("plaintext length {0} out of range")]
    PlaintextLength(usize),
    #[error("key error: {0}")]
    Key(String),
}

/// Raw x coordinate of the ECDH point between our secret and their x-only key.
pub fn shared_x(secret: &SecretKey, their_pubkey: &XOnlyPublicKey) -> [u8; 32] {
    let full = PublicKey::from_x_only_public_key(*their_pubkey, Parity::Even);
    let point = ecdh::shared_secret_point(&full, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// NIP-04 encrypt `plaintext` for `their_pubkey`.
pub fn nip04_encrypt(secret: &SecretKey, their_pubkey: &XOnlyPublicKey, plaintext: &str) -> Result<String, CryptoError> {
    let key = shared_x(secret, their_pubkey);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let ct = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| CryptoError::Key(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}?iv={}", B64.encode(ct), B64.encode(iv)))
}

/// NIP-04 decrypt a `ciphertext?iv=...` payload from `their_pubkey`.
pub fn nip04_decrypt(secret: &SecretKey, their_pubkey: &XOnlyPublicKey, payload: &str) -> Result<String, CryptoError> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| CryptoError::Malformed("missing iv".into()))?;
    let ct = B64.decode(ct_b64).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let iv = B64.decode(iv_b64).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    let key = shared_x(secret, their_pubkey);
    let pt = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| CryptoError::Key(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| CryptoError::InvalidPadding)?;
    String::from_utf8(pt).map_err(|e| CryptoError::Malformed(e.to_string()))
}

/// NIP-44 conversation key shared by both parties.
pub fn nip44_conversation_key(secret: &SecretKey, their_pubkey: &XOnlyPublicKey) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(NIP44_SALT), &shared_x(secret, their_pubkey));
    prk.into()
}

/// NIP-44 v2 encrypt with a random nonce.
pub fn nip44_encrypt(secret: &SecretKey, their_pubkey: &XOnlyPublicKey, plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nip44_encrypt_with_nonce(&nip44_conversation_key(secret, their_pubkey), &nonce, plaintext)
}

/// NIP-44 v2 decrypt.
pub fn nip44_decrypt(secret: &SecretKey, their_pubkey: &XOnlyPublicKey, payload: &str) -> Result<String, CryptoError> {
    nip44_decrypt_with_key(&nip44_conversation_key(secret, their_pubkey), payload)
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

fn message_keys(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key).map_err(|e| CryptoError::Key(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| CryptoError::Key(e.to_string()))?;
    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..]);
    Ok(keys)
}

fn padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn mac_for(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(hmac_key).map_err(|e| CryptoError::Key(e.to_string()))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

fn nip44_encrypt_with_nonce(conversation_key: &[u8; 32], nonce: &[u8; 32], plaintext: &str) -> Result<String, CryptoError> {
    let bytes = plaintext.as_bytes();
    if !(NIP44_MIN_PLAINTEXT..=NIP44_MAX_PLAINTEXT).contains(&bytes.len()) {
        return Err(CryptoError::PlaintextLength(bytes.len()));
    }
    let keys = message_keys(conversation_key, nonce)?;
    let mut buf = Vec::with_capacity(2 + padded_len(bytes.len()));
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf.resize(2 + padded_len(bytes.len()), 0);
    chacha20::ChaCha20::new_from_slices(&keys.chacha_key, &keys.chacha_nonce)
        .map_err(|e| CryptoError::Key(e.to_string()))?
        .apply_keystream(&mut buf);
    let tag = mac_for(&keys.hmac_key, nonce, &buf)?.finalize().into_bytes();

    let mut out = Vec::with_capacity(1 + 32 + buf.len() + 32);
    out.push(NIP44_VERSION);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&buf);
    out.extend_from_slice(&tag);
    Ok(B64.encode(out))
}

fn nip44_decrypt_with_key(conversation_key: &[u8; 32], payload: &str) -> Result<String, CryptoError> {
    if payload.is_empty() || payload.starts_with('#') {
        return Err(CryptoError::Malformed("unknown encoding".into()));
    }
    let raw = B64.decode(payload).map_err(|e| CryptoError::Malformed(e.to_string()))?;
    if raw.len() < 99 {
        return Err(CryptoError::Malformed(format!("payload too short ({} bytes)", raw.len())));
    }
    if raw[0] != NIP44_VERSION {
        return Err(CryptoError::UnsupportedVersion(raw[0]));
    }
    let nonce: [u8; 32] = raw[1..33]
        .try_into()
        .map_err(|_| CryptoError::Malformed("nonce".into()))?;
    let (ciphertext, tag) = raw[33..].split_at(raw.len() - 33 - 32);
    let keys = message_keys(conversation_key, &nonce)?;
    mac_for(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::InvalidMac)?;

    let mut buf = ciphertext.to_vec();
    chacha20::ChaCha20::new_from_slices(&keys.chacha_key, &keys.chacha_nonce)
        .map_err(|e| CryptoError::Key(e.to_string()))?
        .apply_keystream(&mut buf);
    if buf.len() < 2 {
        return Err(CryptoError::InvalidPadding);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len < NIP44_MIN_PLAINTEXT || buf.len() != 2 + padded_len(len) {
        return Err(CryptoError::InvalidPadding);
    }
    String::from_utf8(buf[2..2 + len].to_vec()).map_err(|e| CryptoError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    fn key_n(n: u8) -> Keys {
        Keys::from_hex(&format!("{}{:02x}", "00".repeat(31), n)).unwrap()
    }

    fn xonly(keys: &Keys) -> XOnlyPublicKey {
        crate::keys::parse_public_key(&keys.public_key_hex()).unwrap()
    }

    #[test]
    fn nip44_conversation_key_vector() {
        let ck = nip44_conversation_key(&key_n(1).secret_key(), &xonly(&key_n(2)));
        assert_eq!(
            hex::encode(ck),
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d"
        );
    }

    #[test]
    fn nip44_encrypt_vector() {
        let ck = nip44_conversation_key(&key_n(1).secret_key(), &xonly(&key_n(2)));
        let mut nonce = [0u8; 32];
        nonce[31] = 1;
        let payload = nip44_encrypt_with_nonce(&ck, &nonce, "a").unwrap();
        assert_eq!(
            payload,
            "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb"
        );
        assert_eq!(nip44_decrypt_with_key(&ck, &payload).unwrap(), "a");
    }

    #[test]
    fn nip44_both_directions_share_key() {
        let a = Keys::generate();
        let b = Keys::generate();
        let payload = nip44_encrypt(&a.secret_key(), &xonly(&b), "{\"method\":\"ping\"}").unwrap();
        assert_eq!(
            nip44_decrypt(&b.secret_key(), &xonly(&a), &payload).unwrap(),
            "{\"method\":\"ping\"}"
        );
    }

    #[test]
    fn nip44_rejects_tampering() {
        let a = Keys::generate();
        let b = Keys::generate();
        let payload = nip44_encrypt(&a.secret_key(), &xonly(&b), "hello").unwrap();
        let mut raw = B64.decode(&payload).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 1;
        let tampered = B64.encode(raw);
        assert_eq!(
            nip44_decrypt(&b.secret_key(), &xonly(&a), &tampered),
            Err(CryptoError::InvalidMac)
        );
        assert!(nip44_decrypt(&b.secret_key(), &xonly(&a), "#nope").is_err());
    }

    #[test]
    fn padding_lengths() {
        for (len, want) in [(1, 32), (32, 32), (33, 64), (65, 96), (100, 128), (250, 256), (320, 320), (383, 384), (400, 448), (515, 640), (900, 1024), (65535, 65536)] {
            assert_eq!(padded_len(len), want, "len {len}");
        }
    }

    #[test]
    fn nip04_both_directions() {
        let a = Keys::generate();
        let b = Keys::generate();
        let payload = nip04_encrypt(&a.secret_key(), &xonly(&b), "pay me").unwrap();
        assert!(payload.contains("?iv="));
        assert_eq!(nip04_decrypt(&b.secret_key(), &xonly(&a), &payload).unwrap(), "pay me");
    }

    #[test]
    fn nip04_rejects_missing_iv() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert!(matches!(
            nip04_decrypt(&a.secret_key(), &xonly(&b), "abcd"),
            Err(CryptoError::Malformed(_))
        ));
    }
}
